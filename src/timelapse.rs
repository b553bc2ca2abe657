use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use crate::config::TimelapseConfig;
use crate::errors::{Result, StreamError};

/// Saves at most one published frame per interval window as
/// `<path>/<session start>/imageNN.jpg`.
///
/// Slot bookkeeping happens on the caller; inside a tokio runtime the file
/// write itself runs on the blocking pool. Failures are logged and never
/// reach the caller.
#[derive(Debug)]
pub struct TimelapseWriter {
    enabled: bool,
    interval_secs: u64,
    session_dir: PathBuf,
    start_time: DateTime<Utc>,
    last_saved_slot: i64,
    image_counter: u32,
}

impl TimelapseWriter {
    pub fn new(config: &TimelapseConfig, start_time: DateTime<Utc>) -> Self {
        let session_dir = Path::new(&config.path).join(session_dir_name(start_time));
        let writer = Self {
            enabled: config.is_enabled(),
            interval_secs: config.interval,
            session_dir,
            start_time,
            last_saved_slot: 0,
            image_counter: 0,
        };

        if writer.enabled {
            match writer.create_session_dir() {
                Ok(()) => info!(
                    "Timelapse enabled: saving one frame every {}s to '{}'",
                    writer.interval_secs,
                    writer.session_dir.display()
                ),
                Err(e) => error!("Error in timelapse init: {}", e),
            }
        } else {
            debug!("Timelapse disabled");
        }

        writer
    }

    pub fn disabled(start_time: DateTime<Utc>) -> Self {
        Self::new(&TimelapseConfig { interval: 0, path: String::new() }, start_time)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[cfg(test)]
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    #[cfg(test)]
    pub fn last_saved_slot(&self) -> i64 {
        self.last_saved_slot
    }

    fn create_session_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.session_dir).map_err(|e| {
            StreamError::timelapse(format!(
                "failed to create session directory '{}': {}",
                self.session_dir.display(),
                e
            ))
        })
    }

    /// Index of the interval window `now` falls into, counted from session start.
    pub fn slot_for(&self, now: DateTime<Utc>) -> i64 {
        if self.interval_secs == 0 {
            return 0;
        }
        // i128 holds any u64 interval in milliseconds; the quotient always fits i64.
        let elapsed_ms = (now - self.start_time).num_milliseconds() as i128;
        let interval_ms = self.interval_secs as i128 * 1000;
        elapsed_ms.div_euclid(interval_ms) as i64
    }

    /// Save `frame` if `now` has entered a new interval window.
    ///
    /// Returns the path the frame is written to, if any.
    pub fn maybe_save(&mut self, frame: &Bytes, now: DateTime<Utc>) -> Option<PathBuf> {
        match self.try_save(frame, now) {
            Ok(path) => path,
            Err(e) => {
                error!("Error saving timelapse image: {}", e);
                None
            }
        }
    }

    fn try_save(&mut self, frame: &Bytes, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
        if !self.enabled {
            return Ok(None);
        }

        let slot = self.slot_for(now);
        if slot <= self.last_saved_slot {
            return Ok(None);
        }

        // Advance first so a failing disk is reported once per window, not once per frame.
        self.last_saved_slot = slot;
        self.image_counter += 1;

        let path = self.session_dir.join(format!("image{:02}.jpg", self.image_counter));
        match Handle::try_current() {
            Ok(handle) => {
                let (target, frame) = (path.clone(), frame.clone());
                handle.spawn_blocking(move || {
                    if let Err(e) = write_image(&target, &frame) {
                        error!("Error saving timelapse image: {}", e);
                    }
                });
            }
            Err(_) => write_image(&path, frame)?,
        }

        debug!("Timelapse slot {} -> {}", slot, path.display());
        Ok(Some(path))
    }
}

/// Create, write and close one snapshot file.
fn write_image(path: &Path, frame: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| {
        StreamError::timelapse(format!("failed to create '{}': {}", path.display(), e))
    })?;
    file.write_all(frame).map_err(|e| {
        StreamError::timelapse(format!("failed to write '{}': {}", path.display(), e))
    })?;
    file.flush()?;
    debug!("Saved timelapse image {} ({} bytes)", path.display(), frame.len());
    Ok(())
}

fn session_dir_name(start_time: DateTime<Utc>) -> String {
    start_time.format("%Y%m%dT%H%M%S%.3f").to_string()
}
