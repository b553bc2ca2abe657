use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::broadcaster::StreamBroadcaster;
use crate::timelapse::TimelapseWriter;

/// JPEG Start-Of-Image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Assembles encoder chunks into frames and publishes each completed frame.
///
/// A chunk that begins with the SOI marker closes the frame accumulated so
/// far. Only the capture producer calls [`FrameSink::submit`].
pub struct FrameSink {
    broadcaster: Arc<StreamBroadcaster>,
    timelapse: TimelapseWriter,
    buffer: BytesMut,
    max_frame_size: usize,
    sequence_start: DateTime<Utc>,
    frames_emitted: u64,
    frames_discarded: u64,
}

impl FrameSink {
    pub fn new(
        broadcaster: Arc<StreamBroadcaster>,
        timelapse: TimelapseWriter,
        max_frame_size: usize,
    ) -> Self {
        Self {
            broadcaster,
            timelapse,
            buffer: BytesMut::with_capacity(100_000), // Typical JPEG size
            max_frame_size,
            sequence_start: Utc::now(),
            frames_emitted: 0,
            frames_discarded: 0,
        }
    }

    pub fn submit(&mut self, chunk: &[u8]) {
        self.submit_at(chunk, Utc::now());
    }

    pub fn submit_at(&mut self, chunk: &[u8], now: DateTime<Utc>) {
        if chunk.starts_with(&JPEG_SOI) && !self.buffer.is_empty() {
            let frame = self.buffer.split().freeze();
            self.publish(frame, now);
        }

        if self.buffer.len() + chunk.len() > self.max_frame_size {
            warn!(
                "Discarding {} accumulated bytes: no frame boundary within {} bytes",
                self.buffer.len() + chunk.len(),
                self.max_frame_size
            );
            self.buffer.clear();
            self.frames_discarded += 1;
            return;
        }

        self.buffer.extend_from_slice(chunk);
    }

    fn publish(&mut self, frame: Bytes, now: DateTime<Utc>) {
        // Anything received before the first SOI is not a frame.
        if !frame.starts_with(&JPEG_SOI) {
            debug!("Dropping {} bytes without a JPEG start marker", frame.len());
            self.frames_discarded += 1;
            return;
        }

        let seq = self.broadcaster.publish(frame.clone(), now);
        self.frames_emitted += 1;

        if self.frames_emitted == 1 {
            info!("First frame received from camera ({} bytes)", frame.len());
        } else if self.frames_emitted % 100 == 0 {
            let elapsed = (now - self.sequence_start).num_milliseconds().max(1) as f64 / 1000.0;
            debug!(
                "Published {} frames (seq {}, {:.1} fps average, {} clients)",
                self.frames_emitted,
                seq,
                self.frames_emitted as f64 / elapsed,
                self.broadcaster.receiver_count()
            );
        }

        if self.timelapse.is_enabled() {
            self.timelapse.maybe_save(&frame, now);
        }
    }

    /// Forget any partial frame, e.g. after the capture source restarted.
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            debug!("Discarding {} bytes of partial frame", self.buffer.len());
            self.buffer.clear();
        }
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn frames_discarded(&self) -> u64 {
        self.frames_discarded
    }
}
