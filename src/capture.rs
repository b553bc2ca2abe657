use std::process::Stdio;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::config::{CameraConfig, CaptureSourceKind};
use crate::errors::{Result, StreamError};
use crate::frame_sink::FrameSink;
use crate::test_pattern::TestPatternCapture;

/// EOI immediately followed by SOI: where one JPEG ends and the next begins.
const FRAME_JOIN: u32 = 0xFFD9_FFD8;

/// A camera that writes JPEG chunks into a [`FrameSink`].
#[async_trait]
pub trait CaptureSource: Send {
    fn describe(&self) -> String;

    /// Stream chunks into `sink` until the source ends or fails.
    ///
    /// Dropping the returned future must stop the underlying device.
    async fn stream_into(&mut self, sink: &mut FrameSink) -> Result<()>;
}

pub fn source_from_config(config: &CameraConfig) -> Box<dyn CaptureSource> {
    match config.source {
        CaptureSourceKind::Ffmpeg => Box::new(FfmpegCapture::new(config.clone())),
        CaptureSourceKind::TestPattern => Box::new(TestPatternCapture::new(config)),
    }
}

/// Re-cuts a raw concatenated-JPEG byte stream so that every frame start
/// begins a chunk.
///
/// Pipe reads land anywhere inside a frame. The frame sink treats a chunk that
/// starts with SOI as a frame boundary, so the chunker cuts exactly at
/// `FFD9 FFD8` joins and makes sure no other chunk starts with `FFD8`.
#[derive(Debug, Default)]
pub struct MjpegChunker {
    pending: BytesMut,
    window: u32,
}

impl MjpegChunker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        let mut chunks = Vec::new();

        for &byte in data {
            self.window = (self.window << 8) | byte as u32;
            self.pending.put_u8(byte);
            if self.window == FRAME_JOIN {
                let start = self.pending.len() - 2;
                if start > 0 {
                    chunks.push(self.pending.split_to(start).freeze());
                }
            }
        }

        // Hold back a trailing run of 0xFF plus the byte before it: the next
        // read may complete an SOI, and the held-back chunk must not start
        // with 0xFF unless it is a real frame start.
        let mut cut = self.pending.len().saturating_sub(1);
        while cut > 0 && self.pending[cut] == 0xFF {
            cut -= 1;
        }
        // Never split the SOI of a frame start away from its first bytes.
        if cut >= 2 {
            chunks.push(self.pending.split_to(cut).freeze());
        }

        chunks
    }

    /// Return whatever is still buffered, e.g. at end of stream.
    pub fn flush(&mut self) -> Option<Bytes> {
        self.window = 0;
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }
}

/// Captures MJPEG from a video device through an ffmpeg child process.
pub struct FfmpegCapture {
    config: CameraConfig,
}

impl FfmpegCapture {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }
}

/// Build the ffmpeg command line for `config`, without the program name.
pub fn build_ffmpeg_args(config: &CameraConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(), "error".into(),
        "-fflags".into(), "+nobuffer".into(),   // Disable input buffering
        "-flags".into(), "low_delay".into(),
        "-f".into(), config.input_driver.clone(),
        "-framerate".into(), config.framerate.to_string(),
        "-video_size".into(), format!("{}x{}", config.width, config.height),
    ];

    // Device parameters are passed through as input options.
    for (key, value) in &config.options {
        args.push(format!("-{}", key));
        args.push(value.to_string());
    }

    args.extend(["-i".to_string(), config.device.clone()]);
    args.extend(["-an".to_string(), "-f".to_string(), "mjpeg".to_string()]);
    if let Some(quality) = config.quality {
        args.extend(["-q:v".to_string(), quality.to_string()]);
    }
    args.extend(["-flush_packets".to_string(), "1".to_string()]);
    args.extend(config.extra_output_args.iter().cloned());
    args.push("-".into()); // Output to stdout

    args
}

#[async_trait]
impl CaptureSource for FfmpegCapture {
    fn describe(&self) -> String {
        format!(
            "ffmpeg {} ({}x{} @ {} fps)",
            self.config.device, self.config.width, self.config.height, self.config.framerate
        )
    }

    async fn stream_into(&mut self, sink: &mut FrameSink) -> Result<()> {
        let args = build_ffmpeg_args(&self.config);
        debug!("Starting ffmpeg with arguments: {}", args.join(" "));

        let mut child = tokio::process::Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::capture(format!("failed to start ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::capture("failed to get ffmpeg stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ffmpeg: {}", line);
                }
            });
        }

        info!("ffmpeg process started, reading MJPEG from '{}'", self.config.device);

        let mut reader = BufReader::new(stdout);
        let mut chunker = MjpegChunker::new();
        let mut chunk = vec![0u8; self.config.chunk_read_size];
        let mut total_bytes = 0u64;

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                if let Some(rest) = chunker.flush() {
                    sink.submit(&rest);
                }
                break;
            }
            total_bytes += n as u64;
            for piece in chunker.push(&chunk[..n]) {
                sink.submit(&piece);
            }
        }

        let status = child.wait().await?;
        Err(StreamError::capture(format!(
            "ffmpeg exited with {} after {} bytes",
            status, total_bytes
        )))
    }
}

/// Owns the producer task; [`CaptureHandle::stop`] shuts it down.
pub struct CaptureHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CaptureHandle {
    /// Run `source` on its own task, restarting it after `restart_interval`
    /// whenever it ends, until stopped.
    pub fn spawn(
        mut source: Box<dyn CaptureSource>,
        mut sink: FrameSink,
        restart_interval: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let name = source.describe();
            loop {
                info!("Starting capture: {}", name);
                tokio::select! {
                    result = source.stream_into(&mut sink) => {
                        match result {
                            Ok(()) => info!("Capture '{}' ended", name),
                            Err(e) => error!("Capture '{}' failed: {}", name, e),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }

                sink.reset();
                info!("Restarting capture in {} seconds...", restart_interval.as_secs());
                tokio::select! {
                    _ = sleep(restart_interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!(
                "Capture '{}' stopped after {} frames ({} discarded)",
                name,
                sink.frames_emitted(),
                sink.frames_discarded()
            );
        });

        Self { shutdown_tx, task }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        match timeout(Duration::from_secs(5), self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Capture task panicked: {}", e),
            Err(_) => warn!("Capture task did not stop within 5 seconds"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::StreamBroadcaster;
    use crate::config::OptionValue;
    use crate::frame_sink::JPEG_SOI;
    use crate::timelapse::TimelapseWriter;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fake_jpeg(tag: u8, body_len: usize) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        // Stuffed 0xFF bytes, as they appear in entropy-coded data.
        for i in 0..body_len {
            if i % 9 == 0 {
                data.extend_from_slice(&[0xFF, 0x00]);
            } else {
                data.push(tag.wrapping_add(i as u8) & 0x7F);
            }
        }
        data.extend_from_slice(&[0xFF, 0xD9]);
        data
    }

    fn rechunk(stream: &[u8], read_size: usize) -> Vec<Bytes> {
        let mut chunker = MjpegChunker::new();
        let mut chunks = Vec::new();
        for read in stream.chunks(read_size) {
            chunks.extend(chunker.push(read));
        }
        chunks.extend(chunker.flush());
        chunks
    }

    #[test]
    fn test_chunker_cuts_at_every_frame_start() {
        let frames: Vec<Vec<u8>> = (0..6).map(|i| fake_jpeg(i, 40 + i as usize * 7)).collect();
        let stream: Vec<u8> = frames.concat();

        for read_size in [1, 2, 3, 5, 17, 64, 4096] {
            let chunks = rechunk(&stream, read_size);
            assert_eq!(chunks.concat(), stream, "read size {}", read_size);

            let starts = chunks.iter().filter(|c| c.starts_with(&JPEG_SOI)).count();
            assert_eq!(starts, frames.len(), "read size {}", read_size);
        }
    }

    #[test]
    fn test_chunker_output_reassembles_frames_in_sink() {
        let frames: Vec<Vec<u8>> = (0..4).map(|i| fake_jpeg(i, 100)).collect();
        let mut stream = frames.concat();
        stream.extend_from_slice(&fake_jpeg(9, 10));

        let broadcaster = Arc::new(StreamBroadcaster::new());
        let mut sink = FrameSink::new(broadcaster.clone(), TimelapseWriter::disabled(Utc::now()), 1 << 20);
        let mut published = Vec::new();
        for chunk in rechunk(&stream, 7) {
            sink.submit(&chunk);
            if let Some(frame) = broadcaster.latest() {
                if published.last() != Some(&frame.seq) {
                    assert_eq!(&frame.data[..], &frames[frame.seq as usize - 1][..]);
                    published.push(frame.seq);
                }
            }
        }
        assert_eq!(published, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_ffmpeg_args() {
        let mut config = CameraConfig::default();
        config.quality = Some(4);
        config.options.insert("input_format".into(), OptionValue::Text("mjpeg".into()));
        config.extra_output_args = vec!["-vf".into(), "hflip".into()];

        let args = build_ffmpeg_args(&config);
        let joined = args.join(" ");
        assert!(joined.contains("-f v4l2 -framerate 30 -video_size 640x480 -input_format mjpeg -i /dev/video0"));
        assert!(joined.contains("-f mjpeg -q:v 4"));
        assert!(joined.ends_with("-vf hflip -"));
    }

    struct CountingSource {
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CaptureSource for CountingSource {
        fn describe(&self) -> String {
            "counting".to_string()
        }

        async fn stream_into(&mut self, sink: &mut FrameSink) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            sink.submit(&fake_jpeg(1, 10));
            sink.submit(&fake_jpeg(2, 10));
            Err(StreamError::capture("device unplugged"))
        }
    }

    #[tokio::test]
    async fn test_capture_restarts_and_stops() {
        let starts = Arc::new(AtomicUsize::new(0));
        let broadcaster = Arc::new(StreamBroadcaster::new());
        let sink = FrameSink::new(broadcaster.clone(), TimelapseWriter::disabled(Utc::now()), 1 << 20);

        let handle = CaptureHandle::spawn(
            Box::new(CountingSource { starts: starts.clone() }),
            sink,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        let count = starts.load(Ordering::SeqCst);
        assert!(count >= 2, "source started {} times", count);
        // The partial second frame is dropped on every restart.
        assert_eq!(broadcaster.sequence(), count as u64);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(starts.load(Ordering::SeqCst), count);
    }
}
