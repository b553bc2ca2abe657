use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use crate::capture::{CaptureSource, MjpegChunker};
use crate::config::CameraConfig;
use crate::errors::{Result, StreamError};
use crate::frame_sink::FrameSink;

const DEFAULT_QUALITY: u8 = 80;

/// Synthetic camera producing a moving colour gradient.
///
/// Frames go through the same chunker as a real device, so the sink sees
/// chunked encoder output rather than whole frames.
pub struct TestPatternCapture {
    width: u32,
    height: u32,
    framerate: u32,
    quality: u8,
    chunk_read_size: usize,
    frame_count: u64,
}

impl TestPatternCapture {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            framerate: config.framerate.max(1),
            // ffmpeg's -q:v scale is 2..31 where lower is better; map it onto 1..100.
            quality: config
                .quality
                .map(|q| 100u8.saturating_sub(q.min(31) * 3))
                .unwrap_or(DEFAULT_QUALITY),
            chunk_read_size: config.chunk_read_size.max(1),
            frame_count: 0,
        }
    }
}

/// Encode one test frame. `step` moves the pattern.
pub fn render_test_frame(width: u32, height: u32, step: u64, quality: u8) -> Result<Vec<u8>> {
    let t = step as u32;
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        let r = ((x + t * 4) % 255) as u8;
        let g = ((y + t * 2) % 255) as u8;
        let b = ((x + y + t * 8) % 255) as u8;
        Rgb([r, g, b])
    });

    let mut jpeg_data = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg_data, quality);
    encoder
        .encode_image(&img)
        .map_err(|e| StreamError::capture(format!("failed to encode test frame: {}", e)))?;

    Ok(jpeg_data)
}

#[async_trait]
impl CaptureSource for TestPatternCapture {
    fn describe(&self) -> String {
        format!("test pattern ({}x{} @ {} fps)", self.width, self.height, self.framerate)
    }

    async fn stream_into(&mut self, sink: &mut FrameSink) -> Result<()> {
        info!("Generating test frames at {} fps", self.framerate);

        let mut ticker = interval(Duration::from_micros(1_000_000 / self.framerate as u64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut chunker = MjpegChunker::new();

        loop {
            ticker.tick().await;

            let (width, height, step, quality) = (self.width, self.height, self.frame_count, self.quality);
            let jpeg_data = tokio::task::spawn_blocking(move || render_test_frame(width, height, step, quality))
                .await
                .map_err(|e| StreamError::capture(format!("test frame task failed: {}", e)))??;

            self.frame_count += 1;
            if self.frame_count % 100 == 0 {
                debug!("Generated {} test frames", self.frame_count);
            }

            for read in jpeg_data.chunks(self.chunk_read_size) {
                for piece in chunker.push(read) {
                    sink.submit(&piece);
                }
            }
        }
    }
}
