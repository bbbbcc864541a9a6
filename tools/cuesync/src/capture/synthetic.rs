use super::{CapturedFrame, FrameSource, FrameWriter};
use crate::errors::CuesyncError;
use crate::runtime::{Clock, ClockReading};
use std::sync::Arc;

/// Frame source paced by a [`Clock`]: frame `k` is delivered at
/// `origin + (k + 1) / fps`. With a `FakeClock` no real time passes.
pub struct SyntheticFrameSource {
    clock: Arc<dyn Clock>,
    fps: f64,
    width: u32,
    height: u32,
    origin: ClockReading,
    produced: u64,
    fail_at: Option<u64>,
    reported_fps: Option<f64>,
}

impl SyntheticFrameSource {
    pub fn new(clock: Arc<dyn Clock>, fps: f64, width: u32, height: u32) -> Self {
        let origin = clock.now();
        Self {
            clock,
            fps,
            width,
            height,
            origin,
            produced: 0,
            fail_at: None,
            reported_fps: Some(fps),
        }
    }

    /// The capture call with this zero-based index fails.
    pub fn failing_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Claim a different rate than the one actually delivered.
    pub fn reporting(mut self, fps: Option<f64>) -> Self {
        self.reported_fps = fps;
        self
    }
}

impl FrameSource for SyntheticFrameSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn reported_fps(&self) -> Option<f64> {
        self.reported_fps
    }

    fn capture(&mut self) -> Result<CapturedFrame, CuesyncError> {
        if self.fail_at == Some(self.produced) {
            return Err(CuesyncError::Capture("failed to grab frame".to_string()));
        }
        if self.fps <= 0.0 {
            return Err(CuesyncError::Capture(
                "synthetic source needs a positive rate".to_string(),
            ));
        }
        let due = self
            .origin
            .after((self.produced + 1) as f64 / self.fps);
        self.clock.sleep_until(due)?;
        let shade = (self.produced % 256) as u8;
        self.produced += 1;
        Ok(CapturedFrame {
            width: self.width,
            height: self.height,
            data: vec![shade; (self.width * self.height * 3) as usize],
        })
    }
}

/// Writer that keeps only counts; stands in for the encoder in tests.
#[derive(Debug, Default)]
pub struct MemoryFrameWriter {
    frames: u64,
    bytes: u64,
    finished: bool,
}

impl MemoryFrameWriter {
    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn finished(&self) -> bool {
        self.finished
    }
}

impl FrameWriter for MemoryFrameWriter {
    fn write_frame(&mut self, frame: &CapturedFrame) -> Result<(), CuesyncError> {
        if self.finished {
            return Err(CuesyncError::Capture("writer already finished".to_string()));
        }
        self.frames += 1;
        self.bytes += frame.data.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CuesyncError> {
        self.finished = true;
        Ok(())
    }
}
