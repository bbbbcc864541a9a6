//! Per-frame capture loop for the `record-video` process.
//!
//! Each frame is paired with a clock reading taken right after capture, written
//! to the video file, persisted as a frame row and announced as a
//! `Video_Index:<n>` marker. Indices start at 0 and never skip.

use crate::errors::CuesyncError;
use crate::logging::append_run_log;
use crate::markers::MarkerChannel;
use crate::runtime::{Clock, ClockReading};
use crate::types::FrameRecord;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod ffmpeg;
pub mod synthetic;

pub const FPS_TOLERANCE: f64 = 0.2;
pub const FPS_PROBE_FRAMES: u32 = 120;
pub const FRAME_LABEL_PREFIX: &str = "Video";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

pub trait FrameSource {
    fn dimensions(&self) -> (u32, u32);
    /// Frame rate the device claims, if it reports one.
    fn reported_fps(&self) -> Option<f64>;
    /// Block until the next frame. Any failure is fatal to the capture loop.
    fn capture(&mut self) -> Result<CapturedFrame, CuesyncError>;
}

pub trait FrameWriter {
    fn write_frame(&mut self, frame: &CapturedFrame) -> Result<(), CuesyncError>;
    fn finish(&mut self) -> Result<(), CuesyncError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CaptureBudget {
    pub max_duration_seconds: Option<f64>,
    pub max_frames: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    Duration,
    FrameLimit,
    StopSignal,
    CaptureError(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureSummary {
    pub frames: u64,
    pub first_timestamp: Option<ClockReading>,
    pub last_timestamp: Option<ClockReading>,
    pub stop_reason: StopReason,
}

impl CaptureSummary {
    pub fn effective_fps(&self) -> Option<f64> {
        let (first, last) = (self.first_timestamp?, self.last_timestamp?);
        let span = last - first;
        (self.frames > 1 && span > 0.0).then(|| (self.frames - 1) as f64 / span)
    }
}

/// Run until the budget is spent, `stop` is raised, or capture fails.
///
/// A capture failure still finishes the writer so the file stays playable, then
/// surfaces as `CuesyncError::Capture`.
pub fn run_capture_loop(
    source: &mut dyn FrameSource,
    writer: &mut dyn FrameWriter,
    channel: &MarkerChannel,
    stop: &AtomicBool,
    budget: CaptureBudget,
) -> Result<CaptureSummary, CuesyncError> {
    let clock = channel.clock();
    let started = clock.now();
    let mut next_index: u64 = 0;
    let mut first_timestamp = None;
    let mut last_timestamp = None;

    append_run_log(
        "info",
        "capture.loop.started",
        json!({ "budget_seconds": budget.max_duration_seconds, "budget_frames": budget.max_frames }),
    );

    let stop_reason = loop {
        if stop.load(Ordering::SeqCst) {
            break StopReason::StopSignal;
        }

        let frame = match source.capture() {
            Ok(frame) => frame,
            Err(error) => break StopReason::CaptureError(error.to_string()),
        };
        let timestamp = clock.now();

        if let Err(error) = writer.write_frame(&frame) {
            break StopReason::CaptureError(error.to_string());
        }
        channel.emit_frame(
            FRAME_LABEL_PREFIX,
            FrameRecord {
                frame_index: next_index,
                timestamp,
            },
        );
        first_timestamp.get_or_insert(timestamp);
        last_timestamp = Some(timestamp);
        next_index += 1;

        if budget.max_frames.is_some_and(|limit| next_index >= limit) {
            break StopReason::FrameLimit;
        }
        if budget
            .max_duration_seconds
            .is_some_and(|limit| timestamp - started >= limit)
        {
            break StopReason::Duration;
        }
    };

    let finish_result = writer.finish();
    let summary = CaptureSummary {
        frames: next_index,
        first_timestamp,
        last_timestamp,
        stop_reason,
    };
    append_run_log(
        "info",
        "capture.loop.finished",
        json!({
            "frames": summary.frames,
            "stop_reason": summary.stop_reason,
            "effective_fps": summary.effective_fps(),
        }),
    );

    if let StopReason::CaptureError(detail) = &summary.stop_reason {
        return Err(CuesyncError::Capture(format!(
            "{detail} (after {} frames)",
            summary.frames
        )));
    }
    finish_result?;
    Ok(summary)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FpsOrigin {
    Requested,
    Reported,
    Measured,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FpsDecision {
    pub fps: f64,
    pub origin: FpsOrigin,
    pub reported: Option<f64>,
    pub measured: Option<f64>,
    pub warning: Option<String>,
}

/// Pick the recording frame rate.
///
/// A positive `requested` wins outright. Otherwise the device-reported rate is
/// checked against a measured one and the measurement is preferred when they
/// disagree by more than [`FPS_TOLERANCE`].
pub fn resolve_fps(
    requested: f64,
    reported: Option<f64>,
    measure: impl FnOnce() -> Result<f64, CuesyncError>,
) -> Result<FpsDecision, CuesyncError> {
    if requested > 0.0 {
        return Ok(FpsDecision {
            fps: requested,
            origin: FpsOrigin::Requested,
            reported,
            measured: None,
            warning: None,
        });
    }

    let measured = measure()?;
    let reported = reported.filter(|fps| *fps > 0.0);
    let decision = match reported {
        Some(reported_fps) if (measured - reported_fps).abs() <= FPS_TOLERANCE => FpsDecision {
            fps: reported_fps,
            origin: FpsOrigin::Reported,
            reported,
            measured: Some(measured),
            warning: None,
        },
        Some(reported_fps) => FpsDecision {
            fps: measured,
            origin: FpsOrigin::Measured,
            reported,
            measured: Some(measured),
            warning: Some(format!(
                "camera reports {reported_fps:.3} fps but delivers {measured:.3} fps; using measured rate"
            )),
        },
        None => FpsDecision {
            fps: measured,
            origin: FpsOrigin::Measured,
            reported: None,
            measured: Some(measured),
            warning: None,
        },
    };
    if decision.fps <= 0.0 {
        return Err(CuesyncError::Capture(
            "could not determine a positive frame rate".to_string(),
        ));
    }
    Ok(decision)
}

/// Grab `frames` frames and return the delivered rate.
pub fn measure_fps(
    source: &mut dyn FrameSource,
    clock: &dyn Clock,
    frames: u32,
) -> Result<f64, CuesyncError> {
    let start = clock.now();
    for _ in 0..frames {
        source.capture()?;
    }
    let elapsed = clock.now() - start;
    if elapsed <= 0.0 {
        return Ok(0.0);
    }
    Ok(f64::from(frames) / elapsed)
}
