//! Publish-only marker bus.
//!
//! A [`MarkerChannel`] stamps every label with the shared clock and hands it to
//! each registered [`MarkerSink`] plus an in-memory broadcast. Sinks must accept
//! a marker without blocking on I/O; a sink that fails is logged and skipped so a
//! lost marker never stalls the stimulus timeline.

use crate::errors::CuesyncError;
use crate::logging::append_run_log;
use crate::runtime::Clock;
use crate::types::{FrameRecord, Marker};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 1024;

pub trait MarkerSink: Send + Sync {
    fn name(&self) -> &str;
    fn record_marker(&self, source: &str, marker: &Marker) -> Result<(), CuesyncError>;

    fn record_frame(&self, _source: &str, _frame: &FrameRecord) -> Result<(), CuesyncError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub emitted: u64,
    pub dropped: u64,
}

pub struct MarkerChannel {
    source: String,
    clock: Arc<dyn Clock>,
    sinks: Vec<Arc<dyn MarkerSink>>,
    events: broadcast::Sender<Marker>,
    validate_labels: bool,
    order: Mutex<()>,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl MarkerChannel {
    pub fn new(source: &str, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            source: source.to_string(),
            clock,
            sinks: Vec::new(),
            events,
            validate_labels: true,
            order: Mutex::new(()),
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MarkerSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_label_validation(mut self, enabled: bool) -> Self {
        self.validate_labels = enabled;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Marker> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stamp `label` with the current clock reading and publish it.
    pub fn emit(&self, label: &str) -> Marker {
        let _order = self.order.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let marker = Marker {
            label: label.to_string(),
            timestamp: self.clock.now(),
        };
        self.publish(&marker);
        marker
    }

    /// Publish a captured frame: one frame row plus its index marker.
    pub fn emit_frame(&self, label_prefix: &str, frame: FrameRecord) -> Marker {
        let _order = self.order.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for sink in &self.sinks {
            if let Err(error) = sink.record_frame(&self.source, &frame) {
                self.note_drop(sink.name(), &format!("frame {}", frame.frame_index), &error);
            }
        }
        let marker = Marker {
            label: format!("{label_prefix}_Index:{}", frame.frame_index),
            timestamp: frame.timestamp,
        };
        self.publish(&marker);
        marker
    }

    fn publish(&self, marker: &Marker) {
        if self.validate_labels && cfg!(debug_assertions) {
            if let Err(error) = validate_label(&marker.label) {
                eprintln!("[marker_channel] {error}");
                append_run_log(
                    "warn",
                    "markers.label.malformed",
                    json!({ "source": self.source, "label": marker.label }),
                );
            }
        }
        for sink in &self.sinks {
            if let Err(error) = sink.record_marker(&self.source, marker) {
                self.note_drop(sink.name(), &marker.label, &error);
            }
        }
        let _ = self.events.send(marker.clone());
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    fn note_drop(&self, sink: &str, what: &str, error: &CuesyncError) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        append_run_log(
            "warn",
            "markers.sink.dropped",
            json!({
                "source": self.source,
                "sink": sink,
                "item": what,
                "error": error.to_string(),
            }),
        );
    }
}

/// Accepts `<Phase>_<Event>` and `<Phase>_Index:<n>`.
///
/// The phase part may itself contain underscores; the event is whatever follows
/// the last underscore.
pub fn validate_label(label: &str) -> Result<(), CuesyncError> {
    let malformed = || CuesyncError::MalformedMarkerLabel(label.to_string());
    let (phase, event) = label.rsplit_once('_').ok_or_else(malformed)?;

    let phase_ok = phase
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && phase.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !phase_ok {
        return Err(malformed());
    }

    let event_ok = match event.strip_prefix("Index:") {
        Some(index) => !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()),
        None => !event.is_empty() && event.chars().all(|c| c.is_ascii_alphanumeric()),
    };
    if !event_ok {
        return Err(malformed());
    }
    Ok(())
}

/// In-memory sink used by tests and by `--dry-run` sessions.
#[derive(Default, Clone)]
pub struct MemoryMarkerSink {
    markers: Arc<Mutex<Vec<(String, Marker)>>>,
    frames: Arc<Mutex<Vec<(String, FrameRecord)>>>,
    fail_next: Arc<Mutex<u32>>,
}

impl MemoryMarkerSink {
    pub fn markers(&self) -> Vec<Marker> {
        self.markers
            .lock()
            .map(|rows| rows.iter().map(|(_, marker)| marker.clone()).collect())
            .unwrap_or_default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.markers()
            .into_iter()
            .map(|marker| marker.label)
            .collect()
    }

    pub fn frames(&self) -> Vec<FrameRecord> {
        self.frames
            .lock()
            .map(|rows| rows.iter().map(|(_, frame)| *frame).collect())
            .unwrap_or_default()
    }

    /// Make the next `count` writes fail as if the sink were unavailable.
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut pending) = self.fail_next.lock() {
            *pending = count;
        }
    }

    fn maybe_fail(&self) -> Result<(), CuesyncError> {
        if let Ok(mut pending) = self.fail_next.lock() {
            if *pending > 0 {
                *pending -= 1;
                return Err(CuesyncError::Database("sink unavailable".to_string()));
            }
        }
        Ok(())
    }
}

impl MarkerSink for MemoryMarkerSink {
    fn name(&self) -> &str {
        "memory"
    }

    fn record_marker(&self, source: &str, marker: &Marker) -> Result<(), CuesyncError> {
        self.maybe_fail()?;
        self.markers
            .lock()
            .map_err(|_| CuesyncError::Database("memory sink lock poisoned".to_string()))?
            .push((source.to_string(), marker.clone()));
        Ok(())
    }

    fn record_frame(&self, source: &str, frame: &FrameRecord) -> Result<(), CuesyncError> {
        self.maybe_fail()?;
        self.frames
            .lock()
            .map_err(|_| CuesyncError::Database("memory sink lock poisoned".to_string()))?
            .push((source.to_string(), *frame));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ClockReading, FakeClock};
    use std::time::Duration;

    fn channel_with_memory(clock: FakeClock) -> (MarkerChannel, MemoryMarkerSink) {
        let sink = MemoryMarkerSink::default();
        let channel =
            MarkerChannel::new("sequencer", Arc::new(clock)).with_sink(Arc::new(sink.clone()));
        (channel, sink)
    }

    #[test]
    fn emit_stamps_with_current_clock_reading() {
        let clock = FakeClock::new(12.0);
        let (channel, sink) = channel_with_memory(clock.clone());
        channel.emit("Blink_start");
        clock.advance(Duration::from_millis(1500));
        channel.emit("Blink_Index:1");

        let markers = sink.markers();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].timestamp.as_secs(), 12.0);
        assert_eq!(markers[1].timestamp.as_secs(), 13.5);
        assert_eq!(channel.stats().emitted, 2);
    }

    #[test]
    fn failing_sink_drops_marker_without_raising() {
        let (channel, sink) = channel_with_memory(FakeClock::default());
        sink.fail_next(1);
        channel.emit("Blink_start");
        channel.emit("Blink_done");

        assert_eq!(sink.labels(), vec!["Blink_done".to_string()]);
        assert_eq!(
            channel.stats(),
            ChannelStats {
                emitted: 2,
                dropped: 1
            }
        );
    }

    #[test]
    fn subscribers_receive_broadcast_markers() {
        let (channel, _sink) = channel_with_memory(FakeClock::default());
        let mut rx = channel.subscribe();
        channel.emit("Session_start");
        let received = rx.try_recv().expect("broadcast marker");
        assert_eq!(received.label, "Session_start");
    }

    #[test]
    fn emit_frame_writes_frame_row_and_index_marker() {
        let (channel, sink) = channel_with_memory(FakeClock::default());
        let marker = channel.emit_frame(
            "Video",
            FrameRecord {
                frame_index: 7,
                timestamp: ClockReading::from_secs(3.25),
            },
        );
        assert_eq!(marker.label, "Video_Index:7");
        assert_eq!(marker.timestamp.as_secs(), 3.25);
        assert_eq!(sink.frames().len(), 1);
    }

    #[test]
    fn label_validation_accepts_conventions_and_rejects_free_text() {
        for ok in [
            "Blink_start",
            "Blink_done",
            "DoubleBlink_Index:12",
            "Close_baseline_start",
            "Session_done",
        ] {
            validate_label(ok).unwrap_or_else(|e| panic!("{ok} rejected: {e}"));
        }
        for bad in [
            "blink",
            "_start",
            "Blink_",
            "Blink_Index:",
            "Blink_Index:x1",
            "Blink now_start",
            "9Blink_start",
        ] {
            assert!(
                matches!(validate_label(bad), Err(CuesyncError::MalformedMarkerLabel(_))),
                "{bad} accepted"
            );
        }
    }
}
