use crate::errors::CuesyncError;
use crate::runtime::{Clock, ClockReading};
use crate::types::Position;
use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stimulus", rename_all = "snake_case")]
pub enum Stimulus {
    Text { text: String },
    Fixation,
    Target {
        position: Position,
        with_fixation: bool,
    },
}

impl Stimulus {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn target(position: Position) -> Self {
        Self::Target {
            position,
            with_fixation: false,
        }
    }
}

/// Display and audio surface driven by the sequencer.
///
/// Any error is fatal to the session; sinks do not retry.
pub trait StimulusSink {
    fn present(&mut self, stimulus: &Stimulus) -> Result<(), CuesyncError>;
    /// Start a tone; returns without waiting for it to finish.
    fn play_tone(&mut self, frequency_hz: f64, seconds: f64) -> Result<(), CuesyncError>;
    fn wait_for_operator_key(&mut self) -> Result<(), CuesyncError>;
    fn wait_seconds(&mut self, seconds: f64) -> Result<(), CuesyncError>;
    /// Non-blocking check for an operator abort, called between timed slices
    /// of a phase. Input consumed here does not count as an operator key.
    fn poll_abort(&mut self) -> Result<(), CuesyncError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StimulusEvent {
    Presented { stimulus: Stimulus },
    Tone { frequency_hz: f64, seconds: f64 },
    OperatorKey,
    Waited { seconds: f64 },
}

#[derive(Default)]
struct RecordingState {
    events: Vec<(ClockReading, StimulusEvent)>,
    presents: u64,
    fail_on_present: Option<u64>,
    fail_on_operator_key: bool,
    polls: u64,
    abort_on_poll: Option<u64>,
}

/// Sink that records every call with the clock reading it happened at.
///
/// Clones share state, so a test can keep one handle while the sequencer owns
/// another.
#[derive(Clone)]
pub struct RecordingStimulusSink {
    clock: Arc<dyn Clock>,
    operator_delay_seconds: f64,
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingStimulusSink {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            operator_delay_seconds: 0.0,
            state: Arc::new(Mutex::new(RecordingState::default())),
        }
    }

    /// Simulated operator reaction time per key wait.
    pub fn with_operator_delay(mut self, seconds: f64) -> Self {
        self.operator_delay_seconds = seconds;
        self
    }

    /// The `n`-th (1-based) `present` call fails.
    pub fn fail_on_present(&self, n: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_on_present = Some(n);
        }
    }

    pub fn fail_on_operator_key(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_on_operator_key = true;
        }
    }

    /// The `n`-th (1-based) `poll_abort` call reports an operator abort.
    pub fn abort_on_poll(&self, n: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.abort_on_poll = Some(n);
        }
    }

    pub fn events(&self) -> Vec<(ClockReading, StimulusEvent)> {
        self.state
            .lock()
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }

    pub fn presented(&self) -> Vec<Stimulus> {
        self.events()
            .into_iter()
            .filter_map(|(_, event)| match event {
                StimulusEvent::Presented { stimulus } => Some(stimulus),
                _ => None,
            })
            .collect()
    }

    pub fn operator_waits(&self) -> usize {
        self.events()
            .iter()
            .filter(|(_, event)| matches!(event, StimulusEvent::OperatorKey))
            .count()
    }

    fn record(&self, event: StimulusEvent) -> Result<(), CuesyncError> {
        let now = self.clock.now();
        self.state
            .lock()
            .map_err(|_| CuesyncError::StimulusSink("recording sink lock poisoned".to_string()))?
            .events
            .push((now, event));
        Ok(())
    }
}

impl StimulusSink for RecordingStimulusSink {
    fn present(&mut self, stimulus: &Stimulus) -> Result<(), CuesyncError> {
        {
            let mut state = self.state.lock().map_err(|_| {
                CuesyncError::StimulusSink("recording sink lock poisoned".to_string())
            })?;
            state.presents += 1;
            if state.fail_on_present == Some(state.presents) {
                return Err(CuesyncError::StimulusSink("display window lost".to_string()));
            }
        }
        self.record(StimulusEvent::Presented {
            stimulus: stimulus.clone(),
        })
    }

    fn play_tone(&mut self, frequency_hz: f64, seconds: f64) -> Result<(), CuesyncError> {
        self.record(StimulusEvent::Tone {
            frequency_hz,
            seconds,
        })
    }

    fn wait_for_operator_key(&mut self) -> Result<(), CuesyncError> {
        let fail = self
            .state
            .lock()
            .map(|state| state.fail_on_operator_key)
            .unwrap_or(false);
        if fail {
            return Err(CuesyncError::StimulusSink(
                "operator input closed".to_string(),
            ));
        }
        if self.operator_delay_seconds > 0.0 {
            self.clock.sleep_for(self.operator_delay_seconds)?;
        }
        self.record(StimulusEvent::OperatorKey)
    }

    fn wait_seconds(&mut self, seconds: f64) -> Result<(), CuesyncError> {
        self.record(StimulusEvent::Waited { seconds })?;
        self.clock.sleep_for(seconds)
    }

    fn poll_abort(&mut self) -> Result<(), CuesyncError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CuesyncError::StimulusSink("recording sink lock poisoned".to_string()))?;
        state.polls += 1;
        if state.abort_on_poll == Some(state.polls) {
            return Err(CuesyncError::StimulusSink(
                "operator aborted the session".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeClock;

    #[test]
    fn recording_sink_shares_state_across_clones() {
        let clock = FakeClock::new(1.0);
        let handle = RecordingStimulusSink::new(Arc::new(clock.clone())).with_operator_delay(0.5);
        let mut sink = handle.clone();
        sink.present(&Stimulus::text("Close your eyes"))
            .expect("present");
        sink.wait_for_operator_key().expect("key");
        sink.wait_seconds(2.0).expect("wait");

        let events = handle.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].0.as_secs(), 1.5);
        assert_eq!(clock.now().as_secs(), 3.5);
        assert_eq!(handle.operator_waits(), 1);
    }

    #[test]
    fn injected_present_failure_is_a_sink_error() {
        let clock = FakeClock::default();
        let mut sink = RecordingStimulusSink::new(Arc::new(clock));
        sink.fail_on_present(2);
        sink.present(&Stimulus::Fixation).expect("first");
        let err = sink.present(&Stimulus::Fixation).expect_err("second");
        assert!(matches!(err, CuesyncError::StimulusSink(_)));
        assert_eq!(sink.presented().len(), 1);
    }
}
