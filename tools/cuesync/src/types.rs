use crate::runtime::ClockReading;
use serde::{Deserialize, Serialize};

/// Screen position in normalized units, both axes in `-1.0..=1.0`, origin at center.
pub type Position = [f32; 2];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub label: String,
    pub timestamp: ClockReading,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame_index: u64,
    pub timestamp: ClockReading,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseKind {
    Fixed,
    PeriodicCue {
        interval_seconds: f64,
        cue_text: String,
    },
    JitteredCue {
        min_gap_seconds: f64,
        max_gap_seconds: f64,
        cue_text: String,
    },
    TargetTracking {
        positions: Vec<Position>,
        cadence_seconds: f64,
        show_fixation: bool,
    },
    FixationSaccade {
        positions: Vec<Position>,
        min_gap_seconds: f64,
        max_gap_seconds: f64,
        transient_seconds: f64,
    },
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::PeriodicCue { .. } => "periodic_cue",
            Self::JitteredCue { .. } => "jittered_cue",
            Self::TargetTracking { .. } => "target_tracking",
            Self::FixationSaccade { .. } => "fixation_saccade",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Advance {
    /// Wait for an operator key before the phase begins.
    #[default]
    Operator,
    /// Begin as soon as the previous phase is done.
    Timed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseDescriptor {
    pub name: String,
    pub prompt: String,
    pub duration_seconds: f64,
    pub kind: PhaseKind,
    pub advance: Advance,
    pub intro: Option<String>,
    pub lead_in_seconds: f64,
    pub end_tone: bool,
    pub outro: Option<String>,
}

impl PhaseDescriptor {
    pub fn fixed(name: &str, prompt: &str, duration_seconds: f64) -> Self {
        Self {
            name: name.to_string(),
            prompt: prompt.to_string(),
            duration_seconds,
            kind: PhaseKind::Fixed,
            advance: Advance::Operator,
            intro: None,
            lead_in_seconds: 0.0,
            end_tone: true,
            outro: None,
        }
    }

    pub fn with_kind(mut self, kind: PhaseKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_advance(mut self, advance: Advance) -> Self {
        self.advance = advance;
        self
    }

    pub fn with_intro(mut self, intro: &str) -> Self {
        self.intro = Some(intro.to_string());
        self
    }

    pub fn with_outro(mut self, outro: &str) -> Self {
        self.outro = Some(outro.to_string());
        self
    }

    pub fn with_lead_in(mut self, seconds: f64) -> Self {
        self.lead_in_seconds = seconds;
        self
    }

    pub fn without_end_tone(mut self) -> Self {
        self.end_tone = false;
        self
    }

    pub fn start_label(&self) -> String {
        format!("{}_start", self.name)
    }

    pub fn done_label(&self) -> String {
        format!("{}_done", self.name)
    }

    pub fn index_label(&self, k: u64) -> String {
        format!("{}_Index:{k}", self.name)
    }

    /// Number of cues a fixed-count phase presents; `None` for every other kind.
    pub fn planned_cues(&self) -> Option<u64> {
        match &self.kind {
            PhaseKind::PeriodicCue {
                interval_seconds, ..
            } if *interval_seconds > 0.0 => {
                // tolerate ratios like 0.3 / 0.1 landing just under an integer
                Some((self.duration_seconds / interval_seconds + 1e-9).floor() as u64)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Starting,
    Running,
    Failed,
    Stopped,
}

impl RecorderState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum SequencerState {
    Idle,
    AwaitingOperatorStart,
    Running(usize),
    Complete,
    Failed,
}

impl SequencerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingOperatorStart => "awaiting_operator_start",
            Self::Running(_) => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_follow_phase_event_convention() {
        let phase = PhaseDescriptor::fixed("Blink", "Blink on cue", 30.0);
        assert_eq!(phase.start_label(), "Blink_start");
        assert_eq!(phase.done_label(), "Blink_done");
        assert_eq!(phase.index_label(4), "Blink_Index:4");
    }

    #[test]
    fn planned_cues_floor_duration_by_interval() {
        let phase = PhaseDescriptor::fixed("Blink", "x", 30.0).with_kind(PhaseKind::PeriodicCue {
            interval_seconds: 4.0,
            cue_text: "Blink".to_string(),
        });
        assert_eq!(phase.planned_cues(), Some(7));
        let short = PhaseDescriptor::fixed("Blink", "x", 0.3).with_kind(PhaseKind::PeriodicCue {
            interval_seconds: 0.1,
            cue_text: "Blink".to_string(),
        });
        assert_eq!(short.planned_cues(), Some(3));
        assert_eq!(PhaseDescriptor::fixed("Rest", "x", 30.0).planned_cues(), None);
    }
}
