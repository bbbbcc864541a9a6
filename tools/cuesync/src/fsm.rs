use crate::errors::CuesyncError;
use crate::types::SequencerState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerSnapshot {
    pub state: SequencerState,
    pub phase_count: usize,
    pub phases_completed: usize,
    pub failure_reason: Option<String>,
}

impl SequencerSnapshot {
    pub fn new(phase_count: usize) -> Self {
        Self {
            state: SequencerState::Idle,
            phase_count,
            phases_completed: 0,
            failure_reason: None,
        }
    }

    pub fn transition(&mut self, next: SequencerState) -> Result<(), CuesyncError> {
        validate_transition(self.state, next, self.phase_count)?;
        self.state = next;
        Ok(())
    }

    pub fn on_phase_done(&mut self) -> Result<(), CuesyncError> {
        let SequencerState::Running(index) = self.state else {
            return Err(CuesyncError::InvalidConfig(format!(
                "phase completion outside a running phase ({})",
                self.state.as_str()
            )));
        };
        self.phases_completed = index + 1;
        Ok(())
    }

    pub fn fail(&mut self, reason: &str) -> Result<(), CuesyncError> {
        self.failure_reason = Some(reason.to_string());
        self.transition(SequencerState::Failed)
    }
}

pub fn validate_transition(
    from: SequencerState,
    to: SequencerState,
    phase_count: usize,
) -> Result<(), CuesyncError> {
    use SequencerState as S;

    let allowed = match (from, to) {
        (S::Idle, S::AwaitingOperatorStart) => true,
        (S::AwaitingOperatorStart, S::Running(0)) => phase_count > 0,
        (S::Running(i), S::Running(j)) => j == i + 1 && j < phase_count,
        (S::Running(i), S::Complete) => i + 1 == phase_count,
        (S::Running(_), S::Failed) => true,
        (S::AwaitingOperatorStart, S::Failed) => true,
        _ => false,
    };

    if !allowed {
        return Err(CuesyncError::InvalidConfig(format!(
            "illegal sequencer transition: {:?} -> {:?}",
            from, to
        )));
    }
    Ok(())
}
