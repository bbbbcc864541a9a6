//! Drives the ordered phase list against a stimulus sink and the marker channel.
//!
//! Every deadline is anchored to the phase start on the shared clock, so cue
//! times do not drift with sink latency. Waits go through `Clock::sleep_until`
//! in short slices; between slices the stop flag and the sink's abort key are
//! checked.

use crate::errors::CuesyncError;
use crate::fsm::SequencerSnapshot;
use crate::logging::append_run_log;
use crate::markers::MarkerChannel;
use crate::runtime::{Clock, ClockReading};
use crate::stimulus::{Stimulus, StimulusSink};
use crate::types::{Advance, PhaseDescriptor, PhaseKind, Position, SequencerState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const SESSION_MARKER_PHASE: &str = "Session";
const ABORT_POLL_SECONDS: f64 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub struct SequencerSettings {
    pub cue_hold_seconds: f64,
    pub cue_tone_seconds: f64,
    pub tone_frequency_hz: f64,
    pub end_tone_seconds: f64,
    /// Hold after the end-of-phase tone before `_done`.
    pub end_hold_seconds: f64,
    pub outro_seconds: f64,
    pub welcome_text: String,
    pub continue_text: String,
    pub closing_text: String,
    pub closing_seconds: f64,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            cue_hold_seconds: 1.0,
            cue_tone_seconds: 0.2,
            tone_frequency_hz: 440.0,
            end_tone_seconds: 0.5,
            end_hold_seconds: 1.0,
            outro_seconds: 2.0,
            welcome_text: "Welcome!\n\nPress any key to begin.".to_string(),
            continue_text: "Press any key to continue.".to_string(),
            closing_text: "Experiment complete!\n\nThank you for participating.".to_string(),
            closing_seconds: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub name: String,
    pub kind: &'static str,
    pub started_at: ClockReading,
    pub done_at: Option<ClockReading>,
    pub cues: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequencerReport {
    pub state: SequencerState,
    pub phases_completed: usize,
    pub phase_count: usize,
    pub failure_reason: Option<String>,
    pub phases: Vec<PhaseReport>,
}

pub struct PhaseSequencer<'a> {
    phases: &'a [PhaseDescriptor],
    channel: &'a MarkerChannel,
    sink: &'a mut dyn StimulusSink,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    settings: SequencerSettings,
    snapshot: SequencerSnapshot,
    reports: Vec<PhaseReport>,
    stop: Option<&'a AtomicBool>,
}

impl<'a> PhaseSequencer<'a> {
    pub fn new(
        phases: &'a [PhaseDescriptor],
        channel: &'a MarkerChannel,
        sink: &'a mut dyn StimulusSink,
        settings: SequencerSettings,
        seed: u64,
    ) -> Self {
        Self {
            phases,
            channel,
            sink,
            clock: Arc::clone(channel.clock()),
            rng: StdRng::seed_from_u64(seed),
            settings,
            snapshot: SequencerSnapshot::new(phases.len()),
            reports: Vec::with_capacity(phases.len()),
            stop: None,
        }
    }

    /// Abort with `Interrupted` as soon as `stop` is raised, including mid-phase.
    pub fn with_stop_flag(mut self, stop: &'a AtomicBool) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn state(&self) -> SequencerState {
        self.snapshot.state
    }

    pub fn report(&self) -> SequencerReport {
        SequencerReport {
            state: self.snapshot.state,
            phases_completed: self.snapshot.phases_completed,
            phase_count: self.snapshot.phase_count,
            failure_reason: self.snapshot.failure_reason.clone(),
            phases: self.reports.clone(),
        }
    }

    pub fn run(&mut self) -> Result<SequencerReport, CuesyncError> {
        self.run_with(|_, _| Ok(()))
    }

    /// Run every phase. `before_phase` is called ahead of each phase (the
    /// session driver polls recorder health there); an error from it aborts
    /// the run just like a sink error.
    pub fn run_with(
        &mut self,
        mut before_phase: impl FnMut(usize, &PhaseDescriptor) -> Result<(), CuesyncError>,
    ) -> Result<SequencerReport, CuesyncError> {
        if self.phases.is_empty() {
            return Err(CuesyncError::InvalidConfig(
                "protocol has no phases".to_string(),
            ));
        }
        self.snapshot
            .transition(SequencerState::AwaitingOperatorStart)?;

        match self.drive(&mut before_phase) {
            Ok(()) => Ok(self.report()),
            Err(error) => {
                let reason = error.to_string();
                if self.snapshot.fail(&reason).is_err() {
                    // already Complete: the closing screen failed
                    self.snapshot.failure_reason = Some(reason);
                }
                append_run_log(
                    "error",
                    "sequencer.failed",
                    json!({
                        "phases_completed": self.snapshot.phases_completed,
                        "error": error.to_string(),
                    }),
                );
                Err(error)
            }
        }
    }

    fn drive(
        &mut self,
        before_phase: &mut impl FnMut(usize, &PhaseDescriptor) -> Result<(), CuesyncError>,
    ) -> Result<(), CuesyncError> {
        let phases = self.phases;
        let welcome = phases[0]
            .intro
            .clone()
            .unwrap_or_else(|| self.settings.welcome_text.clone());
        self.sink.present(&Stimulus::text(welcome))?;
        self.sink.wait_for_operator_key()?;

        for (index, phase) in phases.iter().enumerate() {
            self.snapshot.transition(SequencerState::Running(index))?;
            if index == 0 {
                self.channel.emit(&format!("{SESSION_MARKER_PHASE}_start"));
            }
            before_phase(index, phase)?;
            if index > 0 && phase.advance == Advance::Operator {
                let intro = phase
                    .intro
                    .clone()
                    .unwrap_or_else(|| format!("{}\n\n{}", phase.prompt, self.settings.continue_text));
                self.sink.present(&Stimulus::text(intro))?;
                self.sink.wait_for_operator_key()?;
            }
            self.run_phase(phase)?;
            self.snapshot.on_phase_done()?;
        }

        self.snapshot.transition(SequencerState::Complete)?;
        self.channel.emit(&format!("{SESSION_MARKER_PHASE}_done"));
        append_run_log(
            "info",
            "sequencer.complete",
            json!({ "phases": self.snapshot.phases_completed }),
        );
        let closing = Stimulus::text(self.settings.closing_text.clone());
        self.sink.present(&closing)?;
        self.sink.wait_seconds(self.settings.closing_seconds)
    }

    fn run_phase(&mut self, phase: &PhaseDescriptor) -> Result<(), CuesyncError> {
        if phase.lead_in_seconds > 0.0 {
            self.sink.present(&Stimulus::text(phase.prompt.clone()))?;
            self.wait_for(phase.lead_in_seconds)?;
        }

        let started = self.channel.emit(&phase.start_label()).timestamp;
        let end = started.after(phase.duration_seconds);
        self.reports.push(PhaseReport {
            name: phase.name.clone(),
            kind: phase.kind.as_str(),
            started_at: started,
            done_at: None,
            cues: 0,
        });
        append_run_log(
            "info",
            "sequencer.phase.started",
            json!({ "phase": phase.name, "kind": phase.kind.as_str(), "duration": phase.duration_seconds }),
        );

        let cues = match &phase.kind {
            PhaseKind::Fixed => {
                self.sink.present(&Stimulus::text(phase.prompt.clone()))?;
                self.wait_until(end)?;
                0
            }
            PhaseKind::PeriodicCue {
                interval_seconds,
                cue_text,
            } => self.periodic_cues(phase, started, end, *interval_seconds, cue_text)?,
            PhaseKind::JitteredCue {
                min_gap_seconds,
                max_gap_seconds,
                cue_text,
            } => self.jittered_cues(phase, started, end, (*min_gap_seconds, *max_gap_seconds), cue_text)?,
            PhaseKind::TargetTracking {
                positions,
                cadence_seconds,
                show_fixation,
            } => {
                self.track_targets(started, end, positions, *cadence_seconds, *show_fixation)?;
                0
            }
            PhaseKind::FixationSaccade {
                positions,
                min_gap_seconds,
                max_gap_seconds,
                transient_seconds,
            } => self.fixation_saccades(
                phase,
                started,
                end,
                positions,
                (*min_gap_seconds, *max_gap_seconds),
                *transient_seconds,
            )?,
        };

        if phase.end_tone {
            self.sink
                .play_tone(self.settings.tone_frequency_hz, self.settings.end_tone_seconds)?;
            self.wait_for(self.settings.end_hold_seconds)?;
        }
        let done = self.channel.emit(&phase.done_label()).timestamp;
        if let Some(report) = self.reports.last_mut() {
            report.done_at = Some(done);
            report.cues = cues;
        }
        append_run_log(
            "info",
            "sequencer.phase.done",
            json!({ "phase": phase.name, "cues": cues, "elapsed": done - started }),
        );

        if let Some(outro) = &phase.outro {
            self.sink.present(&Stimulus::text(outro.clone()))?;
            self.sink.wait_seconds(self.settings.outro_seconds)?;
            self.check_stop()?;
        }
        Ok(())
    }

    /// `n = floor(duration / interval)` cues at `start + k * interval`.
    fn periodic_cues(
        &mut self,
        phase: &PhaseDescriptor,
        started: ClockReading,
        end: ClockReading,
        interval: f64,
        cue_text: &str,
    ) -> Result<u64, CuesyncError> {
        let n = phase.planned_cues().unwrap_or(0);
        self.sink.present(&Stimulus::text(phase.prompt.clone()))?;
        for k in 1..=n {
            let due = started.after(k as f64 * interval);
            self.wait_until(due)?;
            let text = cue_text
                .replace("{k}", &k.to_string())
                .replace("{n}", &n.to_string());
            self.present_cue(phase, k, text)?;
            self.wait_until(due.after(self.settings.cue_hold_seconds))?;
            self.sink.present(&Stimulus::text(phase.prompt.clone()))?;
        }
        self.wait_until(end)?;
        Ok(n)
    }

    /// Gaps drawn from `[min, max]`; a cue whose gap would cross the phase end
    /// is never shown.
    fn jittered_cues(
        &mut self,
        phase: &PhaseDescriptor,
        started: ClockReading,
        end: ClockReading,
        gap: (f64, f64),
        cue_text: &str,
    ) -> Result<u64, CuesyncError> {
        self.sink.present(&Stimulus::text(phase.prompt.clone()))?;
        let mut cursor = started;
        let mut k = 0;
        loop {
            let due = cursor.after(uniform(&mut self.rng, gap.0, gap.1));
            if due > end {
                break;
            }
            self.wait_until(due)?;
            k += 1;
            self.present_cue(phase, k, cue_text.replace("{k}", &k.to_string()))?;
            let hold_until = due.after(self.settings.cue_hold_seconds).min(end);
            self.wait_until(hold_until)?;
            self.sink.present(&Stimulus::text(phase.prompt.clone()))?;
            cursor = hold_until;
        }
        self.wait_until(end)?;
        Ok(k)
    }

    fn present_cue(&mut self, phase: &PhaseDescriptor, k: u64, text: String) -> Result<(), CuesyncError> {
        self.sink.present(&Stimulus::text(text))?;
        self.channel.emit(&phase.index_label(k));
        self.sink
            .play_tone(self.settings.tone_frequency_hz, self.settings.cue_tone_seconds)
    }

    /// Position at tick `t` is `positions[t % len]`.
    fn track_targets(
        &mut self,
        started: ClockReading,
        end: ClockReading,
        positions: &[Position],
        cadence: f64,
        show_fixation: bool,
    ) -> Result<(), CuesyncError> {
        if positions.is_empty() || cadence <= 0.0 {
            return self.wait_until(end);
        }
        let mut tick: u64 = 0;
        loop {
            let due = started.after(tick as f64 * cadence);
            if due >= end {
                break;
            }
            self.wait_until(due)?;
            self.sink.present(&Stimulus::Target {
                position: target_at(positions, tick),
                with_fixation: show_fixation,
            })?;
            tick += 1;
        }
        self.wait_until(end)
    }

    /// Fixation with transient peripheral targets. The next target is only
    /// scheduled once the previous one has fired.
    fn fixation_saccades(
        &mut self,
        phase: &PhaseDescriptor,
        started: ClockReading,
        end: ClockReading,
        positions: &[Position],
        gap: (f64, f64),
        transient: f64,
    ) -> Result<u64, CuesyncError> {
        self.sink.present(&Stimulus::Fixation)?;
        if positions.is_empty() {
            self.wait_until(end)?;
            return Ok(0);
        }
        let mut k = 0;
        let mut due = started.after(uniform(&mut self.rng, gap.0, gap.1));
        while due < end {
            self.wait_until(due)?;
            k += 1;
            let position = positions[self.rng.gen_range(0..positions.len())];
            self.sink.present(&Stimulus::target(position))?;
            self.channel.emit(&phase.index_label(k));
            let back = due.after(transient).min(end);
            self.wait_until(back)?;
            self.sink.present(&Stimulus::Fixation)?;
            due = due.after(uniform(&mut self.rng, gap.0, gap.1)).max(back);
        }
        self.wait_until(end)?;
        Ok(k)
    }
}

impl PhaseSequencer<'_> {
    fn check_stop(&mut self) -> Result<(), CuesyncError> {
        if self.stop.is_some_and(|stop| stop.load(Ordering::SeqCst)) {
            return Err(CuesyncError::Interrupted(
                "stop signal received during a phase".to_string(),
            ));
        }
        self.sink.poll_abort()
    }

    fn wait_until(&mut self, deadline: ClockReading) -> Result<(), CuesyncError> {
        loop {
            self.check_stop()?;
            let now = self.clock.now();
            if now >= deadline {
                return Ok(());
            }
            let next = now.after(ABORT_POLL_SECONDS);
            if next >= deadline {
                self.clock.sleep_until(deadline)?;
                return self.check_stop();
            }
            self.clock.sleep_until(next)?;
        }
    }

    fn wait_for(&mut self, seconds: f64) -> Result<(), CuesyncError> {
        let deadline = self.clock.now().after(seconds);
        self.wait_until(deadline)
    }
}

pub fn target_at(positions: &[Position], tick: u64) -> Position {
    positions[(tick % positions.len() as u64) as usize]
}

fn uniform(rng: &mut StdRng, min: f64, max: f64) -> f64 {
    if max > min {
        rng.gen_range(min..=max)
    } else {
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::MemoryMarkerSink;
    use crate::runtime::FakeClock;
    use crate::stimulus::{RecordingStimulusSink, StimulusEvent};
    use crate::types::Marker;

    struct Rig {
        clock: FakeClock,
        markers: MemoryMarkerSink,
        channel: MarkerChannel,
        sink: RecordingStimulusSink,
    }

    fn rig() -> Rig {
        let clock = FakeClock::new(50.0);
        let markers = MemoryMarkerSink::default();
        let channel = MarkerChannel::new("sequencer", Arc::new(clock.clone()))
            .with_sink(Arc::new(markers.clone()));
        let sink = RecordingStimulusSink::new(Arc::new(clock.clone()));
        Rig {
            clock,
            markers,
            channel,
            sink,
        }
    }

    fn quiet() -> SequencerSettings {
        SequencerSettings {
            closing_seconds: 0.0,
            ..SequencerSettings::default()
        }
    }

    fn find<'m>(markers: &'m [Marker], label: &str) -> &'m Marker {
        markers
            .iter()
            .find(|m| m.label == label)
            .unwrap_or_else(|| panic!("missing marker {label}"))
    }

    fn blink_phase() -> PhaseDescriptor {
        PhaseDescriptor::fixed("Blink", "Blink when prompted", 30.0)
            .with_kind(PhaseKind::PeriodicCue {
                interval_seconds: 3.0,
                cue_text: "Blink Now ({k}/{n})".to_string(),
            })
            .without_end_tone()
    }

    #[test]
    fn periodic_cues_land_on_interval_multiples() {
        let rig = rig();
        let phases = vec![blink_phase()];
        let mut sink = rig.sink.clone();
        PhaseSequencer::new(&phases, &rig.channel, &mut sink, quiet(), 1)
            .run()
            .expect("run");

        let markers = rig.markers.markers();
        let start = find(&markers, "Blink_start").timestamp;
        let cues: Vec<&Marker> = markers
            .iter()
            .filter(|m| m.label.starts_with("Blink_Index:"))
            .collect();
        assert_eq!(cues.len(), 10);
        for (i, cue) in cues.iter().enumerate() {
            let k = i + 1;
            assert_eq!(cue.label, format!("Blink_Index:{k}"));
            let offset = cue.timestamp - start;
            assert!((offset - 3.0 * k as f64).abs() < 1e-6, "cue {k} at {offset}");
            assert!(offset <= 30.0 + 1e-6);
        }
        assert!(rig
            .sink
            .presented()
            .contains(&Stimulus::text("Blink Now (10/10)")));
    }

    #[test]
    fn fixed_phase_runs_duration_then_tone_hold() {
        let rig = rig();
        let phases = vec![PhaseDescriptor::fixed("Close_baseline", "Relax", 30.0)];
        let mut sink = rig.sink.clone();
        PhaseSequencer::new(&phases, &rig.channel, &mut sink, quiet(), 1)
            .run()
            .expect("run");

        let markers = rig.markers.markers();
        let start = find(&markers, "Close_baseline_start").timestamp;
        let done = find(&markers, "Close_baseline_done").timestamp;
        assert!((done - start - 31.0).abs() < 1e-6);
        assert!(rig.sink.events().iter().any(|(_, event)| matches!(
            event,
            StimulusEvent::Tone { frequency_hz, .. } if *frequency_hz == 440.0
        )));
    }

    #[test]
    fn jittered_cues_stop_on_elapsed_time_and_replay_with_seed() {
        let run = |seed: u64| {
            let rig = rig();
            let phases = vec![PhaseDescriptor::fixed("DoubleBlink", "Double blink", 30.0)
                .with_kind(PhaseKind::JitteredCue {
                    min_gap_seconds: 2.0,
                    max_gap_seconds: 5.0,
                    cue_text: "Double Blink Now ({k})".to_string(),
                })
                .without_end_tone()];
            let mut sink = rig.sink.clone();
            PhaseSequencer::new(&phases, &rig.channel, &mut sink, quiet(), seed)
                .run()
                .expect("run");
            rig.markers.markers()
        };

        let first = run(42);
        let start = find(&first, "DoubleBlink_start").timestamp;
        let cues: Vec<f64> = first
            .iter()
            .filter(|m| m.label.starts_with("DoubleBlink_Index:"))
            .map(|m| m.timestamp - start)
            .collect();
        assert!(cues.len() >= 5, "expected at least 5 cues, got {}", cues.len());
        assert!(cues.iter().all(|offset| *offset <= 30.0 + 1e-6));
        assert!(cues.windows(2).all(|w| w[1] - w[0] >= 3.0 - 1e-6));

        let labels = |markers: &[Marker]| markers.iter().map(|m| m.label.clone()).collect::<Vec<_>>();
        assert_eq!(labels(&first), labels(&run(42)));
    }

    #[test]
    fn target_tracking_alternates_positions_by_tick() {
        let rig = rig();
        let phases = vec![PhaseDescriptor::fixed("VerticalSaccades", "Follow the dot", 3.0)
            .with_kind(PhaseKind::TargetTracking {
                positions: vec![[0.0, 0.8], [0.0, -0.8]],
                cadence_seconds: 0.5,
                show_fixation: true,
            })];
        let mut sink = rig.sink.clone();
        PhaseSequencer::new(&phases, &rig.channel, &mut sink, quiet(), 1)
            .run()
            .expect("run");

        let targets: Vec<Position> = rig
            .sink
            .presented()
            .into_iter()
            .filter_map(|s| match s {
                Stimulus::Target {
                    position,
                    with_fixation: true,
                } => Some(position),
                _ => None,
            })
            .collect();
        assert_eq!(targets.len(), 6);
        for (tick, position) in targets.iter().enumerate() {
            assert_eq!(*position, target_at(&[[0.0, 0.8], [0.0, -0.8]], tick as u64));
        }
    }

    #[test]
    fn fixation_saccade_schedules_next_target_after_previous_fires() {
        let rig = rig();
        let phases = vec![PhaseDescriptor::fixed("MicrosleepFixation", "Keep your eyes on the cross", 180.0)
            .with_kind(PhaseKind::FixationSaccade {
                positions: vec![[-0.8, 0.0], [0.8, 0.0], [0.0, 0.8], [0.0, -0.8]],
                min_gap_seconds: 5.0,
                max_gap_seconds: 10.0,
                transient_seconds: 1.0,
            })];
        let mut sink = rig.sink.clone();
        PhaseSequencer::new(&phases, &rig.channel, &mut sink, quiet(), 9)
            .run()
            .expect("run");

        let markers = rig.markers.markers();
        let start = find(&markers, "MicrosleepFixation_start").timestamp;
        let offsets: Vec<f64> = markers
            .iter()
            .filter(|m| m.label.starts_with("MicrosleepFixation_Index:"))
            .map(|m| m.timestamp - start)
            .collect();
        assert!(offsets.len() >= 17 && offsets.len() <= 36);
        assert!(offsets[0] >= 5.0 - 1e-6 && offsets[0] <= 10.0 + 1e-6);
        for pair in offsets.windows(2) {
            let gap = pair[1] - pair[0];
            assert!((5.0 - 1e-6..=10.0 + 1e-6).contains(&gap), "gap {gap}");
        }
        assert!(offsets.iter().all(|offset| *offset < 180.0));
    }

    #[test]
    fn operator_gate_only_for_first_and_operator_phases() {
        let rig = rig();
        let phases = vec![
            PhaseDescriptor::fixed("A", "first", 1.0),
            PhaseDescriptor::fixed("B", "timed", 1.0).with_advance(Advance::Timed),
            PhaseDescriptor::fixed("C", "operator", 1.0).with_intro("Part C\n\nPress any key"),
        ];
        let mut sink = rig.sink.clone();
        let report = PhaseSequencer::new(&phases, &rig.channel, &mut sink, quiet(), 1)
            .run()
            .expect("run");

        assert_eq!(rig.sink.operator_waits(), 2);
        assert!(rig.sink.presented().contains(&Stimulus::text("Part C\n\nPress any key")));
        assert_eq!(report.state, SequencerState::Complete);
        assert_eq!(report.phases_completed, 3);
    }

    #[test]
    fn phases_emit_start_before_done_and_never_interleave() {
        let rig = rig();
        let phases = vec![
            blink_phase(),
            PhaseDescriptor::fixed("JawClench", "Clench", 5.0).with_outro("Done"),
            PhaseDescriptor::fixed("HorizontalSaccades", "Follow", 4.0)
                .with_lead_in(5.0)
                .with_kind(PhaseKind::TargetTracking {
                    positions: vec![[-0.8, 0.0], [0.8, 0.0]],
                    cadence_seconds: 1.0,
                    show_fixation: false,
                }),
        ];
        let mut sink = rig.sink.clone();
        PhaseSequencer::new(&phases, &rig.channel, &mut sink, quiet(), 3)
            .run()
            .expect("run");

        let boundaries: Vec<String> = rig
            .markers
            .labels()
            .into_iter()
            .filter(|label| label.ends_with("_start") || label.ends_with("_done"))
            .collect();
        assert_eq!(
            boundaries,
            vec![
                "Session_start",
                "Blink_start",
                "Blink_done",
                "JawClench_start",
                "JawClench_done",
                "HorizontalSaccades_start",
                "HorizontalSaccades_done",
                "Session_done",
            ]
        );
        let stamps: Vec<ClockReading> = rig.markers.markers().iter().map(|m| m.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        assert!(rig.clock.now().as_secs() > 50.0);
    }

    #[test]
    fn sink_failure_is_terminal_and_suppresses_done() {
        let rig = rig();
        let phases = vec![blink_phase(), PhaseDescriptor::fixed("Rest", "Relax", 5.0)];
        let mut sink = rig.sink.clone();
        // welcome + prompt + 2 cues with prompt restores, then the 3rd cue fails
        rig.sink.fail_on_present(7);
        let mut sequencer = PhaseSequencer::new(&phases, &rig.channel, &mut sink, quiet(), 1);
        let err = sequencer.run().expect_err("sink failure");
        assert!(matches!(err, CuesyncError::StimulusSink(_)));
        assert_eq!(sequencer.state(), SequencerState::Failed);
        let report = sequencer.report();
        assert_eq!(report.phases_completed, 0);
        assert!(report.failure_reason.is_some());

        let labels = rig.markers.labels();
        assert!(labels.contains(&"Blink_start".to_string()));
        assert!(labels.contains(&"Blink_Index:2".to_string()));
        assert!(!labels.contains(&"Blink_Index:3".to_string()));
        assert!(!labels.iter().any(|label| label.ends_with("_done")));
        assert!(!labels.contains(&"Rest_start".to_string()));
    }

    #[test]
    fn stop_flag_raised_mid_phase_interrupts_before_done() {
        let rig = rig();
        let phases = vec![
            PhaseDescriptor::fixed("MicrosleepFixation", "Keep your eyes on the cross", 180.0),
            PhaseDescriptor::fixed("Rest", "Relax", 5.0),
        ];
        let stop = Arc::new(AtomicBool::new(false));
        rig.clock.raise_at(50.0 + 40.0, Arc::clone(&stop));
        let mut sink = rig.sink.clone();
        let mut sequencer =
            PhaseSequencer::new(&phases, &rig.channel, &mut sink, quiet(), 1).with_stop_flag(&stop);

        let err = sequencer.run().expect_err("interrupted");
        assert!(matches!(err, CuesyncError::Interrupted(_)));
        assert_eq!(sequencer.state(), SequencerState::Failed);
        assert_eq!(sequencer.report().phases_completed, 0);

        let labels = rig.markers.labels();
        assert!(labels.contains(&"MicrosleepFixation_start".to_string()));
        assert!(!labels.iter().any(|label| label.ends_with("_done")));
        assert!(!labels.contains(&"Rest_start".to_string()));
        assert!(rig.clock.now().as_secs() < 50.0 + 41.0);
    }

    #[test]
    fn operator_abort_key_mid_phase_fails_the_run() {
        let rig = rig();
        let phases = vec![PhaseDescriptor::fixed("JawClench", "Clench", 30.0)];
        // a handful of slices into the phase
        rig.sink.abort_on_poll(20);
        let mut sink = rig.sink.clone();
        let mut sequencer = PhaseSequencer::new(&phases, &rig.channel, &mut sink, quiet(), 1);

        let err = sequencer.run().expect_err("aborted");
        assert!(matches!(err, CuesyncError::StimulusSink(_)));
        assert_eq!(sequencer.state(), SequencerState::Failed);
        assert!(rig.markers.labels().contains(&"JawClench_start".to_string()));
        assert!(!rig.markers.labels().contains(&"JawClench_done".to_string()));
        assert!(rig.clock.now().as_secs() < 50.0 + 30.0);
    }

    #[test]
    fn closing_screen_failure_is_recorded_after_complete() {
        let rig = rig();
        let phases = vec![PhaseDescriptor::fixed("Rest", "Relax", 2.0)];
        // welcome, phase prompt, then the closing screen
        rig.sink.fail_on_present(3);
        let mut sink = rig.sink.clone();
        let mut sequencer = PhaseSequencer::new(&phases, &rig.channel, &mut sink, quiet(), 1);

        let err = sequencer.run().expect_err("closing failure");
        assert!(matches!(err, CuesyncError::StimulusSink(_)));
        let report = sequencer.report();
        assert_eq!(report.state, SequencerState::Complete);
        assert_eq!(report.phases_completed, 1);
        assert!(report
            .failure_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("display window lost")));
        assert!(rig.markers.labels().contains(&"Session_done".to_string()));
    }
}
