//! Built-in recording protocol and its fingerprint.

use crate::errors::CuesyncError;
use crate::types::{PhaseDescriptor, PhaseKind, Position};
use serde::Serialize;
use sha2::{Digest, Sha256};

const HORIZONTAL: [Position; 2] = [[-0.8, 0.0], [0.8, 0.0]];
const VERTICAL: [Position; 2] = [[0.0, 0.8], [0.0, -0.8]];
const PERIPHERAL: [Position; 4] = [[-0.8, 0.0], [0.8, 0.0], [0.0, 0.8], [0.0, -0.8]];

fn rest_baseline() -> PhaseDescriptor {
    PhaseDescriptor::fixed("open_baseline", "Open baseline. Relax for 20 seconds.", 20.0)
        .with_intro(
            "Rest Baseline\n\nRelax and keep your eyes open for 20 seconds.\n\nPress any key to begin.",
        )
        .with_outro("Rest baseline complete.")
}

/// The session run when a config carries no `[[phases]]`.
pub fn default_protocol() -> Vec<PhaseDescriptor> {
    vec![
        PhaseDescriptor::fixed("Close_baseline", "Close baseline. Relax for 30 seconds.", 30.0)
            .with_intro(
                "Part 1: Eyes Close Baseline\n\nRelax with eyes closed for 30 seconds.\n\nPress any key to begin.",
            )
            .with_outro("Eyes Close Baseline complete."),
        PhaseDescriptor::fixed("Blink", "Blink when prompted.", 30.0)
            .with_kind(PhaseKind::PeriodicCue {
                interval_seconds: 3.0,
                cue_text: "Blink Now ({k}/{n})".to_string(),
            })
            .with_intro("Part 2: Blink on cue\n\nBlink every 3 seconds for 30 seconds.\n\nPress any key to begin.")
            .with_outro("Blink on cue complete.")
            .without_end_tone(),
        PhaseDescriptor::fixed("DoubleBlink", "Double blink when prompted.", 30.0)
            .with_kind(PhaseKind::JitteredCue {
                min_gap_seconds: 2.0,
                max_gap_seconds: 5.0,
                cue_text: "Double Blink Now ({k})".to_string(),
            })
            .with_intro(
                "Part 3: Double Blink\n\nDouble blink whenever prompted for 30 seconds.\n\nPress any key to begin.",
            )
            .with_outro("Double blink section complete.")
            .without_end_tone(),
        PhaseDescriptor::fixed(
            "HorizontalSaccades",
            "Follow the dot left and right until you hear the beep sound.",
            30.0,
        )
        .with_kind(PhaseKind::TargetTracking {
            positions: HORIZONTAL.to_vec(),
            cadence_seconds: 1.0,
            show_fixation: false,
        })
        .with_lead_in(5.0)
        .with_intro(
            "Part 4: Horizontal Saccades\n\nShift gaze left and right continuously.\n\nPress any key to begin.",
        )
        .with_outro("Horizontal saccades complete."),
        PhaseDescriptor::fixed(
            "VerticalSaccades",
            "Follow the dot up and down until you hear the beep sound.",
            30.0,
        )
        .with_kind(PhaseKind::TargetTracking {
            positions: VERTICAL.to_vec(),
            cadence_seconds: 0.5,
            show_fixation: true,
        })
        .with_lead_in(3.0)
        .with_intro("Part 5: Vertical Saccades\n\nShift gaze up and down continuously.\n\nPress any key to begin.")
        .with_outro("Vertical saccades complete."),
        rest_baseline(),
        PhaseDescriptor::fixed(
            "EyeRoll",
            "Roll eyes in circles till you hear the beep sound",
            30.0,
        )
        .with_lead_in(5.0)
        .with_intro("Part 6: Eye Roll\n\nRoll your eyes in circles for 30 seconds.\n\nPress any key to begin.")
        .with_outro("Eye roll section complete."),
        PhaseDescriptor::fixed(
            "JawClench",
            "Clench and release jaw repeatedly till you hear the beep sound.",
            30.0,
        )
        .with_intro(
            "Part 7: Jaw Clench\n\nClench and release your jaw repeatedly for 30 seconds.\n\nPress any key to begin.",
        )
        .with_outro("Jaw clench section complete."),
        PhaseDescriptor::fixed(
            "EyebrowMovements",
            "Raise eyebrows and frown repeatedly till you hear the beep sound.",
            30.0,
        )
        .with_intro(
            "Part 8: Eyebrow Movements\n\nRaise and frown your eyebrows repeatedly for 30 seconds.\n\nPress any key to begin.",
        )
        .with_outro("Eyebrow movements section complete."),
        rest_baseline(),
        PhaseDescriptor::fixed("HeadMovements", "Nod your head till you hear the beep sound.", 30.0)
            .with_intro(
                "Part 9: Scuba diving simulation Part 1\n\nNod your head up and down for 30 seconds with continuous feet movement.\n\nPress any key to begin.",
            )
            .with_outro("Scuba diving simulation section complete."),
        PhaseDescriptor::fixed(
            "BreathingExercise",
            "Breathe in and out slowly through your mouth till you hear the beep sound.",
            30.0,
        )
        .with_intro(
            "Part 10: Scuba diving simulation Part 2\n\nBreathing Exercise\n\nBreathe in and out slowly through your mouth for 30 seconds.\n\nPress any key to begin.",
        )
        .with_outro("Breathing exercise section complete."),
        PhaseDescriptor::fixed(
            "MicrosleepFixation",
            "Keep your eyes on the cross.\n\nOccasionally, follow the dot briefly,\nthen return to the cross until you hear the beep.",
            180.0,
        )
        .with_kind(PhaseKind::FixationSaccade {
            positions: PERIPHERAL.to_vec(),
            min_gap_seconds: 5.0,
            max_gap_seconds: 10.0,
            transient_seconds: 1.0,
        })
        .with_lead_in(5.0)
        .with_intro(
            "Part 11: Pilot Simulation : Microsleep Fixation\n\nKeep your eyes on the center cross for 3 minutes.\n\nPress any key to begin.",
        )
        .with_outro("Microsleep fixation section complete."),
    ]
}

/// Hex SHA-256 over the JSON form of the phase list. Any change to a name,
/// text, timing or kind changes it.
pub fn protocol_fingerprint(phases: &[PhaseDescriptor]) -> Result<String, CuesyncError> {
    let canonical = serde_json::to_vec(phases)
        .map_err(|e| CuesyncError::InvalidConfig(format!("protocol is not serializable: {e}")))?;
    let mut digest = Sha256::new();
    digest.update(&canonical);
    let bytes = digest.finalize();
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSummary {
    pub index: usize,
    pub name: String,
    pub kind: &'static str,
    pub duration_seconds: f64,
    pub lead_in_seconds: f64,
    pub planned_cues: Option<u64>,
}

pub fn summarize(phases: &[PhaseDescriptor]) -> Vec<PhaseSummary> {
    phases
        .iter()
        .enumerate()
        .map(|(index, phase)| PhaseSummary {
            index: index + 1,
            name: phase.name.clone(),
            kind: phase.kind.as_str(),
            duration_seconds: phase.duration_seconds,
            lead_in_seconds: phase.lead_in_seconds,
            planned_cues: phase.planned_cues(),
        })
        .collect()
}

/// Seconds of timed content (lead-ins plus phase bodies), excluding operator
/// waits, tones and outros.
pub fn nominal_seconds(phases: &[PhaseDescriptor]) -> f64 {
    phases
        .iter()
        .map(|phase| phase.lead_in_seconds + phase.duration_seconds)
        .sum()
}

/// Plain-text table printed by `cuesync protocol`.
pub fn format_listing(phases: &[PhaseDescriptor]) -> Result<String, CuesyncError> {
    let mut out = String::new();
    out.push_str(&format!(
        "{:>3}  {:<20} {:<17} {:>9} {:>8} {:>5}\n",
        "#", "phase", "kind", "duration", "lead-in", "cues"
    ));
    for row in summarize(phases) {
        let cues = row
            .planned_cues
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:>3}  {:<20} {:<17} {:>8.1}s {:>7.1}s {:>5}\n",
            row.index, row.name, row.kind, row.duration_seconds, row.lead_in_seconds, cues
        ));
    }
    out.push_str(&format!(
        "phases: {}  nominal: {:.1}s\n",
        phases.len(),
        nominal_seconds(phases)
    ));
    out.push_str(&format!("fingerprint: {}\n", protocol_fingerprint(phases)?));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::validate_label;

    #[test]
    fn default_protocol_matches_session_plan() {
        let phases = default_protocol();
        let names: Vec<&str> = phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Close_baseline",
                "Blink",
                "DoubleBlink",
                "HorizontalSaccades",
                "VerticalSaccades",
                "open_baseline",
                "EyeRoll",
                "JawClench",
                "EyebrowMovements",
                "open_baseline",
                "HeadMovements",
                "BreathingExercise",
                "MicrosleepFixation",
            ]
        );
        assert_eq!(phases[1].planned_cues(), Some(10));
        assert_eq!(phases[12].duration_seconds, 180.0);
        assert!(!phases[1].end_tone && !phases[2].end_tone);
        assert!(phases.iter().all(|p| p.intro.is_some() && p.outro.is_some()));
    }

    #[test]
    fn default_phase_labels_are_well_formed() {
        for phase in default_protocol() {
            validate_label(&phase.start_label()).expect("start");
            validate_label(&phase.done_label()).expect("done");
            validate_label(&phase.index_label(1)).expect("index");
        }
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive_to_timing() {
        let phases = default_protocol();
        let a = protocol_fingerprint(&phases).expect("fingerprint");
        assert_eq!(a, protocol_fingerprint(&default_protocol()).expect("again"));
        assert_eq!(a.len(), 64);

        let mut changed = default_protocol();
        changed[0].duration_seconds = 31.0;
        assert_ne!(a, protocol_fingerprint(&changed).expect("changed"));
    }

    #[test]
    fn listing_shows_cue_counts_and_fingerprint() {
        let phases = default_protocol();
        let listing = format_listing(&phases).expect("listing");
        let blink = listing
            .lines()
            .find(|line| line.contains("Blink ") && line.contains("periodic_cue"))
            .expect("blink row");
        assert!(blink.trim_end().ends_with("10"));
        assert!(listing.contains("phases: 13"));
        assert!(listing.contains(&protocol_fingerprint(&phases).expect("fp")));
        assert_eq!(nominal_seconds(&phases), 568.0);
    }
}
