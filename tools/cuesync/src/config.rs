use crate::errors::CuesyncError;
use crate::protocol::default_protocol;
use crate::sequencer::SequencerSettings;
use crate::supervisor::{ShutdownPolicy, SupervisorSettings};
use crate::types::{Advance, PhaseDescriptor, PhaseKind, Position};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub session_id: Option<String>,
    pub seed: Option<u64>,
    pub camera_id: Option<String>,
    pub fps: Option<f64>,
    pub no_video: bool,
    pub no_external_logger: bool,
    pub stimulus_mode: Option<StimulusMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub markers: MarkersConfig,
    pub supervisor: SupervisorConfig,
    pub video: VideoConfig,
    pub external_logger: ExternalLoggerConfig,
    pub stimulus: StimulusConfig,
    pub phases: Vec<PhaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub output_dir: PathBuf,
    pub session_id: Option<String>,
    pub seed: Option<u64>,
    /// Wait after the video recorder starts, before anything else.
    pub warmup_seconds: f64,
    /// Wait for the marker stream to become discoverable before the external
    /// logger starts.
    pub discovery_seconds: f64,
    /// Recording continues this long after the protocol completes.
    pub post_roll_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkersConfig {
    /// Relative paths resolve inside the session directory.
    pub database: PathBuf,
    pub validate_labels: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    pub grace_period_seconds: f64,
    pub stop_timeout_seconds: f64,
    pub poll_interval_ms: u64,
    pub on_stop_timeout: ShutdownPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoConfig {
    pub enabled: bool,
    /// Defaults to the running `cuesync` binary.
    pub executable: Option<PathBuf>,
    pub camera_id: String,
    /// `0` probes and measures the camera rate.
    pub fps: f64,
    pub input_format: String,
    pub device: Option<String>,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalLoggerConfig {
    pub enabled: bool,
    pub executable: String,
    pub output: PathBuf,
    pub stream_filter: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StimulusMode {
    /// Full-screen terminal on a TTY, line mode otherwise.
    #[default]
    Auto,
    Terminal,
    Line,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StimulusConfig {
    pub mode: StimulusMode,
    pub cue_hold_seconds: f64,
    pub cue_tone_seconds: f64,
    pub tone_frequency_hz: f64,
    pub end_tone_seconds: f64,
    pub end_hold_seconds: f64,
    pub outro_seconds: f64,
    pub closing_text: String,
    pub closing_seconds: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKindName {
    #[default]
    Fixed,
    PeriodicCue,
    JitteredCue,
    TargetTracking,
    FixationSaccade,
}

/// One `[[phases]]` table. Kind-specific keys are optional here and checked
/// by [`PhaseConfig::to_descriptor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PhaseConfig {
    pub name: String,
    pub prompt: String,
    pub duration_seconds: f64,
    #[serde(default)]
    pub kind: PhaseKindName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advance: Option<Advance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_in_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_tone: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cue_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cue_interval_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cue_jitter_min_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cue_jitter_max_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<Vec<Position>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cadence_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_fixation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_min_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_max_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient_seconds: Option<f64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let stimulus = SequencerSettings::default();
        Self {
            session: SessionConfig {
                output_dir: PathBuf::from("sessions"),
                session_id: None,
                seed: None,
                warmup_seconds: 5.0,
                discovery_seconds: 10.0,
                post_roll_seconds: 10.0,
            },
            markers: MarkersConfig {
                database: PathBuf::from("markers.sqlite"),
                validate_labels: cfg!(debug_assertions),
            },
            supervisor: SupervisorConfig {
                grace_period_seconds: 2.0,
                stop_timeout_seconds: 10.0,
                poll_interval_ms: 100,
                on_stop_timeout: ShutdownPolicy::ForceKill,
            },
            video: VideoConfig {
                enabled: true,
                executable: None,
                camera_id: "0".to_string(),
                fps: 30.0,
                input_format: "v4l2".to_string(),
                device: None,
                output: PathBuf::from("video.avi"),
            },
            external_logger: ExternalLoggerConfig {
                enabled: true,
                executable: "LabRecorderCLI".to_string(),
                output: PathBuf::from("recording.xdf"),
                stream_filter: "name='Collection'".to_string(),
            },
            stimulus: StimulusConfig {
                mode: StimulusMode::Auto,
                cue_hold_seconds: stimulus.cue_hold_seconds,
                cue_tone_seconds: stimulus.cue_tone_seconds,
                tone_frequency_hz: stimulus.tone_frequency_hz,
                end_tone_seconds: stimulus.end_tone_seconds,
                end_hold_seconds: stimulus.end_hold_seconds,
                outro_seconds: stimulus.outro_seconds,
                closing_text: stimulus.closing_text,
                closing_seconds: stimulus.closing_seconds,
            },
            phases: default_protocol().iter().map(PhaseConfig::from).collect(),
        }
    }
}

impl AppConfig {
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            grace_period_seconds: self.supervisor.grace_period_seconds,
            stop_timeout_seconds: self.supervisor.stop_timeout_seconds,
            poll_interval_seconds: self.supervisor.poll_interval_ms as f64 / 1000.0,
            shutdown_policy: self.supervisor.on_stop_timeout,
        }
    }

    pub fn sequencer_settings(&self) -> SequencerSettings {
        let s = &self.stimulus;
        SequencerSettings {
            cue_hold_seconds: s.cue_hold_seconds,
            cue_tone_seconds: s.cue_tone_seconds,
            tone_frequency_hz: s.tone_frequency_hz,
            end_tone_seconds: s.end_tone_seconds,
            end_hold_seconds: s.end_hold_seconds,
            outro_seconds: s.outro_seconds,
            closing_text: s.closing_text.clone(),
            closing_seconds: s.closing_seconds,
            ..SequencerSettings::default()
        }
    }

    pub fn protocol(&self) -> Result<Vec<PhaseDescriptor>, CuesyncError> {
        self.phases.iter().map(PhaseConfig::to_descriptor).collect()
    }

    /// Relative database paths resolve inside the session directory.
    pub fn marker_database(&self, session_dir: &Path) -> PathBuf {
        absolutize_path(session_dir, &self.markers.database)
    }
}

impl From<&PhaseDescriptor> for PhaseConfig {
    fn from(phase: &PhaseDescriptor) -> Self {
        let mut cfg = PhaseConfig {
            name: phase.name.clone(),
            prompt: phase.prompt.clone(),
            duration_seconds: phase.duration_seconds,
            advance: Some(phase.advance),
            intro: phase.intro.clone(),
            outro: phase.outro.clone(),
            lead_in_seconds: Some(phase.lead_in_seconds),
            end_tone: Some(phase.end_tone),
            ..PhaseConfig::default()
        };
        match &phase.kind {
            PhaseKind::Fixed => {}
            PhaseKind::PeriodicCue {
                interval_seconds,
                cue_text,
            } => {
                cfg.kind = PhaseKindName::PeriodicCue;
                cfg.cue_interval_seconds = Some(*interval_seconds);
                cfg.cue_text = Some(cue_text.clone());
            }
            PhaseKind::JitteredCue {
                min_gap_seconds,
                max_gap_seconds,
                cue_text,
            } => {
                cfg.kind = PhaseKindName::JitteredCue;
                cfg.cue_jitter_min_seconds = Some(*min_gap_seconds);
                cfg.cue_jitter_max_seconds = Some(*max_gap_seconds);
                cfg.cue_text = Some(cue_text.clone());
            }
            PhaseKind::TargetTracking {
                positions,
                cadence_seconds,
                show_fixation,
            } => {
                cfg.kind = PhaseKindName::TargetTracking;
                cfg.positions = Some(positions.clone());
                cfg.cadence_seconds = Some(*cadence_seconds);
                cfg.show_fixation = Some(*show_fixation);
            }
            PhaseKind::FixationSaccade {
                positions,
                min_gap_seconds,
                max_gap_seconds,
                transient_seconds,
            } => {
                cfg.kind = PhaseKindName::FixationSaccade;
                cfg.positions = Some(positions.clone());
                cfg.gap_min_seconds = Some(*min_gap_seconds);
                cfg.gap_max_seconds = Some(*max_gap_seconds);
                cfg.transient_seconds = Some(*transient_seconds);
            }
        }
        cfg
    }
}

impl PhaseConfig {
    pub fn to_descriptor(&self) -> Result<PhaseDescriptor, CuesyncError> {
        validate_phase_name(&self.name)?;
        let invalid = |field: &str, why: &str| {
            CuesyncError::InvalidConfig(format!("phases.{}.{field} {why}", self.name))
        };
        if !(self.duration_seconds > 0.0) {
            return Err(invalid("duration_seconds", "must be greater than zero"));
        }
        let lead_in = self.lead_in_seconds.unwrap_or(0.0);
        if !(lead_in >= 0.0) {
            return Err(invalid("lead_in_seconds", "must not be negative"));
        }

        let require = |value: Option<f64>, field: &str| -> Result<f64, CuesyncError> {
            match value {
                Some(v) if v > 0.0 => Ok(v),
                Some(_) => Err(invalid(field, "must be greater than zero")),
                None => Err(invalid(field, "is required for this kind")),
            }
        };
        let positions = || -> Result<Vec<Position>, CuesyncError> {
            let positions = self
                .positions
                .clone()
                .ok_or_else(|| invalid("positions", "is required for this kind"))?;
            if positions.is_empty() {
                return Err(invalid("positions", "must not be empty"));
            }
            if positions
                .iter()
                .any(|p| !(-1.0..=1.0).contains(&p[0]) || !(-1.0..=1.0).contains(&p[1]))
            {
                return Err(invalid("positions", "must lie within -1.0..=1.0"));
            }
            Ok(positions)
        };
        let ordered = |min: f64, max: f64, field: &str| {
            if min > max {
                Err(invalid(field, "min must not exceed max"))
            } else {
                Ok(())
            }
        };

        let kind = match self.kind {
            PhaseKindName::Fixed => PhaseKind::Fixed,
            PhaseKindName::PeriodicCue => {
                let interval_seconds = require(self.cue_interval_seconds, "cue_interval_seconds")?;
                if interval_seconds > self.duration_seconds {
                    return Err(invalid(
                        "cue_interval_seconds",
                        "must not exceed duration_seconds",
                    ));
                }
                PhaseKind::PeriodicCue {
                    interval_seconds,
                    cue_text: self.cue_text.clone().unwrap_or_else(|| self.prompt.clone()),
                }
            }
            PhaseKindName::JitteredCue => {
                let min = require(self.cue_jitter_min_seconds, "cue_jitter_min_seconds")?;
                let max = require(self.cue_jitter_max_seconds, "cue_jitter_max_seconds")?;
                ordered(min, max, "cue_jitter_min_seconds")?;
                PhaseKind::JitteredCue {
                    min_gap_seconds: min,
                    max_gap_seconds: max,
                    cue_text: self.cue_text.clone().unwrap_or_else(|| self.prompt.clone()),
                }
            }
            PhaseKindName::TargetTracking => PhaseKind::TargetTracking {
                positions: positions()?,
                cadence_seconds: require(self.cadence_seconds, "cadence_seconds")?,
                show_fixation: self.show_fixation.unwrap_or(false),
            },
            PhaseKindName::FixationSaccade => {
                let min = require(self.gap_min_seconds, "gap_min_seconds")?;
                let max = require(self.gap_max_seconds, "gap_max_seconds")?;
                ordered(min, max, "gap_min_seconds")?;
                PhaseKind::FixationSaccade {
                    positions: positions()?,
                    min_gap_seconds: min,
                    max_gap_seconds: max,
                    transient_seconds: require(self.transient_seconds, "transient_seconds")?,
                }
            }
        };

        Ok(PhaseDescriptor {
            name: self.name.clone(),
            prompt: self.prompt.clone(),
            duration_seconds: self.duration_seconds,
            kind,
            advance: self.advance.unwrap_or_default(),
            intro: self.intro.clone(),
            lead_in_seconds: lead_in,
            end_tone: self.end_tone.unwrap_or(true),
            outro: self.outro.clone(),
        })
    }
}

/// Phase names become the `<Phase>` part of marker labels.
pub fn validate_phase_name(name: &str) -> Result<(), CuesyncError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CuesyncError::InvalidConfig(format!(
            "phase name {name:?} must start with a letter and use only letters, digits and '_'"
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    session: Option<PartialSessionConfig>,
    markers: Option<PartialMarkersConfig>,
    supervisor: Option<PartialSupervisorConfig>,
    video: Option<PartialVideoConfig>,
    external_logger: Option<PartialExternalLoggerConfig>,
    stimulus: Option<PartialStimulusConfig>,
    phases: Option<Vec<PhaseConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSessionConfig {
    output_dir: Option<PathBuf>,
    session_id: Option<String>,
    seed: Option<u64>,
    warmup_seconds: Option<f64>,
    discovery_seconds: Option<f64>,
    post_roll_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialMarkersConfig {
    database: Option<PathBuf>,
    validate_labels: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSupervisorConfig {
    grace_period_seconds: Option<f64>,
    stop_timeout_seconds: Option<f64>,
    poll_interval_ms: Option<u64>,
    on_stop_timeout: Option<ShutdownPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialVideoConfig {
    enabled: Option<bool>,
    executable: Option<PathBuf>,
    camera_id: Option<String>,
    fps: Option<f64>,
    input_format: Option<String>,
    device: Option<String>,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialExternalLoggerConfig {
    enabled: Option<bool>,
    executable: Option<String>,
    output: Option<PathBuf>,
    stream_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStimulusConfig {
    mode: Option<StimulusMode>,
    cue_hold_seconds: Option<f64>,
    cue_tone_seconds: Option<f64>,
    tone_frequency_hz: Option<f64>,
    end_tone_seconds: Option<f64>,
    end_hold_seconds: Option<f64>,
    outro_seconds: Option<f64>,
    closing_text: Option<String>,
    closing_seconds: Option<f64>,
}

pub fn load_config(overrides: &CliOverrides, process_cwd: &Path) -> Result<AppConfig, CuesyncError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let path = absolutize_path(process_cwd, path);
        let file_contents = std::fs::read_to_string(&path)
            .map_err(|e| CuesyncError::Io(format!("{}: {e}", path.display())))?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| CuesyncError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    cfg.session.output_dir = absolutize_path(process_cwd, &cfg.session.output_dir);

    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn parse_config_str(contents: &str) -> Result<AppConfig, CuesyncError> {
    let partial: PartialAppConfig =
        toml::from_str(contents).map_err(|e| CuesyncError::ConfigParse(e.to_string()))?;
    let mut cfg = AppConfig::default();
    merge_partial_config(&mut cfg, partial);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(session) = partial.session {
        if let Some(value) = session.output_dir {
            cfg.session.output_dir = value;
        }
        if let Some(value) = session.session_id {
            cfg.session.session_id = Some(value);
        }
        if let Some(value) = session.seed {
            cfg.session.seed = Some(value);
        }
        if let Some(value) = session.warmup_seconds {
            cfg.session.warmup_seconds = value;
        }
        if let Some(value) = session.discovery_seconds {
            cfg.session.discovery_seconds = value;
        }
        if let Some(value) = session.post_roll_seconds {
            cfg.session.post_roll_seconds = value;
        }
    }

    if let Some(markers) = partial.markers {
        if let Some(value) = markers.database {
            cfg.markers.database = value;
        }
        if let Some(value) = markers.validate_labels {
            cfg.markers.validate_labels = value;
        }
    }

    if let Some(supervisor) = partial.supervisor {
        if let Some(value) = supervisor.grace_period_seconds {
            cfg.supervisor.grace_period_seconds = value;
        }
        if let Some(value) = supervisor.stop_timeout_seconds {
            cfg.supervisor.stop_timeout_seconds = value;
        }
        if let Some(value) = supervisor.poll_interval_ms {
            cfg.supervisor.poll_interval_ms = value;
        }
        if let Some(value) = supervisor.on_stop_timeout {
            cfg.supervisor.on_stop_timeout = value;
        }
    }

    if let Some(video) = partial.video {
        if let Some(value) = video.enabled {
            cfg.video.enabled = value;
        }
        if let Some(value) = video.executable {
            cfg.video.executable = Some(value);
        }
        if let Some(value) = video.camera_id {
            cfg.video.camera_id = value;
        }
        if let Some(value) = video.fps {
            cfg.video.fps = value;
        }
        if let Some(value) = video.input_format {
            cfg.video.input_format = value;
        }
        if let Some(value) = video.device {
            cfg.video.device = Some(value);
        }
        if let Some(value) = video.output {
            cfg.video.output = value;
        }
    }

    if let Some(logger) = partial.external_logger {
        if let Some(value) = logger.enabled {
            cfg.external_logger.enabled = value;
        }
        if let Some(value) = logger.executable {
            cfg.external_logger.executable = value;
        }
        if let Some(value) = logger.output {
            cfg.external_logger.output = value;
        }
        if let Some(value) = logger.stream_filter {
            cfg.external_logger.stream_filter = value;
        }
    }

    if let Some(stimulus) = partial.stimulus {
        if let Some(value) = stimulus.mode {
            cfg.stimulus.mode = value;
        }
        if let Some(value) = stimulus.cue_hold_seconds {
            cfg.stimulus.cue_hold_seconds = value;
        }
        if let Some(value) = stimulus.cue_tone_seconds {
            cfg.stimulus.cue_tone_seconds = value;
        }
        if let Some(value) = stimulus.tone_frequency_hz {
            cfg.stimulus.tone_frequency_hz = value;
        }
        if let Some(value) = stimulus.end_tone_seconds {
            cfg.stimulus.end_tone_seconds = value;
        }
        if let Some(value) = stimulus.end_hold_seconds {
            cfg.stimulus.end_hold_seconds = value;
        }
        if let Some(value) = stimulus.outro_seconds {
            cfg.stimulus.outro_seconds = value;
        }
        if let Some(value) = stimulus.closing_text {
            cfg.stimulus.closing_text = value;
        }
        if let Some(value) = stimulus.closing_seconds {
            cfg.stimulus.closing_seconds = value;
        }
    }

    if let Some(phases) = partial.phases {
        if !phases.is_empty() {
            cfg.phases = phases;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(output_dir) = &overrides.output_dir {
        cfg.session.output_dir = output_dir.clone();
    }
    if let Some(session_id) = &overrides.session_id {
        cfg.session.session_id = Some(session_id.clone());
    }
    if let Some(seed) = overrides.seed {
        cfg.session.seed = Some(seed);
    }
    if let Some(camera_id) = &overrides.camera_id {
        cfg.video.camera_id = camera_id.clone();
    }
    if let Some(fps) = overrides.fps {
        cfg.video.fps = fps;
    }
    if overrides.no_video {
        cfg.video.enabled = false;
    }
    if overrides.no_external_logger {
        cfg.external_logger.enabled = false;
    }
    if let Some(mode) = overrides.stimulus_mode {
        cfg.stimulus.mode = mode;
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), CuesyncError> {
    if cfg.session.output_dir.as_os_str().is_empty() {
        return Err(CuesyncError::InvalidConfig(
            "session.output_dir must not be empty".to_string(),
        ));
    }
    if let Some(id) = &cfg.session.session_id {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(CuesyncError::InvalidConfig(format!(
                "session.session_id {id:?} must be a plain directory name"
            )));
        }
    }
    for (field, value) in [
        ("session.warmup_seconds", cfg.session.warmup_seconds),
        ("session.discovery_seconds", cfg.session.discovery_seconds),
        ("session.post_roll_seconds", cfg.session.post_roll_seconds),
        ("supervisor.grace_period_seconds", cfg.supervisor.grace_period_seconds),
        ("stimulus.cue_hold_seconds", cfg.stimulus.cue_hold_seconds),
        ("stimulus.cue_tone_seconds", cfg.stimulus.cue_tone_seconds),
        ("stimulus.end_tone_seconds", cfg.stimulus.end_tone_seconds),
        ("stimulus.end_hold_seconds", cfg.stimulus.end_hold_seconds),
        ("stimulus.outro_seconds", cfg.stimulus.outro_seconds),
        ("stimulus.closing_seconds", cfg.stimulus.closing_seconds),
        ("video.fps", cfg.video.fps),
    ] {
        if !(value >= 0.0) {
            return Err(CuesyncError::InvalidConfig(format!(
                "{field} must not be negative"
            )));
        }
    }
    if !(cfg.supervisor.stop_timeout_seconds > 0.0) {
        return Err(CuesyncError::InvalidConfig(
            "supervisor.stop_timeout_seconds must be greater than zero".to_string(),
        ));
    }
    if cfg.supervisor.poll_interval_ms == 0 {
        return Err(CuesyncError::InvalidConfig(
            "supervisor.poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    if !(cfg.stimulus.tone_frequency_hz > 0.0) {
        return Err(CuesyncError::InvalidConfig(
            "stimulus.tone_frequency_hz must be greater than zero".to_string(),
        ));
    }
    if cfg.video.enabled && cfg.video.camera_id.trim().is_empty() {
        return Err(CuesyncError::InvalidConfig(
            "video.camera_id must not be empty".to_string(),
        ));
    }
    if cfg.external_logger.enabled && cfg.external_logger.executable.trim().is_empty() {
        return Err(CuesyncError::InvalidConfig(
            "external_logger.executable must not be empty".to_string(),
        ));
    }
    if cfg.phases.is_empty() {
        return Err(CuesyncError::InvalidConfig(
            "at least one phase is required".to_string(),
        ));
    }
    cfg.protocol()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_built_in_protocol() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.protocol().expect("protocol"), default_protocol());
        assert_eq!(cfg.supervisor_settings(), SupervisorSettings::default());
        assert_eq!(cfg.sequencer_settings(), SequencerSettings::default());
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let cfg = parse_config_str(
            r#"
            [session]
            seed = 7
            post_roll_seconds = 0

            [supervisor]
            on_stop_timeout = "propagate"
            poll_interval_ms = 50

            [[phases]]
            name = "Rest"
            prompt = "Relax"
            duration_seconds = 4
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.session.seed, Some(7));
        assert_eq!(cfg.session.warmup_seconds, 5.0);
        assert_eq!(cfg.supervisor.on_stop_timeout, ShutdownPolicy::Propagate);
        assert_eq!(cfg.supervisor_settings().poll_interval_seconds, 0.05);
        let phases = cfg.protocol().expect("protocol");
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].kind, PhaseKind::Fixed);
        assert!(phases[0].end_tone);
        assert_eq!(phases[0].advance, Advance::Operator);
    }

    #[test]
    fn cli_overrides_win_over_file_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.toml");
        std::fs::write(&path, "[session]\nseed = 1\noutput_dir = \"out\"\n").expect("write");
        let cfg = load_config(
            &CliOverrides {
                config_path: Some(path),
                seed: Some(99),
                no_video: true,
                ..CliOverrides::default()
            },
            dir.path(),
        )
        .expect("load");
        assert_eq!(cfg.session.seed, Some(99));
        assert!(!cfg.video.enabled);
        assert!(cfg.external_logger.enabled);
        assert_eq!(cfg.session.output_dir, dir.path().join("out"));
        assert_eq!(
            cfg.marker_database(&cfg.session.output_dir.join("s1")),
            dir.path().join("out/s1/markers.sqlite")
        );
    }

    #[test]
    fn kind_specific_fields_are_required_and_checked() {
        let err = parse_config_str(
            r#"
            [[phases]]
            name = "Blink"
            prompt = "Blink"
            duration_seconds = 30
            kind = "periodic_cue"
            "#,
        )
        .expect_err("missing interval");
        assert!(err.to_string().contains("cue_interval_seconds"));

        let err = parse_config_str(
            r#"
            [[phases]]
            name = "DoubleBlink"
            prompt = "x"
            duration_seconds = 30
            kind = "jittered_cue"
            cue_jitter_min_seconds = 5
            cue_jitter_max_seconds = 2
            "#,
        )
        .expect_err("inverted range");
        assert!(matches!(err, CuesyncError::InvalidConfig(_)));

        let err = parse_config_str(
            r#"
            [[phases]]
            name = "Saccades"
            prompt = "x"
            duration_seconds = 30
            kind = "target_tracking"
            cadence_seconds = 1
            positions = [[1.5, 0.0]]
            "#,
        )
        .expect_err("off-screen target");
        assert!(err.to_string().contains("positions"));
    }

    #[test]
    fn phase_names_must_be_label_safe() {
        assert!(validate_phase_name("open_baseline").is_ok());
        assert!(validate_phase_name("Phase2").is_ok());
        assert!(validate_phase_name("2nd").is_err());
        assert!(validate_phase_name("eye roll").is_err());
        assert!(validate_phase_name("").is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = parse_config_str("[session\nseed = 1").expect_err("parse");
        assert!(matches!(err, CuesyncError::ConfigParse(_)));
    }

    #[test]
    fn zero_fps_means_autodetect_but_negative_is_rejected() {
        assert!(parse_config_str("[video]\nfps = 0\n").is_ok());
        assert!(parse_config_str("[video]\nfps = -1.0\n").is_err());
    }
}
