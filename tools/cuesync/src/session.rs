//! Session driver: recorders around the protocol, markers into one store.
//!
//! Order of operations: open store, write manifest, start video, warm up, wait
//! for stream discovery, start the external logger, run the protocol (recorder
//! health is checked before every phase), post-roll, stop video, stop the
//! external logger, flush markers, write the report. Recorders are stopped on
//! every exit path.

use crate::config::AppConfig;
use crate::errors::CuesyncError;
use crate::logging::append_run_log;
use crate::marker_store::SqliteMarkerStore;
use crate::markers::{MarkerChannel, MarkerSink};
use crate::protocol::protocol_fingerprint;
use crate::runtime::{Clock, ClockReading, ProcessRunner};
use crate::sequencer::{PhaseSequencer, SequencerReport};
use crate::stimulus::StimulusSink;
use crate::supervisor::{ProcessSpec, RecordingProcess, RecordingSupervisor, StopOutcome};
use crate::types::{PhaseDescriptor, RecorderState};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const SEQUENCER_SOURCE: &str = "sequencer";
pub const VIDEO_SOURCE: &str = "video";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const REPORT_FILE: &str = "session_report.json";

const STOP_POLL_SECONDS: f64 = 0.1;

/// Everything about a session that is decided before anything starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPlan {
    pub session_id: String,
    pub session_dir: PathBuf,
    pub seed: u64,
    pub phases: Vec<PhaseDescriptor>,
    pub fingerprint: String,
    pub marker_database: PathBuf,
}

impl SessionPlan {
    /// Missing session id and seed are generated here, once.
    pub fn resolve(cfg: &AppConfig) -> Result<Self, CuesyncError> {
        let session_id = cfg
            .session
            .session_id
            .clone()
            .unwrap_or_else(|| format!("session-{}", unix_ms()));
        let session_dir = cfg.session.output_dir.join(&session_id);
        let phases = cfg.protocol()?;
        let fingerprint = protocol_fingerprint(&phases)?;
        Ok(Self {
            marker_database: cfg.marker_database(&session_dir),
            session_id,
            session_dir,
            seed: cfg.session.seed.unwrap_or_else(rand::random),
            phases,
            fingerprint,
        })
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.session_dir.join("logs").join("run.jsonl")
    }
}

pub struct SessionEnv {
    pub clock: Arc<dyn Clock>,
    pub process_runner: Arc<dyn ProcessRunner>,
    /// Binary started with `record-video` for the video recorder.
    pub video_executable: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecorderReport {
    pub name: String,
    pub command: String,
    pub pid: Option<u32>,
    pub states: Vec<RecorderState>,
    pub stop: Option<StopOutcome>,
    pub stop_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionFailure {
    pub component: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub session_dir: PathBuf,
    pub fingerprint: String,
    pub seed: u64,
    pub started_at: ClockReading,
    pub finished_at: ClockReading,
    pub failure: Option<SessionFailure>,
    pub sequencer: Option<SequencerReport>,
    pub recorders: Vec<RecorderReport>,
    pub markers_emitted: u64,
    pub markers_dropped: u64,
    pub rows_committed: u64,
}

impl SessionReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Default)]
struct Recorders {
    video: Option<RecordingProcess>,
    external_logger: Option<RecordingProcess>,
}

impl Recorders {
    fn ensure_running(&mut self) -> Result<(), CuesyncError> {
        if let Some(video) = self.video.as_mut() {
            video.ensure_running()?;
        }
        if let Some(logger) = self.external_logger.as_mut() {
            logger.ensure_running()?;
        }
        Ok(())
    }

    /// Stop video first, then the external logger. Both are attempted even
    /// when the first fails; the first error is returned.
    fn stop_all(&mut self) -> (Vec<RecorderReport>, Option<CuesyncError>) {
        let mut reports = Vec::new();
        let mut first_error = None;
        for slot in [&mut self.video, &mut self.external_logger] {
            let Some(mut process) = slot.take() else {
                continue;
            };
            let result = process.stop();
            let (stop, stop_error) = match result {
                Ok(outcome) => (Some(outcome), None),
                Err(error) => {
                    let text = error.to_string();
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                    (None, Some(text))
                }
            };
            reports.push(RecorderReport {
                name: process.name().to_string(),
                command: process.command(),
                pid: process.pid(),
                states: process.history().to_vec(),
                stop,
                stop_error,
            });
        }
        (reports, first_error)
    }
}

/// Run one full session. The report is written to the session directory on
/// success and on failure; a failure is still returned as the error.
pub fn run_session(
    cfg: &AppConfig,
    plan: &SessionPlan,
    env: &SessionEnv,
    sink: &mut dyn StimulusSink,
    stop: &AtomicBool,
) -> Result<SessionReport, CuesyncError> {
    fs::create_dir_all(&plan.session_dir)
        .map_err(|e| CuesyncError::Io(format!("{}: {e}", plan.session_dir.display())))?;
    let store = Arc::new(SqliteMarkerStore::open(&plan.marker_database)?);
    store.register_session(&plan.session_id, &plan.fingerprint, plan.seed)?;
    write_manifest(cfg, plan, env.clock.now())?;

    let channel = MarkerChannel::new(SEQUENCER_SOURCE, Arc::clone(&env.clock))
        .with_sink(Arc::clone(&store) as Arc<dyn MarkerSink>)
        .with_label_validation(cfg.markers.validate_labels);
    let supervisor = RecordingSupervisor::new(
        Arc::clone(&env.process_runner),
        Arc::clone(&env.clock),
        cfg.supervisor_settings(),
    );

    let started_at = env.clock.now();
    append_run_log(
        "info",
        "session.started",
        json!({
            "session_id": plan.session_id,
            "fingerprint": plan.fingerprint,
            "seed": plan.seed,
            "phases": plan.phases.len(),
        }),
    );

    let mut recorders = Recorders::default();
    let mut sequencer_report = None;
    let result = drive(
        cfg,
        plan,
        env,
        &supervisor,
        &channel,
        sink,
        stop,
        &mut recorders,
        &mut sequencer_report,
    );
    if let Err(error) = &result {
        append_run_log(
            "error",
            "session.aborted",
            json!({ "component": error.component(), "error": error.to_string() }),
        );
    }

    let (recorder_reports, stop_error) = recorders.stop_all();
    let flushed = store.flush();
    let stats = channel.stats();
    let error = result
        .err()
        .or(stop_error)
        .or_else(|| flushed.as_ref().err().map(|e| CuesyncError::Database(e.to_string())));

    let report = SessionReport {
        session_id: plan.session_id.clone(),
        session_dir: plan.session_dir.clone(),
        fingerprint: plan.fingerprint.clone(),
        seed: plan.seed,
        started_at,
        finished_at: env.clock.now(),
        failure: error.as_ref().map(|e| SessionFailure {
            component: e.component(),
            error: e.to_string(),
        }),
        sequencer: sequencer_report,
        recorders: recorder_reports,
        markers_emitted: stats.emitted,
        markers_dropped: stats.dropped + store.dropped_rows(),
        rows_committed: flushed.unwrap_or(0),
    };
    write_json(&plan.session_dir.join(REPORT_FILE), &report)?;
    append_run_log(
        if report.succeeded() { "info" } else { "error" },
        "session.finished",
        json!({
            "session_id": plan.session_id,
            "markers_emitted": report.markers_emitted,
            "markers_dropped": report.markers_dropped,
            "rows_committed": report.rows_committed,
        }),
    );

    match error {
        Some(error) => Err(error),
        None => Ok(report),
    }
}

#[allow(clippy::too_many_arguments)]
fn drive(
    cfg: &AppConfig,
    plan: &SessionPlan,
    env: &SessionEnv,
    supervisor: &RecordingSupervisor,
    channel: &MarkerChannel,
    sink: &mut dyn StimulusSink,
    stop: &AtomicBool,
    recorders: &mut Recorders,
    sequencer_report: &mut Option<SequencerReport>,
) -> Result<(), CuesyncError> {
    let clock = env.clock.as_ref();

    if cfg.video.enabled {
        let spec = video_spec(cfg, plan, &env.video_executable);
        recorders.video = Some(supervisor.start(spec)?);
    }
    wait_unless_stopped(clock, cfg.session.warmup_seconds, stop)?;
    recorders.ensure_running()?;

    if cfg.external_logger.enabled {
        wait_unless_stopped(clock, cfg.session.discovery_seconds, stop)?;
        let output = plan.session_dir.join(&cfg.external_logger.output);
        let spec = ProcessSpec::external_logger(
            &cfg.external_logger.executable,
            &output,
            &cfg.external_logger.stream_filter,
        )
        .with_cwd(plan.session_dir.clone());
        recorders.external_logger = Some(supervisor.start(spec)?);
    }

    let mut sequencer = PhaseSequencer::new(
        &plan.phases,
        channel,
        sink,
        cfg.sequencer_settings(),
        plan.seed,
    )
    .with_stop_flag(stop);
    let outcome = sequencer.run_with(|index, phase| {
        if stop.load(Ordering::SeqCst) {
            return Err(CuesyncError::Interrupted(format!(
                "stop signal received before phase {} ({})",
                index + 1,
                phase.name
            )));
        }
        recorders.ensure_running()
    });
    *sequencer_report = Some(sequencer.report());
    outcome?;

    wait_unless_stopped(clock, cfg.session.post_roll_seconds, stop)?;
    recorders.ensure_running()
}

fn video_spec(cfg: &AppConfig, plan: &SessionPlan, executable: &Path) -> ProcessSpec {
    let executable = cfg.video.executable.as_deref().unwrap_or(executable);
    let mut extra = vec![
        "--input-format".to_string(),
        cfg.video.input_format.clone(),
    ];
    if let Some(device) = &cfg.video.device {
        extra.push("--device".to_string());
        extra.push(device.clone());
    }
    ProcessSpec::video_recorder(
        executable,
        &cfg.video.camera_id,
        &plan.session_dir.join(&cfg.video.output),
        cfg.video.fps,
        Some(&plan.marker_database),
        &extra,
    )
    .with_cwd(plan.session_dir.clone())
}

/// Sleep in short slices so a stop signal ends the wait early.
fn wait_unless_stopped(clock: &dyn Clock, seconds: f64, stop: &AtomicBool) -> Result<(), CuesyncError> {
    let deadline = clock.now().after(seconds);
    loop {
        interrupted_if(stop)?;
        let now = clock.now();
        if now >= deadline {
            return Ok(());
        }
        let next = now.after(STOP_POLL_SECONDS);
        if next >= deadline {
            clock.sleep_until(deadline)?;
            return interrupted_if(stop);
        }
        clock.sleep_until(next)?;
    }
}

fn interrupted_if(stop: &AtomicBool) -> Result<(), CuesyncError> {
    if stop.load(Ordering::SeqCst) {
        return Err(CuesyncError::Interrupted(
            "stop signal received".to_string(),
        ));
    }
    Ok(())
}

fn write_manifest(cfg: &AppConfig, plan: &SessionPlan, clock_at_start: ClockReading) -> Result<(), CuesyncError> {
    let manifest = json!({
        "session_id": plan.session_id,
        "fingerprint": plan.fingerprint,
        "seed": plan.seed,
        "created_unix_ms": unix_ms(),
        "clock_at_start": clock_at_start,
        "marker_database": plan.marker_database,
        "config": cfg,
        "protocol": plan.phases,
    });
    write_json(&plan.session_dir.join(MANIFEST_FILE), &manifest)
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<(), CuesyncError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| CuesyncError::Io(e.to_string()))?;
    fs::write(path, text).map_err(|e| CuesyncError::Io(format!("{}: {e}", path.display())))
}

fn unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
