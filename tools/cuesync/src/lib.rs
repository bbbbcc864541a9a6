pub mod capture;
pub mod config;
pub mod errors;
pub mod fsm;
pub mod logging;
pub mod marker_store;
pub mod markers;
pub mod protocol;
pub mod runtime;
pub mod sequencer;
pub mod session;
pub mod signals;
pub mod stimulus;
pub mod stimulus_tui;
pub mod supervisor;
pub mod types;

use capture::ffmpeg::{CameraSettings, FfmpegCameraSource, MjpegFileWriter};
use capture::synthetic::{MemoryFrameWriter, SyntheticFrameSource};
use capture::{
    measure_fps, resolve_fps, run_capture_loop, CaptureBudget, CaptureSummary, FrameSource,
    FrameWriter, StopReason, FPS_PROBE_FRAMES,
};
use clap::{error::ErrorKind, Args, Parser, Subcommand, ValueEnum};
use config::{load_config, AppConfig, CliOverrides, StimulusMode};
use errors::CuesyncError;
use logging::{append_run_log, init_run_logger};
use marker_store::{read_frames, read_markers, SqliteMarkerStore};
use markers::{MarkerChannel, MarkerSink};
use runtime::ProductionRuntime;
use serde_json::json;
use session::{run_session, SessionEnv, SessionPlan, VIDEO_SOURCE};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stimulus::StimulusSink;
use stimulus_tui::{LineStimulusSink, TerminalStimulusSink};

pub const FORCE_TTY_ENV: &str = "CUESYNC_FORCE_TTY";
pub const STIMULUS_ENV: &str = "CUESYNC_STIMULUS";

const DRY_RUN_SIZE: (u32, u32) = (64, 48);

#[derive(Debug, Clone, Parser)]
#[command(name = "cuesync")]
#[command(about = "Synchronized stimulus sequencing and recorder supervision")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a full recording session.
    Run(RunArgs),
    /// Capture a camera to an MJPG file, one marker per frame.
    RecordVideo(RecordVideoArgs),
    /// Print the resolved phase list, planned cue counts and fingerprint.
    Protocol(ProtocolArgs),
    /// Dump persisted markers or frame rows as CSV.
    Markers(MarkersArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    #[arg(long)]
    pub session_id: Option<String>,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long)]
    pub camera_id: Option<String>,
    #[arg(long)]
    pub fps: Option<f64>,
    #[arg(long, default_value_t = false)]
    pub no_video: bool,
    #[arg(long, default_value_t = false)]
    pub no_external_logger: bool,
    #[arg(long, value_enum)]
    pub stimulus: Option<CliStimulus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliStimulus {
    Auto,
    Terminal,
    Line,
}

impl From<CliStimulus> for StimulusMode {
    fn from(value: CliStimulus) -> Self {
        match value {
            CliStimulus::Auto => StimulusMode::Auto,
            CliStimulus::Terminal => StimulusMode::Terminal,
            CliStimulus::Line => StimulusMode::Line,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct RecordVideoArgs {
    pub camera_id: String,
    pub output_path: PathBuf,
    /// `0` or less probes the camera and measures the delivered rate.
    #[arg(allow_negative_numbers = true)]
    pub fps: f64,
    #[arg(long)]
    pub markers: Option<PathBuf>,
    #[arg(long)]
    pub duration: Option<f64>,
    #[arg(long)]
    pub max_frames: Option<u64>,
    #[arg(long, default_value = "v4l2")]
    pub input_format: String,
    #[arg(long)]
    pub device: Option<String>,
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: String,
    #[arg(long, default_value = "ffprobe")]
    pub ffprobe: String,
    #[arg(long)]
    pub log: Option<PathBuf>,
    /// Synthetic frames paced by the clock; nothing is encoded.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ProtocolArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Clone, Args)]
pub struct MarkersArgs {
    #[arg(long)]
    pub database: PathBuf,
    #[arg(long, default_value_t = false)]
    pub frames: bool,
    #[arg(long)]
    pub source: Option<String>,
}

pub fn run() -> Result<i32, CuesyncError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| CuesyncError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &env, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[OsString],
    env: &[(OsString, OsString)],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, CuesyncError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp
            | ErrorKind::DisplayVersion
            | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(CuesyncError::Cli(error.to_string())),
        },
    };
    let env_map = env_to_map(env);

    match cli.command {
        Command::Run(args) => run_command(args, &env_map, cwd, runtime),
        Command::RecordVideo(args) => record_video_command(args, cwd, runtime),
        Command::Protocol(args) => protocol_command(args, cwd, runtime),
        Command::Markers(args) => markers_command(args, cwd, runtime),
    }
}

fn run_command(
    args: RunArgs,
    env_map: &BTreeMap<String, String>,
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, CuesyncError> {
    let stimulus_mode = args.stimulus.map(Into::into).or_else(|| {
        env_map
            .get(STIMULUS_ENV)
            .and_then(|value| match value.as_str() {
                "terminal" => Some(StimulusMode::Terminal),
                "line" => Some(StimulusMode::Line),
                _ => None,
            })
    });
    let overrides = CliOverrides {
        config_path: args.config,
        output_dir: args.output_dir,
        session_id: args.session_id,
        seed: args.seed,
        camera_id: args.camera_id,
        fps: args.fps,
        no_video: args.no_video,
        no_external_logger: args.no_external_logger,
        stimulus_mode,
    };
    let cfg = load_config(&overrides, cwd)?;
    let plan = SessionPlan::resolve(&cfg)?;
    init_run_logger(plan.run_log_path())?;
    signals::install_stop_handlers()?;

    let video_executable =
        std::env::current_exe().map_err(|e| CuesyncError::Io(format!("current_exe: {e}")))?;
    let session_env = SessionEnv {
        clock: Arc::clone(&runtime.clock),
        process_runner: Arc::clone(&runtime.process_runner),
        video_executable,
    };

    let mut sink = open_stimulus_sink(&cfg, env_map, runtime)?;
    let result = run_session(&cfg, &plan, &session_env, sink.as_mut(), signals::stop_flag());
    // restores the terminal before anything else is printed
    drop(sink);

    let report = result?;
    runtime.terminal.write_line(&format!(
        "session {} complete: {} markers ({} dropped), report in {}",
        report.session_id,
        report.markers_emitted,
        report.markers_dropped,
        plan.session_dir.join(session::REPORT_FILE).display()
    ))?;
    Ok(0)
}

fn open_stimulus_sink(
    cfg: &AppConfig,
    env_map: &BTreeMap<String, String>,
    runtime: &ProductionRuntime,
) -> Result<Box<dyn StimulusSink>, CuesyncError> {
    let tty = runtime.terminal.stdin_is_tty() || env_map.contains_key(FORCE_TTY_ENV);
    let use_terminal = match cfg.stimulus.mode {
        StimulusMode::Terminal => true,
        StimulusMode::Line => false,
        StimulusMode::Auto => tty,
    };
    append_run_log(
        "info",
        "stimulus.sink.selected",
        json!({ "terminal": use_terminal, "stdin_tty": tty }),
    );
    let clock = Arc::clone(&runtime.clock);
    if use_terminal {
        Ok(Box::new(TerminalStimulusSink::open(clock)?))
    } else {
        Ok(Box::new(LineStimulusSink::new(
            std::io::stdin().lock(),
            std::io::stdout(),
            clock,
        )))
    }
}

fn record_video_command(
    args: RecordVideoArgs,
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, CuesyncError> {
    let output_path = absolutize(cwd, &args.output_path);
    let markers_path = args.markers.as_ref().map(|path| absolutize(cwd, path));
    let log_path = args.log.as_ref().map(|path| absolutize(cwd, path)).or_else(|| {
        markers_path
            .as_ref()
            .and_then(|db| db.parent())
            .map(|dir| dir.join("logs").join("record-video.jsonl"))
    });
    if let Some(path) = &log_path {
        init_run_logger(path)?;
    }
    signals::install_stop_handlers()?;

    let clock = Arc::clone(&runtime.clock);
    let store = match &markers_path {
        Some(path) => Some(Arc::new(SqliteMarkerStore::open(path)?)),
        None => None,
    };
    let mut channel = MarkerChannel::new(VIDEO_SOURCE, Arc::clone(&clock))
        .with_label_validation(cfg!(debug_assertions));
    if let Some(store) = &store {
        channel = channel.with_sink(Arc::clone(store) as Arc<dyn MarkerSink>);
    }
    let budget = CaptureBudget {
        max_duration_seconds: args.duration.filter(|d| *d > 0.0),
        max_frames: args.max_frames,
    };

    let mut source: Box<dyn FrameSource> = if args.dry_run {
        let fps = if args.fps > 0.0 { args.fps } else { 30.0 };
        Box::new(SyntheticFrameSource::new(
            Arc::clone(&clock),
            fps,
            DRY_RUN_SIZE.0,
            DRY_RUN_SIZE.1,
        ))
    } else {
        let mut settings = CameraSettings::for_camera(&args.camera_id, &args.input_format);
        settings.ffmpeg = args.ffmpeg.clone();
        settings.ffprobe = args.ffprobe.clone();
        if let Some(device) = &args.device {
            settings.device = device.clone();
        }
        settings.requested_fps = Some(args.fps).filter(|fps| *fps > 0.0);
        Box::new(FfmpegCameraSource::open(&settings)?)
    };

    let reported = source.reported_fps();
    let decision = resolve_fps(args.fps, reported, || {
        measure_fps(source.as_mut(), clock.as_ref(), FPS_PROBE_FRAMES)
    })?;
    if let Some(warning) = &decision.warning {
        eprintln!("[WARN] {warning}");
    }
    append_run_log("info", "capture.fps.resolved", json!(decision));
    let (width, height) = source.dimensions();

    let mut writer: Box<dyn FrameWriter> = if args.dry_run {
        Box::new(MemoryFrameWriter::default())
    } else {
        Box::new(MjpegFileWriter::create(
            &args.ffmpeg,
            &output_path,
            width,
            height,
            decision.fps,
        )?)
    };

    let result = run_capture_loop(
        source.as_mut(),
        writer.as_mut(),
        &channel,
        signals::stop_flag(),
        budget,
    );
    if let Some(store) = &store {
        store.flush()?;
    }
    let summary = result?;
    print_capture_summary(&summary, runtime)?;
    Ok(0)
}

fn print_capture_summary(
    summary: &CaptureSummary,
    runtime: &ProductionRuntime,
) -> Result<(), CuesyncError> {
    let reason = match &summary.stop_reason {
        StopReason::Duration => "duration reached".to_string(),
        StopReason::FrameLimit => "frame limit reached".to_string(),
        StopReason::StopSignal => "stop signal".to_string(),
        StopReason::CaptureError(error) => format!("capture error: {error}"),
    };
    let fps = summary
        .effective_fps()
        .map(|fps| format!("{fps:.2}"))
        .unwrap_or_else(|| "-".to_string());
    runtime.terminal.write_line(&format!(
        "[INFO] captured {} frames at {fps} fps ({reason})",
        summary.frames
    ))
}

fn protocol_command(
    args: ProtocolArgs,
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, CuesyncError> {
    let cfg = load_config(
        &CliOverrides {
            config_path: args.config,
            ..CliOverrides::default()
        },
        cwd,
    )?;
    let phases = cfg.protocol()?;
    if args.json {
        let body = json!({
            "fingerprint": protocol::protocol_fingerprint(&phases)?,
            "nominal_seconds": protocol::nominal_seconds(&phases),
            "phases": protocol::summarize(&phases),
        });
        let text =
            serde_json::to_string_pretty(&body).map_err(|e| CuesyncError::Io(e.to_string()))?;
        runtime.terminal.write_line(&text)?;
    } else {
        runtime
            .terminal
            .write_line(protocol::format_listing(&phases)?.trim_end())?;
    }
    Ok(0)
}

fn markers_command(
    args: MarkersArgs,
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, CuesyncError> {
    let database = absolutize(cwd, &args.database);
    let source = args.source.as_deref();
    if args.frames {
        runtime.terminal.write_line("source,frame_index,timestamp")?;
        for row in read_frames(&database, source)? {
            runtime.terminal.write_line(&format!(
                "{},{},{}",
                csv_field(&row.source),
                row.frame_index,
                row.timestamp
            ))?;
        }
    } else {
        runtime.terminal.write_line("source,label,timestamp")?;
        for row in read_markers(&database, source)? {
            runtime.terminal.write_line(&format!(
                "{},{},{}",
                csv_field(&row.source),
                csv_field(&row.label),
                row.timestamp
            ))?;
        }
    }
    Ok(0)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn absolutize(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn env_to_map(env: &[(OsString, OsString)]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (key, value) in env {
        if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeClock, FakeProcessRunner, FakeTerminal};
    use crate::types::Marker;
    use crate::runtime::ClockReading;

    fn fake_runtime(terminal: &FakeTerminal) -> ProductionRuntime {
        ProductionRuntime {
            clock: Arc::new(FakeClock::default()),
            process_runner: Arc::new(FakeProcessRunner::default()),
            terminal: Arc::new(terminal.clone()),
        }
    }

    fn argv(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn protocol_listing_prints_default_phases() {
        let terminal = FakeTerminal::new(false);
        let runtime = fake_runtime(&terminal);
        let dir = tempfile::tempdir().expect("tempdir");
        let code = run_with_runtime(&argv(&["cuesync", "protocol"]), &[], dir.path(), &runtime)
            .expect("protocol");
        assert_eq!(code, 0);
        let out = terminal.written().join("\n");
        assert!(out.contains("MicrosleepFixation"));
        assert!(out.contains("fingerprint: "));
    }

    #[test]
    fn markers_dump_is_csv_in_timestamp_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("markers.sqlite");
        {
            let store = SqliteMarkerStore::open(&db).expect("open");
            for (label, ts) in [("Blink_start", 2.0), ("Session_start", 1.0)] {
                store
                    .append_marker(
                        "sequencer",
                        &Marker {
                            label: label.to_string(),
                            timestamp: ClockReading::from_secs(ts),
                        },
                    )
                    .expect("append");
            }
            store.flush().expect("flush");
        }
        let terminal = FakeTerminal::new(false);
        let runtime = fake_runtime(&terminal);
        run_with_runtime(
            &argv(&["cuesync", "markers", "--database", "markers.sqlite"]),
            &[],
            dir.path(),
            &runtime,
        )
        .expect("markers");
        assert_eq!(
            terminal.written(),
            vec![
                "source,label,timestamp".to_string(),
                "sequencer,Session_start,1.000000".to_string(),
                "sequencer,Blink_start,2.000000".to_string(),
            ]
        );
    }

    #[test]
    fn unknown_subcommand_is_a_cli_error() {
        let terminal = FakeTerminal::new(false);
        let runtime = fake_runtime(&terminal);
        let err = run_with_runtime(&argv(&["cuesync", "frobnicate"]), &[], Path::new("/"), &runtime)
            .expect_err("unknown");
        assert!(matches!(err, CuesyncError::Cli(_)));
    }

    #[test]
    fn csv_fields_with_commas_are_quoted() {
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("Blink_Index:3"), "Blink_Index:3");
    }

    #[test]
    fn dry_run_capture_writes_contiguous_frame_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let terminal = FakeTerminal::new(false);
        let runtime = fake_runtime(&terminal);
        run_with_runtime(
            &argv(&[
                "cuesync",
                "record-video",
                "0",
                "video.avi",
                "25",
                "--markers",
                "markers.sqlite",
                "--duration",
                "2",
                "--dry-run",
            ]),
            &[],
            dir.path(),
            &runtime,
        )
        .expect("record");
        let frames = read_frames(&dir.path().join("markers.sqlite"), Some(VIDEO_SOURCE))
            .expect("frames");
        assert!(!frames.is_empty());
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.frame_index, i as u64);
        }
        assert_eq!(
            crate::logging::run_log_path(),
            Some(dir.path().join("logs/record-video.jsonl"))
        );
        crate::logging::clear_run_logger();
        let out = terminal.written().join("\n");
        assert!(out.contains("captured"));
    }
}
