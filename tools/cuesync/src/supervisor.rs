//! Launch, health-check and tear down out-of-process recorders.
//!
//! A [`RecordingProcess`] owns exactly one OS child. Dropping it while the child
//! is still alive kills and reaps the child, so an aborted session never leaves
//! a recorder running.

use crate::errors::CuesyncError;
use crate::logging::append_run_log;
use crate::runtime::{Clock, ClockReading, ExitInfo, ProcessRequest, ProcessRunner, StopMethod};
use crate::types::RecorderState;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const NO_MATCHING_STREAM: &str = "matched no stream";

/// What `stop` does when a recorder ignores the cooperative stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Kill, reap, and report `StopOutcome::ForceKilled`.
    #[default]
    ForceKill,
    /// Return `ProcessShutdownTimeout`; the handle still kills the child on drop.
    Propagate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub grace_period_seconds: f64,
    pub stop_timeout_seconds: f64,
    pub poll_interval_seconds: f64,
    pub shutdown_policy: ShutdownPolicy,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace_period_seconds: 2.0,
            stop_timeout_seconds: 10.0,
            poll_interval_seconds: 0.1,
            shutdown_policy: ShutdownPolicy::ForceKill,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    /// Short role name used in logs and reports (`video`, `external_logger`).
    pub name: String,
    pub request: ProcessRequest,
    pub stop_method: StopMethod,
    /// Output substrings that mean the recorder cannot record anything.
    pub no_stream_patterns: Vec<String>,
}

impl ProcessSpec {
    /// `cuesync record-video <camera_id> <output_path> <fps> [--markers <db>] ...`
    pub fn video_recorder(
        executable: &Path,
        camera_id: &str,
        output_path: &Path,
        fps: f64,
        markers_db: Option<&Path>,
        extra_args: &[String],
    ) -> Self {
        let mut args = vec![
            "record-video".to_string(),
            camera_id.to_string(),
            output_path.display().to_string(),
            format_fps(fps),
        ];
        if let Some(db) = markers_db {
            args.push("--markers".to_string());
            args.push(db.display().to_string());
        }
        args.extend(extra_args.iter().cloned());
        Self {
            name: "video".to_string(),
            request: ProcessRequest {
                program: executable.display().to_string(),
                args,
                cwd: None,
                stdin_piped: false,
            },
            stop_method: StopMethod::Terminate,
            no_stream_patterns: Vec::new(),
        }
    }

    /// `<executable> <output_path> <stream_filter>`, stopped by a newline on stdin.
    pub fn external_logger(executable: &str, output_path: &Path, stream_filter: &str) -> Self {
        Self {
            name: "external_logger".to_string(),
            request: ProcessRequest {
                program: executable.to_string(),
                args: vec![output_path.display().to_string(), stream_filter.to_string()],
                cwd: None,
                stdin_piped: true,
            },
            stop_method: StopMethod::StdinLine("\n".to_string()),
            no_stream_patterns: vec![NO_MATCHING_STREAM.to_string()],
        }
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.request.cwd = Some(cwd);
        self
    }

    pub fn command_line(&self) -> String {
        self.request.command_line()
    }

    fn no_stream_match(&self, output: &str) -> Option<String> {
        self.no_stream_patterns
            .iter()
            .find(|pattern| output.contains(pattern.as_str()))
            .map(|pattern| {
                output
                    .lines()
                    .find(|line| line.contains(pattern.as_str()))
                    .unwrap_or(pattern)
                    .trim()
                    .to_string()
            })
    }
}

fn format_fps(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as i64)
    } else {
        format!("{fps}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    /// Exited after the cooperative stop.
    Exited { code: Option<i32>, signal: Option<i32> },
    /// Had already exited before stop was requested.
    AlreadyExited { code: Option<i32>, signal: Option<i32> },
    /// Ignored the stop and was killed.
    ForceKilled,
}

impl StopOutcome {
    fn exited(exit: ExitInfo) -> Self {
        Self::Exited {
            code: exit.code,
            signal: exit.signal,
        }
    }

    fn already(exit: ExitInfo) -> Self {
        Self::AlreadyExited {
            code: exit.code,
            signal: exit.signal,
        }
    }
}

pub struct RecordingSupervisor {
    runner: Arc<dyn ProcessRunner>,
    clock: Arc<dyn Clock>,
    settings: SupervisorSettings,
}

impl RecordingSupervisor {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        clock: Arc<dyn Clock>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            runner,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Spawn the recorder and wait out the grace period.
    ///
    /// Returns only once the child is presumed running. A child that exits or
    /// reports no matching stream inside the grace window is reaped before the
    /// error is returned.
    pub fn start(&self, spec: ProcessSpec) -> Result<RecordingProcess, CuesyncError> {
        let command = spec.command_line();
        append_run_log(
            "info",
            "supervisor.start.requested",
            json!({ "name": spec.name, "command": command }),
        );
        verify_program(&spec.request)?;

        let spawned = self.runner.spawn(spec.request.clone()).map_err(|error| {
            append_run_log(
                "error",
                "supervisor.start.launch_failed",
                json!({ "name": spec.name, "command": command, "error": error.to_string() }),
            );
            error
        })?;
        append_run_log(
            "info",
            "supervisor.start.spawned",
            json!({ "name": spec.name, "pid": spawned.pid, "handle": spawned.handle }),
        );

        let mut process = RecordingProcess {
            runner: Arc::clone(&self.runner),
            clock: Arc::clone(&self.clock),
            settings: self.settings.clone(),
            spec,
            handle: spawned.handle,
            pid: spawned.pid,
            state: RecorderState::Starting,
            history: vec![RecorderState::Starting],
            started_at: self.clock.now(),
            exit: None,
            released: false,
        };

        let deadline = process.started_at.after(self.settings.grace_period_seconds);
        loop {
            if let Some(exit) = self.runner.try_wait(process.handle)? {
                let output = self.runner.output_so_far(process.handle).unwrap_or_default();
                process.exit = Some(exit);
                process.mark(RecorderState::Failed);
                process.release();
                if let Some(detail) = process.spec.no_stream_match(&output) {
                    return Err(CuesyncError::NoMatchingStream { command, detail });
                }
                append_run_log(
                    "error",
                    "supervisor.start.early_exit",
                    json!({ "name": process.spec.name, "code": exit.code, "signal": exit.signal }),
                );
                return Err(CuesyncError::ProcessEarlyExit {
                    command,
                    code: exit.code,
                    output: output.trim().to_string(),
                });
            }

            let output = self.runner.output_so_far(process.handle).unwrap_or_default();
            if let Some(detail) = process.spec.no_stream_match(&output) {
                process.kill_and_release();
                process.mark(RecorderState::Failed);
                return Err(CuesyncError::NoMatchingStream { command, detail });
            }

            let now = self.clock.now();
            if now >= deadline {
                break;
            }
            self.clock.sleep_until(
                now.after(self.settings.poll_interval_seconds)
                    .min(deadline),
            )?;
        }

        process.mark(RecorderState::Running);
        append_run_log(
            "info",
            "supervisor.start.running",
            json!({ "name": process.spec.name, "pid": process.pid }),
        );
        Ok(process)
    }
}

/// An explicit path that does not exist is a launch error before any child is created.
fn verify_program(request: &ProcessRequest) -> Result<(), CuesyncError> {
    let program = Path::new(&request.program);
    let explicit = program.components().count() > 1;
    if explicit && !program.exists() {
        return Err(CuesyncError::ProcessLaunch {
            command: request.command_line(),
            reason: format!("executable not found: {}", program.display()),
        });
    }
    Ok(())
}

pub struct RecordingProcess {
    runner: Arc<dyn ProcessRunner>,
    clock: Arc<dyn Clock>,
    settings: SupervisorSettings,
    spec: ProcessSpec,
    handle: u64,
    pid: Option<u32>,
    state: RecorderState,
    history: Vec<RecorderState>,
    started_at: ClockReading,
    exit: Option<ExitInfo>,
    released: bool,
}

impl std::fmt::Debug for RecordingProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingProcess")
            .field("name", &self.spec.name)
            .field("command", &self.spec.command_line())
            .field("pid", &self.pid)
            .field("state", &self.state)
            .finish()
    }
}

impl RecordingProcess {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn command(&self) -> String {
        self.spec.command_line()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn history(&self) -> &[RecorderState] {
        &self.history
    }

    pub fn started_at(&self) -> ClockReading {
        self.started_at
    }

    /// Poll the child once. A recorder that exited on its own becomes `Failed`.
    pub fn health(&mut self) -> Result<RecorderState, CuesyncError> {
        if self.state != RecorderState::Running {
            return Ok(self.state);
        }
        if let Some(exit) = self.runner.try_wait(self.handle)? {
            self.exit = Some(exit);
            self.mark(RecorderState::Failed);
            append_run_log(
                "error",
                "supervisor.health.exited",
                json!({ "name": self.spec.name, "code": exit.code, "signal": exit.signal }),
            );
        }
        Ok(self.state)
    }

    /// `health`, turned into an error when the recorder is no longer running.
    pub fn ensure_running(&mut self) -> Result<(), CuesyncError> {
        match self.health()? {
            RecorderState::Running => Ok(()),
            state => {
                let output = self.runner.output_so_far(self.handle).unwrap_or_default();
                if let Some(detail) = self.spec.no_stream_match(&output) {
                    return Err(CuesyncError::NoMatchingStream {
                        command: self.command(),
                        detail,
                    });
                }
                Err(CuesyncError::Process(format!(
                    "`{}` is {} (exit code {:?})",
                    self.command(),
                    state.as_str(),
                    self.exit.and_then(|exit| exit.code)
                )))
            }
        }
    }

    /// Cooperative stop with a bounded wait.
    pub fn stop(&mut self) -> Result<StopOutcome, CuesyncError> {
        if self.released {
            return Err(CuesyncError::Process(format!(
                "`{}` was already stopped",
                self.command()
            )));
        }
        append_run_log(
            "info",
            "supervisor.stop.requested",
            json!({ "name": self.spec.name, "pid": self.pid }),
        );

        if let Some(exit) = self.exit.or(self.runner.try_wait(self.handle)?) {
            self.exit = Some(exit);
            self.release();
            self.mark(RecorderState::Stopped);
            append_run_log(
                "warn",
                "supervisor.stop.already_exited",
                json!({ "name": self.spec.name, "code": exit.code, "signal": exit.signal }),
            );
            return Ok(StopOutcome::already(exit));
        }

        if let Err(error) = self.runner.request_stop(self.handle, &self.spec.stop_method) {
            append_run_log(
                "warn",
                "supervisor.stop.request_failed",
                json!({ "name": self.spec.name, "error": error.to_string() }),
            );
        }

        let deadline = self.clock.now().after(self.settings.stop_timeout_seconds);
        loop {
            if let Some(exit) = self.runner.try_wait(self.handle)? {
                self.exit = Some(exit);
                self.release();
                self.mark(RecorderState::Stopped);
                let level = if exit.success() { "info" } else { "warn" };
                append_run_log(
                    level,
                    "supervisor.stop.exited",
                    json!({ "name": self.spec.name, "code": exit.code, "signal": exit.signal }),
                );
                return Ok(StopOutcome::exited(exit));
            }
            let now = self.clock.now();
            if now >= deadline {
                break;
            }
            self.clock.sleep_until(
                now.after(self.settings.poll_interval_seconds)
                    .min(deadline),
            )?;
        }

        match self.settings.shutdown_policy {
            ShutdownPolicy::ForceKill => {
                self.kill_and_release();
                self.mark(RecorderState::Stopped);
                append_run_log(
                    "warn",
                    "supervisor.stop.force_killed",
                    json!({
                        "name": self.spec.name,
                        "timeout_secs": self.settings.stop_timeout_seconds,
                    }),
                );
                Ok(StopOutcome::ForceKilled)
            }
            ShutdownPolicy::Propagate => {
                append_run_log(
                    "error",
                    "supervisor.stop.timeout",
                    json!({
                        "name": self.spec.name,
                        "timeout_secs": self.settings.stop_timeout_seconds,
                    }),
                );
                Err(CuesyncError::ProcessShutdownTimeout {
                    command: self.command(),
                    timeout_secs: self.settings.stop_timeout_seconds,
                })
            }
        }
    }

    fn mark(&mut self, next: RecorderState) {
        if self.state != next {
            self.state = next;
            self.history.push(next);
        }
    }

    fn kill_and_release(&mut self) {
        if self.released {
            return;
        }
        if let Err(error) = self.runner.kill(self.handle) {
            append_run_log(
                "error",
                "supervisor.kill.failed",
                json!({ "name": self.spec.name, "error": error.to_string() }),
            );
        }
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.runner.release(self.handle);
            self.released = true;
        }
    }
}

impl Drop for RecordingProcess {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let still_running = self.exit.is_none()
            && !matches!(self.runner.try_wait(self.handle), Ok(Some(_)));
        if still_running {
            append_run_log(
                "warn",
                "supervisor.drop.killed",
                json!({ "name": self.spec.name, "pid": self.pid }),
            );
            self.kill_and_release();
        } else {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeClock, FakeProcessRunner, FakeProcessScript};

    fn supervisor(runner: &FakeProcessRunner, policy: ShutdownPolicy) -> RecordingSupervisor {
        RecordingSupervisor::new(
            Arc::new(runner.clone()),
            Arc::new(FakeClock::default()),
            SupervisorSettings {
                shutdown_policy: policy,
                ..SupervisorSettings::default()
            },
        )
    }

    fn logger_spec() -> ProcessSpec {
        ProcessSpec::external_logger("LabRecorderCLI", Path::new("out.xdf"), "name='Stream'")
    }

    #[test]
    fn start_then_stop_walks_starting_running_stopped() {
        let runner = FakeProcessRunner::default();
        let mut process = supervisor(&runner, ShutdownPolicy::ForceKill)
            .start(logger_spec())
            .expect("start");
        assert_eq!(process.state(), RecorderState::Running);
        let outcome = process.stop().expect("stop");
        assert_eq!(
            outcome,
            StopOutcome::Exited {
                code: Some(0),
                signal: None
            }
        );
        assert_eq!(
            process.history(),
            &[
                RecorderState::Starting,
                RecorderState::Running,
                RecorderState::Stopped
            ]
        );
        assert_eq!(
            runner.stops(),
            vec![(0, StopMethod::StdinLine("\n".to_string()))]
        );
        assert_eq!(runner.live_children(), 0);
    }

    #[test]
    fn exit_inside_grace_window_is_early_exit() {
        let runner = FakeProcessRunner::default();
        runner.push_script(FakeProcessScript::crashes_after(3, 2).with_output("camera busy"));
        let err = supervisor(&runner, ShutdownPolicy::ForceKill)
            .start(logger_spec())
            .expect_err("early exit");
        assert!(matches!(
            err,
            CuesyncError::ProcessEarlyExit { code: Some(2), ref output, .. } if output == "camera busy"
        ));
        assert_eq!(runner.released(), vec![0]);
    }

    #[test]
    fn no_matching_stream_output_is_reported_and_child_reaped() {
        let runner = FakeProcessRunner::default();
        runner.push_script(
            FakeProcessScript::well_behaved()
                .with_output("resolving streams\nquery name='Stream' matched no stream\n"),
        );
        let err = supervisor(&runner, ShutdownPolicy::ForceKill)
            .start(logger_spec())
            .expect_err("no stream");
        assert!(matches!(
            err,
            CuesyncError::NoMatchingStream { ref detail, .. } if detail.contains("name='Stream'")
        ));
        assert_eq!(runner.kills(), vec![0]);
        assert_eq!(runner.live_children(), 0);
    }

    #[test]
    fn launch_error_creates_no_child() {
        let runner = FakeProcessRunner::default();
        runner.push_script(FakeProcessScript::missing_executable());
        let err = supervisor(&runner, ShutdownPolicy::ForceKill)
            .start(logger_spec())
            .expect_err("launch");
        assert!(matches!(err, CuesyncError::ProcessLaunch { .. }));
        assert!(runner.spawned().is_empty());
    }

    #[test]
    fn explicit_missing_path_fails_before_spawn() {
        let runner = FakeProcessRunner::default();
        let spec = ProcessSpec::external_logger(
            "/definitely/not/here/LabRecorderCLI",
            Path::new("out.xdf"),
            "type='EEG'",
        );
        let err = supervisor(&runner, ShutdownPolicy::ForceKill)
            .start(spec)
            .expect_err("launch");
        assert!(matches!(err, CuesyncError::ProcessLaunch { .. }));
        assert!(runner.spawned().is_empty());
    }

    #[test]
    fn ignored_stop_is_force_killed_by_default() {
        let runner = FakeProcessRunner::default();
        runner.push_script(FakeProcessScript::ignores_stop());
        let mut process = supervisor(&runner, ShutdownPolicy::ForceKill)
            .start(logger_spec())
            .expect("start");
        assert_eq!(process.stop().expect("stop"), StopOutcome::ForceKilled);
        assert_eq!(runner.kills(), vec![0]);
        assert_eq!(process.state(), RecorderState::Stopped);
    }

    #[test]
    fn propagate_policy_returns_timeout_and_drop_still_kills() {
        let runner = FakeProcessRunner::default();
        runner.push_script(FakeProcessScript::ignores_stop());
        let mut process = supervisor(&runner, ShutdownPolicy::Propagate)
            .start(logger_spec())
            .expect("start");
        let err = process.stop().expect_err("timeout");
        assert!(matches!(err, CuesyncError::ProcessShutdownTimeout { .. }));
        assert!(runner.kills().is_empty());
        drop(process);
        assert_eq!(runner.kills(), vec![0]);
        assert_eq!(runner.live_children(), 0);
    }

    #[test]
    fn health_reports_a_recorder_that_died_mid_session() {
        let runner = FakeProcessRunner::default();
        runner.push_script(FakeProcessScript::crashes_after(40, 1));
        let mut process = supervisor(&runner, ShutdownPolicy::ForceKill)
            .start(logger_spec())
            .expect("start");
        let mut state = RecorderState::Running;
        for _ in 0..40 {
            state = process.health().expect("health");
        }
        assert_eq!(state, RecorderState::Failed);
        assert!(process.ensure_running().is_err());
        assert!(matches!(
            process.stop().expect("stop"),
            StopOutcome::AlreadyExited { code: Some(1), .. }
        ));
    }

    #[test]
    fn video_recorder_spec_uses_record_video_subcommand() {
        let spec = ProcessSpec::video_recorder(
            Path::new("/usr/bin/cuesync"),
            "0",
            Path::new("/tmp/out.avi"),
            30.0,
            Some(Path::new("/tmp/markers.db")),
            &[],
        );
        assert_eq!(
            spec.command_line(),
            "/usr/bin/cuesync record-video 0 /tmp/out.avi 30 --markers /tmp/markers.db"
        );
        assert_eq!(spec.stop_method, StopMethod::Terminate);
    }
}
