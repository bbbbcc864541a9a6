#![cfg(unix)]

use cuesync::errors::CuesyncError;
use cuesync::runtime::{ProcessRequest, ProductionClock, ProductionProcessRunner, StopMethod};
use cuesync::supervisor::{
    ProcessSpec, RecordingSupervisor, ShutdownPolicy, StopOutcome, SupervisorSettings,
    NO_MATCHING_STREAM,
};
use cuesync::types::RecorderState;
use std::sync::Arc;

fn supervisor(grace: f64, stop_timeout: f64, policy: ShutdownPolicy) -> RecordingSupervisor {
    RecordingSupervisor::new(
        Arc::new(ProductionProcessRunner::new()),
        Arc::new(ProductionClock),
        SupervisorSettings {
            grace_period_seconds: grace,
            stop_timeout_seconds: stop_timeout,
            poll_interval_seconds: 0.05,
            shutdown_policy: policy,
        },
    )
}

fn shell(name: &str, script: &str, stop_method: StopMethod) -> ProcessSpec {
    ProcessSpec {
        name: name.to_string(),
        request: ProcessRequest {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: None,
            stdin_piped: matches!(stop_method, StopMethod::StdinLine(_)),
        },
        stop_method,
        no_stream_patterns: vec![NO_MATCHING_STREAM.to_string()],
    }
}

#[test]
fn long_running_child_starts_then_stops_on_terminate() {
    let supervisor = supervisor(0.3, 5.0, ShutdownPolicy::ForceKill);
    let mut process = supervisor
        .start(shell("video", "exec sleep 30", StopMethod::Terminate))
        .expect("start");
    assert_eq!(process.state(), RecorderState::Running);
    assert!(process.pid().is_some());
    process.ensure_running().expect("still running");

    let outcome = process.stop().expect("stop");
    assert!(matches!(outcome, StopOutcome::Exited { .. }));
    assert_eq!(
        process.history(),
        &[
            RecorderState::Starting,
            RecorderState::Running,
            RecorderState::Stopped
        ]
    );
}

#[test]
fn stdin_line_stop_lets_the_child_exit_cleanly() {
    let supervisor = supervisor(0.3, 5.0, ShutdownPolicy::ForceKill);
    let mut process = supervisor
        .start(shell(
            "external_logger",
            "read line; exit 0",
            StopMethod::StdinLine("\n".to_string()),
        ))
        .expect("start");
    let outcome = process.stop().expect("stop");
    assert_eq!(
        outcome,
        StopOutcome::Exited {
            code: Some(0),
            signal: None
        }
    );
}

#[test]
fn missing_explicit_executable_is_a_launch_error() {
    let supervisor = supervisor(0.3, 5.0, ShutdownPolicy::ForceKill);
    let mut spec = shell("video", "true", StopMethod::Terminate);
    spec.request.program = "/nonexistent/cuesync-recorder".to_string();
    let err = supervisor.start(spec).expect_err("launch");
    assert!(matches!(err, CuesyncError::ProcessLaunch { .. }));
}

#[test]
fn child_exiting_inside_grace_period_is_an_early_exit() {
    let supervisor = supervisor(1.0, 5.0, ShutdownPolicy::ForceKill);
    let err = supervisor
        .start(shell("video", "echo camera busy >&2; exit 3", StopMethod::Terminate))
        .expect_err("early exit");
    match err {
        CuesyncError::ProcessEarlyExit { code, .. } => assert_eq!(code, Some(3)),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn no_matching_stream_output_is_reported_as_such() {
    let supervisor = supervisor(1.0, 5.0, ShutdownPolicy::ForceKill);
    let err = supervisor
        .start(shell(
            "external_logger",
            "echo \"resolve: query name='Collection' matched no stream\"; exec sleep 30",
            StopMethod::StdinLine("\n".to_string()),
        ))
        .expect_err("no stream");
    match err {
        CuesyncError::NoMatchingStream { detail, .. } => {
            assert!(detail.contains("name='Collection'"))
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn child_ignoring_terminate_is_force_killed_after_timeout() {
    let supervisor = supervisor(0.3, 0.5, ShutdownPolicy::ForceKill);
    let mut process = supervisor
        .start(shell("video", "trap '' TERM; exec sleep 30", StopMethod::Terminate))
        .expect("start");
    let outcome = process.stop().expect("stop");
    assert_eq!(outcome, StopOutcome::ForceKilled);
    assert_eq!(process.state(), RecorderState::Stopped);
}

#[test]
fn propagate_policy_surfaces_the_shutdown_timeout() {
    let supervisor = supervisor(0.3, 0.5, ShutdownPolicy::Propagate);
    let mut process = supervisor
        .start(shell("video", "trap '' TERM; exec sleep 30", StopMethod::Terminate))
        .expect("start");
    let err = process.stop().expect_err("timeout");
    assert!(matches!(err, CuesyncError::ProcessShutdownTimeout { .. }));
}
