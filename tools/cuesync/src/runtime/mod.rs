use crate::errors::CuesyncError;
use crate::logging::append_run_log;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::ops::Sub;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub mod fakes;

pub use fakes::{FakeClock, FakeProcessRunner, FakeProcessScript, FakeTerminal};

const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// Seconds on the shared monotonic clock. Comparable across every process of a session.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClockReading(f64);

impl ClockReading {
    pub fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }

    pub fn after(self, secs: f64) -> Self {
        Self(self.0 + secs)
    }

    pub fn min(self, other: Self) -> Self {
        if other.0 < self.0 {
            other
        } else {
            self
        }
    }

    pub fn max(self, other: Self) -> Self {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }
}

impl Sub for ClockReading {
    type Output = f64;

    fn sub(self, rhs: Self) -> f64 {
        self.0 - rhs.0
    }
}

impl std::fmt::Display for ClockReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> ClockReading;
    fn sleep_until(&self, deadline: ClockReading) -> Result<(), CuesyncError>;

    fn sleep_for(&self, secs: f64) -> Result<(), CuesyncError> {
        let deadline = self.now().after(secs);
        self.sleep_until(deadline)
    }
}

/// Reads the OS monotonic clock, so a child process started by the supervisor
/// produces readings on the same scale and epoch as its parent.
pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> ClockReading {
        ClockReading(monotonic_seconds())
    }

    fn sleep_until(&self, deadline: ClockReading) -> Result<(), CuesyncError> {
        let remaining = deadline - self.now();
        if remaining > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(remaining));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn monotonic_seconds() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return process_relative_seconds();
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
}

#[cfg(not(unix))]
fn monotonic_seconds() -> f64 {
    process_relative_seconds()
}

fn process_relative_seconds() -> f64 {
    static ANCHOR: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    ANCHOR
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs_f64()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin_piped: bool,
}

impl ProcessRequest {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnedProcess {
    pub handle: u64,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// How a recorder is asked to finish on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMethod {
    /// SIGTERM on unix.
    Terminate,
    /// Write a line to the child's stdin, then close it.
    StdinLine(String),
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<SpawnedProcess, CuesyncError>;
    fn try_wait(&self, handle: u64) -> Result<Option<ExitInfo>, CuesyncError>;
    /// Combined stdout/stderr captured so far (tail-bounded).
    fn output_so_far(&self, handle: u64) -> Result<String, CuesyncError>;
    fn request_stop(&self, handle: u64, method: &StopMethod) -> Result<(), CuesyncError>;
    /// Kill and reap.
    fn kill(&self, handle: u64) -> Result<(), CuesyncError>;
    /// Forget a handle whose process has exited.
    fn release(&self, handle: u64);
}

struct ChildSlot {
    child: Child,
    stdin: Option<ChildStdin>,
    output: Arc<Mutex<String>>,
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, ChildSlot>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }

    fn with_slot<T>(
        &self,
        handle: u64,
        f: impl FnOnce(&mut ChildSlot) -> Result<T, CuesyncError>,
    ) -> Result<T, CuesyncError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CuesyncError::Process("process table lock poisoned".to_string()))?;
        let slot = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| CuesyncError::Process(format!("unknown handle {handle}")))?;
        f(slot)
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<SpawnedProcess, CuesyncError> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(if request.stdin_piped {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| CuesyncError::ProcessLaunch {
            command: request.command_line(),
            reason: e.to_string(),
        })?;

        let output = Arc::new(Mutex::new(String::new()));
        if let Some(stdout) = child.stdout.take() {
            spawn_output_reader(stdout, Arc::clone(&output), request.program.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_reader(stderr, Arc::clone(&output), request.program.clone());
        }
        let stdin = child.stdin.take();
        let pid = Some(child.id());

        let mut state = self
            .state
            .lock()
            .map_err(|_| CuesyncError::Process("process table lock poisoned".to_string()))?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(
            handle,
            ChildSlot {
                child,
                stdin,
                output,
            },
        );
        Ok(SpawnedProcess { handle, pid })
    }

    fn try_wait(&self, handle: u64) -> Result<Option<ExitInfo>, CuesyncError> {
        self.with_slot(handle, |slot| {
            slot.child
                .try_wait()
                .map(|status| status.map(ExitInfo::from_status))
                .map_err(|e| CuesyncError::Process(e.to_string()))
        })
    }

    fn output_so_far(&self, handle: u64) -> Result<String, CuesyncError> {
        self.with_slot(handle, |slot| {
            Ok(slot
                .output
                .lock()
                .map(|text| text.clone())
                .unwrap_or_default())
        })
    }

    fn request_stop(&self, handle: u64, method: &StopMethod) -> Result<(), CuesyncError> {
        self.with_slot(handle, |slot| match method {
            StopMethod::Terminate => terminate(&mut slot.child),
            StopMethod::StdinLine(line) => {
                let mut stdin = slot.stdin.take().ok_or_else(|| {
                    CuesyncError::Process("stdin was not piped for this process".to_string())
                })?;
                stdin
                    .write_all(line.as_bytes())
                    .and_then(|_| stdin.flush())
                    .map_err(|e| CuesyncError::Process(e.to_string()))
            }
        })
    }

    fn kill(&self, handle: u64) -> Result<(), CuesyncError> {
        self.with_slot(handle, |slot| {
            slot.stdin = None;
            slot.child
                .kill()
                .and_then(|_| slot.child.wait())
                .map(|_| ())
                .map_err(|e| CuesyncError::Process(e.to_string()))
        })
    }

    fn release(&self, handle: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.children.remove(&handle);
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> Result<(), CuesyncError> {
    let pid = child.id() as libc::pid_t;
    // SAFETY: plain signal delivery to a child we own; no memory is shared.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        return Err(CuesyncError::Process(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> Result<(), CuesyncError> {
    child
        .kill()
        .map_err(|e| CuesyncError::Process(e.to_string()))
}

fn spawn_output_reader<R: Read + Send + 'static>(
    stream: R,
    sink: Arc<Mutex<String>>,
    program: String,
) {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else {
                break;
            };
            append_run_log(
                "debug",
                "supervisor.child.output",
                json!({ "program": program, "line": line }),
            );
            if let Ok(mut text) = sink.lock() {
                text.push_str(&line);
                text.push('\n');
                if text.len() > OUTPUT_TAIL_BYTES {
                    let mut cut = text.len() - OUTPUT_TAIL_BYTES;
                    while !text.is_char_boundary(cut) {
                        cut += 1;
                    }
                    text.drain(..cut);
                }
            }
        }
    });
}

pub trait Terminal: Send + Sync {
    fn stdin_is_tty(&self) -> bool;
    fn write_line(&self, line: &str) -> Result<(), CuesyncError>;
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn stdin_is_tty(&self) -> bool {
        std::io::IsTerminal::is_terminal(&std::io::stdin())
    }

    fn write_line(&self, line: &str) -> Result<(), CuesyncError> {
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| CuesyncError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_clock_is_monotonic() {
        let clock = ProductionClock;
        let mut last = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn production_clock_sleep_until_reaches_deadline() {
        let clock = ProductionClock;
        let deadline = clock.now().after(0.02);
        clock.sleep_until(deadline).expect("sleep");
        assert!(clock.now() >= deadline);
    }

    #[test]
    fn clock_reading_arithmetic() {
        let a = ClockReading::from_secs(10.0);
        let b = a.after(2.5);
        assert_eq!(b - a, 2.5);
        assert_eq!(a.min(b), a);
        assert_eq!(a.max(b), b);
        assert_eq!(format!("{a}"), "10.000000");
    }

    #[test]
    fn command_line_joins_program_and_args() {
        let request = ProcessRequest {
            program: "LabRecorderCLI".to_string(),
            args: vec!["out.xdf".to_string(), "name='Collection'".to_string()],
            cwd: None,
            stdin_piped: true,
        };
        assert_eq!(
            request.command_line(),
            "LabRecorderCLI out.xdf name='Collection'"
        );
    }
}
