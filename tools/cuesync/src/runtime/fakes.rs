use super::{
    Clock, ClockReading, ExitInfo, ProcessRequest, ProcessRunner, SpawnedProcess, StopMethod,
    Terminal,
};
use crate::errors::CuesyncError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Deterministic clock: `sleep_until` jumps straight to the deadline.
///
/// Time is kept as integer nanoseconds so repeated advances do not drift.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<Duration>>,
    sleeps: Arc<Mutex<Vec<ClockReading>>>,
    alarms: Arc<Mutex<Vec<(ClockReading, Arc<AtomicBool>)>>>,
}

impl FakeClock {
    pub fn new(start_secs: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(Duration::from_secs_f64(start_secs.max(0.0)))),
            sleeps: Arc::new(Mutex::new(Vec::new())),
            alarms: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Raise `flag` once a sleep carries the clock to `at` or past it, the way
    /// a signal handler would mid-wait.
    pub fn raise_at(&self, at: f64, flag: Arc<AtomicBool>) {
        self.alarms
            .lock()
            .expect("alarm lock")
            .push((ClockReading::from_secs(at), flag));
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().expect("clock lock") += by;
    }

    pub fn sleeps(&self) -> Vec<ClockReading> {
        self.sleeps.lock().expect("sleep lock").clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> ClockReading {
        ClockReading::from_secs(self.now.lock().expect("clock lock").as_secs_f64())
    }

    fn sleep_until(&self, deadline: ClockReading) -> Result<(), CuesyncError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        let target = Duration::from_secs_f64(deadline.as_secs().max(0.0));
        let reached = {
            let mut now = self.now.lock().expect("clock lock");
            if target > *now {
                *now = target;
            }
            ClockReading::from_secs(now.as_secs_f64())
        };
        for (at, flag) in self.alarms.lock().expect("alarm lock").iter() {
            if reached >= *at {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Scripted behavior for one fake child process.
#[derive(Debug, Clone)]
pub struct FakeProcessScript {
    pub launch_error: Option<String>,
    /// Exit on its own after this many `try_wait` polls.
    pub exit_after_polls: Option<u32>,
    pub exit_code: i32,
    pub output: String,
    pub honors_stop: bool,
    pub stop_exit_code: i32,
}

impl Default for FakeProcessScript {
    fn default() -> Self {
        Self {
            launch_error: None,
            exit_after_polls: None,
            exit_code: 1,
            output: String::new(),
            honors_stop: true,
            stop_exit_code: 0,
        }
    }
}

impl FakeProcessScript {
    pub fn well_behaved() -> Self {
        Self::default()
    }

    pub fn missing_executable() -> Self {
        Self {
            launch_error: Some("No such file or directory (os error 2)".to_string()),
            ..Self::default()
        }
    }

    pub fn crashes_after(polls: u32, exit_code: i32) -> Self {
        Self {
            exit_after_polls: Some(polls),
            exit_code,
            ..Self::default()
        }
    }

    pub fn ignores_stop() -> Self {
        Self {
            honors_stop: false,
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.output = output.to_string();
        self
    }
}

#[derive(Debug)]
struct FakeChild {
    script: FakeProcessScript,
    polls: u32,
    stop_requested: bool,
    killed: bool,
    exited: Option<ExitInfo>,
}

#[derive(Default)]
struct FakeRunnerState {
    scripts: VecDeque<FakeProcessScript>,
    children: HashMap<u64, FakeChild>,
    next_handle: u64,
    spawned: Vec<ProcessRequest>,
    stops: Vec<(u64, StopMethod)>,
    kills: Vec<u64>,
    released: Vec<u64>,
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    state: Arc<Mutex<FakeRunnerState>>,
}

impl FakeProcessRunner {
    /// Queue the behavior of the next spawned process. Unscripted spawns are well behaved.
    pub fn push_script(&self, script: FakeProcessScript) {
        self.state
            .lock()
            .expect("runner lock")
            .scripts
            .push_back(script);
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.state.lock().expect("runner lock").spawned.clone()
    }

    pub fn stops(&self) -> Vec<(u64, StopMethod)> {
        self.state.lock().expect("runner lock").stops.clone()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.state.lock().expect("runner lock").kills.clone()
    }

    pub fn released(&self) -> Vec<u64> {
        self.state.lock().expect("runner lock").released.clone()
    }

    pub fn live_children(&self) -> usize {
        self.state
            .lock()
            .expect("runner lock")
            .children
            .values()
            .filter(|child| child.exited.is_none())
            .count()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<SpawnedProcess, CuesyncError> {
        let mut state = self.state.lock().expect("runner lock");
        let script = state.scripts.pop_front().unwrap_or_default();
        if let Some(reason) = &script.launch_error {
            return Err(CuesyncError::ProcessLaunch {
                command: request.command_line(),
                reason: reason.clone(),
            });
        }
        state.spawned.push(request);
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(
            handle,
            FakeChild {
                script,
                polls: 0,
                stop_requested: false,
                killed: false,
                exited: None,
            },
        );
        Ok(SpawnedProcess {
            handle,
            pid: Some(40_000 + handle as u32),
        })
    }

    fn try_wait(&self, handle: u64) -> Result<Option<ExitInfo>, CuesyncError> {
        let mut state = self.state.lock().expect("runner lock");
        let child = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| CuesyncError::Process(format!("unknown handle {handle}")))?;
        if child.exited.is_some() {
            return Ok(child.exited);
        }
        if child.stop_requested && child.script.honors_stop {
            child.exited = Some(ExitInfo {
                code: Some(child.script.stop_exit_code),
                signal: None,
            });
            return Ok(child.exited);
        }
        child.polls += 1;
        if let Some(limit) = child.script.exit_after_polls {
            if child.polls >= limit {
                child.exited = Some(ExitInfo {
                    code: Some(child.script.exit_code),
                    signal: None,
                });
            }
        }
        Ok(child.exited)
    }

    fn output_so_far(&self, handle: u64) -> Result<String, CuesyncError> {
        let state = self.state.lock().expect("runner lock");
        state
            .children
            .get(&handle)
            .map(|child| child.script.output.clone())
            .ok_or_else(|| CuesyncError::Process(format!("unknown handle {handle}")))
    }

    fn request_stop(&self, handle: u64, method: &StopMethod) -> Result<(), CuesyncError> {
        let mut state = self.state.lock().expect("runner lock");
        state.stops.push((handle, method.clone()));
        let child = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| CuesyncError::Process(format!("unknown handle {handle}")))?;
        child.stop_requested = true;
        Ok(())
    }

    fn kill(&self, handle: u64) -> Result<(), CuesyncError> {
        let mut state = self.state.lock().expect("runner lock");
        state.kills.push(handle);
        let child = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| CuesyncError::Process(format!("unknown handle {handle}")))?;
        child.killed = true;
        if child.exited.is_none() {
            child.exited = Some(ExitInfo {
                code: None,
                signal: Some(9),
            });
        }
        Ok(())
    }

    fn release(&self, handle: u64) {
        let mut state = self.state.lock().expect("runner lock");
        state.released.push(handle);
        state.children.remove(&handle);
    }
}

/// Terminal that records written lines.
#[derive(Clone, Default)]
pub struct FakeTerminal {
    tty: bool,
    lines: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new(tty: bool) -> Self {
        Self {
            tty,
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn written(&self) -> Vec<String> {
        self.lines.lock().expect("terminal lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn stdin_is_tty(&self) -> bool {
        self.tty
    }

    fn write_line(&self, line: &str) -> Result<(), CuesyncError> {
        self.lines
            .lock()
            .map_err(|_| CuesyncError::Io("terminal lock poisoned".to_string()))?
            .push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_never_moves_backwards() {
        let clock = FakeClock::new(5.0);
        clock
            .sleep_until(ClockReading::from_secs(3.0))
            .expect("sleep");
        assert_eq!(clock.now().as_secs(), 5.0);
        clock
            .sleep_until(ClockReading::from_secs(7.5))
            .expect("sleep");
        assert_eq!(clock.now().as_secs(), 7.5);
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[test]
    fn fake_clock_advances_without_drift() {
        let clock = FakeClock::default();
        for _ in 0..100 {
            clock.advance(Duration::from_millis(40));
        }
        assert_eq!(clock.now().as_secs(), 4.0);
    }

    #[test]
    fn scripted_child_exits_after_polls() {
        let runner = FakeProcessRunner::default();
        runner.push_script(FakeProcessScript::crashes_after(2, 3));
        let spawned = runner
            .spawn(ProcessRequest {
                program: "rec".to_string(),
                args: vec![],
                cwd: None,
                stdin_piped: false,
            })
            .expect("spawn");
        assert_eq!(runner.try_wait(spawned.handle).expect("poll"), None);
        let exit = runner.try_wait(spawned.handle).expect("poll").expect("exited");
        assert_eq!(exit.code, Some(3));
    }
}
