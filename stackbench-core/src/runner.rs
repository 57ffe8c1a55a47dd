// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Benchmark runner.
//!
//! Drives one workload process through its lifecycle and brackets the
//! steady-state window with the registered collectors:
//!
//! ```text
//! Idle → ProcessStarting → RampingUp → SteadyStateMeasuring → Draining → Completed
//!   └──────────────┴──────────────┴────────────────┴──────────────┴──→ Failed
//! ```
//!
//! The process is owned by a supervisor thread. The controlling thread only
//! ever waits on two one-shot events: "ready" and "exited". Collectors are
//! started after ramp-up and ended when, and only when, the process exits.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::{BenchError, BenchResult, ProtocolViolation, SubprocessError};
use crate::measurement::{Collector, CollectorSet};
use crate::process::{must_run, CommandSpec, HostSystem};
use crate::sync::{lock, OneShot};
use crate::workload::{Readiness, Workload};

/// Run lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Idle,
    ProcessStarting,
    RampingUp,
    SteadyStateMeasuring,
    Draining,
    Completed,
    Failed,
}

impl RunPhase {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::ProcessStarting => "ProcessStarting",
            Self::RampingUp => "RampingUp",
            Self::SteadyStateMeasuring => "SteadyStateMeasuring",
            Self::Draining => "Draining",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, target: RunPhase) -> bool {
        if target == Self::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, target),
            (Self::Idle, Self::ProcessStarting)
                | (Self::ProcessStarting, Self::RampingUp)
                | (Self::RampingUp, Self::SteadyStateMeasuring)
                | (Self::SteadyStateMeasuring, Self::Draining)
                | (Self::Draining, Self::Completed)
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Tracks the phase of one run and enforces valid transitions.
#[derive(Debug)]
pub struct RunStateMachine {
    workload: String,
    phase: RunPhase,
    last_transition: Instant,
}

impl RunStateMachine {
    pub fn new(workload: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
            phase: RunPhase::Idle,
            last_transition: Instant::now(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn transition_to(&mut self, target: RunPhase) -> Result<(), ProtocolViolation> {
        if !self.phase.can_transition_to(target) {
            return Err(ProtocolViolation::InvalidPhaseTransition {
                from: self.phase.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            workload = %self.workload,
            from = self.phase.name(),
            to = target.name(),
            elapsed_ms = self.last_transition.elapsed().as_millis() as u64,
            "Run phase transition"
        );

        self.phase = target;
        self.last_transition = Instant::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Time between readiness and the start of measurement. Falls back to
    /// the workload's own hint, then to zero.
    pub ramp_up: Option<Duration>,
    /// Bound on the wait for readiness. Unbounded when `None`.
    pub readiness_timeout: Option<Duration>,
}

/// When things happened, relative to the workload spawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTiming {
    pub ready_ms: u64,
    pub steady_state_start_ms: u64,
    pub steady_state_end_ms: u64,
}

impl RunTiming {
    pub fn steady_state(&self) -> Duration {
        Duration::from_millis(self.steady_state_end_ms.saturating_sub(self.steady_state_start_ms))
    }
}

/// Successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub collector_results: BTreeMap<String, serde_json::Value>,
    pub timing: RunTiming,
}

#[derive(Debug, Clone)]
struct ProcessExit {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Clone, Copy)]
enum ReadySignal {
    Ready(Instant),
    Exited,
}

/// Events shared between the controlling thread and the supervisor.
struct Supervision {
    spawned: OneShot<Result<(u32, Instant), String>>,
    ready: OneShot<ReadySignal>,
    exited: OneShot<ProcessExit>,
}

/// Kills the live workload of a runner from another thread.
#[derive(Debug, Clone, Default)]
pub struct RunCanceller {
    live_pid: Arc<Mutex<Option<u32>>>,
    cancelled: Arc<AtomicBool>,
}

impl RunCanceller {
    /// Mark the run cancelled and SIGKILL its workload, if one is running.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        tracing::warn!("Cancelling run");
        self.kill_workload();
    }

    /// SIGKILL the workload if the supervisor has not reaped it yet.
    ///
    /// Holds the pid lock across the signal; the supervisor clears the pid
    /// before reaping.
    fn kill_workload(&self) {
        let live = lock(&self.live_pid);
        if let Some(pid) = *live {
            tracing::warn!(pid = pid, "Killing workload");
            kill_process(pid);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// SIGKILL the workload's process group, which includes anything it forked.
fn kill_process(pid: u32) {
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::debug!(pid = pid, error = %e, "SIGKILL failed, process already gone");
    }
}

/// Block until the workload has exited without reaping it. The zombie keeps
/// its pid and process group reserved until `Child::wait`.
fn wait_exited(pid: u32) {
    loop {
        let id = Id::Pid(Pid::from_raw(pid as i32));
        match waitid(id, WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::debug!(pid = pid, error = %e, "waitid failed, reaping directly");
                return;
            }
            Ok(_) => return,
        }
    }
}

pub struct BenchmarkRunner {
    config: RunnerConfig,
    collectors: CollectorSet,
    canceller: RunCanceller,
}

impl BenchmarkRunner {
    pub fn new(config: RunnerConfig, collectors: CollectorSet) -> Self {
        Self::with_canceller(config, collectors, RunCanceller::default())
    }

    /// Use a canceller created before the runner (e.g. by a signal handler).
    pub fn with_canceller(config: RunnerConfig, collectors: CollectorSet, canceller: RunCanceller) -> Self {
        Self {
            config,
            collectors,
            canceller,
        }
    }

    pub fn canceller(&self) -> RunCanceller {
        self.canceller.clone()
    }

    pub fn collectors(&self) -> &CollectorSet {
        &self.collectors
    }

    /// Run the workload to completion. Blocks until it exits.
    pub fn run(&self, workload: &dyn Workload) -> BenchResult<RunOutcome> {
        let identity = workload.identity();
        let mut machine = RunStateMachine::new(identity.clone());

        let result = self.run_phases(workload, &identity, &mut machine);
        match &result {
            Ok(_) => tracing::info!(workload = %identity, "Run completed"),
            Err(e) => {
                tracing::error!(
                    workload = %identity,
                    phase = machine.phase().name(),
                    error = %e,
                    "Run failed"
                );
                if !machine.phase().is_terminal() {
                    machine.transition_to(RunPhase::Failed)?;
                }
            }
        }
        result
    }

    fn run_phases(
        &self,
        workload: &dyn Workload,
        identity: &str,
        machine: &mut RunStateMachine,
    ) -> BenchResult<RunOutcome> {
        if let Some(prepare) = workload.prepare_command() {
            tracing::info!(workload = %identity, command = %prepare, "Preparing workload");
            must_run(&HostSystem, &prepare)?;
        }
        self.check_cancelled(identity)?;

        machine.transition_to(RunPhase::ProcessStarting)?;
        let command = workload.run_command();
        let supervision = Arc::new(Supervision {
            spawned: OneShot::new(),
            ready: OneShot::new(),
            exited: OneShot::new(),
        });
        let supervisor = {
            let supervision = Arc::clone(&supervision);
            let command = command.clone();
            let readiness = workload.readiness();
            let live_pid = Arc::clone(&self.canceller.live_pid);
            thread::Builder::new()
                .name("workload-supervisor".to_string())
                .spawn(move || supervise(command, readiness, supervision, live_pid))
                .map_err(BenchError::io("spawning workload supervisor thread"))?
        };
        let mut run = LiveRun {
            identity,
            supervision,
            supervisor: Some(supervisor),
        };

        let (pid, spawned_at) = match run.supervision.spawned.wait() {
            Ok(spawned) => spawned,
            Err(reason) => {
                run.join();
                return Err(SubprocessError::SpawnFailed {
                    program: command.program.display().to_string(),
                    reason,
                }
                .into());
            }
        };
        tracing::info!(workload = %identity, pid = pid, command = %command, "Workload spawned");
        if self.canceller.is_cancelled() {
            self.canceller.kill_workload();
        }

        let signal = match self.config.readiness_timeout {
            Some(timeout) => run.supervision.ready.wait_timeout(timeout),
            None => Some(run.supervision.ready.wait()),
        };
        let ready_at = match signal {
            Some(ReadySignal::Ready(at)) => at,
            Some(ReadySignal::Exited) => {
                let exit = run.wait_exit();
                self.check_cancelled(identity)?;
                return Err(early_exit(identity, "process start", exit));
            }
            None => {
                tracing::warn!(workload = %identity, pid = pid, "Readiness timeout, killing workload");
                self.canceller.kill_workload();
                run.wait_exit();
                return Err(BenchError::Timeout {
                    operation: format!("readiness of {}", identity),
                    waited_ms: spawned_at.elapsed().as_millis() as u64,
                });
            }
        };
        tracing::info!(
            workload = %identity,
            after_ms = ready_at.duration_since(spawned_at).as_millis() as u64,
            "Workload ready"
        );

        machine.transition_to(RunPhase::RampingUp)?;
        let ramp_up = self
            .config
            .ramp_up
            .or_else(|| workload.ramp_up_hint())
            .unwrap_or(Duration::ZERO);
        if run.supervision.exited.wait_timeout(ramp_up).is_some() {
            let exit = run.wait_exit();
            self.check_cancelled(identity)?;
            return Err(early_exit(identity, "ramp-up", exit));
        }

        machine.transition_to(RunPhase::SteadyStateMeasuring)?;
        let steady_start = Instant::now();
        let mut started: Vec<Arc<dyn Collector>> = Vec::with_capacity(self.collectors.len());
        for collector in self.collectors.iter() {
            tracing::info!(collector = %collector.name(), "Starting collector");
            if let Err(e) = collector.start() {
                tracing::error!(collector = %collector.name(), error = %e, "Collector start failed, aborting run");
                for running in started.iter().rev() {
                    abandon(&**running);
                }
                self.canceller.kill_workload();
                run.wait_exit();
                return Err(e);
            }
            started.push(Arc::clone(collector));
        }

        let exit = run.wait_exit();
        let steady_end = Instant::now();
        tracing::info!(
            workload = %identity,
            code = ?exit.code,
            steady_state_ms = steady_end.duration_since(steady_start).as_millis() as u64,
            "Workload exited"
        );

        machine.transition_to(RunPhase::Draining)?;
        let mut first_error: Option<BenchError> = None;
        let mut collector_results = BTreeMap::new();
        for collector in started {
            let outcome = collector.end().and_then(|_| collector.result());
            match outcome {
                Ok(value) => {
                    collector_results.insert(collector.name().to_string(), value);
                }
                Err(e) => {
                    tracing::error!(collector = %collector.name(), error = %e, "Collector failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.check_cancelled(identity)?;
        if exit.code != Some(0) {
            return Err(SubprocessError::WorkloadFailed {
                workload: identity.to_string(),
                code: exit.code,
                stdout: exit.stdout,
                stderr: exit.stderr,
            }
            .into());
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        machine.transition_to(RunPhase::Completed)?;
        let since_spawn = |at: Instant| at.duration_since(spawned_at).as_millis() as u64;
        Ok(RunOutcome {
            stdout: exit.stdout,
            stderr: exit.stderr,
            collector_results,
            timing: RunTiming {
                ready_ms: since_spawn(ready_at),
                steady_state_start_ms: since_spawn(steady_start),
                steady_state_end_ms: since_spawn(steady_end),
            },
        })
    }

    fn check_cancelled(&self, identity: &str) -> BenchResult<()> {
        if self.canceller.is_cancelled() {
            return Err(BenchError::Cancelled {
                workload: identity.to_string(),
            });
        }
        Ok(())
    }
}

/// The supervisor thread of a run in progress. Joined on drop.
struct LiveRun<'a> {
    identity: &'a str,
    supervision: Arc<Supervision>,
    supervisor: Option<JoinHandle<()>>,
}

impl LiveRun<'_> {
    fn wait_exit(&mut self) -> ProcessExit {
        let exit = self.supervision.exited.wait();
        self.join();
        exit
    }

    fn join(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                tracing::error!(workload = %self.identity, "Workload supervisor thread panicked");
            }
        }
    }
}

impl Drop for LiveRun<'_> {
    fn drop(&mut self) {
        self.join();
    }
}

/// End a collector of an aborted run and discard whatever it measured.
fn abandon(collector: &dyn Collector) {
    if let Err(e) = collector.end() {
        tracing::warn!(collector = %collector.name(), error = %e, "Ending collector of aborted run failed");
        return;
    }
    if let Err(e) = collector.result() {
        tracing::warn!(collector = %collector.name(), error = %e, "Collector result of aborted run unavailable");
    }
}

fn early_exit(workload: &str, phase: &'static str, exit: ProcessExit) -> BenchError {
    let err = match exit.code {
        Some(0) => SubprocessError::ExitedBeforeSteadyState {
            workload: workload.to_string(),
            phase,
            code: exit.code,
        },
        code => SubprocessError::WorkloadFailed {
            workload: workload.to_string(),
            code,
            stdout: exit.stdout,
            stderr: exit.stderr,
        },
    };
    err.into()
}

/// Body of the supervisor thread: spawn, watch stdout, reap.
fn supervise(
    command: CommandSpec,
    readiness: Readiness,
    supervision: Arc<Supervision>,
    live_pid: Arc<Mutex<Option<u32>>>,
) {
    let mut cmd = command.to_command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            supervision.spawned.set(Err(e.to_string()));
            supervision.ready.set(ReadySignal::Exited);
            return;
        }
    };

    let pid = child.id();
    *lock(&live_pid) = Some(pid);
    supervision.spawned.set(Ok((pid, Instant::now())));
    if readiness == Readiness::Spawned {
        supervision.ready.set(ReadySignal::Ready(Instant::now()));
    }

    let stderr_drain = child.stderr.take().and_then(|mut stderr| {
        thread::Builder::new()
            .name("workload-stderr".to_string())
            .spawn(move || {
                let mut buf = Vec::new();
                if let Err(e) = stderr.read_to_end(&mut buf) {
                    tracing::warn!(error = %e, "Reading workload stderr failed");
                }
                String::from_utf8_lossy(&buf).into_owned()
            })
            .ok()
    });

    let mut stdout = String::new();
    if let Some(out) = child.stdout.take() {
        let mut reader = BufReader::new(out);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    if let Readiness::OutputLine(marker) = &readiness {
                        if !supervision.ready.is_set() && text.contains(marker.as_str()) {
                            supervision.ready.set(ReadySignal::Ready(Instant::now()));
                        }
                    }
                    stdout.push_str(&text);
                }
                Err(e) => {
                    tracing::warn!(pid = pid, error = %e, "Reading workload stdout failed");
                    break;
                }
            }
        }
    }

    wait_exited(pid);
    *lock(&live_pid) = None;
    let code = match child.wait() {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!(pid = pid, error = %e, "Waiting for workload failed");
            None
        }
    };

    let stderr = stderr_drain
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    supervision.exited.set(ProcessExit {
        code,
        stdout,
        stderr,
    });
    supervision.ready.set(ReadySignal::Exited);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let mut machine = RunStateMachine::new("fio");
        for phase in [
            RunPhase::ProcessStarting,
            RunPhase::RampingUp,
            RunPhase::SteadyStateMeasuring,
            RunPhase::Draining,
            RunPhase::Completed,
        ] {
            machine.transition_to(phase).unwrap();
        }
        assert_eq!(machine.phase(), RunPhase::Completed);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut machine = RunStateMachine::new("fio");
        let err = machine.transition_to(RunPhase::SteadyStateMeasuring).unwrap_err();
        assert_eq!(
            err,
            ProtocolViolation::InvalidPhaseTransition {
                from: "Idle",
                to: "SteadyStateMeasuring"
            }
        );
        assert!(!RunPhase::Completed.can_transition_to(RunPhase::Failed));
        assert!(!RunPhase::Failed.can_transition_to(RunPhase::Idle));
    }

    #[test]
    fn test_any_live_phase_can_fail() {
        for phase in [
            RunPhase::Idle,
            RunPhase::ProcessStarting,
            RunPhase::RampingUp,
            RunPhase::SteadyStateMeasuring,
            RunPhase::Draining,
        ] {
            assert!(phase.can_transition_to(RunPhase::Failed), "{phase}");
        }
    }

    #[test]
    fn test_early_exit_classification() {
        let clean = ProcessExit {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(matches!(
            early_exit("w", "ramp-up", clean),
            BenchError::Subprocess(SubprocessError::ExitedBeforeSteadyState { phase: "ramp-up", .. })
        ));

        let failed = ProcessExit {
            code: Some(2),
            stdout: "out".into(),
            stderr: "boom".into(),
        };
        match early_exit("w", "ramp-up", failed) {
            BenchError::Subprocess(SubprocessError::WorkloadFailed { code, stderr, .. }) => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_timing_steady_state() {
        let timing = RunTiming {
            ready_ms: 5,
            steady_state_start_ms: 105,
            steady_state_end_ms: 1105,
        };
        assert_eq!(timing.steady_state(), Duration::from_secs(1));
    }

    #[test]
    fn test_exited_workload_not_reaped_by_wait_exited() {
        let mut child = CommandSpec::new("/bin/sh")
            .arg("-c")
            .arg("exit 4")
            .to_command()
            .spawn()
            .unwrap();
        let pid = child.id();

        wait_exited(pid);
        // Still a zombie, so the pid cannot have been recycled.
        assert!(nix::sys::signal::kill(Pid::from_raw(pid as i32), None).is_ok());
        assert_eq!(child.wait().unwrap().code(), Some(4));
    }

    #[test]
    fn test_supervisor_clears_live_pid_before_reporting_exit() {
        let supervision = Arc::new(Supervision {
            spawned: OneShot::new(),
            ready: OneShot::new(),
            exited: OneShot::new(),
        });
        let canceller = RunCanceller::default();
        supervise(
            CommandSpec::new("/bin/sh").arg("-c").arg("echo hi"),
            Readiness::Spawned,
            Arc::clone(&supervision),
            Arc::clone(&canceller.live_pid),
        );

        assert_eq!(supervision.exited.get().unwrap().code, Some(0));
        assert!(lock(&canceller.live_pid).is_none());
        // Nothing left to signal.
        canceller.cancel();
        assert!(canceller.is_cancelled());
    }
}
