// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Streaming telemetry join.
//!
//! A background collector process (typically `bpftrace -f json`) prints
//! newline-delimited JSON events. Counters arrive in frames:
//!
//! ```text
//! {"type": "frame", "data": "begin"}
//! {"type": "counter-batch", "data": {"@zfs_write": 12, "@zfs_write_count": 3}}
//! {"type": "counter-batch", "data": {"@zil_commit": 7}}
//! {"type": "frame", "data": "end"}
//! ```
//!
//! A reader thread folds each complete frame into an [`Update`]. Only frames
//! whose key set matches the schema replace the last update; everything
//! else is logged and dropped. The join then behaves like a measurement
//! session whose samples are "the most recent complete update".

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Deserialize;

use crate::counters::{check_key_set, Update};
use crate::error::{BenchError, BenchResult, ProtocolViolation, SubprocessError};
use crate::measurement::{to_json, Collector};
use crate::process::CommandSpec;
use crate::sync::lock;
use crate::types::CollectorName;

/// Time a collector gets to exit after SIGTERM before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Default bound on the wait for the first complete update.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Default)]
struct JoinState {
    /// Expected key set; learned from the first complete frame if not given.
    schema: Option<BTreeSet<String>>,
    last_update: Option<Update>,
    accepted: u64,
    start: Option<Update>,
    end: Option<Update>,
    result: Option<Update>,
    /// The event stream reached EOF.
    closed: bool,
    /// `end()` was called; further output is discarded.
    draining: bool,
}

struct Shared {
    name: CollectorName,
    state: Mutex<JoinState>,
    changed: Condvar,
}

impl Shared {
    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, JoinState>,
        timeout: Duration,
    ) -> MutexGuard<'a, JoinState> {
        self.changed
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .0
    }

    fn is_draining(&self) -> bool {
        lock(&self.state).draining
    }

    fn accept(&self, update: Update) {
        let mut state = lock(&self.state);
        if state.draining {
            return;
        }

        let schema = state.schema.get_or_insert_with(|| update.key_set());
        if let Err(drift) = check_key_set(schema.iter(), update.as_map().keys()) {
            tracing::warn!(
                collector = %self.name,
                missing = ?drift.missing,
                unexpected = ?drift.unexpected,
                "Discarding incomplete telemetry update"
            );
            return;
        }

        state.last_update = Some(update);
        state.accepted += 1;
        self.changed.notify_all();
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        self.changed.notify_all();
    }
}

/// Collector fed by a stream of telemetry frames.
pub struct StreamingTelemetryJoin {
    shared: Arc<Shared>,
    start_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
}

impl StreamingTelemetryJoin {
    /// Join events read from `source`.
    ///
    /// With `schema == None` the key set of the first complete frame becomes
    /// the schema.
    pub fn from_reader<R: Read + Send + 'static>(
        name: CollectorName,
        source: R,
        schema: Option<BTreeSet<String>>,
        start_timeout: Duration,
    ) -> BenchResult<Self> {
        Self::with_source(name, source, schema, start_timeout)
    }

    /// Run `command` and join the events it prints on stdout.
    pub fn spawn(
        name: CollectorName,
        command: &CommandSpec,
        schema: Option<BTreeSet<String>>,
        start_timeout: Duration,
    ) -> BenchResult<Self> {
        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
            program: command.program.display().to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(collector = %name, pid = child.id(), command = %command, "Spawned telemetry collector");

        let Some(stdout) = child.stdout.take() else {
            terminate(&name, &mut child);
            return Err(SubprocessError::SpawnFailed {
                program: command.program.display().to_string(),
                reason: "stdout not captured".to_string(),
            }
            .into());
        };

        match Self::with_source(name.clone(), stdout, schema, start_timeout) {
            Ok(join) => {
                *lock(&join.child) = Some(child);
                Ok(join)
            }
            Err(e) => {
                terminate(&name, &mut child);
                Err(e)
            }
        }
    }

    fn with_source<R: Read + Send + 'static>(
        name: CollectorName,
        source: R,
        schema: Option<BTreeSet<String>>,
        start_timeout: Duration,
    ) -> BenchResult<Self> {
        let shared = Arc::new(Shared {
            name,
            state: Mutex::new(JoinState {
                schema,
                ..JoinState::default()
            }),
            changed: Condvar::new(),
        });

        let reader = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("telemetry-{}", shared.name))
                .spawn(move || read_events(BufReader::new(source), &shared))
                .map_err(BenchError::io("spawning telemetry reader thread"))?
        };

        Ok(Self {
            shared,
            start_timeout,
            reader: Mutex::new(Some(reader)),
            child: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &CollectorName {
        &self.shared.name
    }

    /// Number of complete updates accepted so far.
    pub fn updates_accepted(&self) -> u64 {
        lock(&self.shared.state).accepted
    }

    pub fn last_update(&self) -> Option<Update> {
        lock(&self.shared.state).last_update.clone()
    }

    /// Block until at least `n` complete updates have been accepted.
    pub fn wait_for_updates(&self, n: u64, timeout: Duration) -> BenchResult<u64> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        while state.accepted < n {
            if state.closed {
                return Err(self.exited_error());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BenchError::Timeout {
                    operation: format!("{} telemetry updates from {}", n, self.shared.name),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            state = self.shared.wait(state, remaining);
        }
        Ok(state.accepted)
    }

    /// Snapshot the most recent complete update, waiting for the first one
    /// if none has arrived yet.
    pub fn start(&self) -> BenchResult<()> {
        let deadline = Instant::now() + self.start_timeout;
        let mut state = lock(&self.shared.state);
        if state.start.is_some() {
            return Err(ProtocolViolation::AlreadyStarted {
                subject: self.shared.name.to_string(),
            }
            .into());
        }

        loop {
            if let Some(update) = &state.last_update {
                tracing::debug!(collector = %self.shared.name, "Telemetry measurement started");
                state.start = Some(update.clone());
                return Ok(());
            }
            if state.closed {
                return Err(self.exited_error());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BenchError::Timeout {
                    operation: format!("first telemetry update from {}", self.shared.name),
                    waited_ms: self.start_timeout.as_millis() as u64,
                });
            }
            state = self.shared.wait(state, remaining);
        }
    }

    /// Snapshot the most recent update and return `end - start`. All output
    /// after this point is discarded.
    pub fn end(&self) -> BenchResult<Update> {
        let mut state = lock(&self.shared.state);
        let Some(start) = state.start.clone() else {
            return Err(ProtocolViolation::NotStarted {
                subject: self.shared.name.to_string(),
                operation: "end",
            }
            .into());
        };
        if state.end.is_some() {
            return Err(ProtocolViolation::AlreadyEnded {
                subject: self.shared.name.to_string(),
            }
            .into());
        }

        let end = state.last_update.clone().unwrap_or_else(|| start.clone());
        state.draining = true;
        state.end = Some(end.clone());
        let result = end.diff(&start)?;
        state.result = Some(result.clone());
        tracing::debug!(collector = %self.shared.name, "Telemetry measurement ended");
        Ok(result)
    }

    /// The difference computed by [`end`](Self::end), every time.
    pub fn result(&self) -> BenchResult<Update> {
        let state = lock(&self.shared.state);
        if let Some(result) = &state.result {
            return Ok(result.clone());
        }
        let violation = if state.start.is_none() {
            ProtocolViolation::NotStarted {
                subject: self.shared.name.to_string(),
                operation: "result",
            }
        } else {
            ProtocolViolation::NotEnded {
                subject: self.shared.name.to_string(),
            }
        };
        Err(violation.into())
    }

    /// Stop the collector process: SIGTERM, then SIGKILL after
    /// [`STOP_GRACE`]. Joins the reader once the stream is closed.
    pub fn stop(&self) {
        lock(&self.shared.state).draining = true;

        let child = lock(&self.child).take();
        if let Some(mut child) = child {
            let pid = Pid::from_raw(child.id() as i32);
            tracing::info!(collector = %self.shared.name, pid = child.id(), "Stopping telemetry collector");
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                tracing::debug!(collector = %self.shared.name, error = %e, "SIGTERM failed");
            }
            if !self.wait_closed(STOP_GRACE) {
                tracing::warn!(
                    collector = %self.shared.name,
                    "Collector did not exit after SIGTERM, killing it"
                );
                if let Err(e) = child.kill() {
                    tracing::debug!(collector = %self.shared.name, error = %e, "SIGKILL failed");
                }
            }
            if let Err(e) = child.wait() {
                tracing::warn!(collector = %self.shared.name, error = %e, "Waiting for collector failed");
            }
        }

        if !self.wait_closed(STOP_GRACE) {
            tracing::warn!(collector = %self.shared.name, "Telemetry stream still open, detaching reader");
            return;
        }
        if let Some(handle) = lock(&self.reader).take() {
            if handle.join().is_err() {
                tracing::error!(collector = %self.shared.name, "Telemetry reader thread panicked");
            }
        }
    }

    fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        while !state.closed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = self.shared.wait(state, remaining);
        }
        true
    }

    fn exited_error(&self) -> BenchError {
        SubprocessError::CollectorExited {
            collector: self.shared.name.to_string(),
        }
        .into()
    }
}

impl fmt::Debug for StreamingTelemetryJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("StreamingTelemetryJoin")
            .field("name", &self.shared.name)
            .field("accepted", &state.accepted)
            .field("started", &state.start.is_some())
            .field("ended", &state.end.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Drop for StreamingTelemetryJoin {
    fn drop(&mut self) {
        if lock(&self.child).is_some() {
            self.stop();
        }
    }
}

impl Collector for StreamingTelemetryJoin {
    fn name(&self) -> &str {
        self.shared.name.as_str()
    }

    fn start(&self) -> BenchResult<()> {
        StreamingTelemetryJoin::start(self)
    }

    fn end(&self) -> BenchResult<()> {
        StreamingTelemetryJoin::end(self).map(|_| ())
    }

    fn result(&self) -> BenchResult<serde_json::Value> {
        let update = StreamingTelemetryJoin::result(self)?;
        to_json(self.shared.name.as_str(), &update)
    }
}

/// Reap a collector whose join could not be set up.
fn terminate(name: &CollectorName, child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!(collector = %name, error = %e, "SIGKILL failed");
    }
    match child.wait() {
        Ok(status) => tracing::debug!(collector = %name, %status, "Collector reaped"),
        Err(e) => tracing::warn!(collector = %name, error = %e, "Waiting for collector failed"),
    }
}

/// Body of the reader thread.
fn read_events<R: BufRead>(mut reader: R, shared: &Shared) {
    // `None` while no frame is open.
    let mut frame: Option<BTreeMap<String, i64>> = None;
    let mut poisoned = false;
    let mut raw = Vec::new();

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(collector = %shared.name, error = %e, "Reading telemetry stream failed");
                break;
            }
        }
        if shared.is_draining() {
            continue;
        }

        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: RawEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(collector = %shared.name, error = %e, line = %line, "Dropping malformed telemetry line");
                continue;
            }
        };

        match event.kind.as_str() {
            "frame" => match event.data.as_str() {
                Some("begin") => {
                    if frame.is_some() {
                        tracing::warn!(collector = %shared.name, "Frame began before previous one ended, dropping it");
                    }
                    frame = Some(BTreeMap::new());
                    poisoned = false;
                }
                Some("end") => match frame.take() {
                    Some(_) if poisoned => {
                        tracing::warn!(collector = %shared.name, "Dropping frame with duplicate counters");
                    }
                    Some(counters) => shared.accept(Update::new(counters)),
                    None => {
                        tracing::warn!(collector = %shared.name, "Frame end without begin");
                    }
                },
                _ => {
                    tracing::warn!(collector = %shared.name, data = %event.data, "Unknown frame marker");
                }
            },
            "counter-batch" => {
                let Some(counters) = frame.as_mut() else {
                    tracing::warn!(collector = %shared.name, "Counter batch outside of a frame");
                    continue;
                };
                let batch: BTreeMap<String, i64> = match serde_json::from_value(event.data) {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(collector = %shared.name, error = %e, "Malformed counter batch, dropping frame");
                        poisoned = true;
                        continue;
                    }
                };
                for (key, value) in batch {
                    if counters.insert(key.clone(), value).is_some() {
                        let violation = ProtocolViolation::DuplicateCounter { key };
                        tracing::warn!(collector = %shared.name, error = %violation, "Poisoned frame");
                        poisoned = true;
                    }
                }
            }
            other => {
                tracing::trace!(collector = %shared.name, kind = %other, "Ignoring telemetry event");
            }
        }
    }

    tracing::debug!(collector = %shared.name, "Telemetry stream closed");
    shared.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    fn name() -> CollectorName {
        CollectorName::new("latency").unwrap()
    }

    fn frame(out: &mut impl Write, batches: &[&str]) {
        writeln!(out, r#"{{"type": "frame", "data": "begin"}}"#).unwrap();
        for batch in batches {
            writeln!(out, r#"{{"type": "counter-batch", "data": {}}}"#, batch).unwrap();
        }
        writeln!(out, r#"{{"type": "frame", "data": "end"}}"#).unwrap();
        out.flush().unwrap();
    }

    fn schema(keys: &[&str]) -> Option<BTreeSet<String>> {
        Some(keys.iter().map(|k| k.to_string()).collect())
    }

    #[test]
    fn test_window_difference() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let join =
            StreamingTelemetryJoin::from_reader(name(), rx, schema(&["a", "b"]), Duration::from_secs(5))
                .unwrap();

        frame(&mut tx, &[r#"{"a": 1}"#, r#"{"b": 2}"#]);
        join.start().unwrap();

        frame(&mut tx, &[r#"{"a": 5, "b": 9}"#]);
        join.wait_for_updates(2, Duration::from_secs(5)).unwrap();

        let delta = join.end().unwrap();
        assert_eq!(delta, Update::from([("a", 4), ("b", 7)]));
        assert_eq!(join.result().unwrap(), delta);
        assert_eq!(join.result().unwrap(), delta);

        drop(tx);
        join.stop();
    }

    #[test]
    fn test_incomplete_frames_are_dropped() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let join =
            StreamingTelemetryJoin::from_reader(name(), rx, schema(&["a", "b"]), Duration::from_secs(5))
                .unwrap();

        frame(&mut tx, &[r#"{"a": 1}"#]);
        writeln!(tx, "not json").unwrap();
        frame(&mut tx, &[r#"{"a": 1}"#, r#"{"a": 2, "b": 3}"#]);
        frame(&mut tx, &[r#"{"a": 10, "b": 20}"#]);

        assert_eq!(join.wait_for_updates(1, Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(join.last_update(), Some(Update::from([("a", 10), ("b", 20)])));
        drop(tx);
        join.stop();
    }

    #[test]
    fn test_learns_schema_from_first_frame() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let join = StreamingTelemetryJoin::from_reader(name(), rx, None, Duration::from_secs(5)).unwrap();

        frame(&mut tx, &[r#"{"x": 1}"#]);
        frame(&mut tx, &[r#"{"x": 2, "y": 1}"#]);
        frame(&mut tx, &[r#"{"x": 3}"#]);

        join.wait_for_updates(2, Duration::from_secs(5)).unwrap();
        assert_eq!(join.last_update(), Some(Update::from([("x", 3)])));
        drop(tx);
        join.stop();
    }

    #[test]
    fn test_start_times_out_without_update() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        let join = StreamingTelemetryJoin::from_reader(name(), rx, None, Duration::from_millis(50)).unwrap();
        let err = join.start().unwrap_err();
        assert!(err.is_timeout());
        assert!(join.end().unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_start_fails_when_stream_closes() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let join = StreamingTelemetryJoin::from_reader(name(), rx, None, Duration::from_secs(5)).unwrap();
        drop(tx);
        assert!(matches!(
            join.start().unwrap_err(),
            BenchError::Subprocess(SubprocessError::CollectorExited { .. })
        ));
    }

    #[test]
    fn test_protocol_misuse() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let join = StreamingTelemetryJoin::from_reader(name(), rx, None, Duration::from_secs(5)).unwrap();
        assert!(join.result().unwrap_err().is_protocol_violation());

        frame(&mut tx, &[r#"{"n": 1}"#]);
        join.start().unwrap();
        assert!(join.start().unwrap_err().is_protocol_violation());
        assert!(join.result().unwrap_err().is_protocol_violation());
        join.end().unwrap();
        assert!(join.end().unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_duplicate_key_poisons_frame() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let join = StreamingTelemetryJoin::from_reader(name(), rx, None, Duration::from_secs(5)).unwrap();

        frame(&mut tx, &[r#"{"a": 1}"#, r#"{"a": 2}"#]);
        frame(&mut tx, &[r#"{"a": 3}"#]);
        join.wait_for_updates(1, Duration::from_secs(5)).unwrap();
        assert_eq!(join.last_update(), Some(Update::from([("a", 3)])));
        drop(tx);
        join.stop();
    }

    #[test]
    fn test_spawned_collector_is_stopped() {
        let script = r#"
echo '{"type": "frame", "data": "begin"}'
echo '{"type": "counter-batch", "data": {"ticks": 1}}'
echo '{"type": "frame", "data": "end"}'
exec sleep 30
"#;
        let cmd = CommandSpec::new("/bin/sh").arg("-c").arg(script);
        let join = StreamingTelemetryJoin::spawn(name(), &cmd, None, Duration::from_secs(5)).unwrap();
        join.start().unwrap();
        assert_eq!(join.end().unwrap(), Update::from([("ticks", 0)]));

        let begin = Instant::now();
        join.stop();
        assert!(begin.elapsed() < STOP_GRACE * 2);
    }

    #[test]
    fn test_terminate_reaps_collector() {
        let mut child = CommandSpec::new("/bin/sh")
            .arg("-c")
            .arg("exec sleep 30")
            .to_command()
            .spawn()
            .unwrap();

        let begin = Instant::now();
        terminate(&name(), &mut child);
        assert!(begin.elapsed() < Duration::from_secs(5));
        // Already reaped: the exit status stays cached on the handle.
        assert!(child.try_wait().unwrap().is_some());
    }
}
