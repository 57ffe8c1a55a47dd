// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Ordered acquisition, reverse-order release.
//!
//! A [`ResourceStack`] owns a list of release actions. Every successful
//! [`ResourceStack::acquire`] appends one; [`ResourceStack::release`] runs
//! them last-in first-out. A setup routine that needs several steps builds a
//! private stack and, only once every step succeeded, hands the whole lot to
//! its caller with [`ResourceStack::detach_all`]. If a step fails, the
//! private stack is dropped and tears down only what that routine created.

use std::fmt;

use crate::error::{BenchError, BenchResult, ProtocolViolation};

/// Something with an enter/exit lifecycle.
pub trait Resource: Send + 'static {
    /// What entering produces (device paths, mount points, ...).
    type Entered;

    /// Human-readable label for logs.
    fn label(&self) -> String;

    fn enter(&mut self) -> BenchResult<Self::Entered>;

    fn exit(&mut self) -> BenchResult<()>;
}

type ReleaseAction = Box<dyn FnOnce() -> BenchResult<()> + Send>;

struct Entry {
    label: String,
    release: ReleaseAction,
}

/// Single-use container of release actions.
#[derive(Default)]
pub struct ResourceStack {
    entries: Vec<Entry>,
    released: bool,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `resource` and take ownership of its exit.
    ///
    /// If entering fails the stack is left untouched and the error is
    /// returned unchanged.
    pub fn acquire<R: Resource>(&mut self, mut resource: R) -> BenchResult<R::Entered> {
        self.ensure_usable()?;

        let label = resource.label();
        tracing::debug!(resource = %label, "Acquiring resource");
        let entered = resource.enter()?;

        self.entries.push(Entry {
            label,
            release: Box::new(move || resource.exit()),
        });
        Ok(entered)
    }

    /// Register a release action for a step that has already been performed.
    pub fn push<F>(&mut self, label: impl Into<String>, release: F) -> BenchResult<()>
    where
        F: FnOnce() -> BenchResult<()> + Send + 'static,
    {
        self.ensure_usable()?;
        self.entries.push(Entry {
            label: label.into(),
            release: Box::new(release),
        });
        Ok(())
    }

    /// Move every entry into a new stack, leaving this one empty.
    pub fn detach_all(&mut self) -> ResourceStack {
        ResourceStack {
            entries: std::mem::take(&mut self.entries),
            released: false,
        }
    }

    /// Run all release actions in reverse acquisition order.
    ///
    /// A failing release does not stop the others. Every failure is logged;
    /// the first one is returned. The stack cannot be used afterwards.
    pub fn release(&mut self) -> BenchResult<()> {
        self.released = true;

        let mut first_error: Option<BenchError> = None;
        while let Some(entry) = self.entries.pop() {
            tracing::debug!(resource = %entry.label, "Releasing resource");
            if let Err(e) = (entry.release)() {
                tracing::error!(resource = %entry.label, error = %e, "Release failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Labels in acquisition order.
    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.label.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_usable(&self) -> BenchResult<()> {
        if self.released {
            return Err(ProtocolViolation::StackReleased.into());
        }
        Ok(())
    }
}

impl fmt::Debug for ResourceStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceStack")
            .field("entries", &self.labels())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        tracing::warn!(
            resources = ?self.labels(),
            "Resource stack dropped without release, releasing now"
        );
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Probe {
        name: &'static str,
        log: Log,
        fail_enter: bool,
        fail_exit: bool,
    }

    impl Probe {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                fail_enter: false,
                fail_exit: false,
            }
        }

        fn failing_enter(mut self) -> Self {
            self.fail_enter = true;
            self
        }

        fn failing_exit(mut self) -> Self {
            self.fail_exit = true;
            self
        }
    }

    impl Resource for Probe {
        type Entered = &'static str;

        fn label(&self) -> String {
            self.name.to_string()
        }

        fn enter(&mut self) -> BenchResult<&'static str> {
            self.log.lock().unwrap().push(format!("enter {}", self.name));
            if self.fail_enter {
                return Err(BenchError::ResourceConflict {
                    resource: self.name.to_string(),
                    diagnostic: "busy".to_string(),
                });
            }
            Ok(self.name)
        }

        fn exit(&mut self) -> BenchResult<()> {
            self.log.lock().unwrap().push(format!("exit {}", self.name));
            if self.fail_exit {
                return Err(BenchError::ResourceConflict {
                    resource: self.name.to_string(),
                    diagnostic: "exit failed".to_string(),
                });
            }
            Ok(())
        }
    }

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_release_is_reverse_order() {
        let log = log();
        let mut stack = ResourceStack::new();
        assert_eq!(stack.acquire(Probe::new("r1", &log)).unwrap(), "r1");
        stack.acquire(Probe::new("r2", &log)).unwrap();
        stack.acquire(Probe::new("r3", &log)).unwrap();
        stack.release().unwrap();

        assert_eq!(
            entries(&log),
            vec!["enter r1", "enter r2", "enter r3", "exit r3", "exit r2", "exit r1"]
        );
    }

    #[test]
    fn test_failed_acquire_unwinds_previous() {
        let log = log();
        let result = (|| -> BenchResult<ResourceStack> {
            let mut stack = ResourceStack::new();
            stack.acquire(Probe::new("r1", &log))?;
            stack.acquire(Probe::new("r2", &log))?;
            stack.acquire(Probe::new("r3", &log).failing_enter())?;
            Ok(stack.detach_all())
        })();

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            BenchError::ResourceConflict { ref resource, .. } if resource == "r3"
        ));
        assert_eq!(
            entries(&log),
            vec!["enter r1", "enter r2", "enter r3", "exit r2", "exit r1"]
        );
    }

    #[test]
    fn test_failed_acquire_leaves_stack_unchanged() {
        let log = log();
        let mut stack = ResourceStack::new();
        stack.acquire(Probe::new("r1", &log)).unwrap();
        assert!(stack.acquire(Probe::new("r2", &log).failing_enter()).is_err());
        assert_eq!(stack.labels(), vec!["r1".to_string()]);
        stack.release().unwrap();
    }

    #[test]
    fn test_release_continues_after_failure() {
        let log = log();
        let mut stack = ResourceStack::new();
        stack.acquire(Probe::new("r1", &log)).unwrap();
        stack.acquire(Probe::new("r2", &log).failing_exit()).unwrap();
        stack.acquire(Probe::new("r3", &log).failing_exit()).unwrap();

        let err = stack.release().unwrap_err();
        // r3 is released first, so its failure is the one reported.
        assert!(matches!(
            err,
            BenchError::ResourceConflict { ref resource, .. } if resource == "r3"
        ));
        assert_eq!(
            entries(&log)[3..],
            ["exit r3", "exit r2", "exit r1"].map(String::from)
        );
    }

    #[test]
    fn test_detach_all_transfers_entries() {
        let log = log();
        let mut stack = ResourceStack::new();
        stack.acquire(Probe::new("r1", &log)).unwrap();
        stack.acquire(Probe::new("r2", &log)).unwrap();

        let mut owner = stack.detach_all();
        assert!(stack.is_empty());
        drop(stack);
        assert_eq!(entries(&log).len(), 2, "dropping the emptied stack releases nothing");

        owner.release().unwrap();
        assert_eq!(entries(&log)[2..], ["exit r2", "exit r1"].map(String::from));
    }

    #[test]
    fn test_push_and_release_callbacks() {
        let log = log();
        let mut stack = ResourceStack::new();
        for name in ["wipefs", "unmount"] {
            let log = Arc::clone(&log);
            stack
                .push(name, move || {
                    log.lock().unwrap().push(name.to_string());
                    Ok(())
                })
                .unwrap();
        }
        stack.release().unwrap();
        assert_eq!(entries(&log), vec!["unmount", "wipefs"]);
    }

    #[test]
    fn test_stack_is_single_use() {
        let log = log();
        let mut stack = ResourceStack::new();
        stack.acquire(Probe::new("r1", &log)).unwrap();
        stack.release().unwrap();

        let err = stack.acquire(Probe::new("r2", &log)).unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(stack.push("late", || Ok(())).unwrap_err().is_protocol_violation());
        assert_eq!(entries(&log), vec!["enter r1", "exit r1"]);
    }

    #[test]
    fn test_drop_releases_remaining() {
        let log = log();
        {
            let mut stack = ResourceStack::new();
            stack.acquire(Probe::new("r1", &log)).unwrap();
            stack.acquire(Probe::new("r2", &log)).unwrap();
        }
        assert_eq!(entries(&log)[2..], ["exit r2", "exit r1"].map(String::from));
    }
}
