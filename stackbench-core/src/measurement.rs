// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Pre/post measurement sessions.
//!
//! A [`MeasurementSession`] samples some quantity once at the start of the
//! steady-state window and once at its end, and reports the difference.
//! What is sampled and how two samples are subtracted is supplied by a
//! [`Sampler`]; the session only enforces the single-use protocol:
//!
//! ```text
//! idle --start()--> started --end()--> ended --result()*--> ended
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{BenchError, BenchResult, ConfigValidationError, ProtocolViolation};
use crate::sync::lock;
use crate::types::CollectorName;

/// Capability that produces samples and subtracts them.
pub trait Sampler: Send + Sync {
    type Sample: Send;
    type Output: Serialize + Clone + Send;

    fn sample(&self) -> BenchResult<Self::Sample>;

    fn diff(&self, start: &Self::Sample, end: &Self::Sample) -> BenchResult<Self::Output>;
}

/// Anything the runner can bracket around the steady-state window.
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> BenchResult<()>;

    fn end(&self) -> BenchResult<()>;

    fn result(&self) -> BenchResult<serde_json::Value>;
}

struct SessionState<S: Sampler> {
    start: Option<S::Sample>,
    end: Option<S::Sample>,
    result: Option<S::Output>,
}

/// Single-use start/end/result state machine around a [`Sampler`].
pub struct MeasurementSession<S: Sampler> {
    name: CollectorName,
    sampler: S,
    state: Mutex<SessionState<S>>,
}

impl<S: Sampler> MeasurementSession<S> {
    pub fn new(name: CollectorName, sampler: S) -> Self {
        Self {
            name,
            sampler,
            state: Mutex::new(SessionState {
                start: None,
                end: None,
                result: None,
            }),
        }
    }

    pub fn name(&self) -> &CollectorName {
        &self.name
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    /// Capture the start sample. May be called once.
    pub fn start(&self) -> BenchResult<()> {
        let mut state = lock(&self.state);
        if state.start.is_some() {
            return Err(ProtocolViolation::AlreadyStarted {
                subject: self.name.to_string(),
            }
            .into());
        }

        tracing::debug!(collector = %self.name, "Starting measurement");
        state.start = Some(self.sampler.sample()?);
        Ok(())
    }

    /// Capture the end sample. Requires `start()`, may be called once.
    pub fn end(&self) -> BenchResult<()> {
        let mut state = lock(&self.state);
        if state.start.is_none() {
            return Err(ProtocolViolation::NotStarted {
                subject: self.name.to_string(),
                operation: "end",
            }
            .into());
        }
        if state.end.is_some() {
            return Err(ProtocolViolation::AlreadyEnded {
                subject: self.name.to_string(),
            }
            .into());
        }

        tracing::debug!(collector = %self.name, "Ending measurement");
        state.end = Some(self.sampler.sample()?);
        Ok(())
    }

    /// `end - start`, computed on first call and returned unchanged afterwards.
    pub fn result(&self) -> BenchResult<S::Output> {
        let mut state = lock(&self.state);
        if let Some(result) = &state.result {
            return Ok(result.clone());
        }

        let (Some(start), Some(end)) = (&state.start, &state.end) else {
            let violation = if state.start.is_none() {
                ProtocolViolation::NotStarted {
                    subject: self.name.to_string(),
                    operation: "result",
                }
            } else {
                ProtocolViolation::NotEnded {
                    subject: self.name.to_string(),
                }
            };
            return Err(violation.into());
        };

        let result = self.sampler.diff(start, end)?;
        state.result = Some(result.clone());
        Ok(result)
    }
}

impl<S: Sampler> fmt::Debug for MeasurementSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MeasurementSession")
            .field("name", &self.name)
            .field("started", &state.start.is_some())
            .field("ended", &state.end.is_some())
            .finish()
    }
}

impl<S: Sampler> Collector for MeasurementSession<S> {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    fn start(&self) -> BenchResult<()> {
        MeasurementSession::start(self)
    }

    fn end(&self) -> BenchResult<()> {
        MeasurementSession::end(self)
    }

    fn result(&self) -> BenchResult<serde_json::Value> {
        let output = MeasurementSession::result(self)?;
        to_json(self.name.as_str(), &output)
    }
}

pub(crate) fn to_json<T: Serialize>(collector: &str, value: &T) -> BenchResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| BenchError::Parse {
        context: format!("serializing result of collector {}", collector),
        message: e.to_string(),
    })
}

/// Ordered set of collectors with unique names.
#[derive(Clone, Default)]
pub struct CollectorSet {
    collectors: Vec<Arc<dyn Collector>>,
}

impl CollectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector. Registration order is start order.
    pub fn register(&mut self, collector: Arc<dyn Collector>) -> Result<(), ConfigValidationError> {
        if self.collectors.iter().any(|c| c.name() == collector.name()) {
            return Err(ConfigValidationError::DuplicateCollector {
                name: collector.name().to_string(),
            });
        }
        self.collectors.push(collector);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Collector>> {
        self.collectors.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.collectors.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}

impl fmt::Debug for CollectorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
