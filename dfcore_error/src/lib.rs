//! Shared error kinds for dfcore, per the core's fatal-only error model:
//! stages either complete or the job aborts, there is no retry.

use std::fmt;

/// Opaque identifier echoed into diagnostics. Each subsystem has its own
/// strongly typed id (`NodeId`, `StreamId`, ...); they are converted to
/// this representation only when attached to an error so that
/// `dfcore_error` does not need to depend on any other dfcore crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagId(pub u64);

impl fmt::Display for DiagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The five fatal error kinds the core can report. None are recoverable:
/// the scheduler propagates the first one observed up to the `Action`
/// that triggered execution and the job aborts.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No room even after spilling every eligible block.
    #[error("out of memory (after_spill={after_spill}): {detail}")]
    OutOfMemory {
        /// Whether every eligible block/partition had already been spilled.
        after_spill: bool,
        detail: String,
    },

    /// Failed swap or spill read/write, or any other I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Item typecode disagreement between sender and receiver.
    #[error("serialization mismatch: {0}")]
    SerializationMismatch(String),

    /// Malformed header or an unknown stream id after timeout.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Insert into closed writer, double-close, cyclic DAG, etc.
    #[error("logic error: {0}")]
    Logic(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The error surfaced to the user: a single textual diagnostic plus the
/// identifier of the DOp that first failed, per the core's error design.
#[derive(Debug, thiserror::Error)]
#[error("job aborted: {source} (failing node: {})", failing_node.map(|n| n.to_string()).unwrap_or_else(|| "<none>".to_string()))]
pub struct JobError {
    #[source]
    pub source: Error,
    pub failing_node: Option<DiagId>,
}

impl JobError {
    pub fn new(source: Error, failing_node: Option<DiagId>) -> Self {
        Self {
            source,
            failing_node,
        }
    }
}

impl Error {
    pub fn out_of_memory(after_spill: bool, detail: impl Into<String>) -> Self {
        Error::OutOfMemory {
            after_spill,
            detail: detail.into(),
        }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        Error::Protocol(detail.into())
    }

    pub fn logic(detail: impl Into<String>) -> Self {
        Error::Logic(detail.into())
    }

    pub fn serialization_mismatch(detail: impl Into<String>) -> Self {
        Error::SerializationMismatch(detail.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_displays_failing_node() {
        let err = JobError::new(Error::logic("double close"), Some(DiagId(7)));
        assert!(err.to_string().contains("failing node: 7"));
    }

    #[test]
    fn job_error_displays_without_node() {
        let err = JobError::new(Error::protocol("bad header"), None);
        assert!(err.to_string().contains("<none>"));
    }
}
