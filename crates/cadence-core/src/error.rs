//! Error taxonomy for the container runtime.
//!
//! Every fallible runtime operation returns [`CntrError`]. Loops over
//! independent sub-operations (packed parameters, event registrations,
//! subgraph members) collect their outcomes in a [`BatchResult`] instead of
//! aborting on the first failure.

use thiserror::Error;

/// Kind of a runtime failure, without its context message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or undersized payload.
    BadParam,
    /// Peer or resource not yet available. Always retryable.
    NotReady,
    /// Unknown opcode or parameter id.
    Unsupported,
    /// Generic failure.
    Failed,
    /// Internal invariant violated.
    Unexpected,
}

impl ErrorKind {
    const fn bit(self) -> u8 {
        match self {
            Self::BadParam => 1 << 0,
            Self::NotReady => 1 << 1,
            Self::Unsupported => 1 << 2,
            Self::Failed => 1 << 3,
            Self::Unexpected => 1 << 4,
        }
    }

    /// All kinds in a fixed order.
    pub const ALL: [ErrorKind; 5] = [
        Self::BadParam,
        Self::NotReady,
        Self::Unsupported,
        Self::Failed,
        Self::Unexpected,
    ];
}

/// Errors produced by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CntrError {
    /// Malformed or undersized payload.
    #[error("bad parameter: {0}")]
    BadParam(String),

    /// Peer or resource not yet available.
    #[error("not ready: {0}")]
    NotReady(String),

    /// Unknown opcode or parameter id.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Generic failure.
    #[error("failed: {0}")]
    Failed(String),

    /// Internal invariant violated.
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl CntrError {
    /// Creates a [`CntrError::BadParam`].
    pub fn bad_param(msg: impl Into<String>) -> Self {
        Self::BadParam(msg.into())
    }

    /// Creates a [`CntrError::NotReady`].
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Creates a [`CntrError::Unsupported`].
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Creates a [`CntrError::Failed`].
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Creates a [`CntrError::Unexpected`].
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadParam(_) => ErrorKind::BadParam,
            Self::NotReady(_) => ErrorKind::NotReady,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Failed(_) => ErrorKind::Failed,
            Self::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Wire-style status code (0 is success).
    pub fn code(&self) -> u32 {
        match self.kind() {
            ErrorKind::Failed => 1,
            ErrorKind::BadParam => 2,
            ErrorKind::Unsupported => 3,
            ErrorKind::NotReady => 5,
            ErrorKind::Unexpected => 13,
        }
    }

    /// Builds an error of the given kind.
    pub fn from_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match kind {
            ErrorKind::BadParam => Self::BadParam(msg),
            ErrorKind::NotReady => Self::NotReady(msg),
            ErrorKind::Unsupported => Self::Unsupported(msg),
            ErrorKind::Failed => Self::Failed(msg),
            ErrorKind::Unexpected => Self::Unexpected(msg),
        }
    }
}

/// Result alias used throughout the runtime.
pub type CntrResult<T> = Result<T, CntrError>;

/// Best-effort accumulator for a batch of independent sub-operations.
///
/// Records every failing kind (the equivalent of or-ing status codes) and
/// keeps the first error for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    kinds: u8,
    first: Option<CntrError>,
    failures: usize,
}

impl BatchResult {
    /// Creates an empty (successful) batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of one sub-operation.
    pub fn record<T>(&mut self, result: CntrResult<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    /// Records one failure.
    pub fn push(&mut self, err: CntrError) {
        self.kinds |= err.kind().bit();
        self.failures += 1;
        if self.first.is_none() {
            self.first = Some(err);
        }
    }

    /// Merges another batch into this one.
    pub fn merge(&mut self, other: BatchResult) {
        self.kinds |= other.kinds;
        self.failures += other.failures;
        if self.first.is_none() {
            self.first = other.first;
        }
    }

    /// Returns `true` if nothing failed.
    pub fn is_ok(&self) -> bool {
        self.failures == 0
    }

    /// Returns `true` if a failure of `kind` was recorded.
    pub fn contains(&self, kind: ErrorKind) -> bool {
        self.kinds & kind.bit() != 0
    }

    /// Number of recorded failures.
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Converts into a single result, reporting the first error.
    pub fn into_result(self) -> CntrResult<()> {
        match self.first {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl From<CntrResult<()>> for BatchResult {
    fn from(result: CntrResult<()>) -> Self {
        let mut batch = Self::new();
        batch.record(result);
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = CntrError::bad_param("payload 4 bytes, need 8");
        assert_eq!(err.to_string(), "bad parameter: payload 4 bytes, need 8");
        assert_eq!(err.kind(), ErrorKind::BadParam);
    }

    #[test]
    fn from_kind_round_trips_kind() {
        for kind in ErrorKind::ALL {
            assert_eq!(CntrError::from_kind(kind, "x").kind(), kind);
        }
    }

    #[test]
    fn batch_keeps_first_error_and_all_kinds() {
        let mut batch = BatchResult::new();
        batch.record::<()>(Ok(()));
        batch.record::<()>(Err(CntrError::not_ready("peer")));
        batch.record::<()>(Err(CntrError::unsupported("param 7")));

        assert!(!batch.is_ok());
        assert_eq!(batch.failures(), 2);
        assert!(batch.contains(ErrorKind::NotReady));
        assert!(batch.contains(ErrorKind::Unsupported));
        assert!(!batch.contains(ErrorKind::Failed));
        assert_eq!(batch.into_result(), Err(CntrError::not_ready("peer")));
    }

    #[test]
    fn merge_combines_batches() {
        let mut a = BatchResult::new();
        let mut b = BatchResult::new();
        b.push(CntrError::failed("module"));
        a.merge(b);
        assert!(a.contains(ErrorKind::Failed));
        assert_eq!(a.failures(), 1);
    }

    #[test]
    fn empty_batch_is_ok() {
        assert_eq!(BatchResult::new().into_result(), Ok(()));
    }
}
