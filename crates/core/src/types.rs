//! Identifier and configuration types shared across the engine.

use std::fmt;

/// Unique identifier of a ref cell.
///
/// Assigned monotonically at ref creation time and never reused while any
/// handle to the cell is alive. The identifier carries no meaning beyond
/// identity; ordering reflects creation order only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(u64);

impl RefId {
    /// Wrap a raw identifier.
    pub const fn new(raw: u64) -> Self {
        RefId(raw)
    }

    /// The raw identifier.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref-{}", self.0)
    }
}

/// Transaction identifier.
///
/// Monotonically increasing, assigned per attempt. Used for diagnostics and
/// log correlation only; it has no effect on commit ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(u64);

impl TxnId {
    /// Wrap a raw identifier.
    pub const fn new(raw: u64) -> Self {
        TxnId(raw)
    }

    /// The raw identifier.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Committed version of a single ref.
///
/// Incremented exactly once per successful commit that touches the ref,
/// regardless of how many writes or commutes the transaction staged for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(u64);

impl Version {
    /// The version a ref carries before its first committed change.
    pub const ZERO: Version = Version(0);

    /// Wrap a raw version counter.
    pub const fn new(raw: u64) -> Self {
        Version(raw)
    }

    /// The raw counter.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The version after one more commit.
    pub const fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Strength of the consistency check applied to a transaction at commit time.
///
/// Both levels validate writes and re-apply commutes against the live store;
/// they differ only in whether the read set is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Validate writes only. Values that were read but not written may have
    /// changed underneath the transaction without forcing a retry.
    Snapshot,
    /// Additionally require that every ref read during the attempt is still
    /// at the version it had when read.
    Serializable,
}

/// Token returned when registering a change callback on a ref.
///
/// Pass it back to `unwatch` to remove the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(u64);

impl WatchToken {
    /// Wrap a raw token.
    pub const fn new(raw: u64) -> Self {
        WatchToken(raw)
    }

    /// The raw token.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct StmConfig {
    /// Ceiling on conflicted attempts before a transaction gives up with
    /// `RetryLimitExceeded`. `None` retries forever, which is the baseline
    /// behavior; set a limit when starvation matters more than completion.
    pub max_retries: Option<usize>,
}
