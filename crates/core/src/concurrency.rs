//! Optimistic concurrency primitives.
//!
//! Every persisted row carries a [`VersionToken`] assigned by the store. A write
//! carries the token read at load time; the store compares it with the current
//! token atomically as part of the write and rejects the write on mismatch.
//! Nothing here retries: retry policy belongs to the calling use case.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Opaque, store-assigned row version.
///
/// [`VersionToken::UNSAVED`] marks an entity that has never been written.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(u64);

impl VersionToken {
    pub const UNSAVED: VersionToken = VersionToken(0);

    /// Token of a freshly inserted row.
    pub const INITIAL: VersionToken = VersionToken(1);

    /// Wrap a raw store value. Only stores should mint tokens.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_unsaved(self) -> bool {
        self == Self::UNSAVED
    }

    /// The token a store assigns after a successful write over `self`.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl core::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Optimistic concurrency expectation for a write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The row must not exist yet.
    Absent,
    /// Require the row to be at an exact version.
    Exact(VersionToken),
}

impl ExpectedVersion {
    /// Expectation for writing an entity that carries `token`.
    pub fn for_token(token: VersionToken) -> Self {
        if token.is_unsaved() {
            ExpectedVersion::Absent
        } else {
            ExpectedVersion::Exact(token)
        }
    }

    pub fn matches(self, actual: Option<VersionToken>) -> bool {
        match (self, actual) {
            (ExpectedVersion::Absent, None) => true,
            (ExpectedVersion::Exact(v), Some(actual)) => v == actual,
            _ => false,
        }
    }

    pub fn check(self, actual: Option<VersionToken>) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual:?})"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsaved_token_expects_absent_row() {
        assert_eq!(
            ExpectedVersion::for_token(VersionToken::UNSAVED),
            ExpectedVersion::Absent
        );
        assert!(ExpectedVersion::Absent.matches(None));
        assert!(!ExpectedVersion::Absent.matches(Some(VersionToken::INITIAL)));
    }

    #[test]
    fn stale_token_is_a_conflict() {
        let loaded = VersionToken::INITIAL;
        let current = loaded.next();

        let err = ExpectedVersion::for_token(loaded)
            .check(Some(current))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn exact_token_against_missing_row_does_not_match() {
        assert!(!ExpectedVersion::Exact(VersionToken::INITIAL).matches(None));
    }
}
