//! Rate limiting types.

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request is within quota.
    Allowed {
        /// Maximum requests allowed in the window (0 when the check was bypassed).
        limit: u32,
        /// Requests left in the current window.
        remaining: u32,
    },
    /// The source exhausted its quota for the current window.
    Throttled {
        /// Maximum requests allowed in the window.
        limit: u32,
        /// Seconds until the window rolls over.
        retry_after: u64,
    },
}

impl Admission {
    /// Admission granted without consulting the store.
    pub const fn bypassed() -> Self {
        Self::Allowed {
            limit: 0,
            remaining: 0,
        }
    }

    /// Whether the request may proceed.
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}
