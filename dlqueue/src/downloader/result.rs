//! Attempt outcome flags and their interpretation.

use serde::{Deserialize, Serialize};

/// Flags reported by a backend for one download attempt.
///
/// Several flags may be set together; [`ResultFlags::outcome`] decides which
/// one wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultFlags {
    #[serde(default)]
    pub unsupported: bool,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default)]
    pub main_category_failed: bool,
    #[serde(default)]
    pub success: bool,
}

/// What the manager does with a finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Cancelled by the user or by shutdown.
    Stopped,
    /// Primary category produced its output.
    Succeeded,
    /// The backend cannot handle this URL; try another.
    Unsupported,
    /// Transient failure, subject to the retry bound.
    Failed,
}

impl ResultFlags {
    pub const SUCCESS: Self = Self {
        unsupported: false,
        stopped: false,
        main_category_failed: false,
        success: true,
    };

    pub const STOPPED: Self = Self {
        unsupported: false,
        stopped: true,
        main_category_failed: false,
        success: false,
    };

    pub const UNSUPPORTED: Self = Self {
        unsupported: true,
        stopped: false,
        main_category_failed: false,
        success: false,
    };

    pub const MAIN_CATEGORY_FAILED: Self = Self {
        unsupported: false,
        stopped: false,
        main_category_failed: true,
        success: false,
    };

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Combine two flag sets.
    pub fn union(self, other: Self) -> Self {
        Self {
            unsupported: self.unsupported || other.unsupported,
            stopped: self.stopped || other.stopped,
            main_category_failed: self.main_category_failed || other.main_category_failed,
            success: self.success || other.success,
        }
    }

    /// Resolve the flags in precedence order: stopped, success, unsupported,
    /// then everything else is a transient failure.
    pub fn outcome(&self) -> AttemptOutcome {
        if self.stopped {
            AttemptOutcome::Stopped
        } else if self.success {
            AttemptOutcome::Succeeded
        } else if self.unsupported {
            AttemptOutcome::Unsupported
        } else {
            AttemptOutcome::Failed
        }
    }
}

/// Result of one backend attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptResult {
    pub flags: ResultFlags,
    /// Last meaningful line the backend printed, if any.
    pub last_output: Option<String>,
}

impl AttemptResult {
    pub fn new(flags: ResultFlags) -> Self {
        Self {
            flags,
            last_output: None,
        }
    }

    pub fn with_output(mut self, line: impl Into<String>) -> Self {
        self.last_output = Some(line.into());
        self
    }

    pub fn success() -> Self {
        Self::new(ResultFlags::SUCCESS)
    }

    pub fn stopped() -> Self {
        Self::new(ResultFlags::STOPPED)
    }

    pub fn unsupported() -> Self {
        Self::new(ResultFlags::UNSUPPORTED)
    }

    pub fn failed() -> Self {
        Self::new(ResultFlags::MAIN_CATEGORY_FAILED)
    }
}
