//! Test status and its allowed transitions

use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution status of a single test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// The test has started and has not reached a terminal status yet
    Loading,
    Succeeded,
    Failed,
    /// Finished with warnings
    Warned,
    /// The server does not support the tested functionality
    NotSupported,
    /// The test has no body
    NotImplemented,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Loading => "loading",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Warned => "warned",
            Status::NotSupported => "not-supported",
            Status::NotImplemented => "not-implemented",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Status::Loading
    }

    /// Severity used by the transition table. A status can only move to a
    /// strictly more severe one.
    fn severity(self) -> u8 {
        match self {
            Status::Loading => 0,
            Status::Succeeded => 1,
            Status::Warned => 2,
            Status::NotSupported | Status::NotImplemented => 3,
            Status::Failed => 4,
        }
    }

    /// Whether a test in this status may move to `next`
    ///
    /// Re-applying the current status is allowed and is a no-op. Nothing
    /// ever returns to `Loading`.
    pub fn can_transition_to(self, next: Status) -> bool {
        if next == Status::Loading {
            return self == Status::Loading;
        }
        self == next || next.severity() > self.severity()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
