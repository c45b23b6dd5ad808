use std::time::Duration;

use crate::{GatewayError, Result};

/// A half-open request window `[from, until)` in epoch seconds.
///
/// Construction enforces `from < until`; an inverted or empty window is a
/// client error and fails the whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeFrame {
    from: i64,
    until: i64,
}

impl TimeFrame {
    pub fn new(from: i64, until: i64) -> Result<Self> {
        if from >= until {
            return Err(GatewayError::InvalidTimeRange);
        }
        Ok(Self { from, until })
    }

    pub fn from(&self) -> i64 {
        self.from
    }

    pub fn until(&self) -> i64 {
        self.until
    }

    /// Window width.
    pub fn width(&self) -> Duration {
        Duration::from_secs((self.until - self.from) as u64)
    }
}

impl std::fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.from, self.until)
    }
}
