use std::time::Duration;

use gch_time::Time;
use gch_types::TimeFrame;

/// Which TTL regime a request window falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// The long-lived regime for wide or historical windows.
    Default,
    /// The short regime for small windows ending near "now": flapping
    /// dashboard traffic becomes cheap hits without serving stale data
    /// for long.
    Short,
}

impl TtlClass {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Short => "short",
        }
    }
}

/// The TTL chosen for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlSelection {
    /// TTL in seconds; `0` disables caching for this target.
    pub seconds: u32,
    /// Decimal rendering of `seconds`, part of the cache key and of the
    /// `X-Cached-Find` response header.
    pub label: String,
    pub class: TtlClass,
}

impl TtlSelection {
    pub fn enabled(&self) -> bool {
        self.seconds > 0
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.seconds))
    }
}

/// Chooses between the short and default TTL regimes.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    default_sec: u32,
    default_label: String,
    short_sec: u32,
    short_label: String,
    short_duration: Duration,
    short_until_offset: i64,
}

impl TtlPolicy {
    /// Build a policy, normalizing the configured values.
    ///
    /// A default TTL below the short TTL is raised to it, and a short TTL
    /// that is unset or equal to the default collapses the short class
    /// entirely.
    pub fn new(
        default_sec: u32,
        short_sec: u32,
        short_duration: Duration,
        short_until_offset: Duration,
    ) -> Self {
        let mut default_sec = default_sec;
        let mut short_sec = short_sec;
        let mut short_duration = short_duration;

        if default_sec < short_sec {
            default_sec = short_sec;
        }
        if short_sec == 0 || short_sec == default_sec {
            short_sec = 0;
            short_duration = Duration::ZERO;
        }
        if default_sec < short_sec {
            default_sec = short_sec;
        }

        Self {
            default_sec,
            default_label: default_sec.to_string(),
            short_sec,
            short_label: short_sec.to_string(),
            short_duration,
            short_until_offset: short_until_offset.as_secs() as i64,
        }
    }

    /// True when at least one regime caches at all.
    pub fn enabled(&self) -> bool {
        self.default_sec > 0 || self.short_sec > 0
    }

    /// Pick the TTL for a request window.
    ///
    /// The short regime applies iff the window is at most
    /// `short_duration` wide and ends within `short_until_offset` of now.
    pub fn select(&self, now: Time, frame: &TimeFrame) -> TtlSelection {
        if self.short_sec == 0 || self.short_duration.is_zero() {
            return self.default_selection();
        }
        if frame.width() > self.short_duration
            || now.timestamp() - frame.until() > self.short_until_offset
        {
            return self.default_selection();
        }
        TtlSelection {
            seconds: self.short_sec,
            label: self.short_label.clone(),
            class: TtlClass::Short,
        }
    }

    fn default_selection(&self) -> TtlSelection {
        TtlSelection {
            seconds: self.default_sec,
            label: self.default_label.clone(),
            class: TtlClass::Default,
        }
    }
}
