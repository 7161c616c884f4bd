use time::{OffsetDateTime, UtcOffset};

/// Wall clock in the local time zone.
///
/// On unix the local offset can only be read while the process is single-threaded, so it is
/// captured once at startup and reused for every timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    offset: UtcOffset,
}

impl Clock {
    /// Must be called before any thread is spawned; falls back to UTC otherwise.
    pub fn local() -> Self {
        Self {
            offset: UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
        }
    }

    pub fn utc() -> Self {
        Self { offset: UtcOffset::UTC }
    }

    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}
