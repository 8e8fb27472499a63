use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

/// Microseconds since the unix epoch.
///
/// Carried alongside every readiness dispatch so read callbacks learn when
/// the poller actually woke up, not when user code got around to running.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const MICROS_PER_SECOND: i64 = 1_000_000;

    #[inline]
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Timestamp(elapsed.as_micros() as i64),
            Err(_) => Timestamp(0),
        }
    }

    #[inline]
    pub const fn invalid() -> Self {
        Timestamp(0)
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub const fn micros(&self) -> i64 {
        self.0
    }

    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / Self::MICROS_PER_SECOND as f64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp_micros(self.0) {
            Some(utc) => write!(f, "{}", utc.format("%Y-%m-%d %H:%M:%S%.6f")),
            None => write!(f, "{}us", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_valid_and_monotonic_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.is_valid());
        assert!(b >= a);
    }

    #[test]
    fn invalid_is_not_valid() {
        assert!(!Timestamp::invalid().is_valid());
    }

    #[test]
    fn display_formats_as_utc_datetime() {
        let t = Timestamp(1_700_000_000 * Timestamp::MICROS_PER_SECOND);
        let s = t.to_string();
        assert!(s.starts_with("2023-11-14"), "got {s}");
    }
}
