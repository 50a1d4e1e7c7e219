use std::time::{Duration, Instant};

/// Furthest offset `GoEpoch::at` resolves to; later timestamps are clamped.
pub const MAX_RELATIVE_OFFSET: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Wall-clock reference of the go command. Relative timestamps across the crate
/// are seconds measured from this instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoEpoch {
    origin: Instant,
}

impl GoEpoch {
    pub fn new(origin: Instant) -> Self {
        Self { origin }
    }

    pub fn now() -> Self {
        Self::new(Instant::now())
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Seconds between the epoch and `instant`; negative before the epoch.
    pub fn relative(&self, instant: Instant) -> f64 {
        if instant >= self.origin {
            instant.duration_since(self.origin).as_secs_f64()
        } else {
            -self.origin.duration_since(instant).as_secs_f64()
        }
    }

    pub fn elapsed(&self) -> f64 {
        self.relative(Instant::now())
    }

    /// Absolute instant of a relative timestamp, saturating at
    /// [`MAX_RELATIVE_OFFSET`] in either direction.
    pub fn at(&self, relative: f64) -> Instant {
        if relative.is_nan() {
            return self.origin;
        }
        let offset = Duration::try_from_secs_f64(relative.abs())
            .unwrap_or(MAX_RELATIVE_OFFSET)
            .min(MAX_RELATIVE_OFFSET);
        if relative >= 0.0 {
            self.origin.checked_add(offset).unwrap_or(self.origin)
        } else {
            self.origin.checked_sub(offset).unwrap_or(self.origin)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_round_trip() {
        let epoch = GoEpoch::new(Instant::now());
        let later = epoch.at(2.5);
        assert!((epoch.relative(later) - 2.5).abs() < 1e-9);
        assert!(epoch.relative(epoch.origin()).abs() < f64::EPSILON);
    }

    #[test]
    fn test_huge_timestamps_saturate() {
        let epoch = GoEpoch::new(Instant::now());
        let far = epoch.at(1e30);
        assert_eq!(far, epoch.at(f64::INFINITY));
        assert!(far > epoch.at(1e6));
        assert!(epoch.at(-1e30) <= epoch.origin());
        assert_eq!(epoch.at(f64::NAN), epoch.origin());
    }
}
