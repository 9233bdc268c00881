use std::time::Duration;

/// The default wait bound applied to each partition of a parallel operation.
pub const DEFAULT_TIMEOUT: Timeout = Timeout::After(Duration::from_secs(30));

/// An upper bound on how long a caller is willing to wait.
///
/// Timeouts are advisory: they bound how long the waiting thread blocks, they never cancel
/// work that is already running.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Timeout {
    /// Wait until the awaited condition occurs, however long that takes.
    Infinite,

    /// Give up once the given duration has elapsed. A zero duration means "do not wait".
    After(Duration),
}

impl Timeout {
    /// Returns the finite bound, or `None` for [`Timeout::Infinite`].
    #[must_use]
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::After(duration) => Some(duration),
        }
    }

    /// Whether this is a finite bound of zero.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self == Self::After(Duration::ZERO)
    }

    /// Whether a wait that has lasted `elapsed` has used up this budget.
    #[must_use]
    pub fn is_exceeded_by(self, elapsed: Duration) -> bool {
        match self {
            Self::Infinite => false,
            Self::After(limit) => elapsed >= limit,
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        DEFAULT_TIMEOUT
    }
}

impl From<Duration> for Timeout {
    fn from(value: Duration) -> Self {
        Self::After(value)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn default_is_thirty_seconds() {
        assert_eq!(
            Timeout::default().as_duration(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn infinite_is_never_exceeded() {
        assert!(!Timeout::Infinite.is_exceeded_by(Duration::MAX));
        assert_eq!(Timeout::Infinite.as_duration(), None);
    }

    #[test]
    fn finite_is_exceeded_at_limit() {
        let timeout = Timeout::from(Duration::from_millis(10));

        assert!(!timeout.is_exceeded_by(Duration::from_millis(9)));
        assert!(timeout.is_exceeded_by(Duration::from_millis(10)));
    }

    #[test]
    fn zero_is_zero() {
        assert!(Timeout::After(Duration::ZERO).is_zero());
        assert!(!Timeout::Infinite.is_zero());
    }
}
