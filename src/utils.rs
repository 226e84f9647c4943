use std::time::{Duration, Instant};

/// Error type for polling operations
#[derive(Debug)]
pub enum PollError<E> {
    /// Deadline elapsed before the operation produced a value
    Timeout,
    /// The polled operation itself failed
    ConditionError(E),
}

impl<E> std::fmt::Display for PollError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Timeout => write!(f, "Operation timed out"),
            PollError::ConditionError(e) => write!(f, "Condition error: {}", e),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Timeout => None,
            PollError::ConditionError(e) => Some(e),
        }
    }
}

/// Poll `operation` until it yields `Some`, sleeping `idle` between empty polls.
///
/// Returns `Ok(None)` once `timeout` has elapsed. The operation is always
/// attempted at least once, so a zero timeout still drains anything pending.
pub fn poll_with_timeout<F, T, E>(
    mut operation: F,
    timeout: Duration,
    idle: Duration,
) -> Result<Option<T>, PollError<E>>
where
    F: FnMut() -> Result<Option<T>, E>,
{
    let deadline = Instant::now() + timeout;

    loop {
        match operation() {
            Ok(Some(result)) => return Ok(Some(result)),
            Ok(None) => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(idle);
            }
            Err(e) => return Err(PollError::ConditionError(e)),
        }
    }
}

/// Block for a dwell period. Zero dwell returns immediately.
pub fn dwell(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}

/// Human readable count rate, e.g. `"512 Cps"`, `"12.3 KCps"`, `"1.5 MCps"`
pub fn format_count_rate(count: u32) -> String {
    if count >= 1_000_000 {
        format!("{:.1} MCps", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1} KCps", count as f64 / 1_000.0)
    } else {
        format!("{} Cps", count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_with_timeout_success() {
        let mut attempts = 0;
        let result = poll_with_timeout(
            || {
                attempts += 1;
                if attempts >= 3 {
                    Ok::<Option<i32>, &str>(Some(attempts))
                } else {
                    Ok(None)
                }
            },
            Duration::from_millis(500),
            Duration::from_millis(1),
        );

        assert_eq!(result.unwrap(), Some(3));
    }

    #[test]
    fn test_poll_with_timeout_timeout() {
        let start = Instant::now();
        let result = poll_with_timeout(
            || Ok::<Option<()>, &str>(None),
            Duration::from_millis(30),
            Duration::from_millis(5),
        );

        assert_eq!(result.unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_poll_with_timeout_error() {
        let result = poll_with_timeout(
            || Err::<Option<()>, &str>("link closed"),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );

        assert!(matches!(result, Err(PollError::ConditionError("link closed"))));
    }

    #[test]
    fn test_format_count_rate() {
        assert_eq!(format_count_rate(999), "999 Cps");
        assert_eq!(format_count_rate(12_345), "12.3 KCps");
        assert_eq!(format_count_rate(1_500_000), "1.5 MCps");
    }
}
