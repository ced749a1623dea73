use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct Pending {
    last_change: Instant,
    /// Earliest time of the next readiness check
    not_before: Instant,
    attempts: u32,
}

/// What a settled path should do after its readiness check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

/// Tracks changed files until they stop changing.
///
/// A path is due once `settle` has passed since its last change. A due path
/// that is not readable yet (empty, locked) is retried with exponential
/// backoff starting at `retry_base` and capped at ten seconds.
pub struct SettleTracker {
    pending: HashMap<PathBuf, Pending>,
    settle: Duration,
    retry_base: Duration,
    max_retries: u32,
}

impl SettleTracker {
    pub fn new(settle: Duration, retry_base: Duration, max_retries: u32) -> Self {
        Self {
            pending: HashMap::new(),
            settle,
            retry_base,
            max_retries,
        }
    }

    /// Record a change; any retry state for the path starts over.
    pub fn file_changed(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(
            path,
            Pending {
                last_change: now,
                not_before: now + self.settle,
                attempts: 0,
            },
        );
    }

    pub fn forget(&mut self, path: &Path) -> bool {
        self.pending.remove(path).is_some()
    }

    /// Forget every tracked path under `dir`.
    pub fn forget_under(&mut self, dir: &Path) -> usize {
        let before = self.pending.len();
        self.pending.retain(|path, _| !path.starts_with(dir));
        before - self.pending.len()
    }

    /// Paths ready for a readiness check, oldest change first. They stay
    /// tracked until [`settled`](Self::settled) or [`retry`](Self::retry).
    pub fn due(&self, now: Instant) -> Vec<PathBuf> {
        let mut due: Vec<(&PathBuf, &Pending)> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.not_before && now.duration_since(p.last_change) >= self.settle)
            .collect();
        due.sort_by_key(|(_, p)| p.last_change);
        due.into_iter().map(|(path, _)| path.clone()).collect()
    }

    pub fn settled(&mut self, path: &Path) {
        self.pending.remove(path);
    }

    /// Schedule another check, or drop the path after `max_retries`.
    pub fn retry(&mut self, path: &Path, now: Instant) -> RetryDecision {
        let Some(entry) = self.pending.get_mut(path) else {
            return RetryDecision::GiveUp;
        };
        if entry.attempts >= self.max_retries {
            self.pending.remove(path);
            return RetryDecision::GiveUp;
        }
        let delay = self
            .retry_base
            .saturating_mul(2u32.saturating_pow(entry.attempts))
            .min(MAX_RETRY_DELAY);
        entry.attempts += 1;
        entry.not_before = now + delay;
        RetryDecision::Retry {
            attempt: entry.attempts,
            delay,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> SettleTracker {
        SettleTracker::new(Duration::from_millis(500), Duration::from_millis(200), 3)
    }

    #[test]
    fn test_due_after_quiet_period() {
        let mut t = tracker();
        let start = Instant::now();
        t.file_changed(PathBuf::from("/out/a.png"), start);

        assert!(t.due(start + Duration::from_millis(499)).is_empty());
        assert_eq!(
            t.due(start + Duration::from_millis(500)),
            vec![PathBuf::from("/out/a.png")]
        );
    }

    #[test]
    fn test_new_change_restarts_window() {
        let mut t = tracker();
        let start = Instant::now();
        let path = PathBuf::from("/out/a.png");
        t.file_changed(path.clone(), start);
        t.file_changed(path.clone(), start + Duration::from_millis(400));

        assert!(t.due(start + Duration::from_millis(600)).is_empty());
        assert_eq!(t.due(start + Duration::from_millis(900)), vec![path]);
    }

    #[test]
    fn test_due_in_change_order() {
        let mut t = tracker();
        let start = Instant::now();
        t.file_changed(PathBuf::from("/out/b.png"), start);
        t.file_changed(PathBuf::from("/out/a.png"), start + Duration::from_millis(10));

        let due = t.due(start + Duration::from_secs(1));
        assert_eq!(due, vec![PathBuf::from("/out/b.png"), PathBuf::from("/out/a.png")]);
    }

    #[test]
    fn test_retry_backoff_and_give_up() {
        let mut t = tracker();
        let start = Instant::now();
        let path = PathBuf::from("/out/a.png");
        t.file_changed(path.clone(), start);
        let now = start + Duration::from_millis(500);

        assert_eq!(
            t.retry(&path, now),
            RetryDecision::Retry { attempt: 1, delay: Duration::from_millis(200) }
        );
        assert!(t.due(now + Duration::from_millis(199)).is_empty());
        assert_eq!(t.due(now + Duration::from_millis(200)).len(), 1);

        assert_eq!(
            t.retry(&path, now),
            RetryDecision::Retry { attempt: 2, delay: Duration::from_millis(400) }
        );
        assert_eq!(
            t.retry(&path, now),
            RetryDecision::Retry { attempt: 3, delay: Duration::from_millis(800) }
        );
        assert_eq!(t.retry(&path, now), RetryDecision::GiveUp);
        assert!(t.is_empty());
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let mut t = SettleTracker::new(Duration::ZERO, Duration::from_secs(4), 10);
        let now = Instant::now();
        let path = PathBuf::from("/out/a.png");
        t.file_changed(path.clone(), now);

        t.retry(&path, now);
        t.retry(&path, now);
        assert_eq!(
            t.retry(&path, now),
            RetryDecision::Retry { attempt: 3, delay: MAX_RETRY_DELAY }
        );
    }

    #[test]
    fn test_forget_under_directory() {
        let mut t = tracker();
        let now = Instant::now();
        t.file_changed(PathBuf::from("/out/J1/a.png"), now);
        t.file_changed(PathBuf::from("/out/J1/b.png"), now);
        t.file_changed(PathBuf::from("/out/J10/c.png"), now);

        assert_eq!(t.forget_under(Path::new("/out/J1")), 2);
        assert_eq!(t.len(), 1);
        assert!(t.forget(Path::new("/out/J10/c.png")));
        assert!(!t.forget(Path::new("/out/J10/c.png")));
    }
}
