//! Token generations, cooperative yield pacing, and debounce
//!
//! Staleness is decided by comparing monotonically increasing tokens, never
//! by holding locks across suspension points: an asynchronous step captures
//! the token at issue time and compares it against the generation before
//! committing its result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Token captured by an asynchronous step and compared before committing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u64);

/// Monotonic token source; issuing supersedes every earlier token
#[derive(Debug, Default)]
pub struct Generation {
    latest: AtomicU64,
}

impl Generation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next token, making it the only current one
    pub fn issue(&self) -> Token {
        Token(self.latest.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Invalidate every outstanding token without issuing a new one
    pub fn bump(&self) {
        self.latest.fetch_add(1, Ordering::AcqRel);
    }

    /// The token most recently issued (or the initial one)
    #[must_use]
    pub fn current(&self) -> Token {
        Token(self.latest.load(Ordering::Acquire))
    }

    /// Whether `token` is still the newest one
    #[must_use]
    pub fn is_current(&self, token: Token) -> bool {
        self.current() == token
    }
}

/// Paces a long loop: after every `stride` items, yields to the scheduler,
/// but only once at least `min_elapsed` passed since the previous yield.
/// A zero `min_elapsed` makes the stride unconditional.
#[derive(Debug)]
pub struct YieldBudget {
    stride: usize,
    min_elapsed: Duration,
    seen: usize,
    last_yield: Instant,
}

impl YieldBudget {
    #[must_use]
    pub fn new(stride: usize, min_elapsed: Duration) -> Self {
        Self {
            stride: stride.max(1),
            min_elapsed,
            seen: 0,
            last_yield: Instant::now(),
        }
    }

    /// Account one item; returns whether a yield happened
    pub async fn tick(&mut self) -> bool {
        self.seen += 1;
        if self.seen % self.stride != 0 {
            return false;
        }
        if self.min_elapsed > Duration::ZERO && self.last_yield.elapsed() < self.min_elapsed {
            return false;
        }
        tokio::task::yield_now().await;
        self.last_yield = Instant::now();
        true
    }
}

/// Trailing-edge debounce: every trigger restarts the window and only the
/// newest trigger survives it
#[derive(Debug)]
pub struct Debounce {
    delay: Duration,
    epoch: Generation,
}

impl Debounce {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            epoch: Generation::new(),
        }
    }

    /// Wait out the window; true when this trigger is still the newest one
    pub async fn settle(&self) -> bool {
        let token = self.epoch.issue();
        tokio::time::sleep(self.delay).await;
        self.epoch.is_current(token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn issuing_supersedes_earlier_tokens() {
        let generation = Generation::new();
        let first = generation.issue();
        assert!(generation.is_current(first));

        let second = generation.issue();
        assert!(!generation.is_current(first));
        assert!(generation.is_current(second));
        assert!(first < second);
    }

    #[test]
    fn bump_invalidates_without_issuing() {
        let generation = Generation::new();
        let token = generation.issue();
        generation.bump();
        assert!(!generation.is_current(token));
    }

    #[tokio::test]
    async fn budget_skips_yield_between_strides() {
        let mut budget = YieldBudget::new(3, Duration::ZERO);
        assert!(!budget.tick().await);
        assert!(!budget.tick().await);
        assert!(budget.tick().await);
        assert!(!budget.tick().await);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_respects_min_elapsed() {
        let mut budget = YieldBudget::new(1, Duration::from_millis(12));
        // Stride is met but no time has passed since construction.
        assert!(!budget.tick().await);

        tokio::time::advance(Duration::from_millis(13)).await;
        assert!(budget.tick().await);

        // The clock was just reset by the yield.
        assert!(!budget.tick().await);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_keeps_only_the_newest_trigger() {
        let debounce = Arc::new(Debounce::new(Duration::from_millis(80)));

        let early = tokio::spawn({
            let debounce = Arc::clone(&debounce);
            async move { debounce.settle().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let late = tokio::spawn({
            let debounce = Arc::clone(&debounce);
            async move { debounce.settle().await }
        });

        assert!(!early.await.unwrap());
        assert!(late.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_lets_a_lone_trigger_through() {
        let debounce = Debounce::new(Duration::from_millis(80));
        assert!(debounce.settle().await);
    }
}
