//! Shared backoff for a pipeline that the upstream has started blocking.
//!
//! The state is derived from the clock: the controller is cooling down while
//! `now < expires_at`, and clear again as soon as the expiry passes.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info};

/// Cooldown applied for the first, second, third and later consecutive blocks.
pub const COOLDOWN_LADDER: [Duration; 4] = [
    Duration::from_secs(10),
    Duration::from_secs(6 * 60),
    Duration::from_secs(24 * 60),
    Duration::from_secs(48 * 60),
];

#[derive(Debug, Default)]
pub struct ThrottleController {
    cooldown: Duration,
    expires_at: Option<Instant>,
}

impl ThrottleController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cooling_down(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() < at)
    }

    /// Time left in the current cooldown, zero when clear.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(Instant::now()))
    }

    /// Duration of the most recent cooldown; zero after a success.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Escalates to the next rung and starts a cooldown of that length.
    pub fn on_blocked(&mut self) -> Duration {
        let next = COOLDOWN_LADDER
            .iter()
            .copied()
            .find(|rung| *rung > self.cooldown)
            .unwrap_or(COOLDOWN_LADDER[COOLDOWN_LADDER.len() - 1]);
        self.cooldown = next;
        self.expires_at = Some(Instant::now() + next);

        let until = chrono::Duration::from_std(next)
            .map(|d| chrono::Local::now() + d)
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        error!(
            cooldown_ms = u64::try_from(next.as_millis()).unwrap_or(u64::MAX),
            until = %until,
            "throttling detected, pausing scrapers"
        );
        next
    }

    /// Resets the ladder. A cooldown already in progress still runs out.
    pub fn on_success(&mut self) {
        if self.cooldown > Duration::ZERO {
            info!("upstream responding again, resetting throttle ladder");
        }
        self.cooldown = Duration::ZERO;
    }
}
