//! Bounded polling and named settle pauses
//!
//! Every wait in a run is bounded. Element waits poll with exponential
//! backoff (100ms doubling to a 1s cap); settle pauses are `WaitPolicy`
//! values so any one of them can be switched from a fixed sleep to
//! condition polling without touching its call site.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::browser::{PageDriver, Selector};

const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for navigation-class waits (page loads, answer generation)
pub const MAX_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Upper bound for interaction-class waits (clicks, fills, presence checks)
pub const MAX_INTERACTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Poll `check` until it yields `Some`, an error, or `timeout` elapses
///
/// The check always runs at least once, so a zero timeout still performs
/// a single check. Returns `Ok(None)` on timeout.
pub async fn poll_until<T, E, F, Fut>(timeout: Duration, mut check: F) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + timeout;
    let mut interval = INITIAL_POLL_INTERVAL;

    loop {
        if let Some(value) = check().await? {
            return Ok(Some(value));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }

        tokio::time::sleep(interval.min(deadline - now)).await;
        interval = (interval * 2).min(MAX_POLL_INTERVAL);
    }
}

/// A named pause that lets an externally driven UI transition settle
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    pub name: &'static str,
    pub pause: Duration,
    /// Ends the pause early once this selector is present
    pub until: Option<Selector>,
}

impl WaitPolicy {
    pub const fn fixed(name: &'static str, pause: Duration) -> Self {
        Self {
            name,
            pause,
            until: None,
        }
    }

    pub fn until(mut self, selector: Selector) -> Self {
        self.until = Some(selector);
        self
    }

    /// Never fails: an unmet `until` condition just runs out the pause.
    pub async fn settle(&self, page: &dyn PageDriver) {
        match &self.until {
            None => {
                debug!("Settle '{}' for {}ms", self.name, self.pause.as_millis());
                tokio::time::sleep(self.pause).await;
            }
            Some(selector) => {
                debug!(
                    "Settle '{}' up to {}ms or until {}",
                    self.name,
                    self.pause.as_millis(),
                    selector
                );
                if let Err(e) = page.wait_for_selector(selector, self.pause).await
                    && !e.is_timeout()
                {
                    debug!("Settle '{}' condition check failed: {}", self.name, e);
                }
            }
        }
    }
}

/// Reject configured waits above `max`
pub fn validate_timeout(name: &str, value: Duration, max: Duration) -> Result<Duration, String> {
    if value > max {
        return Err(format!(
            "{} cannot exceed {}ms ({:.1} minutes). Received: {}ms",
            name,
            max.as_millis(),
            max.as_secs_f64() / 60.0,
            value.as_millis()
        ));
    }
    Ok(value)
}
