//! Common test helpers for peerlink tests
//!
//! This crate provides:
//! - Condition-based waiting (no hardcoded sleeps)
//! - [`MemoryRelay`]: an in-process signaling relay
//! - [`FakeProvider`]: negotiation primitives that pair with each other
//!   in-process and open working data channels

mod primitive;
mod relay;

pub use primitive::{FakeChannel, FakeNetwork, FakePrimitive, FakeProvider};
pub use relay::MemoryRelay;

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Poll a synchronous condition until it holds
pub async fn wait_until<F>(check: F, max_wait: Duration) -> bool
where
    F: Fn() -> bool,
{
    wait_for(|| std::future::ready(check()), DEFAULT_CHECK_INTERVAL, max_wait).await
}

/// Next item from `rx`, or `None` on timeout or a closed channel
pub async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>, max_wait: Duration) -> Option<T> {
    timeout(max_wait, rx.recv()).await.ok().flatten()
}

/// Skip items until one matches `predicate`
pub async fn wait_for_event<T, F>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    mut predicate: F,
    max_wait: Duration,
) -> Option<T>
where
    F: FnMut(&T) -> bool,
{
    let deadline = Instant::now() + max_wait;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        let item = next_event(rx, left).await?;
        if predicate(&item) {
            return Some(item);
        }
    }
}

/// Everything that arrives on `rx` within `window`
pub async fn collect_for<T>(rx: &mut mpsc::UnboundedReceiver<T>, window: Duration) -> Vec<T> {
    let deadline = Instant::now() + window;
    let mut items = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match next_event(rx, left).await {
            Some(item) => items.push(item),
            None => break,
        }
    }
    items
}
