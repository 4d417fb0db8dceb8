//! Testing utilities for Tollgate.
//!
//! - [`StubProvider`]: a scriptable [`BillingProvider`](tollgate::BillingProvider)
//!   that also measures how many requests it handles at once
//! - [`Recorder`]: a [`Listener`](tollgate::Listener) that keeps everything it sees
//! - [`ThreadUiHost`]: a real, dedicated UI thread
//! - [`TestSurface`]: a [`UiContext`](tollgate::UiContext) with switches for
//!   liveness and foreground state

mod provider;
mod recorder;
mod ui;

pub use provider::{FlowOutcome, StubProvider};
pub use recorder::{Recorded, Recorder};
pub use ui::{TestSurface, ThreadUiHost, UI_THREAD_NAME};

use std::time::Duration;

/// Polls `condition` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
