//! Capabilities a host application implements so the engine can reason about
//! its UI without owning any of it.
//!
//! The engine only ever holds a [`Weak`](std::sync::Weak) to a [`UiContext`];
//! liveness is asked, never assumed.

use std::sync::Arc;

use crate::activity::ActivityMonitor;
use crate::error::LaunchError;

/// A UI surface (screen, window, activity) that may originate requests.
pub trait UiContext: Send + Sync + 'static {
    /// False once the surface has been destroyed.
    fn is_alive(&self) -> bool;

    /// False while the surface is in the background.
    fn is_foreground(&self) -> bool {
        self.is_alive()
    }

    /// Closes the surface. Only called on surfaces the engine started itself.
    fn finish(&self) {}
}

/// Starts a foreground flow on a UI surface with the given request code.
///
/// Runs on the UI thread. An `Err` means the flow never started.
pub type LaunchFn = Arc<dyn Fn(&dyn UiContext, i32) -> Result<(), LaunchError> + Send + Sync>;

/// Wraps a closure as a [`LaunchFn`].
pub fn launcher<F>(f: F) -> LaunchFn
where
    F: Fn(&dyn UiContext, i32) -> Result<(), LaunchError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The host's UI thread.
pub trait UiHost: Send + Sync + 'static {
    /// Runs `job` on the UI thread.
    fn run_on_ui(&self, job: Box<dyn FnOnce() + Send>);

    /// Starts a transient surface for a flow that has no caller-supplied one.
    ///
    /// The host reports the surface through
    /// [`ActivityMonitor::surface_ready`] once it can launch flows, and through
    /// [`ActivityMonitor::surface_resumed`] whenever it comes back to the
    /// foreground.
    fn start_transient_surface(&self, monitor: ActivityMonitor);
}

/// True when `context` points at a surface that is alive and in front.
pub(crate) fn is_live(context: &Option<std::sync::Weak<dyn UiContext>>) -> bool {
    match context {
        None => true,
        Some(weak) => weak
            .upgrade()
            .is_some_and(|ctx| ctx.is_alive() && ctx.is_foreground()),
    }
}
