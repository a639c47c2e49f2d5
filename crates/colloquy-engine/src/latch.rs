//! Cancellation suppression around message generation.
//!
//! Once the customer has seen a typing indicator, a reply must be emitted or
//! an explicit error surfaced; a follow-up message must not leave the session
//! in a "typing, then silence" state. Inside the latch the work runs under a
//! detached context that does not observe external cancellation; the deferred
//! cancellation is reported when the latch releases.

use std::sync::atomic::{AtomicBool, Ordering};

use colloquy_core::correlation::Context;

#[derive(Default)]
pub struct CancellationSuppressionLatch {
    engaged: AtomicBool,
}

/// Result of running work under the latch.
pub struct Suppressed<T> {
    pub output: T,
    /// External cancellation arrived while the latch was engaged.
    pub cancellation_deferred: bool,
}

impl CancellationSuppressionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    /// Run `work` to completion regardless of `ctx` cancellation. The closure
    /// receives a detached child context; the caller checks
    /// `cancellation_deferred` after release and acts on it then.
    pub async fn run<T, F, Fut>(&self, ctx: &Context, work: F) -> Suppressed<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        self.engaged.store(true, Ordering::Release);
        let output = work(ctx.detached()).await;
        self.engaged.store(false, Ordering::Release);
        Suppressed {
            output,
            cancellation_deferred: ctx.is_cancelled(),
        }
    }
}
