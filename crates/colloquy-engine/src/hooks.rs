//! Engine lifecycle hooks.
//!
//! Each stage boundary runs a chain of hooks. A hook decides whether the
//! chain continues (`CallNext`), short-circuits successfully (`Resolve`), or
//! quietly discards the current execution (`Bail`). For most stages a bail
//! drops the response entirely; during preparation iterations it signals
//! that preparation is complete.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::LoadedContext;
use crate::error::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookVerdict {
    /// Run the next hook in the chain, if any.
    CallNext,
    /// Return without running the remaining hooks.
    Resolve,
    /// Return without running the remaining hooks and discard the current
    /// execution.
    Bail,
}

#[async_trait]
pub trait EngineHook: Send + Sync {
    async fn run(&self, ctx: &mut LoadedContext, error: Option<&EngineError>) -> HookVerdict;
}

/// Hook invoked once per emitted message chunk; a bail drops that chunk but
/// later chunks still run.
#[async_trait]
pub trait MessageChunkHook: Send + Sync {
    async fn run(&self, ctx: &LoadedContext, chunk: &str) -> HookVerdict;
}

type HookChain = Vec<Arc<dyn EngineHook>>;

#[derive(Clone, Default)]
pub struct EngineHooks {
    pub on_error: HookChain,
    pub on_acknowledging: HookChain,
    pub on_acknowledged: HookChain,
    pub on_preparing: HookChain,
    pub on_preparation_iteration_start: HookChain,
    pub on_preparation_iteration_end: HookChain,
    pub on_generating_messages: HookChain,
    pub on_generated_messages: HookChain,
    pub on_message_generated: Vec<Arc<dyn MessageChunkHook>>,
}

impl EngineHooks {
    /// Run a chain; `Ok(true)` means proceed, `Ok(false)` means bail.
    async fn call_chain(
        chain: &HookChain,
        ctx: &mut LoadedContext,
        error: Option<&EngineError>,
    ) -> bool {
        for hook in chain {
            match hook.run(ctx, error).await {
                HookVerdict::CallNext => continue,
                HookVerdict::Resolve => return true,
                HookVerdict::Bail => return false,
            }
        }
        true
    }

    pub async fn call_on_error(&self, ctx: &mut LoadedContext, error: &EngineError) -> bool {
        Self::call_chain(&self.on_error, ctx, Some(error)).await
    }

    pub async fn call_on_acknowledging(&self, ctx: &mut LoadedContext) -> bool {
        Self::call_chain(&self.on_acknowledging, ctx, None).await
    }

    pub async fn call_on_acknowledged(&self, ctx: &mut LoadedContext) -> bool {
        Self::call_chain(&self.on_acknowledged, ctx, None).await
    }

    pub async fn call_on_preparing(&self, ctx: &mut LoadedContext) -> bool {
        Self::call_chain(&self.on_preparing, ctx, None).await
    }

    pub async fn call_on_preparation_iteration_start(&self, ctx: &mut LoadedContext) -> bool {
        Self::call_chain(&self.on_preparation_iteration_start, ctx, None).await
    }

    pub async fn call_on_preparation_iteration_end(&self, ctx: &mut LoadedContext) -> bool {
        Self::call_chain(&self.on_preparation_iteration_end, ctx, None).await
    }

    pub async fn call_on_generating_messages(&self, ctx: &mut LoadedContext) -> bool {
        Self::call_chain(&self.on_generating_messages, ctx, None).await
    }

    pub async fn call_on_generated_messages(&self, ctx: &mut LoadedContext) -> bool {
        Self::call_chain(&self.on_generated_messages, ctx, None).await
    }

    /// Per-chunk hook: `true` means emit the chunk, `false` means drop it.
    pub async fn call_on_message_generated(&self, ctx: &LoadedContext, chunk: &str) -> bool {
        for hook in &self.on_message_generated {
            match hook.run(ctx, chunk).await {
                HookVerdict::CallNext => continue,
                HookVerdict::Resolve => return true,
                HookVerdict::Bail => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::agents::Agent;
    use colloquy_core::customers::Customer;
    use colloquy_core::sessions::Session;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedHook {
        verdict: HookVerdict,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EngineHook for FixedHook {
        async fn run(&self, _ctx: &mut LoadedContext, _error: Option<&EngineError>) -> HookVerdict {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.verdict
        }
    }

    fn loaded() -> LoadedContext {
        let agent = Agent::new("a", "d");
        let customer = Customer::guest();
        let session = Session::new(agent.id.clone(), customer.id.clone());
        LoadedContext::new(session, agent, customer, Vec::new())
    }

    fn hook(verdict: HookVerdict, calls: &Arc<AtomicUsize>) -> Arc<dyn EngineHook> {
        Arc::new(FixedHook {
            verdict,
            calls: calls.clone(),
        })
    }

    #[tokio::test]
    async fn empty_chain_proceeds() {
        let hooks = EngineHooks::default();
        assert!(hooks.call_on_acknowledging(&mut loaded()).await);
    }

    #[tokio::test]
    async fn call_next_runs_whole_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hooks = EngineHooks {
            on_preparing: vec![
                hook(HookVerdict::CallNext, &calls),
                hook(HookVerdict::CallNext, &calls),
            ],
            ..Default::default()
        };
        assert!(hooks.call_on_preparing(&mut loaded()).await);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn resolve_short_circuits_without_bailing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hooks = EngineHooks {
            on_preparing: vec![
                hook(HookVerdict::Resolve, &calls),
                hook(HookVerdict::CallNext, &calls),
            ],
            ..Default::default()
        };
        assert!(hooks.call_on_preparing(&mut loaded()).await);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn bail_stops_chain_and_reports() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hooks = EngineHooks {
            on_generating_messages: vec![
                hook(HookVerdict::Bail, &calls),
                hook(HookVerdict::CallNext, &calls),
            ],
            ..Default::default()
        };
        assert!(!hooks.call_on_generating_messages(&mut loaded()).await);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    struct DropLongChunks;

    #[async_trait]
    impl MessageChunkHook for DropLongChunks {
        async fn run(&self, _ctx: &LoadedContext, chunk: &str) -> HookVerdict {
            if chunk.len() > 10 {
                HookVerdict::Bail
            } else {
                HookVerdict::CallNext
            }
        }
    }

    #[tokio::test]
    async fn message_chunk_hook_can_drop() {
        let hooks = EngineHooks {
            on_message_generated: vec![Arc::new(DropLongChunks)],
            ..Default::default()
        };
        let ctx = loaded();
        assert!(hooks.call_on_message_generated(&ctx, "short").await);
        assert!(
            !hooks
                .call_on_message_generated(&ctx, "much too long a chunk")
                .await
        );
    }
}
