//! Hierarchical correlation scopes and the per-call `Context` value.
//!
//! Every external request establishes a root scope (`R<id>`). Dispatching a
//! processing task pushes `::process`; nested operations push further
//! `::<label>` segments. The scope is carried as an explicit value threaded
//! through every call rather than task-local state, so concurrent
//! sub-operations each hold the scope they were created under.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A correlation scope value such as `R4f21a0::process::tool-caller`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationScope(String);

impl CorrelationScope {
    /// New root scope for an external request.
    pub fn root() -> Self {
        let id = Uuid::now_v7().simple().to_string();
        Self(format!("R{}", &id[..10]))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Child scope with `::label` appended.
    pub fn push(&self, label: &str) -> Self {
        Self(format!("{}::{}", self.0, label))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` descends from (or equals) `ancestor`.
    pub fn descends_from(&self, ancestor: &CorrelationScope) -> bool {
        self.0 == ancestor.0 || self.0.starts_with(&format!("{}::", ancestor.0))
    }
}

impl fmt::Display for CorrelationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The context value threaded through every engine call: the active
/// correlation scope plus the cooperative cancellation token.
#[derive(Clone, Debug)]
pub struct Context {
    scope: CorrelationScope,
    cancel: CancellationToken,
}

impl Context {
    pub fn new(scope: CorrelationScope, cancel: CancellationToken) -> Self {
        Self { scope, cancel }
    }

    /// Fresh root context with its own cancellation token.
    pub fn root() -> Self {
        Self::new(CorrelationScope::root(), CancellationToken::new())
    }

    pub fn scope(&self) -> &CorrelationScope {
        &self.scope
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Child context with a pushed scope label, sharing the parent's token.
    pub fn scoped(&self, label: &str) -> Self {
        Self {
            scope: self.scope.push(label),
            cancel: self.cancel.clone(),
        }
    }

    /// Child context that does not observe the parent's cancellation.
    /// Used by the cancellation-suppression latch around message generation.
    pub fn detached(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            cancel: CancellationToken::new(),
        }
    }
}
