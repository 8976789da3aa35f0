//! Trace context state and its scoped storage.
//!
//! A context records the nesting depth and function stack of one logical
//! task. In scoped mode the context lives in tokio task-local storage, so
//! it follows continuations across `.await` and two concurrently running
//! scopes never observe each other's state. Interactive mode (a single
//! persistent context) and the lazily-created fallback context are owned
//! by the [`Tracer`](crate::Tracer) itself.

use std::cell::RefCell;
use std::time::Instant;

use tracelink_schema::PatternSet;

/// One entry in a context's function stack.
#[derive(Debug, Clone)]
pub(crate) struct FrameRecord {
    pub name: String,
    pub started: Instant,
    /// Nesting level this frame was entered at.
    #[allow(dead_code)]
    pub level: u32,
}

/// Producer-private state for one logical task. Never serialized.
#[derive(Debug, Clone)]
pub(crate) struct TraceContext {
    pub thread_id: u64,
    pub nesting_level: u32,
    pub stack: Vec<FrameRecord>,
    /// Per-scope override of the producer identity.
    pub source: Option<String>,
    /// Per-scope override of the include patterns.
    pub include: Option<PatternSet>,
    /// Per-scope override of the exclude patterns.
    pub exclude: Option<PatternSet>,
}

impl TraceContext {
    pub fn new(thread_id: u64) -> Self {
        Self {
            thread_id,
            nesting_level: 0,
            stack: Vec::new(),
            source: None,
            include: None,
            exclude: None,
        }
    }
}

/// Overrides applied to the context entered by
/// [`Tracer::in_scope`](crate::Tracer::in_scope). Unset fields inherit
/// from the enclosing scope or the tracer configuration.
#[derive(Debug, Clone, Default)]
pub struct ScopeOptions {
    pub source: Option<String>,
    pub include_patterns: Option<Vec<String>>,
    pub exclude_patterns: Option<Vec<String>>,
}

tokio::task_local! {
    /// The scoped-mode context. Set only inside `Tracer::in_scope`.
    pub(crate) static SCOPE: RefCell<TraceContext>;
}

/// Clone the innermost scope context, if one is active on this task.
pub(crate) fn scope_snapshot() -> Option<TraceContext> {
    SCOPE.try_with(|c| c.borrow().clone()).ok()
}

/// Whether this task is currently inside a scope.
pub(crate) fn in_scope() -> bool {
    SCOPE.try_with(|_| ()).is_ok()
}
