//! The producer tracing engine.
//!
//! A [`Tracer`] maintains hierarchical call-stack context across
//! synchronous and asynchronous code, evaluates filters, renders to local
//! sinks, and offers frames to the broker link.

use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracelink_schema::{
    ClientFrame, Event, Level, LogEvent, PatternSet, ServerFrame, SubscriptionFilters, TraceEvent,
    TraceKind, sanitize_payload,
};
use tracing::warn;

use crate::context::{FrameRecord, SCOPE, ScopeOptions, TraceContext, in_scope, scope_snapshot};
use crate::error::Result;
use crate::link::{Link, LinkConfig, LinkState};
use crate::sink::{ConsoleSink, EventSink, FileSink, FileSinkConfig};

/// Configuration for a [`Tracer`].
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Producer identity stamped on every event. Defaults to the hostname.
    pub source: Option<String>,

    /// Master switch for trace events. Plain logs are always emitted.
    pub tracing_enabled: bool,

    /// Drop events nested deeper than this. `None` means unlimited.
    pub max_trace_level: Option<u32>,

    /// If any include pattern matches a message, the event is delivered
    /// and exclude patterns are not consulted.
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,

    /// Call-site frames captured for error events; 0 disables capture.
    pub stack_depth: usize,

    /// Append rendered lines to this file.
    pub file: Option<FileSinkConfig>,

    /// Mirror rendered lines to stderr with a `[TRACE]` tag.
    pub console: bool,

    /// Broker URL. `None` runs serverless: frames are dropped after the
    /// local sinks have seen them.
    pub url: Option<String>,

    /// Route stamped on outbound event frames.
    pub route: Option<String>,

    /// Consecutive failed reconnects before the link gives up.
    pub max_retries: u32,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            source: None,
            tracing_enabled: true,
            max_trace_level: None,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            stack_depth: 0,
            file: None,
            console: false,
            url: None,
            route: None,
            max_retries: 10,
        }
    }
}

/// Snapshot of the resolved context, for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceInfo {
    pub thread_id: u64,
    pub nesting_level: u32,
    pub function_stack: Vec<String>,
    pub interactive: bool,
}

struct TracerInner {
    config: TracerConfig,
    source: String,
    include: PatternSet,
    exclude: PatternSet,
    interactive: AtomicBool,
    interactive_ctx: Mutex<Option<TraceContext>>,
    fallback_ctx: Mutex<Option<TraceContext>>,
    next_thread_id: AtomicU64,
    sinks: Mutex<Vec<Arc<dyn EventSink>>>,
    link: Option<Link>,
    broadcasts: Mutex<Option<mpsc::UnboundedReceiver<ServerFrame>>>,
}

/// The producer tracing engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    /// Build a tracer. Must be called from within a tokio runtime when a
    /// broker URL is configured, since the link driver is spawned here.
    pub fn new(config: TracerConfig) -> Result<Self> {
        let include = PatternSet::compile(&config.include_patterns);
        let exclude = PatternSet::compile(&config.exclude_patterns);
        let source = config.source.clone().unwrap_or_else(default_source);

        let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
        if let Some(file) = &config.file {
            sinks.push(Arc::new(FileSink::new(file)?));
        }
        if config.console {
            sinks.push(Arc::new(ConsoleSink));
        }

        let (link, broadcasts) = match &config.url {
            Some(url) => {
                let mut link_config = LinkConfig::new(url.clone());
                link_config.max_retries = config.max_retries;
                let (link, inbound) = Link::open(link_config);
                (Some(link), Some(inbound))
            }
            None => (None, None),
        };

        Ok(Self {
            inner: Arc::new(TracerInner {
                config,
                source,
                include,
                exclude,
                interactive: AtomicBool::new(false),
                interactive_ctx: Mutex::new(None),
                fallback_ctx: Mutex::new(None),
                next_thread_id: AtomicU64::new(1),
                sinks: Mutex::new(sinks),
                link,
                broadcasts: Mutex::new(broadcasts),
            }),
        })
    }

    /// Register an additional sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        lock(&self.inner.sinks).push(sink);
    }

    /// Run `fut` inside a fresh (or, when nested, inherited) scope
    /// context. Concurrent scopes observe independent contexts; the
    /// context follows the future across suspension and is dropped on
    /// every exit path.
    pub async fn in_scope<F>(&self, options: ScopeOptions, fut: F) -> F::Output
    where
        F: Future,
    {
        let mut ctx = match scope_snapshot() {
            // A nested scope starts from a snapshot of its parent.
            Some(parent) => parent,
            // A top-level scope gets a fresh context id.
            None => self.fresh_context(),
        };
        if let Some(source) = options.source {
            ctx.source = Some(source);
        }
        if let Some(patterns) = options.include_patterns {
            ctx.include = Some(PatternSet::compile(&patterns));
        }
        if let Some(patterns) = options.exclude_patterns {
            ctx.exclude = Some(PatternSet::compile(&patterns));
        }
        SCOPE.scope(RefCell::new(ctx), fut).await
    }

    /// Record entry into `name` and deepen the context by one level.
    pub fn trace_entry(&self, name: &str, args: Option<Vec<Value>>) {
        if !self.inner.config.tracing_enabled {
            return;
        }
        let events = self.with_context(|ctx| {
            ctx.nesting_level += 1;
            ctx.stack.push(FrameRecord {
                name: name.to_string(),
                started: Instant::now(),
                level: ctx.nesting_level,
            });
            let message = match &args {
                Some(list) if !list.is_empty() => {
                    format!(">>> Call {name} {}", Value::Array(list.clone()))
                }
                _ => format!(">>> Call {name}"),
            };
            let event = Event::Trace(TraceEvent {
                base: self.header(ctx, Level::Debug, message, ctx.nesting_level, None, None),
                kind: TraceKind::Entry,
                function_name: name.to_string(),
                args: args
                    .as_ref()
                    .map(|list| list.iter().map(sanitize_payload).collect()),
                return_value: None,
                execution_time_ms: None,
            });
            self.filtered(ctx, event).into_iter().collect()
        });
        self.dispatch(events);
    }

    /// Record exit from `name`. The exit event is emitted before the
    /// nesting level is decremented so entry and exit render at the same
    /// depth; the decrement saturates at zero.
    pub fn trace_exit(&self, name: &str, return_value: Option<Value>, error: Option<&str>) {
        if !self.inner.config.tracing_enabled {
            return;
        }
        let events = self.with_context(|ctx| {
            let mut out = Vec::new();

            let frame = ctx.stack.pop();
            if let Some(frame) = &frame {
                if frame.name != name {
                    let message = format!("Mismatched exit: expected {}, got {name}", frame.name);
                    let diagnostic =
                        Event::Log(self.header(ctx, Level::Warn, message, ctx.nesting_level, None, None));
                    out.extend(self.filtered(ctx, diagnostic));
                }
            }

            let execution_time_ms = frame.as_ref().map(|f| f.started.elapsed().as_millis() as u64);
            let message = if error.is_some() {
                format!("<<< Exit {name} ERROR")
            } else if let Some(value) = &return_value {
                format!("<<< Exit {name} {value}")
            } else {
                format!("<<< Exit {name}")
            };
            let level = if error.is_some() {
                Level::Error
            } else {
                Level::Debug
            };
            let (message, stack) = self.enrich(level, message);
            let event = Event::Trace(TraceEvent {
                base: self.header(ctx, level, message, ctx.nesting_level, None, stack),
                kind: TraceKind::Exit,
                function_name: name.to_string(),
                args: None,
                return_value: return_value.as_ref().map(sanitize_payload),
                execution_time_ms,
            });
            out.extend(self.filtered(ctx, event));

            ctx.nesting_level = ctx.nesting_level.saturating_sub(1);
            out
        });
        self.dispatch(events);
    }

    /// Emit a plain log event. Inside a traced frame the event is a child
    /// of that frame: it carries the frame's depth plus one and travels as
    /// a trace record.
    pub fn log(&self, level: Level, message: &str, data: Option<Value>) {
        let events = self.with_context(|ctx| {
            let depth = if ctx.stack.is_empty() {
                ctx.nesting_level
            } else {
                ctx.nesting_level + 1
            };
            let (message, stack) = self.enrich(level, message.to_string());
            let data = data.as_ref().map(sanitize_payload);
            let event = match ctx.stack.last() {
                Some(frame) => Event::Trace(TraceEvent {
                    base: self.header(ctx, level, message, depth, data, stack),
                    kind: if level == Level::Error {
                        TraceKind::Error
                    } else {
                        TraceKind::Log
                    },
                    function_name: frame.name.clone(),
                    args: None,
                    return_value: None,
                    execution_time_ms: None,
                }),
                None => Event::Log(self.header(ctx, level, message, depth, data, stack)),
            };
            self.filtered(ctx, event).into_iter().collect()
        });
        self.dispatch(events);
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::Debug, message, None);
    }

    pub fn info(&self, message: &str) {
        self.log(Level::Info, message, None);
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::Warn, message, None);
    }

    pub fn error(&self, message: &str) {
        self.log(Level::Error, message, None);
    }

    /// Run a closure between an entry/exit pair, recording its outcome.
    /// The return value is preserved either way.
    pub fn exec<T, E, F>(&self, name: &str, args: Vec<Value>, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        T: Serialize,
        E: std::fmt::Display,
    {
        self.trace_entry(name, Some(args));
        match f() {
            Ok(value) => {
                self.trace_exit(name, serde_json::to_value(&value).ok(), None);
                Ok(value)
            }
            Err(error) => {
                self.trace_exit(name, None, Some(&error.to_string()));
                Err(error)
            }
        }
    }

    /// Async form of [`exec`](Self::exec). If the future is cancelled
    /// before settling, the exit event is still emitted before the
    /// context unwinds.
    pub async fn exec_async<T, E, Fut>(
        &self,
        name: &str,
        args: Vec<Value>,
        fut: Fut,
    ) -> std::result::Result<T, E>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        T: Serialize,
        E: std::fmt::Display,
    {
        self.trace_entry(name, Some(args));
        let mut guard = ExitGuard {
            tracer: self,
            name,
            armed: true,
        };
        let out = fut.await;
        guard.armed = false;
        match &out {
            Ok(value) => self.trace_exit(name, serde_json::to_value(value).ok(), None),
            Err(error) => self.trace_exit(name, None, Some(&error.to_string())),
        }
        out
    }

    /// Wrap a closure so every invocation runs under [`exec`](Self::exec)
    /// with the given name.
    pub fn wrap<T, E, F>(
        &self,
        name: impl Into<String>,
        mut f: F,
    ) -> impl FnMut() -> std::result::Result<T, E>
    where
        F: FnMut() -> std::result::Result<T, E>,
        T: Serialize,
        E: std::fmt::Display,
    {
        let tracer = self.clone();
        let name = name.into();
        move || tracer.exec(&name, Vec::new(), &mut f)
    }

    /// Switch to the single persistent context. Not safe under
    /// overlapping tasks; intended for discrete-command callers.
    pub fn enable_interactive(&self) {
        self.inner.interactive.store(true, Ordering::Relaxed);
    }

    /// Return to scoped context resolution. The interactive context is
    /// retained for a later re-enable.
    pub fn disable_interactive(&self) {
        self.inner.interactive.store(false, Ordering::Relaxed);
    }

    /// Discard whatever context the current resolution order finds.
    pub fn reset_context(&self) {
        if self.inner.interactive.load(Ordering::Relaxed) {
            *lock(&self.inner.interactive_ctx) = Some(self.fresh_context());
            return;
        }
        let replaced = SCOPE
            .try_with(|c| {
                *c.borrow_mut() = self.fresh_context();
            })
            .is_ok();
        if !replaced {
            *lock(&self.inner.fallback_ctx) = None;
        }
    }

    /// Snapshot of the resolved context.
    pub fn trace_info(&self) -> TraceInfo {
        let interactive = self.inner.interactive.load(Ordering::Relaxed);
        self.with_context(|ctx| TraceInfo {
            thread_id: ctx.thread_id,
            nesting_level: ctx.nesting_level,
            function_stack: ctx.stack.iter().map(|f| f.name.clone()).collect(),
            interactive,
        })
    }

    /// Declare interest in broadcasts for `route`.
    pub fn subscribe(&self, route: &str, filters: Option<SubscriptionFilters>) {
        if let Some(link) = &self.inner.link {
            link.offer(ClientFrame::Subscribe {
                route: route.to_string(),
                filters,
            });
        }
    }

    pub fn unsubscribe(&self, route: &str) {
        if let Some(link) = &self.inner.link {
            link.offer(ClientFrame::Unsubscribe {
                route: route.to_string(),
            });
        }
    }

    /// Take the inbound broadcast/ack receiver. Yields `None` if the
    /// tracer is serverless or the receiver was already taken.
    pub fn take_broadcasts(&self) -> Option<mpsc::UnboundedReceiver<ServerFrame>> {
        lock(&self.inner.broadcasts).take()
    }

    pub fn link_state(&self) -> Option<LinkState> {
        self.inner.link.as_ref().map(|l| l.state())
    }

    /// Close the link. Queued frames are lost; local sinks keep working.
    pub fn close(&self) {
        if let Some(link) = &self.inner.link {
            link.close();
        }
    }

    fn fresh_context(&self) -> TraceContext {
        TraceContext::new(self.inner.next_thread_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Resolve the context for this operation: interactive first, then
    /// the scope-attached context, then the lazily-created fallback.
    fn with_context<R>(&self, f: impl FnOnce(&mut TraceContext) -> R) -> R {
        if self.inner.interactive.load(Ordering::Relaxed) {
            let mut guard = lock(&self.inner.interactive_ctx);
            let ctx = guard.get_or_insert_with(|| self.fresh_context());
            return f(ctx);
        }
        if in_scope() {
            return SCOPE.with(|c| f(&mut c.borrow_mut()));
        }
        let mut guard = lock(&self.inner.fallback_ctx);
        let ctx = guard.get_or_insert_with(|| self.fresh_context());
        f(ctx)
    }

    fn header(
        &self,
        ctx: &TraceContext,
        level: Level,
        message: String,
        nesting_level: u32,
        data: Option<Value>,
        stack: Option<String>,
    ) -> LogEvent {
        LogEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level,
            message,
            source: ctx
                .source
                .clone()
                .unwrap_or_else(|| self.inner.source.clone()),
            thread_id: ctx.thread_id,
            nesting_level,
            data,
            stack,
        }
    }

    /// Apply the producer filter chain; include patterns win over exclude.
    fn filtered(&self, ctx: &TraceContext, event: Event) -> Option<Event> {
        if event.is_trace() && !self.inner.config.tracing_enabled {
            return None;
        }
        if let Some(max) = self.inner.config.max_trace_level {
            if ctx.nesting_level > max {
                return None;
            }
        }
        let include = ctx.include.as_ref().unwrap_or(&self.inner.include);
        let exclude = ctx.exclude.as_ref().unwrap_or(&self.inner.exclude);
        if !include.is_empty() {
            if include.matches(event.message()) {
                return Some(event);
            }
            return None;
        }
        if exclude.matches(event.message()) {
            return None;
        }
        Some(event)
    }

    /// For error events, append captured call-site frames to the message.
    fn enrich(&self, level: Level, message: String) -> (String, Option<String>) {
        let depth = self.inner.config.stack_depth;
        if level != Level::Error || depth == 0 {
            return (message, None);
        }
        let frames = capture_frames(depth);
        if frames.is_empty() {
            return (message, None);
        }
        let joined = frames.join("\n");
        (
            format!("{message}\nStack (top {depth}):\n{joined}"),
            Some(joined),
        )
    }

    fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let sinks = lock(&self.inner.sinks).clone();
        for event in events {
            for sink in &sinks {
                sink.accept(&event);
            }
            if let Some(link) = &self.inner.link {
                link.offer(ClientFrame::from_event(
                    event,
                    self.inner.config.route.clone(),
                ));
            }
        }
    }
}

/// Emits an error exit if an `exec_async` future is dropped mid-flight.
struct ExitGuard<'a> {
    tracer: &'a Tracer,
    name: &'a str,
    armed: bool,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracer.trace_exit(self.name, None, Some("cancelled"));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn default_source() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| {
            warn!("Could not determine hostname, using fallback source");
            "unknown".to_string()
        })
}

fn capture_frames(limit: usize) -> Vec<String> {
    let bt = backtrace::Backtrace::new();
    let mut frames = Vec::new();
    for frame in bt.frames() {
        for symbol in frame.symbols() {
            let Some(name) = symbol.name() else { continue };
            let name = name.to_string();
            // Skip the capture machinery and the tracer's own frames.
            if name.contains("backtrace::") || name.contains("tracelink_client::") {
                continue;
            }
            let line = match (symbol.filename(), symbol.lineno()) {
                (Some(file), Some(line)) => format!("  at {name} ({}:{line})", file.display()),
                _ => format!("  at {name}"),
            };
            frames.push(line);
            if frames.len() == limit {
                return frames;
            }
        }
    }
    frames
}
