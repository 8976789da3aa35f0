//! Shared broker state: the link registry and per-link subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{RwLock, mpsc};
use tracelink_schema::{Event, PatternSet, ServerFrame, SubscriptionFilters};
use tracing::debug;

use crate::config::{BrokerConfig, FilterRule};
use crate::routes::RouteTable;
use crate::stats::Stats;

/// A link's declared interest in one route.
struct Subscription {
    filters: SubscriptionFilters,
    include: PatternSet,
    exclude: PatternSet,
}

impl Subscription {
    fn new(filters: SubscriptionFilters) -> Self {
        let include = PatternSet::compile(&filters.include_patterns);
        let exclude = PatternSet::compile(&filters.exclude_patterns);
        Self {
            filters,
            include,
            exclude,
        }
    }

    /// Evaluate the filter predicates in order: levels, sources, then the
    /// pattern rule configured for this broker.
    fn accepts(&self, event: &Event, rule: FilterRule) -> bool {
        if !self.filters.levels.is_empty() && !self.filters.levels.contains(&event.level()) {
            return false;
        }
        if !self.filters.sources.is_empty()
            && !self.filters.sources.iter().any(|s| s == event.source())
        {
            return false;
        }
        match rule {
            FilterRule::IncludeWins => {
                if !self.include.is_empty() {
                    return self.include.matches(event.message());
                }
                !self.exclude.matches(event.message())
            }
            FilterRule::Conjunctive => {
                if !self.include.is_empty() && !self.include.matches(event.message()) {
                    return false;
                }
                !self.exclude.matches(event.message())
            }
        }
    }
}

struct SessionState {
    subscriptions: HashMap<String, Subscription>,
    /// The route of the most recent subscribe; events without an explicit
    /// route fall back to it.
    current_route: Option<String>,
    last_activity: Instant,
}

/// One accepted link: the writer-channel handle plus subscription state.
pub struct LinkHandle {
    pub id: u64,
    pub connected_at: Instant,
    sender: mpsc::UnboundedSender<ServerFrame>,
    state: Mutex<SessionState>,
}

impl LinkHandle {
    fn new(id: u64, sender: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            id,
            connected_at: Instant::now(),
            sender,
            state: Mutex::new(SessionState {
                subscriptions: HashMap::new(),
                current_route: None,
                last_activity: Instant::now(),
            }),
        }
    }

    /// Queue a frame for the writer task. Returns false if the writer is
    /// gone, which marks the link for removal.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.sender.send(frame).is_ok()
    }

    pub fn subscribe(&self, route: String, filters: SubscriptionFilters) {
        let mut state = self.lock_state();
        state
            .subscriptions
            .insert(route.clone(), Subscription::new(filters));
        state.current_route = Some(route);
    }

    pub fn unsubscribe(&self, route: &str) {
        let mut state = self.lock_state();
        state.subscriptions.remove(route);
        if state.current_route.as_deref() == Some(route) {
            state.current_route = None;
        }
    }

    pub fn current_route(&self) -> Option<String> {
        self.lock_state().current_route.clone()
    }

    /// Record activity, from any inbound frame or a probe response.
    pub fn touch(&self) {
        self.lock_state().last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.lock_state().last_activity
    }

    /// Whether any of this link's subscriptions accepts `event` routed to
    /// `route`. Subscription routes match by prefix.
    fn wants(&self, route: &str, event: &Event, rule: FilterRule) -> bool {
        let state = self.lock_state();
        state
            .subscriptions
            .iter()
            .any(|(sub_route, sub)| route.starts_with(sub_route.as_str()) && sub.accepts(event, rule))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared state for the broker server, wrapped in `Arc` and handed to
/// every request handler and link task.
pub struct BrokerContext {
    pub config: BrokerConfig,
    pub routes: RouteTable,
    pub stats: Stats,
    links: RwLock<HashMap<u64, Arc<LinkHandle>>>,
    next_link_id: AtomicU64,
}

pub type SharedContext = Arc<BrokerContext>;

impl BrokerContext {
    pub fn new(config: BrokerConfig) -> Self {
        let routes = RouteTable::new(config.routes.clone());
        Self {
            config,
            routes,
            stats: Stats::new(),
            links: RwLock::new(HashMap::new()),
            next_link_id: AtomicU64::new(1),
        }
    }

    pub async fn register_link(&self, sender: mpsc::UnboundedSender<ServerFrame>) -> Arc<LinkHandle> {
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let link = Arc::new(LinkHandle::new(id, sender));
        self.links.write().await.insert(id, link.clone());
        link
    }

    pub async fn remove_link(&self, id: u64) {
        self.links.write().await.remove(&id);
    }

    pub async fn link_count(&self) -> usize {
        self.links.read().await.len()
    }

    /// Fan an event out to every subscribed link whose predicates pass.
    /// Links whose writer is gone are dropped from the registry without
    /// aborting the broadcast.
    pub async fn broadcast(&self, route: &str, event: &Event) {
        let rule = self.config.filter_rule;
        let mut dead = Vec::new();
        {
            let links = self.links.read().await;
            for (id, link) in links.iter() {
                if link.wants(route, event, rule)
                    && !link.send(ServerFrame::from_event(event.clone()))
                {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut links = self.links.write().await;
            for id in dead {
                links.remove(&id);
                debug!(link_id = id, "Removed unreachable link");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracelink_schema::{Level, LogEvent};

    fn event(level: Level, message: &str, source: &str) -> Event {
        Event::Log(LogEvent {
            id: "e".to_string(),
            timestamp: "2026-08-01T10:00:00.000Z".to_string(),
            level,
            message: message.to_string(),
            source: source.to_string(),
            thread_id: 1,
            nesting_level: 0,
            data: None,
            stack: None,
        })
    }

    fn subscription(filters: SubscriptionFilters) -> Subscription {
        Subscription::new(filters)
    }

    #[test]
    fn test_empty_filters_accept_everything() {
        let sub = subscription(SubscriptionFilters::default());
        assert!(sub.accepts(&event(Level::Debug, "x", "a"), FilterRule::Conjunctive));
    }

    #[test]
    fn test_level_filter() {
        let sub = subscription(SubscriptionFilters {
            levels: vec![Level::Error, Level::Warn],
            ..SubscriptionFilters::default()
        });
        assert!(sub.accepts(&event(Level::Error, "x", "a"), FilterRule::Conjunctive));
        assert!(!sub.accepts(&event(Level::Info, "x", "a"), FilterRule::Conjunctive));
    }

    #[test]
    fn test_source_filter() {
        let sub = subscription(SubscriptionFilters {
            sources: vec!["host-a".to_string()],
            ..SubscriptionFilters::default()
        });
        assert!(sub.accepts(&event(Level::Info, "x", "host-a"), FilterRule::Conjunctive));
        assert!(!sub.accepts(&event(Level::Info, "x", "host-b"), FilterRule::Conjunctive));
    }

    #[test]
    fn test_conjunctive_rule_applies_both_pattern_sets() {
        let sub = subscription(SubscriptionFilters {
            include_patterns: vec![".*important.*".to_string()],
            exclude_patterns: vec![".*message.*".to_string()],
            ..SubscriptionFilters::default()
        });
        // Matches the include but also the exclude: conjunctive drops it.
        assert!(!sub.accepts(
            &event(Level::Info, "an important message", "a"),
            FilterRule::Conjunctive
        ));
        assert!(sub.accepts(
            &event(Level::Info, "an important note", "a"),
            FilterRule::Conjunctive
        ));
    }

    #[test]
    fn test_include_wins_rule_skips_excludes() {
        let sub = subscription(SubscriptionFilters {
            include_patterns: vec![".*important.*".to_string()],
            exclude_patterns: vec![".*message.*".to_string()],
            ..SubscriptionFilters::default()
        });
        assert!(sub.accepts(
            &event(Level::Info, "an important message", "a"),
            FilterRule::IncludeWins
        ));
        assert!(!sub.accepts(
            &event(Level::Info, "a plain message", "a"),
            FilterRule::IncludeWins
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_matching_subscribers_only() {
        let ctx = BrokerContext::new(BrokerConfig::default());

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let link_a = ctx.register_link(tx_a).await;
        let link_b = ctx.register_link(tx_b).await;

        link_a.subscribe("/trace".to_string(), SubscriptionFilters::default());
        link_b.subscribe(
            "/trace".to_string(),
            SubscriptionFilters {
                levels: vec![Level::Error],
                ..SubscriptionFilters::default()
            },
        );

        ctx.broadcast("/trace/deep", &event(Level::Info, "fan out", "a"))
            .await;

        assert!(rx_a.try_recv().is_ok(), "unfiltered subscriber receives");
        assert!(rx_b.try_recv().is_err(), "level-filtered subscriber does not");
    }

    #[tokio::test]
    async fn test_broadcast_ignores_unrelated_routes() {
        let ctx = BrokerContext::new(BrokerConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = ctx.register_link(tx).await;
        link.subscribe("/app".to_string(), SubscriptionFilters::default());

        ctx.broadcast("/other", &event(Level::Info, "elsewhere", "a"))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_drops_dead_links() {
        let ctx = BrokerContext::new(BrokerConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let link = ctx.register_link(tx).await;
        link.subscribe("/".to_string(), SubscriptionFilters::default());
        drop(rx); // writer gone

        assert_eq!(ctx.link_count().await, 1);
        ctx.broadcast("/", &event(Level::Info, "x", "a")).await;
        assert_eq!(ctx.link_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_clears_current_route() {
        let ctx = BrokerContext::new(BrokerConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = ctx.register_link(tx).await;

        link.subscribe("/app".to_string(), SubscriptionFilters::default());
        assert_eq!(link.current_route().as_deref(), Some("/app"));

        link.unsubscribe("/app");
        assert_eq!(link.current_route(), None);
    }
}
