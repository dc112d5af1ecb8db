//! Server node selection and failover.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Consecutive failures after which a node is treated as unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// One candidate server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    url: String,
}

impl Node {
    /// Creates a node, dropping surrounding whitespace and trailing slashes.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            url: url.trim().trim_end_matches('/').to_string(),
        }
    }

    /// Returns the base URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Joins `path` onto the base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Picks the endpoint for each outbound request.
///
/// Implementations must never block and must always return a node.
/// Embedding applications may supply their own strategy.
pub trait NodeChooser: Send + Sync {
    /// Returns the node to use for the next request.
    fn next(&self) -> Node;

    /// Records a failed request against `node`.
    fn report_failure(&self, node: &Node);

    /// Records a successful request against `node`.
    fn report_success(&self, node: &Node);
}

struct NodeHealth {
    node: Node,
    failures: AtomicU32,
    /// Nanoseconds since the chooser's epoch, 0 = never failed.
    last_failure: AtomicU64,
}

/// Round-robin over healthy nodes.
///
/// A node becomes unhealthy after `threshold` consecutive failures and
/// healthy again on its next success. When every node is unhealthy, the one
/// whose last failure is oldest is returned, so callers keep operating in a
/// degraded mode rather than stalling.
pub struct RoundRobinChooser {
    nodes: Vec<NodeHealth>,
    cursor: AtomicUsize,
    threshold: u32,
    recovery_window: Option<Duration>,
    epoch: Instant,
    // Serializes the fallback scan so concurrent callers agree on one node.
    fallback: Mutex<()>,
}

impl RoundRobinChooser {
    /// Creates a chooser over `nodes`.
    ///
    /// [`ConnectionContext::build`](crate::ConnectionContext::build) rejects
    /// empty pools; an empty chooser answers with a node whose URL is empty.
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|node| NodeHealth {
                    node,
                    failures: AtomicU32::new(0),
                    last_failure: AtomicU64::new(0),
                })
                .collect(),
            cursor: AtomicUsize::new(0),
            threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_window: None,
            epoch: Instant::now(),
            fallback: Mutex::new(()),
        }
    }

    /// Sets the failure threshold (minimum 1).
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    /// Lets an unhealthy node be tried again once `window` has passed since
    /// its last failure.
    pub fn with_recovery_window(mut self, window: Duration) -> Self {
        self.recovery_window = Some(window);
        self
    }

    /// Returns the number of nodes in the pool.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the consecutive failure count for `node`.
    pub fn failures(&self, node: &Node) -> u32 {
        self.find(node)
            .map(|h| h.failures.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Returns true if `node` is currently eligible for round-robin.
    pub fn is_healthy(&self, node: &Node) -> bool {
        self.find(node).map(|h| self.healthy(h)).unwrap_or(false)
    }

    fn find(&self, node: &Node) -> Option<&NodeHealth> {
        self.nodes.iter().find(|h| &h.node == node)
    }

    fn now_nanos(&self) -> u64 {
        // +1 keeps 0 reserved for "never failed"
        u64::try_from(self.epoch.elapsed().as_nanos())
            .unwrap_or(u64::MAX)
            .saturating_add(1)
    }

    fn healthy(&self, health: &NodeHealth) -> bool {
        if health.failures.load(Ordering::SeqCst) < self.threshold {
            return true;
        }
        match self.recovery_window {
            Some(window) => {
                let last = health.last_failure.load(Ordering::SeqCst);
                let window = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
                self.now_nanos().saturating_sub(last) >= window
            }
            None => false,
        }
    }
}

impl NodeChooser for RoundRobinChooser {
    fn next(&self) -> Node {
        let len = self.nodes.len();
        if len == 0 {
            return Node::new("");
        }

        let start = self.cursor.fetch_add(1, Ordering::SeqCst);
        for offset in 0..len {
            let health = &self.nodes[(start + offset) % len];
            if self.healthy(health) {
                if offset > 0 {
                    // Skip the unhealthy ones next time too
                    self.cursor.fetch_add(offset, Ordering::SeqCst);
                }
                return health.node.clone();
            }
        }

        let _guard = self.fallback.lock();
        let fallback = self
            .nodes
            .iter()
            .min_by_key(|h| h.last_failure.load(Ordering::SeqCst))
            .unwrap_or(&self.nodes[0]);
        debug!(node = %fallback.node, "all nodes unhealthy, using least recently failed");
        fallback.node.clone()
    }

    fn report_failure(&self, node: &Node) {
        if let Some(health) = self.find(node) {
            let failures = health.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            health.last_failure.store(self.now_nanos(), Ordering::SeqCst);
            if failures == self.threshold {
                debug!(node = %node, failures, "node marked unhealthy");
            }
        }
    }

    fn report_success(&self, node: &Node) {
        if let Some(health) = self.find(node) {
            health.failures.store(0, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for RoundRobinChooser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundRobinChooser")
            .field(
                "nodes",
                &self
                    .nodes
                    .iter()
                    .map(|h| (h.node.url(), h.failures.load(Ordering::SeqCst)))
                    .collect::<Vec<_>>(),
            )
            .field("threshold", &self.threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn pool(urls: &[&str]) -> RoundRobinChooser {
        RoundRobinChooser::new(urls.iter().map(|u| Node::new(*u)))
    }

    #[test]
    fn node_normalizes_url() {
        let node = Node::new("  http://a:8080/ ");
        assert_eq!(node.url(), "http://a:8080");
        assert_eq!(node.endpoint("/config/fetch"), "http://a:8080/config/fetch");
        assert_eq!(node.to_string(), "http://a:8080");
    }

    #[test]
    fn round_robin_over_healthy_nodes() {
        let chooser = pool(&["http://a", "http://b", "http://c"]);
        let picks: Vec<_> = (0..6).map(|_| chooser.next().url().to_string()).collect();
        assert_eq!(
            picks,
            vec!["http://a", "http://b", "http://c", "http://a", "http://b", "http://c"]
        );
    }

    #[test]
    fn failover_after_threshold() {
        let chooser = pool(&["http://a", "http://b"]);
        let a = Node::new("http://a");
        let b = Node::new("http://b");

        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            chooser.report_failure(&a);
        }
        assert!(!chooser.is_healthy(&a));

        for _ in 0..10 {
            assert_eq!(chooser.next(), b);
        }
    }

    #[test]
    fn below_threshold_still_rotates() {
        let chooser = pool(&["http://a", "http://b"]);
        let a = Node::new("http://a");
        chooser.report_failure(&a);
        assert!(chooser.is_healthy(&a));
        let picks: Vec<_> = (0..4).map(|_| chooser.next()).collect();
        assert!(picks.contains(&a));
    }

    #[test]
    fn all_unhealthy_returns_least_recently_failed() {
        let chooser = pool(&["http://a", "http://b"]).with_failure_threshold(1);
        let a = Node::new("http://a");
        let b = Node::new("http://b");

        chooser.report_failure(&a);
        thread::sleep(Duration::from_millis(2));
        chooser.report_failure(&b);

        assert_eq!(chooser.next(), a);
        assert_eq!(chooser.next(), a);
    }

    #[test]
    fn success_restores_node() {
        let chooser = pool(&["http://a", "http://b"]).with_failure_threshold(2);
        let a = Node::new("http://a");
        chooser.report_failure(&a);
        chooser.report_failure(&a);
        assert_eq!(chooser.failures(&a), 2);
        assert!(!chooser.is_healthy(&a));

        chooser.report_success(&a);
        assert_eq!(chooser.failures(&a), 0);
        assert!(chooser.is_healthy(&a));
    }

    #[test]
    fn recovery_window_readmits_node() {
        let chooser = pool(&["http://a", "http://b"])
            .with_failure_threshold(1)
            .with_recovery_window(Duration::from_millis(20));
        let a = Node::new("http://a");
        chooser.report_failure(&a);
        assert!(!chooser.is_healthy(&a));
        thread::sleep(Duration::from_millis(30));
        assert!(chooser.is_healthy(&a));
    }

    #[test]
    fn single_node_pool_always_answers() {
        let chooser = pool(&["http://only"]).with_failure_threshold(1);
        let only = Node::new("http://only");
        chooser.report_failure(&only);
        assert_eq!(chooser.next(), only);
    }

    #[test]
    fn unknown_node_reports_are_ignored() {
        let chooser = pool(&["http://a"]);
        chooser.report_failure(&Node::new("http://elsewhere"));
        assert_eq!(chooser.failures(&Node::new("http://elsewhere")), 0);
        assert!(chooser.is_healthy(&Node::new("http://a")));
    }

    #[test]
    fn concurrent_use_never_panics() {
        let chooser = Arc::new(pool(&["http://a", "http://b", "http://c"]));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let chooser = Arc::clone(&chooser);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let node = chooser.next();
                        if i % 2 == 0 {
                            chooser.report_failure(&node);
                        } else {
                            chooser.report_success(&node);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(chooser.len(), 3);
    }
}
