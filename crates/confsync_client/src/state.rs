//! Sync engine state machine.

use crate::config::{AppMode, Backoff, ConnectionContext};
use crate::dispatch::{CallbackDispatcher, ChangeEvent, ChangeHandler, FailureHandler};
use crate::error::{SyncError, SyncResult};
use crate::node::{Node, NodeChooser, RoundRobinChooser};
use crate::service::{CachedConfigService, RemoteConfigService};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::transport::{accepted_fetch, accepted_long_poll, ConfigTransport};
use confsync_protocol::{FetchRequest, LongPollRequest, LongPollResponse, Revision};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Created, not started.
    Idle,
    /// Running the initial fetch inside `start()`.
    Bootstrapping,
    /// Background loop active.
    Running,
    /// `stop()` in progress.
    Stopping,
    /// Background loop finished.
    Stopped,
    /// Bootstrap failed fatally; the engine never ran.
    Failed,
}

impl SyncState {
    /// Returns true while the background loop may be running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Running | SyncState::Stopping)
    }

    /// Returns true once the engine can no longer be started.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Stopped | SyncState::Failed)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "IDLE",
            SyncState::Bootstrapping => "BOOTSTRAPPING",
            SyncState::Running => "RUNNING",
            SyncState::Stopping => "STOPPING",
            SyncState::Stopped => "STOPPED",
            SyncState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Successful server round trips, bootstrap included.
    pub cycles_completed: u64,
    /// Snapshots published after bootstrap.
    pub updates_applied: u64,
    /// Responses ignored because their revision was not newer.
    pub stale_ignored: u64,
    /// Failed sync attempts.
    pub failures: u64,
    /// Last successful round trip.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// How long `stop()` waits for the worker before detaching it.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// One-shot latch. Used to wake interval and backoff waits on shutdown, and
/// to tell `stop()` that the worker has exited.
#[derive(Debug, Default)]
struct Latch {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn trigger(&self) {
        *self.triggered.lock() = true;
        self.cond.notify_all();
    }

    fn is_triggered(&self) -> bool {
        *self.triggered.lock()
    }

    /// Waits up to `timeout`. Returns true if the latch was triggered.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut triggered = self.triggered.lock();
        while !*triggered {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut triggered, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut triggered),
            }
        }
        *triggered
    }
}

/// Triggers the latch when dropped, including during a panic unwind.
struct TriggerOnDrop<'a>(&'a Latch);

impl Drop for TriggerOnDrop<'_> {
    fn drop(&mut self) {
        self.0.trigger();
    }
}

struct EngineInner<T: ConfigTransport> {
    context: Arc<ConnectionContext>,
    transport: Arc<T>,
    chooser: Arc<dyn NodeChooser>,
    store: Arc<SnapshotStore>,
    dispatcher: Arc<CallbackDispatcher>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    reconcile_interval: Duration,
    shutdown: Latch,
    exited: Latch,
}

/// The sync engine keeps the snapshot store in step with the server.
///
/// [`start`](Self::start) bootstraps synchronously and then hands the work
/// to a dedicated worker thread, which is the only writer of the snapshot
/// store. Dropping the engine stops it.
pub struct SyncEngine<T: ConfigTransport + 'static> {
    inner: Arc<EngineInner<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop_grace: Duration,
}

/// Builder for [`SyncEngine`] with optional shared collaborators.
pub struct SyncEngineBuilder<T: ConfigTransport + 'static> {
    context: ConnectionContext,
    transport: Arc<T>,
    chooser: Option<Arc<dyn NodeChooser>>,
    store: Option<Arc<SnapshotStore>>,
    dispatcher: Option<Arc<CallbackDispatcher>>,
    reconcile_interval: Option<Duration>,
    stop_grace: Duration,
}

impl<T: ConfigTransport + 'static> SyncEngineBuilder<T> {
    /// Uses a custom node chooser instead of round-robin.
    pub fn with_chooser(mut self, chooser: Arc<dyn NodeChooser>) -> Self {
        self.chooser = Some(chooser);
        self
    }

    /// Publishes into an existing snapshot store.
    pub fn with_store(mut self, store: Arc<SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Dispatches through an existing dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: Arc<CallbackDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Sets the period of the full pull run alongside long polling.
    ///
    /// Defaults to the context's pull interval. Zero is ignored.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = Some(interval).filter(|i| !i.is_zero());
        self
    }

    /// Sets how long `stop()` waits for an in-flight request before
    /// detaching the worker.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Builds the engine in [`SyncState::Idle`].
    pub fn build(self) -> SyncEngine<T> {
        let chooser = self.chooser.unwrap_or_else(|| {
            Arc::new(RoundRobinChooser::new(self.context.nodes().iter().cloned()))
        });
        let reconcile_interval = self
            .reconcile_interval
            .unwrap_or_else(|| self.context.pull_interval());
        SyncEngine {
            inner: Arc::new(EngineInner {
                context: Arc::new(self.context),
                transport: self.transport,
                chooser,
                store: self.store.unwrap_or_default(),
                dispatcher: self.dispatcher.unwrap_or_default(),
                state: RwLock::new(SyncState::Idle),
                stats: RwLock::new(SyncStats::default()),
                reconcile_interval,
                shutdown: Latch::default(),
                exited: Latch::default(),
            }),
            worker: Mutex::new(None),
            stop_grace: self.stop_grace,
        }
    }
}

impl<T: ConfigTransport + 'static> SyncEngine<T> {
    /// Creates an engine with a round-robin chooser over the context's nodes.
    pub fn new(context: ConnectionContext, transport: T) -> Self {
        Self::builder(context, transport).build()
    }

    /// Starts building an engine.
    pub fn builder(context: ConnectionContext, transport: T) -> SyncEngineBuilder<T> {
        SyncEngineBuilder {
            context,
            transport: Arc::new(transport),
            chooser: None,
            store: None,
            dispatcher: None,
            reconcile_interval: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.inner.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// Returns the connection context.
    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.inner.context
    }

    /// Returns the snapshot store.
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.inner.store
    }

    /// Returns the callback dispatcher.
    pub fn dispatcher(&self) -> &Arc<CallbackDispatcher> {
        &self.inner.dispatcher
    }

    /// Returns the node chooser.
    pub fn chooser(&self) -> &Arc<dyn NodeChooser> {
        &self.inner.chooser
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    /// Registers a change handler.
    pub fn register(&self, handler: impl ChangeHandler + 'static) {
        self.inner.dispatcher.register(handler);
    }

    /// Sets the failure handler.
    pub fn set_failure_handler(&self, handler: impl FailureHandler + 'static) {
        self.inner.dispatcher.set_failure_handler(handler);
    }

    /// Returns a config service reading the local snapshot.
    pub fn config_service(&self) -> CachedConfigService {
        CachedConfigService::new(Arc::clone(&self.inner.store))
    }

    /// Returns a config service that asks the server on every call.
    ///
    /// It shares this engine's transport, so it stops working once the
    /// engine is stopped.
    pub fn remote_config_service(&self) -> RemoteConfigService<T> {
        RemoteConfigService::new(
            Arc::clone(&self.inner.context),
            Arc::clone(&self.inner.transport),
            Arc::clone(&self.inner.chooser),
        )
    }

    /// Bootstraps the snapshot and launches the background loop.
    ///
    /// Returns the bootstrapped key/value mapping so the caller can seed its
    /// own configuration namespace. Fatal errors leave the engine in
    /// [`SyncState::Failed`] and no thread is started. If `stop()` was called
    /// during bootstrap the engine ends up [`SyncState::Stopped`] instead of
    /// running.
    pub fn start(&self) -> SyncResult<HashMap<String, String>> {
        let mut worker = self.worker.lock();
        self.inner
            .transition(SyncState::Idle, SyncState::Bootstrapping)?;

        let context = &self.inner.context;
        info!(
            app = context.app_code(),
            mode = %context.app_mode(),
            nodes = context.nodes().len(),
            "starting config sync"
        );

        let resolved = match self.inner.bootstrap() {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(error = %e, "config bootstrap failed");
                self.inner.stats.write().last_error = Some(e.to_string());
                self.inner.set_state(SyncState::Failed);
                return Err(e);
            }
        };

        {
            let mut state = self.inner.state.write();
            if self.inner.shutdown.is_triggered() {
                *state = SyncState::Stopped;
                drop(state);
                info!("stop requested during bootstrap, not starting sync worker");
                self.inner.close_transport();
                return Ok(resolved);
            }
            *state = SyncState::Running;
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("confsync-sync".into())
            .spawn(move || {
                let _exit = TriggerOnDrop(&inner.exited);
                inner.run();
            })
            .map_err(|e| {
                self.inner.set_state(SyncState::Failed);
                SyncError::Bootstrap(format!("cannot spawn sync worker: {e}"))
            })?;
        *worker = Some(handle);

        Ok(resolved)
    }

    /// Stops the background loop and waits for it to finish.
    ///
    /// Idempotent, and a no-op before `start()`. Called during bootstrap it
    /// only records the request; `start()` then returns without launching
    /// the worker. The wait is bounded by the stop grace period: a worker
    /// still blocked in a request the transport cannot abort is detached and
    /// exits on its own when that request returns, without applying it. When
    /// called from a change handler (on the worker thread) it does not wait.
    pub fn stop(&self) -> SyncResult<()> {
        {
            let mut state = self.inner.state.write();
            match *state {
                SyncState::Running => *state = SyncState::Stopping,
                SyncState::Bootstrapping => {
                    self.inner.shutdown.trigger();
                    debug!("stop requested during bootstrap");
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
        info!("stopping config sync");

        self.inner.shutdown.trigger();
        self.inner.close_transport();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                if self.inner.exited.wait(self.stop_grace) {
                    if handle.join().is_err() {
                        error!("sync worker panicked");
                    }
                } else {
                    warn!(
                        grace_ms = self.stop_grace.as_millis() as u64,
                        "sync worker still blocked in a request, detaching it"
                    );
                }
            }
        }

        self.inner.set_state(SyncState::Stopped);
        info!("config sync stopped");
        Ok(())
    }
}

impl<T: ConfigTransport + 'static> Drop for SyncEngine<T> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl<T: ConfigTransport + 'static> fmt::Debug for SyncEngine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("app", &self.inner.context.app_code())
            .field("mode", &self.inner.context.app_mode())
            .field("state", &self.state())
            .field("revision", &self.inner.store.current_revision())
            .finish()
    }
}

impl<T: ConfigTransport> EngineInner<T> {
    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn close_transport(&self) {
        if let Err(e) = self.transport.close() {
            warn!(error = %e, "failed to close transport");
        }
    }

    fn transition(&self, from: SyncState, to: SyncState) -> SyncResult<()> {
        let mut state = self.state.write();
        if *state != from {
            return Err(SyncError::InvalidStateTransition {
                from: state.to_string(),
                to: to.to_string(),
            });
        }
        *state = to;
        Ok(())
    }

    /// Fetches the full configuration, trying each node at most once.
    fn bootstrap(&self) -> SyncResult<HashMap<String, String>> {
        let request = FetchRequest::new(self.context.credentials().clone());
        let mut last_error = None;

        for attempt in 1..=self.context.nodes().len().max(1) {
            let node = self.chooser.next();
            match self.transport.fetch(&node, &request).and_then(accepted_fetch) {
                Ok(response) => {
                    self.chooser.report_success(&node);
                    self.check_required_keys(&response.values)?;
                    self.store.replace(response.values.clone(), response.revision);
                    self.record_success();
                    info!(
                        node = %node,
                        revision = %response.revision,
                        keys = response.values.len(),
                        "configuration bootstrapped"
                    );
                    return Ok(response.values);
                }
                Err(e) => {
                    self.chooser.report_failure(&node);
                    warn!(node = %node, attempt, error = %e, "bootstrap fetch failed");
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no node available".into());
        if self.context.check_config_exist() {
            return Err(SyncError::Bootstrap(reason));
        }
        warn!(error = %reason, "no configuration fetched, starting with an empty snapshot");
        Ok(HashMap::new())
    }

    fn check_required_keys(&self, values: &HashMap<String, String>) -> SyncResult<()> {
        let missing: Vec<String> = self
            .context
            .required_keys()
            .iter()
            .filter(|key| !values.contains_key(key.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        if self.context.check_config_exist() {
            return Err(SyncError::MissingKeys(missing));
        }
        warn!(missing = ?missing, "required configuration keys missing on server");
        Ok(())
    }

    fn run(&self) {
        match self.context.app_mode() {
            AppMode::Pulling => self.pull_loop(),
            AppMode::LongPolling => self.long_poll_loop(),
        }
        debug!("sync worker exiting");
    }

    fn pull_loop(&self) {
        while !self.shutdown.wait(self.context.pull_interval()) {
            self.pull_once();
        }
    }

    fn pull_once(&self) {
        let node = self.chooser.next();
        let request = FetchRequest::new(self.context.credentials().clone())
            .with_known_revision(self.store.current_revision());

        let result = self.transport.fetch(&node, &request).and_then(accepted_fetch);
        if self.shutdown.is_triggered() {
            return;
        }
        match result {
            Ok(response) => {
                self.chooser.report_success(&node);
                self.record_success();
                let current = self.store.current_revision();
                if response.revision.is_newer_than(current) {
                    self.apply(Snapshot::new(response.values, response.revision));
                } else if response.revision == current {
                    debug!(node = %node, revision = %current, "configuration unchanged");
                } else {
                    self.ignore_stale(&node, response.revision, current);
                }
            }
            Err(e) => self.record_failure(&node, e),
        }
    }

    fn long_poll_loop(&self) {
        let mut backoff = Backoff::new(self.context.retry().clone());
        // None when the period is too long to represent: never reconcile
        let mut next_reconcile = Instant::now().checked_add(self.reconcile_interval);

        while !self.shutdown.is_triggered() {
            if next_reconcile.is_some_and(|at| Instant::now() >= at) {
                debug!("running reconciliation pull");
                self.pull_once();
                next_reconcile = Instant::now().checked_add(self.reconcile_interval);
            }

            let node = self.chooser.next();
            let request = LongPollRequest::new(
                self.context.credentials().clone(),
                self.store.current_revision(),
                self.context.long_polling_timeout(),
            );

            let result = self
                .transport
                .long_poll(&node, &request)
                .and_then(accepted_long_poll);
            if self.shutdown.is_triggered() {
                break;
            }
            match result {
                Ok(response) => {
                    self.chooser.report_success(&node);
                    self.record_success();
                    backoff.reset();
                    self.apply_long_poll(&node, response);
                }
                Err(e) => {
                    self.record_failure(&node, e);
                    let delay = backoff.next_delay();
                    debug!(delay_ms = delay.as_millis() as u64, "backing off");
                    if self.shutdown.wait(delay) {
                        break;
                    }
                }
            }
        }
    }

    fn apply_long_poll(&self, node: &Node, response: LongPollResponse) {
        let current = self.store.read();
        if !response.changed {
            debug!(node = %node, revision = %current.revision(), "long poll returned unchanged");
            return;
        }
        if !response.revision.is_newer_than(current.revision()) {
            self.ignore_stale(node, response.revision, current.revision());
            return;
        }
        let values = response.merged_onto(current.values());
        self.apply(Snapshot::new(values, response.revision));
    }

    fn apply(&self, snapshot: Snapshot) {
        let current = Arc::new(snapshot);
        let previous = self.store.publish(Arc::clone(&current));
        let event = ChangeEvent::new(current, previous);
        info!(
            from = %event.previous.revision(),
            to = %event.current.revision(),
            changed = event.changes.len(),
            "configuration updated"
        );
        self.stats.write().updates_applied += 1;
        self.dispatcher.dispatch_change(&event);
    }

    fn ignore_stale(&self, node: &Node, received: Revision, current: Revision) {
        debug!(node = %node, received = %received, current = %current, "ignoring stale revision");
        self.stats.write().stale_ignored += 1;
    }

    fn record_success(&self) {
        let mut stats = self.stats.write();
        stats.cycles_completed += 1;
        stats.last_sync_time = Some(Instant::now());
        stats.last_error = None;
    }

    fn record_failure(&self, node: &Node, error: SyncError) {
        if self.shutdown.is_triggered() {
            // Interrupted by stop(), not a server problem
            return;
        }
        self.chooser.report_failure(node);
        warn!(node = %node, error = %error, "config sync failed");
        {
            let mut stats = self.stats.write();
            stats.failures += 1;
            stats.last_error = Some(error.to_string());
        }
        self.dispatcher.dispatch_failure(&error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionOptions, RetryConfig};
    use crate::dispatch::HandlerResult;
    use crate::service::ConfigService;
    use crate::transport::{MockCallKind, MockTransport};
    use confsync_protocol::{FetchResponse, LongPollResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pulling(interval: Duration) -> ConnectionContext {
        ConnectionContext::build(
            ConnectionOptions::new("billing", "s3cret", "http://a,http://b")
                .with_pull_interval(interval),
        )
        .unwrap()
    }

    fn long_polling() -> ConnectionContext {
        ConnectionContext::build(
            ConnectionOptions::new("billing", "s3cret", "http://a,http://b")
                .with_dynamic_push(true)
                .with_retry(
                    RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5))
                        .with_jitter(false),
                ),
        )
        .unwrap()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn counting_handler(engine: &SyncEngine<Arc<MockTransport>>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        engine.register(move |_: &ChangeEvent| -> HandlerResult {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    #[test]
    fn sync_state_checks() {
        assert!(SyncState::Running.is_active());
        assert!(!SyncState::Idle.is_active());
        assert!(SyncState::Failed.is_terminal());
        assert_eq!(SyncState::Bootstrapping.to_string(), "BOOTSTRAPPING");
    }

    #[test]
    fn sync_engine_initial_state() {
        let engine = SyncEngine::new(pulling(Duration::from_secs(300)), MockTransport::new());
        assert_eq!(engine.state(), SyncState::Idle);
        assert_eq!(engine.stats().cycles_completed, 0);
        assert_eq!(engine.store().current_revision(), Revision::ZERO);
    }

    #[test]
    fn bootstrap_populates_snapshot_before_start_returns() {
        let transport = Arc::new(MockTransport::new());
        transport.set_fetch_response(FetchResponse::success(
            Revision::new(3),
            values(&[("foo", "bar")]),
        ));
        let engine = SyncEngine::new(pulling(Duration::from_secs(300)), Arc::clone(&transport));

        let resolved = engine.start().unwrap();
        assert_eq!(resolved, values(&[("foo", "bar")]));
        assert_eq!(engine.state(), SyncState::Running);
        assert_eq!(engine.config_service().get("foo").unwrap(), "bar");
        assert_eq!(engine.stats().cycles_completed, 1);

        engine.stop().unwrap();
        assert_eq!(engine.state(), SyncState::Stopped);
    }

    #[test]
    fn bootstrap_fails_over_to_next_node() {
        let transport = Arc::new(MockTransport::new());
        transport.set_fetch_response(FetchResponse::success(
            Revision::new(1),
            values(&[("foo", "bar")]),
        ));
        transport.fail_node(&Node::new("http://a"));
        let engine = SyncEngine::new(pulling(Duration::from_secs(300)), Arc::clone(&transport));

        engine.start().unwrap();
        assert_eq!(engine.store().get("foo").as_deref(), Some("bar"));
        let nodes: Vec<_> = transport.calls().into_iter().map(|c| c.node).collect();
        assert_eq!(nodes, vec![Node::new("http://a"), Node::new("http://b")]);
    }

    #[test]
    fn bootstrap_failure_is_fatal_when_checking() {
        let context = ConnectionContext::build(
            ConnectionOptions::new("billing", "s3cret", "http://a").with_check_config_exist(true),
        )
        .unwrap();
        let transport = MockTransport::new();
        transport.fail_node(&Node::new("http://a"));
        let engine = SyncEngine::new(context, transport);

        let err = engine.start().unwrap_err();
        assert!(matches!(err, SyncError::Bootstrap(_)));
        assert!(err.is_fatal());
        assert_eq!(engine.state(), SyncState::Failed);
        assert!(engine.worker.lock().is_none());
        engine.stop().unwrap();
        assert_eq!(engine.state(), SyncState::Failed);
    }

    #[test]
    fn bootstrap_failure_is_tolerated_otherwise() {
        let transport = MockTransport::new();
        transport.push_fetch_failure("refused");
        transport.push_fetch_failure("refused");
        let engine = SyncEngine::new(pulling(Duration::from_secs(300)), transport);

        let resolved = engine.start().unwrap();
        assert!(resolved.is_empty());
        assert_eq!(engine.state(), SyncState::Running);
        assert!(engine.store().read().is_empty());
    }

    #[test]
    fn missing_required_keys() {
        let options = ConnectionOptions::new("billing", "s3cret", "http://a")
            .with_required_keys(["db.url", "foo"]);
        let response = FetchResponse::success(Revision::new(1), values(&[("foo", "bar")]));

        let transport = MockTransport::new();
        transport.set_fetch_response(response.clone());
        let strict = SyncEngine::new(
            ConnectionContext::build(options.clone().with_check_config_exist(true)).unwrap(),
            transport,
        );
        let err = strict.start().unwrap_err();
        assert!(matches!(err, SyncError::MissingKeys(ref keys) if keys == &["db.url"]));

        let transport = MockTransport::new();
        transport.set_fetch_response(response);
        let lenient = SyncEngine::new(ConnectionContext::build(options).unwrap(), transport);
        let resolved = lenient.start().unwrap();
        assert_eq!(resolved.get("foo").map(String::as_str), Some("bar"));
        assert!(!resolved.contains_key("db.url"));
    }

    #[test]
    fn start_twice_is_rejected() {
        let transport = MockTransport::new();
        transport.set_fetch_response(FetchResponse::success(Revision::new(1), HashMap::new()));
        let engine = SyncEngine::new(pulling(Duration::from_secs(300)), transport);
        engine.start().unwrap();
        assert!(matches!(
            engine.start(),
            Err(SyncError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn pull_applies_newer_revision_once() {
        let transport = Arc::new(MockTransport::new());
        transport.push_fetch(FetchResponse::success(
            Revision::new(1),
            values(&[("foo", "bar")]),
        ));
        transport.set_fetch_response(FetchResponse::success(
            Revision::new(2),
            values(&[("foo", "baz")]),
        ));
        let engine = SyncEngine::new(pulling(Duration::from_millis(10)), Arc::clone(&transport));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.register(move |event: &ChangeEvent| -> HandlerResult {
            sink.lock().extend(event.changes.clone());
            Ok(())
        });

        engine.start().unwrap();
        assert!(wait_for(|| transport.call_count(MockCallKind::Fetch) >= 4));
        engine.stop().unwrap();

        assert_eq!(engine.store().get("foo").as_deref(), Some("baz"));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].old.as_deref(), Some("bar"));
        assert_eq!(seen[0].new.as_deref(), Some("baz"));
        assert_eq!(engine.stats().updates_applied, 1);
    }

    #[test]
    fn pull_ignores_stale_revision() {
        let transport = Arc::new(MockTransport::new());
        transport.push_fetch(FetchResponse::success(
            Revision::new(5),
            values(&[("foo", "new")]),
        ));
        transport.set_fetch_response(FetchResponse::success(
            Revision::new(4),
            values(&[("foo", "old")]),
        ));
        let engine = SyncEngine::new(pulling(Duration::from_millis(5)), Arc::clone(&transport));
        let calls = counting_handler(&engine);

        engine.start().unwrap();
        assert!(wait_for(|| engine.stats().stale_ignored >= 2));
        engine.stop().unwrap();

        assert_eq!(engine.store().get("foo").as_deref(), Some("new"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pull_failure_reaches_failure_handler() {
        let transport = Arc::new(MockTransport::new());
        transport.push_fetch(FetchResponse::success(Revision::new(1), HashMap::new()));
        transport.push_fetch_failure("connection reset");
        transport.set_fetch_response(FetchResponse::success(Revision::new(1), HashMap::new()));
        let engine = SyncEngine::new(pulling(Duration::from_millis(5)), Arc::clone(&transport));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        engine.set_failure_handler(move |e: &SyncError| sink.lock().push(e.to_string()));

        engine.start().unwrap();
        assert!(wait_for(|| !failures.lock().is_empty()));
        engine.stop().unwrap();

        assert_eq!(failures.lock()[0], "transport error: connection reset");
        assert_eq!(engine.stats().failures, 1);
    }

    #[test]
    fn long_poll_applies_diff_and_ignores_duplicates() {
        let transport = Arc::new(MockTransport::new());
        transport.set_fetch_response(FetchResponse::success(
            Revision::new(1),
            values(&[("foo", "bar"), ("gone", "x")]),
        ));
        transport.push_long_poll(LongPollResponse::unchanged(Revision::new(1)));
        transport.push_long_poll(LongPollResponse::diff(
            Revision::new(2),
            values(&[("foo", "baz")]),
            vec!["gone".to_string()],
        ));
        transport.push_long_poll(LongPollResponse::diff(
            Revision::new(2),
            values(&[("foo", "dup")]),
            Vec::new(),
        ));
        transport.set_idle_hold(Duration::from_millis(2));

        let engine = SyncEngine::new(long_polling(), Arc::clone(&transport));
        let calls = counting_handler(&engine);
        engine.start().unwrap();
        assert!(wait_for(|| transport.call_count(MockCallKind::LongPoll) >= 5));
        engine.stop().unwrap();

        let snapshot = engine.store().read();
        assert_eq!(snapshot.revision(), Revision::new(2));
        assert_eq!(snapshot.get("foo"), Some("baz"));
        assert!(!snapshot.contains("gone"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().stale_ignored, 1);
    }

    #[test]
    fn long_poll_backs_off_and_recovers() {
        let transport = Arc::new(MockTransport::new());
        transport.set_fetch_response(FetchResponse::success(Revision::new(1), HashMap::new()));
        transport.push_long_poll_failure("timeout");
        transport.push_long_poll_failure("timeout");
        transport.push_long_poll(LongPollResponse::full(
            Revision::new(7),
            values(&[("foo", "bar")]),
        ));

        let engine = SyncEngine::new(long_polling(), Arc::clone(&transport));
        engine.start().unwrap();
        assert!(wait_for(|| engine.store().current_revision() == Revision::new(7)));
        engine.stop().unwrap();

        assert_eq!(engine.stats().failures, 2);
        assert_eq!(engine.store().get("foo").as_deref(), Some("bar"));
    }

    #[test]
    fn stop_is_idempotent_and_prompt() {
        let transport = MockTransport::new();
        transport.set_fetch_response(FetchResponse::success(Revision::new(1), HashMap::new()));
        let engine = SyncEngine::new(pulling(Duration::from_secs(300)), transport);

        engine.stop().unwrap();
        assert_eq!(engine.state(), SyncState::Idle);

        engine.start().unwrap();
        let started = Instant::now();
        engine.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(engine.state(), SyncState::Stopped);
        assert!(!engine.transport().is_connected());

        engine.stop().unwrap();
        assert_eq!(engine.state(), SyncState::Stopped);
    }

    #[test]
    fn latch_wakes_waiters() {
        let latch = Arc::new(Latch::default());
        assert!(!latch.wait(Duration::from_millis(1)));

        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait(Duration::from_secs(60)))
        };
        // Too long to turn into a deadline
        let unbounded = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(10));
        latch.trigger();
        assert!(waiter.join().unwrap());
        assert!(unbounded.join().unwrap());
        assert!(latch.is_triggered());
    }

    #[test]
    fn stop_detaches_a_worker_stuck_in_a_long_poll() {
        let transport = Arc::new(MockTransport::new());
        transport.set_fetch_response(FetchResponse::success(Revision::new(1), HashMap::new()));
        // Stands in for a server hold the client cannot abort
        transport.set_idle_hold(Duration::from_secs(3));
        let engine = SyncEngine::builder(long_polling(), Arc::clone(&transport))
            .with_stop_grace(Duration::from_millis(100))
            .build();
        let calls = counting_handler(&engine);

        engine.start().unwrap();
        assert!(wait_for(|| transport.call_count(MockCallKind::LongPoll) == 1));
        let started = Instant::now();
        engine.stop().unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(engine.state(), SyncState::Stopped);
        assert_eq!(engine.stats().failures, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn long_poll_retry_moves_to_another_node() {
        let transport = Arc::new(MockTransport::new());
        transport.set_fetch_response(FetchResponse::success(Revision::new(1), HashMap::new()));
        transport.fail_node(&Node::new("http://a"));
        let engine = SyncEngine::new(long_polling(), Arc::clone(&transport));

        engine.start().unwrap();
        let b = Node::new("http://b");
        assert!(wait_for(|| {
            transport
                .calls()
                .iter()
                .filter(|c| c.kind == MockCallKind::LongPoll && c.node == b)
                .count()
                >= 3
        }));
        engine.stop().unwrap();

        let long_polls: Vec<Node> = transport
            .calls()
            .into_iter()
            .filter(|c| c.kind == MockCallKind::LongPoll)
            .map(|c| c.node)
            .collect();
        let a = Node::new("http://a");
        assert!(long_polls.contains(&a));
        for pair in long_polls.windows(2) {
            if pair[0] == a {
                assert_eq!(pair[1], b);
            }
        }
        assert!(engine.stats().failures >= 1);
    }

    #[test]
    fn long_polling_reconciles_with_periodic_pulls() {
        let transport = Arc::new(MockTransport::new());
        transport.set_fetch_response(FetchResponse::success(
            Revision::new(1),
            values(&[("foo", "bar")]),
        ));
        transport.set_idle_hold(Duration::from_millis(2));
        let engine = SyncEngine::builder(long_polling(), Arc::clone(&transport))
            .with_reconcile_interval(Duration::from_millis(20))
            .build();
        let calls = counting_handler(&engine);

        engine.start().unwrap();
        // Long polls keep answering "unchanged"; only a pull can see this
        transport.set_fetch_response(FetchResponse::success(
            Revision::new(2),
            values(&[("foo", "baz")]),
        ));
        assert!(wait_for(|| engine.store().current_revision() == Revision::new(2)));
        assert!(wait_for(|| transport.call_count(MockCallKind::Fetch) >= 3));
        engine.stop().unwrap();

        let kinds: Vec<MockCallKind> = transport.calls().into_iter().map(|c| c.kind).collect();
        assert_eq!(kinds[0], MockCallKind::Fetch);
        let interleaved = kinds.windows(3).any(|w| {
            w == [
                MockCallKind::LongPoll,
                MockCallKind::Fetch,
                MockCallKind::LongPoll,
            ]
        });
        assert!(interleaved, "no pull between long polls: {kinds:?}");
        assert_eq!(engine.store().get("foo").as_deref(), Some("baz"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Delays every fetch so a test can act while bootstrap is in flight.
    struct SlowFetch {
        inner: MockTransport,
        delay: Duration,
    }

    impl ConfigTransport for SlowFetch {
        fn fetch(&self, node: &Node, request: &FetchRequest) -> SyncResult<FetchResponse> {
            thread::sleep(self.delay);
            self.inner.fetch(node, request)
        }

        fn long_poll(
            &self,
            node: &Node,
            request: &LongPollRequest,
        ) -> SyncResult<LongPollResponse> {
            self.inner.long_poll(node, request)
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn close(&self) -> SyncResult<()> {
            self.inner.close()
        }
    }

    #[test]
    fn stop_during_bootstrap_keeps_the_worker_from_starting() {
        let inner = MockTransport::new();
        inner.set_fetch_response(FetchResponse::success(
            Revision::new(1),
            values(&[("foo", "bar")]),
        ));
        let transport = SlowFetch {
            inner,
            delay: Duration::from_millis(200),
        };
        let engine = SyncEngine::new(pulling(Duration::from_millis(10)), transport);

        let resolved = thread::scope(|scope| {
            let starter = scope.spawn(|| engine.start());
            assert!(wait_for(|| engine.state() == SyncState::Bootstrapping));
            engine.stop().unwrap();
            starter.join().unwrap()
        })
        .unwrap();

        assert_eq!(resolved["foo"], "bar");
        assert_eq!(engine.state(), SyncState::Stopped);
        assert!(engine.worker.lock().is_none());
        assert!(!engine.transport().is_connected());
        assert!(matches!(
            engine.start(),
            Err(SyncError::InvalidStateTransition { .. })
        ));
    }
}
