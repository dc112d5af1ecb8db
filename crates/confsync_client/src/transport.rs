//! Transport layer abstraction for configuration requests.

use crate::error::{SyncError, SyncResult};
use crate::node::Node;
use confsync_protocol::{FetchRequest, FetchResponse, LongPollRequest, LongPollResponse};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A config transport carries requests to one chosen node.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, in-process loopback, mock for testing, etc.).
/// Calls block the calling thread.
pub trait ConfigTransport: Send + Sync {
    /// Fetches the full (or key-filtered) configuration from `node`.
    fn fetch(&self, node: &Node, request: &FetchRequest) -> SyncResult<FetchResponse>;

    /// Issues a long-poll against `node`, blocking up to the requested hold.
    fn long_poll(&self, node: &Node, request: &LongPollRequest) -> SyncResult<LongPollResponse>;

    /// Checks if the transport is usable.
    fn is_connected(&self) -> bool;

    /// Closes the transport, interrupting in-flight requests where the
    /// underlying client supports it.
    fn close(&self) -> SyncResult<()>;
}

impl<T: ConfigTransport + ?Sized> ConfigTransport for Arc<T> {
    fn fetch(&self, node: &Node, request: &FetchRequest) -> SyncResult<FetchResponse> {
        (**self).fetch(node, request)
    }

    fn long_poll(&self, node: &Node, request: &LongPollRequest) -> SyncResult<LongPollResponse> {
        (**self).long_poll(node, request)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn close(&self) -> SyncResult<()> {
        (**self).close()
    }
}

/// Turns a served-but-rejected fetch into an error.
pub(crate) fn accepted_fetch(response: FetchResponse) -> SyncResult<FetchResponse> {
    if response.success {
        Ok(response)
    } else {
        Err(SyncError::ServerError(
            response.error.unwrap_or_else(|| "fetch rejected".into()),
        ))
    }
}

/// Turns a served-but-rejected long-poll into an error.
pub(crate) fn accepted_long_poll(response: LongPollResponse) -> SyncResult<LongPollResponse> {
    if response.success {
        Ok(response)
    } else {
        Err(SyncError::ServerError(
            response.error.unwrap_or_else(|| "long poll rejected".into()),
        ))
    }
}

/// Kind of request seen by [`MockTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCallKind {
    /// A fetch request.
    Fetch,
    /// A long-poll request.
    LongPoll,
}

/// One request recorded by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockCall {
    /// Node the request was sent to.
    pub node: Node,
    /// Request kind.
    pub kind: MockCallKind,
}

enum Reply<T> {
    Respond(T),
    Fail(String),
}

/// A scriptable transport for testing.
///
/// Queued replies are consumed in order. Once the fetch queue is empty the
/// sticky fetch response (if any) is returned; once the long-poll queue is
/// empty the mock waits `idle_hold` and answers "unchanged", like a server
/// whose hold expired. Requests to nodes marked failing get a connection
/// error.
pub struct MockTransport {
    connected: AtomicBool,
    fetch_queue: Mutex<VecDeque<Reply<FetchResponse>>>,
    fetch_default: Mutex<Option<FetchResponse>>,
    long_poll_queue: Mutex<VecDeque<Reply<LongPollResponse>>>,
    idle_hold: Mutex<Duration>,
    failing_nodes: Mutex<HashSet<Node>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            fetch_queue: Mutex::new(VecDeque::new()),
            fetch_default: Mutex::new(None),
            long_poll_queue: Mutex::new(VecDeque::new()),
            idle_hold: Mutex::new(Duration::from_millis(5)),
            failing_nodes: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sets the fetch response returned whenever the queue is empty.
    pub fn set_fetch_response(&self, response: FetchResponse) {
        *self.fetch_default.lock() = Some(response);
    }

    /// Queues a one-shot fetch response.
    pub fn push_fetch(&self, response: FetchResponse) {
        self.fetch_queue.lock().push_back(Reply::Respond(response));
    }

    /// Queues a one-shot fetch failure.
    pub fn push_fetch_failure(&self, message: impl Into<String>) {
        self.fetch_queue.lock().push_back(Reply::Fail(message.into()));
    }

    /// Queues a one-shot long-poll response.
    pub fn push_long_poll(&self, response: LongPollResponse) {
        self.long_poll_queue
            .lock()
            .push_back(Reply::Respond(response));
    }

    /// Queues a one-shot long-poll failure.
    pub fn push_long_poll_failure(&self, message: impl Into<String>) {
        self.long_poll_queue
            .lock()
            .push_back(Reply::Fail(message.into()));
    }

    /// Sets how long an idle long-poll is held before answering "unchanged".
    pub fn set_idle_hold(&self, hold: Duration) {
        *self.idle_hold.lock() = hold;
    }

    /// Makes every request to `node` fail.
    pub fn fail_node(&self, node: &Node) {
        self.failing_nodes.lock().insert(node.clone());
    }

    /// Lets requests to `node` through again.
    pub fn heal_node(&self, node: &Node) {
        self.failing_nodes.lock().remove(node);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns every request seen so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Returns the number of requests of `kind` seen so far.
    pub fn call_count(&self, kind: MockCallKind) -> usize {
        self.calls.lock().iter().filter(|c| c.kind == kind).count()
    }

    fn begin(&self, node: &Node, kind: MockCallKind) -> SyncResult<()> {
        self.calls.lock().push(MockCall {
            node: node.clone(),
            kind,
        });
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        if self.failing_nodes.lock().contains(node) {
            return Err(SyncError::transport_retryable(format!(
                "connection refused: {node}"
            )));
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigTransport for MockTransport {
    fn fetch(&self, node: &Node, _request: &FetchRequest) -> SyncResult<FetchResponse> {
        self.begin(node, MockCallKind::Fetch)?;
        let queued = self.fetch_queue.lock().pop_front();
        match queued {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail(message)) => Err(SyncError::transport_retryable(message)),
            None => self
                .fetch_default
                .lock()
                .clone()
                .ok_or_else(|| SyncError::Protocol("no mock fetch response set".into())),
        }
    }

    fn long_poll(&self, node: &Node, request: &LongPollRequest) -> SyncResult<LongPollResponse> {
        self.begin(node, MockCallKind::LongPoll)?;
        let queued = self.long_poll_queue.lock().pop_front();
        match queued {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail(message)) => Err(SyncError::transport_retryable(message)),
            None => {
                let hold = *self.idle_hold.lock();
                std::thread::sleep(hold);
                Ok(LongPollResponse::unchanged(request.revision))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confsync_protocol::{Credentials, Revision};
    use std::collections::HashMap;

    fn fetch_request() -> FetchRequest {
        FetchRequest::new(Credentials::new("app", "secret"))
    }

    #[test]
    fn mock_transport_connection() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());

        transport.set_connected(false);
        assert!(!transport.is_connected());

        transport.set_connected(true);
        transport.close().unwrap();
        assert!(!transport.is_connected());
    }

    #[test]
    fn mock_transport_not_connected_error() {
        let transport = MockTransport::new();
        transport.close().unwrap();

        let result = transport.fetch(&Node::new("http://a"), &fetch_request());
        assert!(matches!(result, Err(SyncError::NotConnected)));
    }

    #[test]
    fn mock_transport_queue_then_default() {
        let transport = MockTransport::new();
        let node = Node::new("http://a");
        transport.push_fetch_failure("reset by peer");
        transport.set_fetch_response(FetchResponse::success(Revision::new(1), HashMap::new()));

        assert!(transport.fetch(&node, &fetch_request()).is_err());
        assert!(transport.fetch(&node, &fetch_request()).unwrap().success);
        assert!(transport.fetch(&node, &fetch_request()).unwrap().success);
        assert_eq!(transport.call_count(MockCallKind::Fetch), 3);
    }

    #[test]
    fn mock_transport_failing_node() {
        let transport = MockTransport::new();
        transport.set_fetch_response(FetchResponse::success(Revision::new(1), HashMap::new()));
        let a = Node::new("http://a");
        transport.fail_node(&a);

        let err = transport.fetch(&a, &fetch_request()).unwrap_err();
        assert!(err.is_retryable());
        assert!(transport.fetch(&Node::new("http://b"), &fetch_request()).is_ok());

        transport.heal_node(&a);
        assert!(transport.fetch(&a, &fetch_request()).is_ok());
    }

    #[test]
    fn idle_long_poll_reports_unchanged() {
        let transport = MockTransport::new();
        transport.set_idle_hold(Duration::ZERO);
        let request = LongPollRequest::new(
            Credentials::new("app", "secret"),
            Revision::new(9),
            Duration::from_secs(90),
        );
        let response = transport.long_poll(&Node::new("http://a"), &request).unwrap();
        assert!(!response.changed);
        assert_eq!(response.revision, Revision::new(9));
    }

    #[test]
    fn rejected_responses_become_errors() {
        let err = accepted_fetch(FetchResponse::error("invalid secret")).unwrap_err();
        assert!(matches!(err, SyncError::ServerError(ref m) if m == "invalid secret"));

        let err = accepted_long_poll(LongPollResponse::error("unknown app")).unwrap_err();
        assert!(matches!(err, SyncError::ServerError(_)));

        assert!(accepted_long_poll(LongPollResponse::unchanged(Revision::ZERO)).is_ok());
    }
}
