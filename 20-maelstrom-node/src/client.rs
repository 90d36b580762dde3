//! Outbound messaging and request/response correlation.
//!
//! Every request gets a fresh `msg_id` from a per-client counter. [`Client::rpc`]
//! parks a one-shot slot in the pending map under that id and waits for
//! [`Client::handle_response`] to fill it. Removal from the map is the single
//! point where a response and a timeout race; whichever removes the entry wins
//! and the other side becomes a no-op.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    error::Error,
    init::InitService,
    message::{Body, Message, MessageId, NodeId, Payload},
    retry::{RetryPolicy, retry},
    server::{Handler, HandlerFuture},
    shutdown::Shutdown,
    transport::Outbox,
};

/// Per-call rpc settings. Each attempt gets its own `timeout` window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RpcConfig {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl RpcConfig {
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(300),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    dest: NodeId,
    reply: oneshot::Sender<Body>,
}

type PendingMap = Mutex<HashMap<MessageId, PendingRequest>>;

pub struct Client {
    init: Arc<InitService>,
    outbox: Outbox,
    shutdown: Shutdown,
    config: RpcConfig,
    next_msg_id: AtomicU64,
    pending: PendingMap,
}

impl Client {
    pub fn new(
        init: Arc<InitService>,
        outbox: Outbox,
        shutdown: Shutdown,
        config: RpcConfig,
    ) -> Self {
        Self {
            init,
            outbox,
            shutdown,
            config,
            next_msg_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> RpcConfig {
        self.config
    }

    pub fn next_message_id(&self) -> MessageId {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends `body` to `dest` from this node. Waits for `init` if identity is not known yet.
    pub async fn send(&self, dest: &str, body: Body) -> Result<(), Error> {
        let src = self.init.node_id().await;
        self.outbox.send(&Message::new(src, dest, body)).await
    }

    /// Sends `payload` as a request and waits for the correlated response,
    /// using the client's default timeout and retry policy.
    pub async fn rpc(&self, dest: &str, payload: Payload) -> Result<Body, Error> {
        self.rpc_with(dest, payload, self.config).await
    }

    pub async fn rpc_with(
        &self,
        dest: &str,
        payload: Payload,
        config: RpcConfig,
    ) -> Result<Body, Error> {
        if self.shutdown.is_triggered() {
            return Err(Error::Cancelled);
        }

        let exchange = retry(config.retry, move |attempt| {
            self.attempt(dest, payload.clone(), config.timeout, attempt)
        });

        tokio::select! {
            biased;
            _ = self.shutdown.triggered() => Err(Error::Cancelled),
            result = exchange => result,
        }
    }

    async fn attempt(
        &self,
        dest: &str,
        payload: Payload,
        timeout: Duration,
        attempt: u32,
    ) -> Result<Body, Error> {
        let msg_id = self.next_message_id();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        let guard = self.register(msg_id, dest, reply_tx);

        let exchange = async {
            self.send(dest, Body::request(msg_id, payload)).await?;
            (&mut reply_rx).await.map_err(|_| Error::Cancelled)
        };

        let body = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result?,
            Err(_elapsed) => {
                if guard.release() {
                    debug!(%dest, msg_id, attempt, "rpc attempt timed out");
                    return Err(Error::RpcTimeout {
                        dest: dest.to_string(),
                        msg_id,
                        attempts: attempt,
                    });
                }
                // The response claimed the slot first; its value is already in the channel.
                reply_rx.try_recv().map_err(|_| Error::RpcTimeout {
                    dest: dest.to_string(),
                    msg_id,
                    attempts: attempt,
                })?
            }
        };

        remote_result(dest, body)
    }

    fn register(&self, msg_id: MessageId, dest: &str, reply: oneshot::Sender<Body>) -> PendingGuard<'_> {
        self.lock_pending().insert(
            msg_id,
            PendingRequest {
                dest: dest.to_string(),
                reply,
            },
        );
        PendingGuard {
            pending: &self.pending,
            msg_id,
        }
    }

    /// Completes the pending request named by `body.in_reply_to`.
    ///
    /// Responses nobody is waiting for (late, duplicated, or spurious) are dropped.
    pub fn handle_response(&self, src: &str, body: Body) {
        let Some(in_reply_to) = body.in_reply_to else {
            warn!(%src, kind = body.payload.kind(), "response without in_reply_to dropped");
            return;
        };

        // Completing under the lock makes removal and delivery one step for a racing timeout.
        let mut pending = self.lock_pending();
        match pending.remove(&in_reply_to) {
            Some(request) => {
                if request.dest != src {
                    debug!(%src, expected = %request.dest, in_reply_to, "response from unexpected node");
                }
                if request.reply.send(body).is_err() {
                    debug!(%src, in_reply_to, "requester went away before the response arrived");
                }
            }
            None => {
                debug!(%src, in_reply_to, kind = body.payload.kind(), "dropping unmatched response");
            }
        }
    }

    /// Fails every outstanding rpc wait. Used when the node shuts down.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.lock_pending().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "cancelling pending requests");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<MessageId, PendingRequest>> {
        lock(&self.pending)
    }
}

impl Handler for Client {
    fn accepts(&self, message: &Message) -> bool {
        message.body.is_response()
    }

    fn handle(self: Arc<Self>, message: Arc<Message>) -> HandlerFuture {
        self.handle_response(&message.src, message.body.clone());
        Box::pin(async { Ok(None) })
    }
}

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<MessageId, PendingRequest>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remote_result(dest: &str, body: Body) -> Result<Body, Error> {
    match body.payload {
        Payload::Error { code, text } => Err(Error::Remote {
            dest: dest.to_string(),
            code,
            text,
        }),
        _ => Ok(body),
    }
}

/// Removes the pending entry when an attempt ends for any reason, including
/// the surrounding future being dropped.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    msg_id: MessageId,
}

impl PendingGuard<'_> {
    /// Returns `true` if the entry was still registered, i.e. no response claimed it.
    fn release(&self) -> bool {
        lock(self.pending).remove(&self.msg_id).is_some()
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    use super::*;

    struct Harness {
        client: Arc<Client>,
        shutdown: Shutdown,
        wire: tokio::io::Lines<BufReader<DuplexStream>>,
    }

    fn harness(config: RpcConfig) -> Harness {
        let init = Arc::new(InitService::new());
        init.handle_init("n1".into(), vec!["n1".into(), "n2".into()]);
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let shutdown = Shutdown::new();
        let client = Arc::new(Client::new(
            init,
            Outbox::new(writer),
            shutdown.clone(),
            config,
        ));
        Harness {
            client,
            shutdown,
            wire: BufReader::new(reader).lines(),
        }
    }

    fn fast(times: u32) -> RpcConfig {
        RpcConfig {
            timeout: Duration::from_millis(30),
            retry: RetryPolicy::new(times, Duration::from_millis(5), Duration::from_millis(10)),
        }
    }

    async fn next_sent(wire: &mut tokio::io::Lines<BufReader<DuplexStream>>) -> Message {
        let line = tokio::time::timeout(Duration::from_secs(1), wire.next_line())
            .await
            .expect("message should be sent")
            .expect("io")
            .expect("line");
        Message::decode(&line).expect("decode")
    }

    #[tokio::test]
    async fn concurrent_callers_get_distinct_contiguous_ids() {
        let harness = harness(RpcConfig::default());
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let client = Arc::clone(&harness.client);
            tasks.push(tokio::spawn(async move {
                (0..10).map(|_| client.next_message_id()).collect::<Vec<_>>()
            }));
        }

        let mut ids = HashSet::new();
        for task in tasks {
            ids.extend(task.await.expect("task"));
        }
        assert_eq!(ids.len(), 640);
        assert_eq!(ids.iter().min(), Some(&1));
        assert_eq!(ids.iter().max(), Some(&640));
    }

    #[tokio::test]
    async fn rpc_resolves_with_matching_response() {
        let mut harness = harness(fast(1));
        let client = Arc::clone(&harness.client);
        let call = tokio::spawn(async move { client.rpc("n2", Payload::Read).await });

        let request = next_sent(&mut harness.wire).await;
        assert_eq!(request.src, "n1");
        assert_eq!(request.dest, "n2");
        let msg_id = request.body.msg_id.expect("requests carry msg_id");

        harness.client.handle_response(
            "n2",
            Body::response(msg_id, Payload::ReadOk { messages: vec![7] }),
        );

        let body = call.await.expect("task").expect("rpc succeeds");
        assert_eq!(body.payload, Payload::ReadOk { messages: vec![7] });
        assert_eq!(harness.client.pending_count(), 0);
    }

    #[tokio::test]
    async fn unresponsive_destination_gets_exactly_k_sends() {
        let mut harness = harness(fast(4));
        let result = harness.client.rpc("n2", Payload::Read).await;

        assert!(matches!(result, Err(Error::RpcTimeout { attempts: 4, .. })));
        assert_eq!(harness.client.pending_count(), 0);

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(next_sent(&mut harness.wire).await.body.msg_id.expect("msg id"));
        }
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]), "fresh id per attempt: {ids:?}");

        let extra = tokio::time::timeout(Duration::from_millis(50), harness.wire.next_line()).await;
        assert!(extra.is_err(), "no fifth send expected");
    }

    #[tokio::test]
    async fn unmatched_response_leaves_pending_state_alone() {
        let mut harness = harness(fast(1));
        let client = Arc::clone(&harness.client);
        let call = tokio::spawn(async move { client.rpc("n2", Payload::Read).await });
        let request = next_sent(&mut harness.wire).await;
        let msg_id = request.body.msg_id.expect("msg id");

        harness
            .client
            .handle_response("n2", Body::response(msg_id + 100, Payload::ReadOk { messages: vec![] }));
        harness.client.handle_response(
            "n2",
            Body {
                payload: Payload::ReadOk { messages: vec![] },
                msg_id: None,
                in_reply_to: None,
            },
        );
        assert_eq!(harness.client.pending_count(), 1);

        harness
            .client
            .handle_response("n2", Body::response(msg_id, Payload::ReadOk { messages: vec![] }));
        call.await.expect("task").expect("rpc succeeds");
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_dropped() {
        let mut harness = harness(fast(1));
        let result = harness.client.rpc("n2", Payload::Read).await;
        assert!(matches!(result, Err(Error::RpcTimeout { .. })));

        let request = next_sent(&mut harness.wire).await;
        harness.client.handle_response(
            "n2",
            Body::response(request.body.msg_id.expect("msg id"), Payload::ReadOk { messages: vec![] }),
        );
        assert_eq!(harness.client.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_reply_surfaces_as_remote_error() {
        let mut harness = harness(fast(1));
        let client = Arc::clone(&harness.client);
        let call = tokio::spawn(async move { client.rpc("n2", Payload::Read).await });
        let request = next_sent(&mut harness.wire).await;

        harness.client.handle_response(
            "n2",
            Body::response(
                request.body.msg_id.expect("msg id"),
                Payload::error(crate::message::ErrorCode::TemporarilyUnavailable, "busy"),
            ),
        );

        let result = call.await.expect("task");
        assert!(matches!(result, Err(Error::Remote { code: 11, .. })));
    }

    #[tokio::test]
    async fn dropped_rpc_releases_its_pending_entry() {
        let mut harness = harness(RpcConfig {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::once(),
        });
        let client = Arc::clone(&harness.client);
        let call = tokio::spawn(async move { client.rpc("n2", Payload::Read).await });

        next_sent(&mut harness.wire).await;
        assert_eq!(harness.client.pending_count(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(harness.client.pending_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_waiting_rpc() {
        let mut harness = harness(RpcConfig {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::unlimited(),
        });
        let client = Arc::clone(&harness.client);
        let call = tokio::spawn(async move { client.rpc("n2", Payload::Read).await });
        next_sent(&mut harness.wire).await;

        harness.shutdown.trigger();
        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("rpc should observe shutdown")
            .expect("task");

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(harness.client.pending_count(), 0);
        assert!(matches!(
            harness.client.rpc("n2", Payload::Read).await,
            Err(Error::Cancelled)
        ));
    }
}
