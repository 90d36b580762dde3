//! Gossip-based broadcast.
//!
//! Each node keeps the set of values it has seen. A value seen for the first
//! time is forwarded to every neighbor with unlimited retries; a value already
//! known is acknowledged without forwarding, which is what stops gossip storms.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use futures::future::try_join_all;
use tracing::{debug, info, warn};

use crate::{
    client::{Client, RpcConfig},
    error::Error,
    init::InitService,
    message::{Message, NodeId, Payload},
    retry::RetryPolicy,
    server::{Handler, HandlerFuture},
};

pub struct BroadcastService {
    init: Arc<InitService>,
    client: Arc<Client>,
    gossip: RpcConfig,
    values: Mutex<HashSet<i64>>,
    neighbors: OnceLock<Vec<NodeId>>,
}

impl BroadcastService {
    pub fn new(init: Arc<InitService>, client: Arc<Client>) -> Self {
        let defaults = client.config();
        let gossip = defaults.with_retry(RetryPolicy {
            times: RetryPolicy::unlimited().times,
            ..defaults.retry
        });
        Self {
            init,
            client,
            gossip,
            values: Mutex::new(HashSet::new()),
            neighbors: OnceLock::new(),
        }
    }

    /// Neighbors from the first applicable topology; `None` until one arrives.
    pub fn neighbors(&self) -> Option<&[NodeId]> {
        self.neighbors.get().map(Vec::as_slice)
    }

    pub fn handle_topology(&self, topology: &HashMap<NodeId, Vec<NodeId>>) -> Payload {
        let Some(identity) = self.init.try_identity() else {
            warn!("topology arrived before init; no neighbors");
            return Payload::TopologyOk;
        };
        let Some(listed) = topology.get(&identity.node_id) else {
            warn!(node_id = %identity.node_id, ?topology, "topology does not mention this node");
            return Payload::TopologyOk;
        };

        let mut seen = HashSet::new();
        let neighbors: Vec<NodeId> = listed
            .iter()
            .filter(|id| **id != identity.node_id && seen.insert(id.as_str()))
            .cloned()
            .collect();

        info!(?neighbors, "topology received");
        if self.neighbors.set(neighbors).is_err() {
            warn!(current = ?self.neighbors(), "topology already known; ignoring update");
        }
        Payload::TopologyOk
    }

    /// Records `value` and, if it is new, gossips it to every neighbor before acknowledging.
    pub async fn handle_broadcast(&self, value: i64) -> Result<Payload, Error> {
        // Insert-if-absent under one lock so two deliveries of the same value fan out once.
        let inserted = self.lock_values().insert(value);
        if !inserted {
            debug!(value, "value already known");
            return Ok(Payload::BroadcastOk);
        }

        let neighbors = self.neighbors().unwrap_or_default();
        if self.neighbors.get().is_none() {
            debug!(value, "no topology yet; value kept locally");
        }
        try_join_all(neighbors.iter().map(|neighbor| self.gossip(neighbor, value))).await?;
        Ok(Payload::BroadcastOk)
    }

    async fn gossip(&self, neighbor: &str, value: i64) -> Result<(), Error> {
        self.client
            .rpc_with(neighbor, Payload::Broadcast { message: value }, self.gossip)
            .await?;
        debug!(%neighbor, value, "gossip acknowledged");
        Ok(())
    }

    pub fn handle_read(&self) -> Payload {
        Payload::ReadOk {
            messages: self.values(),
        }
    }

    /// Snapshot of every value seen so far, in ascending order.
    pub fn values(&self) -> Vec<i64> {
        let mut values: Vec<i64> = self.lock_values().iter().copied().collect();
        values.sort_unstable();
        values
    }

    fn lock_values(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Handler for BroadcastService {
    fn accepts(&self, message: &Message) -> bool {
        matches!(
            message.body.payload,
            Payload::Broadcast { .. } | Payload::Read | Payload::Topology { .. }
        ) && !message.body.is_response()
    }

    fn handle(self: Arc<Self>, message: Arc<Message>) -> HandlerFuture {
        Box::pin(async move {
            let reply = match &message.body.payload {
                Payload::Broadcast { message: value } => self.handle_broadcast(*value).await?,
                Payload::Read => self.handle_read(),
                Payload::Topology { topology } => self.handle_topology(topology),
                _ => return Ok(None),
            };
            Ok(Some(reply))
        })
    }
}
