//! Node identity, established once by the first `init` message.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    message::{Message, NodeId, Payload},
    server::{Handler, HandlerFuture},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub node_id: NodeId,
    pub node_ids: Vec<NodeId>,
}

impl Identity {
    /// Position of this node in the cluster membership, if it is listed.
    pub fn index(&self) -> Option<usize> {
        self.node_ids.iter().position(|id| *id == self.node_id)
    }
}

/// Write-once identity cell. Readers that arrive before `init` wait for it.
#[derive(Debug)]
pub struct InitService {
    identity: watch::Sender<Option<Identity>>,
}

impl InitService {
    pub fn new() -> Self {
        let (identity, _rx) = watch::channel(None);
        Self { identity }
    }

    /// Records the identity carried by an `init` payload and returns `init_ok`.
    ///
    /// Only the first call takes effect; later ones are logged and acknowledged
    /// without touching the established identity.
    pub fn handle_init(&self, node_id: NodeId, node_ids: Vec<NodeId>) -> Payload {
        let candidate = Identity { node_id, node_ids };
        let accepted = self.identity.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(candidate.clone());
            true
        });

        if accepted {
            info!(node_id = %candidate.node_id, members = candidate.node_ids.len(), "node initialised");
        } else {
            warn!(
                ignored = %candidate.node_id,
                current = ?self.try_identity().map(|identity| identity.node_id),
                "duplicate init ignored"
            );
        }
        Payload::InitOk
    }

    pub fn try_identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    /// Waits until `init` has been handled, then returns the identity.
    pub async fn identity(&self) -> Identity {
        let mut rx = self.identity.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(identity) = current {
                return identity;
            }
            // `self` owns the sender, so the channel stays open for as long as we wait.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub async fn node_id(&self) -> NodeId {
        self.identity().await.node_id
    }

    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.identity().await.node_ids
    }
}

impl Default for InitService {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for InitService {
    fn accepts(&self, message: &Message) -> bool {
        matches!(message.body.payload, Payload::Init { .. })
    }

    fn handle(self: Arc<Self>, message: Arc<Message>) -> HandlerFuture {
        let reply = match &message.body.payload {
            Payload::Init { node_id, node_ids } => {
                Some(self.handle_init(node_id.clone(), node_ids.clone()))
            }
            _ => None,
        };
        Box::pin(async move { Ok(reply) })
    }
}
