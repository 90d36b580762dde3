//! Cluster-wide unique ids without coordination.
//!
//! Node `i` of `n` hands out `i, i + n, i + 2n, ...`, so no two nodes can ever
//! produce the same id.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tracing::warn;

use crate::{
    init::InitService,
    message::{Message, Payload},
    server::{Handler, HandlerFuture},
};

pub struct UniqueIdsService {
    init: Arc<InitService>,
    generated: AtomicU64,
}

impl UniqueIdsService {
    pub fn new(init: Arc<InitService>) -> Self {
        Self {
            init,
            generated: AtomicU64::new(0),
        }
    }

    pub async fn generate(&self) -> u64 {
        let identity = self.init.identity().await;
        let members = identity.node_ids.len().max(1) as u64;
        let index = identity.index().unwrap_or_else(|| {
            warn!(node_id = %identity.node_id, "node missing from membership; using slot 0");
            0
        }) as u64;
        self.generated.fetch_add(1, Ordering::Relaxed) * members + index
    }
}

impl Handler for UniqueIdsService {
    fn accepts(&self, message: &Message) -> bool {
        matches!(message.body.payload, Payload::Generate)
    }

    fn handle(self: Arc<Self>, _message: Arc<Message>) -> HandlerFuture {
        Box::pin(async move {
            let id = self.generate().await;
            Ok(Some(Payload::GenerateOk { id }))
        })
    }
}
