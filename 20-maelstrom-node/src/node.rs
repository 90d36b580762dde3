//! Wires the services of one node together.

use std::sync::Arc;

use tokio::io::AsyncBufRead;

use crate::{
    broadcast::BroadcastService,
    client::{Client, RpcConfig},
    echo::EchoService,
    error::Error,
    init::InitService,
    server::{Server, ServerConfig},
    shutdown::Shutdown,
    transport::Outbox,
    unique_ids::UniqueIdsService,
};

/// Which application handlers the node serves next to `init` and rpc responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    Echo,
    UniqueIds,
    Broadcast,
}

#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    pub workload: Workload,
    pub rpc: RpcConfig,
    pub server: ServerConfig,
}

impl NodeConfig {
    pub fn new(workload: Workload) -> Self {
        Self {
            workload,
            rpc: RpcConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub struct Node {
    server: Server,
    init: Arc<InitService>,
    client: Arc<Client>,
    broadcast: Option<Arc<BroadcastService>>,
}

impl Node {
    pub fn new(config: NodeConfig, outbox: Outbox) -> Self {
        let shutdown = Shutdown::new();
        let init = Arc::new(InitService::new());
        let client = Arc::new(Client::new(
            Arc::clone(&init),
            outbox.clone(),
            shutdown.clone(),
            config.rpc,
        ));

        let mut server = Server::new(outbox, shutdown, config.server);
        server.register(init.clone());
        server.register(client.clone());

        let mut broadcast = None;
        match config.workload {
            Workload::Echo => server.register(Arc::new(EchoService)),
            Workload::UniqueIds => {
                server.register(Arc::new(UniqueIdsService::new(Arc::clone(&init))));
            }
            Workload::Broadcast => {
                let service = Arc::new(BroadcastService::new(
                    Arc::clone(&init),
                    Arc::clone(&client),
                ));
                server.register(service.clone());
                broadcast = Some(service);
            }
        }

        Self {
            server,
            init,
            client,
            broadcast,
        }
    }

    pub fn start<R>(&self, reader: R) -> Result<(), Error>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        self.server.start(reader)
    }

    /// Waits for the read loop to finish, then fails any rpc still waiting.
    pub async fn await_termination(&self) -> Result<(), Error> {
        let result = self.server.await_termination().await;
        self.client.cancel_all();
        result
    }

    pub async fn run<R>(&self, reader: R) -> Result<(), Error>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        self.start(reader)?;
        self.await_termination().await
    }

    pub fn shutdown(&self) {
        self.server.shutdown();
        self.client.cancel_all();
    }

    pub fn init(&self) -> &Arc<InitService> {
        &self.init
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn broadcast(&self) -> Option<&Arc<BroadcastService>> {
        self.broadcast.as_ref()
    }
}
