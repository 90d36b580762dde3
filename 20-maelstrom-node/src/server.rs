//! Read loop and concurrent handler dispatch.
//!
//! The server reads messages in line order and hands each one to every
//! registered [`Handler`] that accepts it. Each invocation runs as its own task,
//! so a slow or failing handler never holds up the read loop or its siblings.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{
    io::AsyncBufRead,
    task::{JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::Error,
    message::{ErrorCode, Message, Payload},
    shutdown::Shutdown,
    transport::{Inbound, Outbox},
};

/// Outcome of one handler invocation: an optional reply to the request's sender.
pub type HandlerFuture = BoxFuture<'static, Result<Option<Payload>, Error>>;

pub trait Handler: Send + Sync + 'static {
    fn accepts(&self, message: &Message) -> bool;

    fn handle(self: Arc<Self>, message: Arc<Message>) -> HandlerFuture;
}

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// Grace period for in-flight handlers once input is exhausted.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(1),
        }
    }
}

enum State {
    Idle,
    Running(JoinHandle<Result<(), Error>>),
    Terminated,
}

pub struct Server {
    dispatcher: Dispatcher,
    shutdown: Shutdown,
    config: ServerConfig,
    state: Mutex<State>,
    finished: Shutdown,
}

impl Server {
    pub fn new(outbox: Outbox, shutdown: Shutdown, config: ServerConfig) -> Self {
        Self {
            dispatcher: Dispatcher {
                handlers: Arc::new(Vec::new()),
                outbox,
            },
            shutdown,
            config,
            state: Mutex::new(State::Idle),
            finished: Shutdown::new(),
        }
    }

    /// Adds a handler. Handlers registered after [`Server::start`] are not seen
    /// by the running loop.
    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        Arc::make_mut(&mut self.dispatcher.handlers).push(handler);
    }

    /// Spawns the read loop over `reader`. Fails if the server was already started.
    pub fn start<R>(&self, reader: R) -> Result<(), Error>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, State::Idle) {
            return Err(Error::AlreadyStarted);
        }

        let read_loop = ReadLoop {
            inbound: Inbound::new(reader),
            dispatcher: self.dispatcher.clone(),
            shutdown: self.shutdown.clone(),
            drain_timeout: self.config.drain_timeout,
        };
        let finished = Finished(self.finished.clone());
        *state = State::Running(tokio::spawn(async move {
            let _finished = finished;
            read_loop.run().await
        }));
        info!(handlers = self.dispatcher.handlers.len(), "server started");
        Ok(())
    }

    /// Waits until input is exhausted or [`Server::shutdown`] cancels the loop.
    ///
    /// The first caller collects the loop's result; concurrent and later
    /// callers wait for the same termination and return `Ok`.
    pub async fn await_termination(&self) -> Result<(), Error> {
        let handle = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *state, State::Terminated) {
                State::Running(handle) => handle,
                State::Terminated => {
                    drop(state);
                    self.finished.triggered().await;
                    return Ok(());
                }
                State::Idle => {
                    *state = State::Idle;
                    return Err(Error::NotStarted);
                }
            }
        };

        match handle.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => {
                error!(error = %err, "read loop panicked");
                Err(Error::Cancelled)
            }
        }
    }

    /// Cancels the read loop and every in-flight handler.
    pub fn shutdown(&self) {
        info!("server shutdown requested");
        self.shutdown.trigger();
    }
}

/// Signals waiters when the read loop task ends, including by panic or abort.
struct Finished(Shutdown);

impl Drop for Finished {
    fn drop(&mut self) {
        self.0.trigger();
    }
}

#[derive(Clone)]
struct Dispatcher {
    handlers: Arc<Vec<Arc<dyn Handler>>>,
    outbox: Outbox,
}

impl Dispatcher {
    fn dispatch(&self, tasks: &mut JoinSet<()>, message: Message) {
        let message = Arc::new(message);
        let mut accepted = false;

        for handler in self.handlers.iter().filter(|handler| handler.accepts(&message)) {
            accepted = true;
            let invocation = Arc::clone(handler).handle(Arc::clone(&message));
            let outbox = self.outbox.clone();
            let request = Arc::clone(&message);
            tasks.spawn(async move {
                let outcome = invocation.await;
                respond(&outbox, &request, outcome).await;
            });
        }

        if !accepted {
            self.reject(tasks, message);
        }
    }

    fn reject(&self, tasks: &mut JoinSet<()>, message: Arc<Message>) {
        let kind = message.body.payload.kind();
        if message.body.payload.is_response() {
            debug!(src = %message.src, kind, "no handler for response; dropped");
            return;
        }
        warn!(src = %message.src, kind, "unsupported message type");
        let outbox = self.outbox.clone();
        tasks.spawn(async move {
            let reply = Payload::error(ErrorCode::NotSupported, format!("{kind} is not supported"));
            respond(&outbox, &message, Ok(Some(reply))).await;
        });
    }
}

async fn respond(outbox: &Outbox, request: &Message, outcome: Result<Option<Payload>, Error>) {
    let payload = match outcome {
        Ok(Some(payload)) => payload,
        Ok(None) => return,
        Err(err) => {
            warn!(
                src = %request.src,
                kind = request.body.payload.kind(),
                error = %err,
                "handler failed"
            );
            Payload::error(err.code(), err.to_string())
        }
    };

    if request.body.msg_id.is_none() {
        debug!(src = %request.src, kind = payload.kind(), "request had no msg_id; reply suppressed");
        return;
    }
    if let Err(err) = outbox.send(&request.reply(payload)).await {
        warn!(dest = %request.src, error = %err, "failed to send reply");
    }
}

struct ReadLoop<R> {
    inbound: Inbound<R>,
    dispatcher: Dispatcher,
    shutdown: Shutdown,
    drain_timeout: Duration,
}

impl<R> ReadLoop<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn run(mut self) -> Result<(), Error> {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.triggered() => {
                    info!(in_flight = tasks.len(), "cancelling in-flight handlers");
                    tasks.shutdown().await;
                    return Ok(());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => report(joined),
                next = self.inbound.next() => match next {
                    Ok(Some(Ok(message))) => self.dispatcher.dispatch(&mut tasks, message),
                    Ok(Some(Err(err))) => warn!(error = %err, "dropping malformed message"),
                    Ok(None) => break,
                    Err(err) => {
                        error!(error = %err, "input stream failed");
                        tasks.shutdown().await;
                        self.shutdown.trigger();
                        return Err(err.into());
                    }
                },
            }
        }

        drain(self.shutdown.clone(), self.drain_timeout, tasks).await;
        self.shutdown.trigger();
        Ok(())
    }
}

/// Gives in-flight handlers `drain_timeout` to finish, cut short by shutdown,
/// then aborts whatever is left.
async fn drain(shutdown: Shutdown, drain_timeout: Duration, mut tasks: JoinSet<()>) {
    info!(in_flight = tasks.len(), "input closed; draining handlers");
    let drained = tokio::time::timeout(drain_timeout, async {
        while let Some(joined) = tasks.join_next().await {
            report(joined);
        }
    });

    let finished = tokio::select! {
        biased;
        _ = shutdown.triggered() => false,
        result = drained => result.is_ok(),
    };
    if !finished {
        warn!(remaining = tasks.len(), "abandoning handlers still running");
    }
    tasks.shutdown().await;
}

fn report(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!(error = %err, "handler panicked");
        }
    }
}
