use std::sync::Arc;

use crate::{
    message::{Message, Payload},
    server::{Handler, HandlerFuture},
};

/// Replies to `echo` with the same text.
#[derive(Debug, Default)]
pub struct EchoService;

impl Handler for EchoService {
    fn accepts(&self, message: &Message) -> bool {
        matches!(message.body.payload, Payload::Echo { .. })
    }

    fn handle(self: Arc<Self>, message: Arc<Message>) -> HandlerFuture {
        let reply = match &message.body.payload {
            Payload::Echo { echo } => Some(Payload::EchoOk { echo: echo.clone() }),
            _ => None,
        };
        Box::pin(async move { Ok(reply) })
    }
}
