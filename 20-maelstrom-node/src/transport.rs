//! Line framing between the node and its peers.
//!
//! [`Inbound`] turns an input stream into decoded messages, one per line.
//! [`Outbox`] is the shared writer every component sends through; a lock around
//! the writer keeps each line intact when senders race.

use std::{io, pin::Pin, sync::Arc};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Split},
    sync::Mutex,
};
use tracing::trace;

use crate::{error::Error, message::Message};

pub struct Inbound<R> {
    lines: Split<R>,
}

impl<R> Inbound<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.split(b'\n'),
        }
    }

    /// Reads the next non-empty line and decodes it.
    ///
    /// Returns `Ok(None)` at end of input. A line that fails to decode,
    /// including one that is not valid UTF-8, is returned as `Ok(Some(Err(_)))`
    /// so the caller can drop it and keep going. Only a failing reader is an
    /// `Err`. Cancel safe: no line is lost if the future is dropped before
    /// completion.
    pub async fn next(&mut self) -> io::Result<Option<Result<Message, Error>>> {
        loop {
            let Some(line) = self.lines.next_segment().await? else {
                return Ok(None);
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            trace!(line = %String::from_utf8_lossy(&line), "received");
            return Ok(Some(Message::decode_bytes(&line)));
        }
    }
}

type SharedWriter = Arc<Mutex<Pin<Box<dyn AsyncWrite + Send>>>>;

#[derive(Clone)]
pub struct Outbox {
    writer: SharedWriter,
}

impl Outbox {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::pin(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Encodes `message` and writes it as one flushed line.
    pub async fn send(&self, message: &Message) -> Result<(), Error> {
        // Encode before taking the lock so a slow encoder never holds up other senders.
        let mut encoded = message.encode()?.into_bytes();
        encoded.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        trace!(dest = %message.dest, kind = message.body.payload.kind(), "sent");
        Ok(())
    }
}
