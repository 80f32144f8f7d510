//! A bundled reference [`Protocol`](crate::remote::Protocol): one JSON-encoded
//! [`WireEnvelope`] per line, over any [`AsyncSocketStream`] (Unix or TCP).
//!
//! Mirrors `veecle-orchestrator::api`'s use of `Framed<AsyncSocketStream,
//! LinesCodec>` for its JSON-lines control protocol; here the framed stream's
//! write half is wrapped to satisfy [`Protocol`], and the read half is pumped
//! into an inbound channel by a background task.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use ten_net_utils::AsyncSocketStream;
use ten_runtime_protocol::WireEnvelope;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Framed, LinesCodec};

use crate::message::Message;
use crate::remote::Protocol;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A `Protocol` that speaks one JSON `WireEnvelope` per line over a socket.
///
/// The framed stream is split conceptually into a write half guarded by a
/// `Mutex` (messages from different extensions may be sent concurrently) and
/// a read half owned by the [`JsonLinesProtocol::spawn_reader`] background
/// task, which decodes incoming lines and forwards them to `inbound`.
pub struct JsonLinesProtocol {
    framed: Arc<Mutex<Framed<AsyncSocketStream, LinesCodec>>>,
}

impl JsonLinesProtocol {
    pub fn new(stream: AsyncSocketStream) -> Self {
        Self {
            framed: Arc::new(Mutex::new(Framed::new(stream, LinesCodec::new()))),
        }
    }

    /// Spawns a task that reads lines off the socket, decodes each as a
    /// `WireEnvelope`, converts it to a `Message`, and forwards it on
    /// `inbound`. Returns once the peer closes the connection or a decode
    /// error occurs.
    pub fn spawn_reader(&self, inbound: mpsc::UnboundedSender<Message>) -> tokio::task::JoinHandle<()> {
        let framed = self.framed.clone();
        tokio::spawn(async move {
            loop {
                let line = {
                    let mut framed = framed.lock().await;
                    framed.next().await
                };
                let Some(line) = line else {
                    break;
                };
                let line = match line {
                    Ok(line) => line,
                    Err(error) => {
                        tracing::warn!(%error, "jsonl protocol read error, closing connection");
                        break;
                    }
                };
                match decode_line(&line) {
                    Ok(message) => {
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "dropping malformed jsonl envelope");
                    }
                }
            }
        })
    }
}

fn decode_line(line: &str) -> Result<Message, crate::error::WireError> {
    let envelope: WireEnvelope =
        serde_json::from_str(line).map_err(|error| crate::error::WireError::Malformed(error.to_string()))?;
    Message::try_from(envelope)
}

impl Protocol for JsonLinesProtocol {
    fn send(&self, message: Message) -> BoxFuture<()> {
        let framed = self.framed.clone();
        Box::pin(async move {
            let envelope = WireEnvelope::from(&message);
            let Ok(line) = serde_json::to_string(&envelope) else {
                tracing::warn!("failed to encode outgoing envelope, dropping");
                return;
            };
            let mut framed = framed.lock().await;
            if let Err(error) = framed.send(line).await {
                tracing::warn!(%error, "jsonl protocol write error");
            }
        })
    }

    fn close(&self) -> BoxFuture<()> {
        let framed = self.framed.clone();
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut framed = framed.lock().await;
            let _ = framed.get_mut().shutdown().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ten_net_utils::UnresolvedMultiSocketAddress;
    use ten_runtime_protocol::Loc;

    #[tokio::test]
    async fn round_trips_a_cmd_between_two_endpoints() {
        let listener = "127.0.0.1:0".parse::<UnresolvedMultiSocketAddress>().unwrap().bind_async().await.unwrap();
        let address = UnresolvedMultiSocketAddress::try_from(listener.local_address().unwrap()).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let protocol = JsonLinesProtocol::new(stream);
            let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
            let reader = protocol.spawn_reader(inbound_tx);
            let received = inbound_rx.recv().await.unwrap();
            reader.abort();
            received
        });

        let client_stream = address.connect_async().await.unwrap();
        let client = JsonLinesProtocol::new(client_stream);
        let cmd = Message::new_cmd("ping", Loc::extension("g1", "caller"), vec![Loc::extension("g1", "e1")]);
        client.send(cmd.clone()).await;

        let received = server.await.unwrap();
        assert_eq!(received.kind.name(), "ping");
        assert_eq!(received.cmd_id(), cmd.cmd_id());
    }
}
