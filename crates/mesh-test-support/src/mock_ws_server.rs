// A mock peer server for testing WireClient / Cluster dial-in behavior.
//
// Binds to port 0 (random) and, on each accepted connection, immediately
// sends a NodeInfo frame carrying the configured node id and channel list --
// standing in for the remote side of a peer-establishment handshake
// (SPEC_FULL.md 4.7.2) without spinning up a full Cluster.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use mesh_util::{EncodeData, Frame};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;

pub struct MockPeerServer {
    addr: SocketAddr,
    received: Arc<Mutex<mpsc::UnboundedReceiver<Frame>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockPeerServer {
    /// Start the mock peer, greeting every connection with a NodeInfo frame
    /// for `node_id` subscribed to `channels`.
    pub async fn start(
        node_id: &str,
        channels: &[&str],
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let node_id = node_id.to_owned();
        let channels: Vec<String> = channels.iter().map(|s| s.to_string()).collect();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let node_id = node_id.clone();
                        let channels = channels.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let _ = Self::handle_connection(stream, node_id, channels, tx).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self { addr, received: Arc::new(Mutex::new(rx)), _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Pops the next frame this peer received from a connecting client.
    pub async fn next_received(&self) -> Option<Frame> {
        self.received.lock().await.recv().await
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        node_id: String,
        channels: Vec<String>,
        tx: mpsc::UnboundedSender<Frame>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        let greeting = mesh_util::encode(
            "I",
            EncodeData::Json(json!({"_t": 1, "_i": node_id, "c": channels})),
            None,
        );
        write.send(Message::Text(greeting.into())).await?;

        while let Some(msg) = read.next().await {
            match msg? {
                Message::Text(text) => {
                    if let Ok(frame) = mesh_util::decode(&text) {
                        let _ = tx.send(frame);
                    }
                }
                Message::Ping(payload) => {
                    write.send(Message::Pong(payload)).await?;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }
}
