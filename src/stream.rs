//! WebSocket endpoint streaming live registry snapshots to viewers.

use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::engine::StatsFrame;
use crate::error::Result;
use crate::registry::MetricsRegistry;

/// Pushes a JSON [`StatsFrame`] to every connected viewer at a fixed
/// period. Viewers are independent; a slow or dead one never stalls the
/// others.
pub struct StreamServer {
    registry: Arc<MetricsRegistry>,
    push_period: Duration,
}

impl StreamServer {
    pub fn new(registry: Arc<MetricsRegistry>, push_period: Duration) -> Self {
        Self {
            registry,
            push_period,
        }
    }

    /// Bind the listener and accept viewers until the task is aborted.
    pub async fn run(self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "stream server listening");
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "stream viewer connected");

            let registry = self.registry.clone();
            let push_period = self.push_period;
            tokio::spawn(async move {
                if let Err(e) = serve_viewer(stream, registry, push_period).await {
                    debug!(%peer, error = %e, "stream viewer dropped");
                }
            });
        }
    }
}

/// Push frames to a single viewer until the socket errors out.
async fn serve_viewer(
    stream: TcpStream,
    registry: Arc<MetricsRegistry>,
    push_period: Duration,
) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "websocket handshake failed");
            return Err(e);
        }
    };

    loop {
        let frame = StatsFrame::capture(&registry);
        match serde_json::to_string(&frame) {
            Ok(text) => ws.send(Message::text(text)).await?,
            Err(e) => warn!(error = %e, "failed to encode stream frame"),
        }

        tokio::time::sleep(push_period).await;
    }
}
