use crate::directory::Identity;
use crate::error::Result;
use crate::gateway::DeliveryGateway;
use crate::protocol::{self, ClientFrame, ServerFrame};
use crate::session::DisconnectReason;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub fn router(gateway: Arc<DeliveryGateway>) -> Router {
    Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/healthchecker", get(healthchecker))
        .with_state(gateway)
}

pub async fn serve<F>(listener: TcpListener, gateway: Arc<DeliveryGateway>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthchecker() -> &'static str {
    "Server is running"
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(gateway): State<Arc<DeliveryGateway>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, gateway))
}

async fn handle_connection(socket: WebSocket, gateway: Arc<DeliveryGateway>) {
    let (mut connection, outbound) = gateway.accept();
    let connection_id = connection.id();
    info!(%connection_id, "new client connected");

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound, gateway.send_timeout()));

    let reason = loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match protocol::decode(text.as_str()) {
                    Ok(ClientFrame::Register(raw)) => match Identity::new(raw) {
                        Ok(identity) => gateway.on_register(&mut connection, identity),
                        Err(e) => warn!(%connection_id, error = %e, "register without identity ignored"),
                    },
                    Err(e) => debug!(%connection_id, error = %e, "ignoring client frame"),
                },
                Some(Ok(Message::Close(_))) | None => break DisconnectReason::PeerClosed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%connection_id, error = %e, "websocket read failed");
                    break DisconnectReason::TransportError;
                }
            },
            finished = &mut writer => {
                break finished.unwrap_or(DisconnectReason::TransportError);
            }
        }
    };

    gateway.on_disconnect(&mut connection, reason);
    writer.abort();
}

/// Drains the connection's outbound queue onto the socket. Each write is
/// bounded by `send_timeout`; a stalled client is disconnected rather than
/// allowed to back up the queue.
///
/// After a failed or timed-out write the sink may hold a half-written frame,
/// so it is dropped without a close handshake.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerFrame>,
    send_timeout: Duration,
) -> DisconnectReason {
    loop {
        let Some(frame) = outbound.recv().await else {
            close_sink(&mut sink, send_timeout).await;
            return DisconnectReason::Shutdown;
        };
        let text = match protocol::encode(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(event = %frame.event, error = %e, "failed to encode frame");
                continue;
            }
        };
        match tokio::time::timeout(send_timeout, sink.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, event = %frame.event, "push failed");
                return DisconnectReason::TransportError;
            }
            Err(_) => {
                warn!(event = %frame.event, timeout_ms = send_timeout.as_millis() as u64, "push timed out, closing stalled client");
                return DisconnectReason::Stalled;
            }
        }
    }
}

async fn close_sink(sink: &mut SplitSink<WebSocket, Message>, send_timeout: Duration) {
    match tokio::time::timeout(send_timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "websocket close failed"),
        Err(_) => debug!("websocket close timed out"),
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
