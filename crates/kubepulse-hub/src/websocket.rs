//! WebSocket transport
//!
//! Accepts viewer connections, registers each with the hub, forwards hub
//! frames to the socket and turns subscribe/unsubscribe frames into hub
//! membership changes. A connection that ends for any reason is removed from
//! every topic in one step.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::hub::{TopicHub, ViewerConnection, ViewerId};
use crate::protocol::{ClientMessage, ServerMessage};
use kubepulse_types::Topic;

/// How long a disconnected viewer's pending frames may take to flush
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Accept viewers on `listener` until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    hub: Arc<TopicHub>,
    queue_capacity: usize,
    cancel: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "viewer transport listening");
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&hub),
                            queue_capacity,
                            cancel.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                    }
                }
            }
        }
    }

    tracing::info!("viewer transport stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<TopicHub>,
    queue_capacity: usize,
    cancel: CancellationToken,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let ViewerConnection { id, mut frames } = hub.connect(queue_capacity);
    tracing::info!(viewer = %id, %peer, "viewer connected");

    // Ends once the hub drops this viewer's sender or the socket fails
    let send_loop = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = ws_sender.send(WsMessage::text(frame.to_string())).await {
                tracing::debug!(viewer = %id, error = %e, "failed to write frame");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            message = ws_receiver.next() => {
                match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        let reply = handle_text(&hub, id, text.as_str());
                        hub.send_to(id, &reply);
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    // Pings are answered by tungstenite; binary frames are not part of the protocol
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(viewer = %id, error = %e, "websocket read failed");
                        break;
                    }
                }
            }
        }
    }

    let topics = hub.leave_all(id);
    tracing::info!(viewer = %id, topics, "viewer disconnected");

    finish_send_loop(send_loop, id, SEND_DRAIN_TIMEOUT).await;
}

/// Wait for the send loop to flush, aborting it if the peer stopped reading
async fn finish_send_loop(mut send_loop: JoinHandle<()>, viewer: ViewerId, limit: Duration) {
    match tokio::time::timeout(limit, &mut send_loop).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(%viewer, error = %e, "send loop ended abnormally");
        }
        Err(_) => {
            tracing::debug!(%viewer, "peer is not reading, dropping unsent frames");
            send_loop.abort();
        }
    }
}

/// Apply one client frame to the hub and build the reply for that viewer
pub fn handle_text(hub: &TopicHub, viewer: ViewerId, text: &str) -> ServerMessage {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(
                %viewer,
                error = %e,
                frame = %text.chars().take(100).collect::<String>(),
                "invalid client message"
            );
            return ServerMessage::error(format!("invalid message: {e}"));
        }
    };

    match message {
        ClientMessage::Subscribe { topic } => {
            let topic = match topic.parse::<Topic>() {
                Ok(topic) => topic,
                Err(e) => return ServerMessage::error(e.to_string()),
            };
            match hub.join(topic.clone(), viewer) {
                Ok(_) => {
                    tracing::debug!(%viewer, %topic, "subscribed");
                    ServerMessage::Subscribed { topic }
                }
                Err(e) => ServerMessage::error(e.to_string()),
            }
        }
        ClientMessage::Unsubscribe { topic } => {
            let topic = match topic.parse::<Topic>() {
                Ok(topic) => topic,
                Err(e) => return ServerMessage::error(e.to_string()),
            };
            hub.leave(&topic, viewer);
            tracing::debug!(%viewer, %topic, "unsubscribed");
            ServerMessage::Unsubscribed { topic }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_handle_subscribe_and_unsubscribe() {
        let hub = TopicHub::new();
        let viewer = hub.connect(4);

        let reply = handle_text(&hub, viewer.id, r#"{"type":"subscribe","topic":"logs:worker-1"}"#);
        assert_eq!(
            reply,
            ServerMessage::Subscribed {
                topic: Topic::logs("worker-1")
            }
        );
        assert_eq!(hub.member_count(&Topic::logs("worker-1")), 1);

        let reply = handle_text(&hub, viewer.id, r#"{"type":"unsubscribe","topic":"logs:worker-1"}"#);
        assert_eq!(
            reply,
            ServerMessage::Unsubscribed {
                topic: Topic::logs("worker-1")
            }
        );
        assert_eq!(hub.member_count(&Topic::logs("worker-1")), 0);
    }

    #[test]
    fn test_handle_bad_frames() {
        let hub = TopicHub::new();
        let viewer = hub.connect(4);

        let reply = handle_text(&hub, viewer.id, "not json");
        assert!(matches!(reply, ServerMessage::Error { .. }));

        let reply = handle_text(&hub, viewer.id, r#"{"type":"subscribe","topic":"nodes"}"#);
        assert_eq!(reply, ServerMessage::error("unknown topic 'nodes'"));

        let reply = handle_text(&hub, viewer.id, r#"{"type":"subscribe","topic":"logs:"}"#);
        assert!(matches!(reply, ServerMessage::Error { .. }));
        assert_eq!(hub.viewer_count(), 1);
        assert!(hub.log_targets().is_empty());
    }

    async fn next_message<S>(stream: &mut S) -> ServerMessage
    where
        S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let message = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let WsMessage::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_round_trip_and_disconnect_cleanup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = Arc::new(TopicHub::new());
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Arc::clone(&hub), 16, cancel.clone()));

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        ws.send(WsMessage::text(
            json!({"type": "subscribe", "topic": "pods"}).to_string(),
        ))
        .await
        .unwrap();

        assert_eq!(
            next_message(&mut ws).await,
            ServerMessage::Subscribed { topic: Topic::Pods }
        );
        assert_eq!(hub.member_count(&Topic::Pods), 1);

        hub.emit(&Topic::Pods, &json!([{"name": "api-0"}]));
        assert_eq!(
            next_message(&mut ws).await,
            ServerMessage::Update {
                topic: Topic::Pods,
                data: json!([{"name": "api-0"}]),
            }
        );

        ws.close(None).await.unwrap();
        drop(ws);

        // Cleanup runs on the server task after the close frame arrives
        for _ in 0..100 {
            if hub.viewer_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(hub.viewer_count(), 0);
        assert_eq!(hub.member_count(&Topic::Pods), 0);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stuck_send_loop_is_aborted() {
        let hub = TopicHub::new();
        let viewer = hub.connect(4);

        // Stands in for a write that never completes; `_alive` drops on abort
        let (alive, mut aborted) = tokio::sync::oneshot::channel::<()>();
        let send_loop = tokio::spawn(async move {
            let _alive = alive;
            std::future::pending::<()>().await;
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            finish_send_loop(send_loop, viewer.id, Duration::from_millis(50)),
        )
        .await
        .expect("finishing a stuck send loop should not hang");

        let closed = tokio::time::timeout(Duration::from_secs(5), &mut aborted)
            .await
            .expect("send loop task was not torn down");
        assert!(closed.is_err());
    }
}
