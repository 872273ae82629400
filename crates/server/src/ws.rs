use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::Identity,
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, ServerEvent},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// Drives one admitted connection: outbound events are written by a dedicated
/// task, inbound frames are handled in arrival order.
pub(crate) async fn serve_connection(state: Arc<AppState>, socket: WebSocket, identity: Identity) {
    let (session, outbound) = state.api.connect(identity).await;
    let connection_id = session.connection_id();
    info!(%connection_id, user_id = %session.identity().id, "websocket session started");

    let (mut sink, mut stream) = socket.split();
    let mut outbound = UnboundedReceiverStream::new(outbound);
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(error) => {
                    warn!(%connection_id, %error, "failed to encode server event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientRequest>(&text) {
                Ok(request) => state.api.handle_request(&session, request).await,
                Err(error) => {
                    debug!(%connection_id, %error, "malformed client event");
                    session.reply(ServerEvent::Error(ApiError::new(
                        ErrorCode::Validation,
                        format!("malformed event: {error}"),
                    )));
                }
            },
            Ok(Message::Binary(_)) => session.reply(ServerEvent::Error(ApiError::new(
                ErrorCode::Validation,
                "binary frames are not supported",
            ))),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(%connection_id, %error, "websocket receive failed");
                break;
            }
        }
    }

    // dropping the last sender ends the writer once queued events are flushed
    state.api.disconnect(session).await;
    let _ = writer.await;
    info!(%connection_id, "websocket session closed");
}
