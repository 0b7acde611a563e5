//! WebSocket transport
//!
//! The producer API. Each connection exchanges JSON text frames:
//! - `send` stores a new message through the dispatcher's [`Submitter`] and
//!   answers with the generated uuid once it is durable;
//! - `logs` answers with a status summary, daily counts and every message.
//!
//! Malformed or rejected requests get an `error` frame; the connection stays
//! open either way.

use std::io;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::dispatcher::message::is_valid_mobile;
use crate::dispatcher::{Message, Submitter};
use crate::persistence::SledStore;
use crate::transport::message::{ClientMessage, LogsReport, ServerMessage};

/// Days covered by the `daycount` of a logs report.
const LOG_DAYS: u32 = 7;

/// Accept producer connections on `addr` until `cancel` fires.
pub async fn start_websocket_server(
    addr: String,
    submitter: Submitter,
    store: SledStore,
    cancel: CancellationToken,
) -> io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on ws://{addr}");

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        debug!(%peer, "producer connected");
        tokio::spawn(serve_connection(
            stream,
            submitter.clone(),
            store.clone(),
            cancel.clone(),
        ));
    }

    info!("WebSocket server stopped");
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    submitter: Submitter,
    store: SledStore,
    cancel: CancellationToken,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake error");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                debug!(error = %e, "failed to send response");
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            next = ws_receiver.next() => match next {
                Some(Ok(msg)) => msg,
                _ => break,
            },
        };
        let WsMessage::Text(text) = msg else {
            continue;
        };

        let response = handle_request(&text, &submitter, &store).await;
        match serde_json::to_string(&response) {
            Ok(json) => {
                if tx.send(WsMessage::Text(json.into())).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "failed to encode response"),
        }
    }

    debug!("producer disconnected");
}

/// Turn one request frame into its response.
pub(crate) async fn handle_request(
    text: &str,
    submitter: &Submitter,
    store: &SledStore,
) -> ServerMessage {
    let request = match serde_json::from_str::<ClientMessage>(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(
                error = %e,
                frame = %text.chars().take(100).collect::<String>(),
                "invalid client message"
            );
            return error_response(format!("invalid request: {e}"));
        }
    };

    match request {
        ClientMessage::Send { mobile, message } => {
            let mobile = mobile.trim();
            if mobile.is_empty() || message.trim().is_empty() {
                return error_response("mobile and message are required".to_string());
            }
            if !is_valid_mobile(mobile) {
                return error_response(format!("invalid mobile number {mobile:?}"));
            }
            let uuid = Uuid::new_v4().to_string();
            match submitter
                .submit(Message::new(uuid.clone(), mobile, message))
                .await
            {
                Ok(()) => {
                    info!(%uuid, "message accepted");
                    ServerMessage::Accepted { uuid }
                }
                Err(e) => {
                    warn!(error = %e, "submission refused");
                    error_response(e.to_string())
                }
            }
        }
        ClientMessage::Logs {} => match logs_report(store) {
            Ok(report) => ServerMessage::Logs(report),
            Err(e) => {
                warn!(error = %e, "failed to read logs");
                error_response(e.to_string())
            }
        },
    }
}

fn logs_report(store: &SledStore) -> Result<LogsReport, crate::utils::error::StoreError> {
    Ok(LogsReport {
        summary: store.status_summary()?,
        daycount: store.daily_counts(LOG_DAYS)?,
        messages: store.messages()?,
    })
}

fn error_response(message: String) -> ServerMessage {
    ServerMessage::Error { message }
}
