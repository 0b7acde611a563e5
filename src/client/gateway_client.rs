//! Gateway client
//!
//! `GatewayClient` speaks the producer protocol over a WebSocket: one request
//! frame, one response frame. The CLI uses it for `send` and `logs`.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::protocol::Message as WsMessage;

use crate::transport::message::{ClientMessage, LogsReport, ServerMessage};
use crate::utils::error::ClientError;

pub struct GatewayClient {
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl GatewayClient {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _response) = connect_async(url).await?;
        Ok(Self { ws_stream })
    }

    /// Submit a message; returns the uuid the gateway assigned to it.
    pub async fn send_sms(&mut self, mobile: &str, message: &str) -> Result<String, ClientError> {
        let request = ClientMessage::Send {
            mobile: mobile.to_string(),
            message: message.to_string(),
        };
        match self.request(&request).await? {
            ServerMessage::Accepted { uuid } => Ok(uuid),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn logs(&mut self) -> Result<LogsReport, ClientError> {
        match self.request(&ClientMessage::Logs {}).await? {
            ServerMessage::Logs(report) => Ok(report),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    async fn request(&mut self, request: &ClientMessage) -> Result<ServerMessage, ClientError> {
        let frame = serde_json::to_string(request)?;
        self.ws_stream.send(WsMessage::Text(frame.into())).await?;

        while let Some(msg) = self.ws_stream.next().await {
            match msg? {
                WsMessage::Text(text) => {
                    return match serde_json::from_str::<ServerMessage>(&text)? {
                        ServerMessage::Error { message } => Err(ClientError::Rejected(message)),
                        response => Ok(response),
                    };
                }
                WsMessage::Close(_) => break,
                _ => continue,
            }
        }
        Err(ClientError::Disconnected)
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.ws_stream.close(None).await?;
        Ok(())
    }
}
