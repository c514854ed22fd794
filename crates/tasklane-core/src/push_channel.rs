use futures_util::StreamExt;
use tasklane_types::ProtocolError;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::PushError;

/// One ordered server-to-client event stream.
pub struct PushChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl PushChannel {
    pub async fn connect(url: &str, token: Option<&str>) -> Result<Self, PushError> {
        let mut request = url.into_client_request()?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| PushError::Transport(format!("invalid token header: {err}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (stream, _) = connect_async(request).await?;
        tracing::debug!(url, "push channel connected");
        Ok(Self { stream })
    }

    /// Next text payload, undecoded. `Ok(None)` once the server closes the
    /// stream.
    pub async fn next_message(&mut self) -> Result<Option<String>, PushError> {
        while let Some(frame) = self.stream.next().await {
            match classify(frame?)? {
                Frame::Text(text) => return Ok(Some(text)),
                Frame::Control => continue,
                Frame::Closed => return Ok(None),
            }
        }
        Ok(None)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Text(String),
    Control,
    Closed,
}

fn classify(frame: Message) -> Result<Frame, PushError> {
    match frame {
        Message::Text(text) => Ok(Frame::Text(text)),
        Message::Ping(_) | Message::Pong(_) => Ok(Frame::Control),
        Message::Close(_) => Ok(Frame::Closed),
        Message::Binary(bytes) => Err(ProtocolError::UnexpectedFrame(format!(
            "binary frame of {} bytes",
            bytes.len()
        ))
        .into()),
        Message::Frame(_) => Err(ProtocolError::UnexpectedFrame("raw frame".to_string()).into()),
    }
}
