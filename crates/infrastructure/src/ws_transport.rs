//! WebSocket 推送传输
//!
//! 访问令牌与世界标识作为查询参数附加到连接地址上。

use application::{ConnectRequest, FrameStream, StreamTransport, TransportError};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Url;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};

#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }

    /// `{url}?token=<access>&world=<world>`
    pub fn connect_url(request: &ConnectRequest) -> Result<Url, TransportError> {
        let mut url = Url::parse(&request.url)
            .map_err(|err| TransportError::connect(format!("invalid stream url: {err}")))?;
        url.query_pairs_mut()
            .append_pair("token", &request.access_token)
            .append_pair("world", &request.world);
        Ok(url)
    }
}

fn handshake_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                TransportError::Unauthorized { status }
            } else {
                TransportError::connect(format!("handshake returned status {status}"))
            }
        }
        other => TransportError::connect(other.to_string()),
    }
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn open(&self, request: ConnectRequest) -> Result<FrameStream, TransportError> {
        let url = Self::connect_url(&request)?;
        tracing::debug!(host = ?url.host_str(), world = %request.world, "opening stream");
        let (socket, _response) = connect_async(url.as_str()).await.map_err(handshake_error)?;

        let frames = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!(len = bytes.len(), "dropping non-utf8 binary frame");
                        None
                    }
                },
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    Some(Err(TransportError::Closed { code, reason }))
                }
                Ok(_) => None,
                Err(err) => Some(Err(TransportError::io(err.to_string()))),
            }
        });
        Ok(frames.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url_carries_credentials() {
        let request = ConnectRequest {
            url: "ws://example.test/ws".to_string(),
            access_token: "a b&c".to_string(),
            world: "Antica".to_string(),
        };
        let url = WebSocketTransport::connect_url(&request).unwrap();
        assert_eq!(url.as_str(), "ws://example.test/ws?token=a+b%26c&world=Antica");
    }

    #[test]
    fn test_invalid_url_is_connect_error() {
        let request = ConnectRequest {
            url: "not a url".to_string(),
            access_token: String::new(),
            world: String::new(),
        };
        assert!(matches!(
            WebSocketTransport::connect_url(&request),
            Err(TransportError::Connect(_))
        ));
    }
}
