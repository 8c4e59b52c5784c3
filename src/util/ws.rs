//! WebSocket plumbing shared by the streaming vendor clients.

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite::Error as WsError, MaybeTlsStream, WebSocketStream};

use crate::error::ParleyError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
pub struct AbortOnDrop(pub JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Map a WebSocket handshake failure to a typed error.
pub fn map_connect_error(vendor: &str, error: WsError) -> ParleyError {
    match error {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if matches!(status, 401 | 403) {
                ParleyError::Authentication(format!(
                    "{vendor} websocket authentication failed with status {status}"
                ))
            } else {
                ParleyError::api(
                    status,
                    format!("{vendor} websocket handshake failed with status {status}"),
                )
            }
        }
        WsError::Io(error) => ParleyError::Io(error),
        WsError::Url(error) => {
            ParleyError::Configuration(format!("Invalid {vendor} websocket URL: {error}"))
        }
        other => ParleyError::Stream(format!("{vendor} websocket connect failed: {other}")),
    }
}
