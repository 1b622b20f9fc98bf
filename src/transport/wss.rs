use super::BoxedTransport;
use crate::error::{ProxyError, Result};
use crate::protocol::MAX_MESSAGE_SIZE;
use http::header::{CONNECTION, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use http::{HeaderMap, Method, Request};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::{client_async_with_config, WebSocketStream};

/// 已完成升级的 WebSocket 连接
pub type WsStream = WebSocketStream<BoxedTransport>;

/// 两端统一的 WebSocket 参数：单条消息和单帧都不超过 1.5 MiB
pub fn ws_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_MESSAGE_SIZE))
        .max_frame_size(Some(MAX_MESSAGE_SIZE))
}

fn header_contains_token(headers: &HeaderMap, name: http::header::HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// 是否为合法的 RFC 6455 升级请求
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    let headers = request.headers();
    request.method() == Method::GET
        && header_contains_token(headers, CONNECTION, "upgrade")
        && header_contains_token(headers, UPGRADE, "websocket")
        && headers
            .get(SEC_WEBSOCKET_VERSION)
            .is_some_and(|v| v.as_bytes() == b"13")
        && headers.contains_key(SEC_WEBSOCKET_KEY)
}

/// 101 响应
pub fn switching_protocols_response(key: &[u8]) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key)
    )
}

/// 服务端完成升级：写出 101 响应，并把请求头之后已读到的字节交还给 WebSocket 层
pub async fn accept_upgrade<B>(
    mut stream: BoxedTransport,
    request: &Request<B>,
    leftover: Vec<u8>,
    deadline: Duration,
) -> Result<WsStream> {
    let key = request
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| ProxyError::upgrade_rejected("missing Sec-WebSocket-Key"))?;
    let response = switching_protocols_response(key.as_bytes());

    timeout(deadline, async {
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| ProxyError::timeout(deadline))??;

    let ws =
        WebSocketStream::from_partially_read(stream, leftover, Role::Server, Some(ws_config()))
            .await;
    Ok(ws)
}

/// 客户端发起升级
pub async fn connect_upgrade(
    stream: BoxedTransport,
    url: &str,
    headers: HeaderMap,
    deadline: Duration,
) -> Result<WsStream> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ProxyError::config_error(format!("Invalid url {}: {}", url, e)))?;
    request.headers_mut().extend(headers);

    let (ws, response) = timeout(
        deadline,
        client_async_with_config(request, stream, Some(ws_config())),
    )
    .await
    .map_err(|_| ProxyError::timeout(deadline))?
    .map_err(|e| ProxyError::upgrade_rejected(e.to_string()))?;

    tracing::debug!("Upgrade accepted with status {}", response.status());
    Ok(ws)
}
