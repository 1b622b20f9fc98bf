mod tls;
mod wss;

pub use tls::{handshake, TlsDialer, TlsListener};
pub use wss::{
    accept_upgrade, connect_upgrade, is_upgrade_request, switching_protocols_response, ws_config,
    WsStream,
};

use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// 传输层连接抽象
///
/// 服务端与客户端的 TLS 流类型不同，统一装箱后交给 WebSocket 层
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 装箱后的传输层连接
pub type BoxedTransport = Pin<Box<dyn Transport>>;
