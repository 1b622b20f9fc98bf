/// ws-link 库入口
///
/// 基于双向 TLS 的 WebSocket 消息链路：服务端代理接受多个边缘客户端，
/// 客户端代理维持一条可自动重连的长连接
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod limited_reader;
pub mod limiter;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod stats;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use client::ClientProxy;
pub use config::{HeartbeatConfig, ProxyConfig, ProxySettings, ReconnectPolicy};
pub use connection::{ConnState, ConnectionManager};
pub use error::{ProxyError, Result};
pub use handler::{MessageHandler, RouteInfo};
pub use protocol::{FrameType, Message, MsgPeerInfo, PeerInfo};
pub use server::ServerProxy;
pub use stats::{ConnectionStats, StatsSnapshot};
pub use tls::TlsInfo;
