/// 自定义错误类型
///
/// 使用 thiserror 区分配置、拨号、发送等不同阶段的失败，
/// 方便调用者按类别处理（例如只对 Dial 做重试）
use std::io;
use std::time::Duration;
use thiserror::Error;

/// WebSocket 链路的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 配置错误：地址、TLS 材料或限流参数不合法
    #[error("Configuration error: {0}")]
    Config(String),

    /// 客户端首次拨号失败
    #[error("Failed to dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    /// 连接未建立或已经断开
    #[error("Connection is not established")]
    NotConnected,

    /// 服务端索引中找不到该对端
    #[error("Peer '{0}' is not connected")]
    UnknownPeer(String),

    /// 不支持的帧类型
    #[error("Invalid websocket frame type: {0}")]
    InvalidFrameType(i32),

    /// 出站消息 JSON 编码失败
    #[error("Failed to encode message: {0}")]
    Encoding(#[from] serde_json::Error),

    /// 升级请求被拒绝
    #[error("Upgrade rejected: {0}")]
    Upgrade(String),

    /// 已建立连接上的读写错误
    #[error("Transport error: {0}")]
    Transport(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建拨号错误
    pub fn dial_failed(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::Dial {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unknown_peer(name: impl Into<String>) -> Self {
        Self::UnknownPeer(name.into())
    }

    pub fn upgrade_rejected(msg: impl Into<String>) -> Self {
        Self::Upgrade(msg.into())
    }

    pub fn transport(err: impl ToString) -> Self {
        Self::Transport(err.to_string())
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn is_dial_error(&self) -> bool {
        matches!(self, Self::Dial { .. })
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }

    pub fn is_unknown_peer(&self) -> bool {
        matches!(self, Self::UnknownPeer(_))
    }

    pub fn is_invalid_frame_type(&self) -> bool {
        matches!(self, Self::InvalidFrameType(_))
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProxyError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
