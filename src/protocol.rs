/// 链路两端共享的协议定义：对端标识、帧类型和 JSON 消息模型
use bytes::Bytes;
use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// 心跳 Ping 帧携带的固定内容
pub const PING_PAYLOAD: &str = "send ping message";

/// 客户端携带逻辑名称的请求头
pub const CLIENT_NAME_HEADER: &str = "clientname";

/// 客户端携带真实 IP 的请求头
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// 单条消息（以及单帧）允许的最大字节数：1.5 MiB
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 3 / 2;

/// 对端标识，连接存续期间不可变
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PeerInfo {
    /// 序列号（逻辑名称），服务端以此索引连接
    pub sn: String,
    /// IPv4 地址，可以为空
    pub ip: String,
}

impl PeerInfo {
    pub fn new(sn: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            sn: sn.into(),
            ip: ip.into(),
        }
    }

    /// 转换为随消息交给处理器的对端信息
    pub fn to_msg_peer_info(&self) -> MsgPeerInfo {
        MsgPeerInfo {
            ip: self.ip.clone(),
            sn: self.sn.clone(),
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.is_empty() {
            write!(f, "{}", self.sn)
        } else {
            write!(f, "{}@{}", self.sn, self.ip)
        }
    }
}

/// 消息处理器看到的对端信息
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MsgPeerInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(rename = "serialNumber", default, skip_serializing_if = "String::is_empty")]
    pub sn: String,
}

/// WebSocket 帧类型，取值与 RFC 6455 操作码一致
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FrameType {
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl TryFrom<i32> for FrameType {
    type Error = ProxyError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(Self::Text),
            2 => Ok(Self::Binary),
            8 => Ok(Self::Close),
            9 => Ok(Self::Ping),
            10 => Ok(Self::Pong),
            other => Err(ProxyError::InvalidFrameType(other)),
        }
    }
}

impl FrameType {
    /// 把载荷封装成对应类型的 tungstenite 帧
    ///
    /// Text 帧要求 UTF-8；Close 帧的载荷按"2 字节状态码 + 原因"解析，
    /// 为空时发送不带状态码的 Close。
    pub fn into_message(self, payload: Vec<u8>) -> Result<WsMessage> {
        let message = match self {
            FrameType::Text => {
                let text = String::from_utf8(payload)
                    .map_err(|e| ProxyError::transport(format!("text frame is not utf-8: {e}")))?;
                WsMessage::text(text)
            }
            FrameType::Binary => WsMessage::Binary(Bytes::from(payload)),
            FrameType::Ping => WsMessage::Ping(Bytes::from(payload)),
            FrameType::Pong => WsMessage::Pong(Bytes::from(payload)),
            FrameType::Close => {
                if payload.len() < 2 {
                    WsMessage::Close(None)
                } else {
                    let code = u16::from_be_bytes([payload[0], payload[1]]);
                    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
                    WsMessage::Close(Some(CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    }))
                }
            }
        };
        Ok(message)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Text => write!(f, "text"),
            FrameType::Binary => write!(f, "binary"),
            FrameType::Close => write!(f, "close"),
            FrameType::Ping => write!(f, "ping"),
            FrameType::Pong => write!(f, "pong"),
        }
    }
}

/// 消息头
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub is_sync: bool,
    /// 毫秒时间戳
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub peer_info: MsgPeerInfo,
}

/// 消息路由
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRouter {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub option: String,
    #[serde(default)]
    pub resource: String,
}

/// 链路上传输的应用消息
///
/// 链路本身把载荷当作不透明字节处理，这个模型供上层业务构造和解析消息。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub router: MessageRouter,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Message {
    /// 创建带新 id 和当前时间戳的消息
    pub fn new() -> Self {
        Self {
            header: MessageHeader {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: now_millis(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// 基于请求创建响应：沿用路由，parent_id 指向请求 id
    pub fn new_response(request: &Message) -> Self {
        let mut resp = Self::new();
        resp.header.parent_id = request.header.id.clone();
        resp.header.is_sync = request.header.is_sync;
        resp.header.peer_info = request.header.peer_info.clone();
        resp.router = request.router.clone();
        resp
    }

    pub fn set_router(
        &mut self,
        source: impl Into<String>,
        destination: impl Into<String>,
        option: impl Into<String>,
        resource: impl Into<String>,
    ) {
        self.router = MessageRouter {
            source: source.into(),
            destination: destination.into(),
            option: option.into(),
            resource: resource.into(),
        };
    }

    /// 填充消息内容
    pub fn fill_content<T: Serialize + ?Sized>(&mut self, content: &T) -> Result<()> {
        self.content = serde_json::to_value(content)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(1).unwrap(), FrameType::Text);
        assert_eq!(FrameType::try_from(10).unwrap(), FrameType::Pong);

        for bad in [-1, 0, 3, 7, 11] {
            let err = FrameType::try_from(bad).unwrap_err();
            assert!(err.is_invalid_frame_type());
        }
    }

    #[test]
    fn test_close_payload_parsing() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        match FrameType::Close.into_message(payload).unwrap() {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("unexpected message: {:?}", other),
        }

        assert!(matches!(
            FrameType::Close.into_message(Vec::new()).unwrap(),
            WsMessage::Close(None)
        ));
    }

    #[test]
    fn test_text_frame_requires_utf8() {
        assert!(FrameType::Text.into_message(vec![0xff, 0xfe]).is_err());
        assert!(FrameType::Binary.into_message(vec![0xff, 0xfe]).is_ok());
    }

    #[test]
    fn test_msg_peer_info_json_names() {
        let info = PeerInfo::new("edge-01", "10.0.0.8").to_msg_peer_info();
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(json, r#"{"ip":"10.0.0.8","serialNumber":"edge-01"}"#);

        let empty = serde_json::to_string(&MsgPeerInfo::default()).unwrap();
        assert_eq!(empty, "{}");
    }

    #[test]
    fn test_message_response_links_parent() {
        let mut req = Message::new();
        req.set_router("edge", "center", "GET", "DT_TEST");
        req.fill_content("hello").unwrap();

        let resp = Message::new_response(&req);
        assert_eq!(resp.header.parent_id, req.header.id);
        assert_ne!(resp.header.id, req.header.id);
        assert_eq!(resp.router.resource, "DT_TEST");

        let parsed = Message::from_bytes(&req.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, req);
        assert_eq!(parsed.content, serde_json::json!("hello"));
    }

    #[test]
    fn test_peer_info_display() {
        assert_eq!(PeerInfo::new("a", "").to_string(), "a");
        assert_eq!(PeerInfo::new("a", "1.2.3.4").to_string(), "a@1.2.3.4");
    }
}
