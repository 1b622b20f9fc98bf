/// 消息处理器接口
use crate::error::Result;
use crate::protocol::MsgPeerInfo;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

/// 一条路由登记：哪个模块处理 (option, resource) 组合的消息
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteInfo {
    pub option: String,
    pub resource: String,
    pub module: String,
}

impl RouteInfo {
    pub fn new(
        option: impl Into<String>,
        resource: impl Into<String>,
        module: impl Into<String>,
    ) -> Self {
        Self {
            option: option.into(),
            resource: resource.into(),
            module: module.into(),
        }
    }
}

/// 应用消息处理器
///
/// 每条入站 Text 消息都会在一个新任务里调用 [`MessageHandler::handle_msg`]，
/// 同一连接上的多次调用可能并发执行。返回空字节表示不回复。
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_msg(&self, payload: Bytes, peer: MsgPeerInfo) -> Vec<u8>;

    /// 登记路由，默认只记录日志
    fn register(&self, route: RouteInfo) -> Result<()> {
        info!(
            "Route registered: {}/{} -> {}",
            route.option, route.resource, route.module
        );
        Ok(())
    }
}

/// 原样回显载荷的处理器
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle_msg(&self, payload: Bytes, _peer: MsgPeerInfo) -> Vec<u8> {
        payload.to_vec()
    }
}
