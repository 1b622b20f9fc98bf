use crate::connection::ConnectionManager;
use crate::limiter::{ConnLimiter, ConnSlot};
use std::collections::HashMap;
use std::sync::Arc;

/// 在线对端索引：clientName -> 连接管理器
///
/// 同一个名字最多对应一个管理器，插入必须是原子的"不存在才插入"
#[derive(Default)]
pub struct PeerIndex {
    peers: parking_lot::RwLock<HashMap<String, Arc<ConnectionManager>>>,
}

impl PeerIndex {
    /// 名字已被占用时返回 false
    pub fn insert_if_absent(&self, name: &str, manager: Arc<ConnectionManager>) -> bool {
        let mut peers = self.peers.write();
        if peers.contains_key(name) {
            return false;
        }
        peers.insert(name.to_string(), manager);
        true
    }

    /// 只删除仍指向同一个管理器的条目
    pub fn remove_if_same(&self, name: &str, manager: &Arc<ConnectionManager>) -> bool {
        let mut peers = self.peers.write();
        match peers.get(name) {
            Some(current) if Arc::ptr_eq(current, manager) => {
                peers.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConnectionManager>> {
        self.peers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// 取出全部条目
    pub fn drain(&self) -> Vec<(String, Arc<ConnectionManager>)> {
        self.peers.write().drain().collect()
    }
}

/// 请求结束时归还连接额度
pub(crate) struct UpgradeGuard {
    _slot: Option<ConnSlot>,
}

impl UpgradeGuard {
    /// 未设置限制器时总是成功；限制器已满时返回 None
    pub(crate) fn acquire(limiter: Option<Arc<dyn ConnLimiter>>) -> Option<Self> {
        match limiter {
            None => Some(Self { _slot: None }),
            Some(limiter) => ConnSlot::acquire(limiter).map(|slot| Self { _slot: Some(slot) }),
        }
    }
}
