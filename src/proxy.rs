/// 服务端与客户端代理共享的能力集合
///
/// 连接管理器通过弱引用回看所属代理，读取回调和共享限流器
use crate::config::ProxyConfig;
use crate::limiter::BandwidthLimiter;
use crate::protocol::PeerInfo;
use crate::stats::ConnectionStats;
use std::sync::Arc;

/// 连接建立 / 断开回调
pub type PeerCallback = Arc<dyn Fn(&PeerInfo) + Send + Sync>;

/// 客户端重连成功回调
pub type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

pub trait ProxyInstance: Send + Sync {
    /// 客户端在每次断线重连成功后按登记顺序调用；服务端为空
    fn reconnect_callbacks(&self) -> Vec<ReconnectCallback>;

    /// 每次 CONNECTED -> TEARDOWN 调用一次
    fn disconnect_callbacks(&self) -> Vec<PeerCallback>;

    /// 连接启动时调用；客户端为空
    fn on_connect_callbacks(&self) -> Vec<PeerCallback>;

    fn bandwidth_limiter(&self) -> Option<Arc<dyn BandwidthLimiter>>;

    fn proxy_config(&self) -> &ProxyConfig;

    fn stats(&self) -> &ConnectionStats;
}

/// 回调列表：setter 传空切片即清空，否则整体替换
pub(crate) struct CallbackList<C> {
    inner: parking_lot::RwLock<Vec<C>>,
}

impl<C> Default for CallbackList<C> {
    fn default() -> Self {
        Self {
            inner: parking_lot::RwLock::new(Vec::new()),
        }
    }
}

impl<C: Clone> CallbackList<C> {
    pub(crate) fn set(&self, callbacks: Vec<C>) {
        *self.inner.write() = callbacks;
    }

    pub(crate) fn snapshot(&self) -> Vec<C> {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_callback_list_replace_and_clear() {
        let list: CallbackList<PeerCallback> = CallbackList::default();
        assert!(list.snapshot().is_empty());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let callback: PeerCallback = Arc::new(move |_peer: &PeerInfo| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        list.set(vec![callback.clone(), callback]);

        let peer = PeerInfo::new("edge", "10.0.0.1");
        for cb in list.snapshot() {
            cb(&peer);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        list.set(Vec::new());
        assert!(list.snapshot().is_empty());

        let reconnects: CallbackList<ReconnectCallback> = CallbackList::default();
        reconnects.set(vec![Arc::new(|| {})]);
        assert_eq!(reconnects.snapshot().len(), 1);
    }
}
