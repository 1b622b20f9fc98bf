mod reconnect;

pub use reconnect::Backoff;

use crate::config::{ConfigValidator, ProxyConfig};
use crate::connection::ConnectionManager;
use crate::error::{ProxyError, Result};
use crate::limiter::{BandwidthLimiter, SharedBandwidthLimiter};
use crate::protocol::{FrameType, PeerInfo, CLIENT_NAME_HEADER, REAL_IP_HEADER};
use crate::proxy::{CallbackList, PeerCallback, ProxyInstance, ReconnectCallback};
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::transport::{connect_upgrade, TlsDialer};
use http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::{Mutex, RwLock};
use reconnect::{sleep_or_cancel, LOG_EVERY_N_FAILURES};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// 客户端代理
///
/// 维持到服务端的一条连接：首次拨号同步完成，之后由重连守护任务
/// 在断线时按指数退避重新拨号，并依次调用重连回调
pub struct ClientProxy {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ProxyConfig,
    manager: RwLock<Option<Arc<ConnectionManager>>>,
    on_reconnect: CallbackList<ReconnectCallback>,
    on_disconnect: CallbackList<PeerCallback>,
    bandwidth: RwLock<Option<Arc<SharedBandwidthLimiter>>>,
    stats: ConnectionStats,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyInstance for ClientInner {
    fn reconnect_callbacks(&self) -> Vec<ReconnectCallback> {
        self.on_reconnect.snapshot()
    }

    fn disconnect_callbacks(&self) -> Vec<PeerCallback> {
        self.on_disconnect.snapshot()
    }

    fn on_connect_callbacks(&self) -> Vec<PeerCallback> {
        Vec::new()
    }

    fn bandwidth_limiter(&self) -> Option<Arc<dyn BandwidthLimiter>> {
        self.bandwidth
            .read()
            .clone()
            .map(|limiter| limiter as Arc<dyn BandwidthLimiter>)
    }

    fn proxy_config(&self) -> &ProxyConfig {
        &self.config
    }

    fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

impl ClientProxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                manager: RwLock::new(None),
                on_reconnect: CallbackList::default(),
                on_disconnect: CallbackList::default(),
                bandwidth: RwLock::new(None),
                stats: ConnectionStats::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// 等待启动延迟后拨号一次；失败返回 [`ProxyError::Dial`]，不留下后台任务
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let config = &inner.config;
        ConfigValidator::validate_serial_number(config.name())?;

        if inner
            .supervisor
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return Err(ProxyError::config_error(format!(
                "client '{}' is already running",
                config.name()
            )));
        }

        let scope = config.renew_scope();
        if !sleep_or_cancel(&scope, config.reconnect_policy().startup_delay).await {
            return Err(ProxyError::dial_failed(config.hosts(), "start cancelled"));
        }

        if let Err(e) = inner.establish().await {
            scope.cancel();
            error!("Connect to {} failed: {}", config.hosts(), e);
            return Err(match e {
                ProxyError::Dial { .. } => e,
                other => ProxyError::dial_failed(config.hosts(), other),
            });
        }

        let task = tokio::spawn(Arc::clone(inner).supervise(scope));
        *inner.supervisor.lock() = Some(task);
        Ok(())
    }

    /// 停止客户端，返回遇到的第一个错误
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        inner.config.scope().cancel();

        if let Some(limiter) = inner.bandwidth.write().take() {
            limiter.stop();
        }

        let mut first_error = None;

        let task = inner.supervisor.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Reconnect supervisor of '{}' ended abnormally: {}", inner.config.name(), e);
                first_error.get_or_insert(ProxyError::Other(anyhow::anyhow!(
                    "reconnect supervisor failed: {}",
                    e
                )));
            }
        }

        let manager = inner.manager.write().take();
        if let Some(manager) = manager {
            if let Err(e) = manager.stop().await {
                error!("Stop connection to {} error: {}", inner.config.hosts(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// 以文本帧发送 JSON 消息
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        self.send_with_type(message, FrameType::Text as i32).await
    }

    pub async fn send_with_type<T: Serialize + ?Sized>(
        &self,
        message: &T,
        frame_type: i32,
    ) -> Result<()> {
        let frame_type = FrameType::try_from(frame_type)?;
        let payload = serde_json::to_vec(message)?;
        let manager = self
            .inner
            .manager
            .read()
            .clone()
            .ok_or(ProxyError::NotConnected)?;
        manager.send(frame_type, payload).await
    }

    /// 传空列表即清空
    pub fn set_reconn_callback(&self, callbacks: Vec<ReconnectCallback>) {
        self.inner.on_reconnect.set(callbacks);
    }

    pub fn set_disconn_callback(&self, callbacks: Vec<PeerCallback>) {
        self.inner.on_disconnect.set(callbacks);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn bandwidth_limiter(&self) -> Option<Arc<SharedBandwidthLimiter>> {
        self.inner.bandwidth.read().clone()
    }
}

impl Drop for ClientProxy {
    fn drop(&mut self) {
        self.inner.config.scope().cancel();
    }
}

impl ClientInner {
    fn is_connected(&self) -> bool {
        self.manager
            .read()
            .as_ref()
            .is_some_and(|manager| manager.is_connected())
    }

    fn url(&self) -> Result<Url> {
        let config = &self.config;
        endpoint_url(config.host(), config.port(), config.url_path())
    }

    fn upgrade_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let name = HeaderValue::from_str(self.config.name())
            .map_err(|e| ProxyError::config_error(format!("Invalid client name: {}", e)))?;
        headers.insert(HeaderName::from_static(CLIENT_NAME_HEADER), name);
        if let Some(ip) = self.config.real_ip() {
            let value = HeaderValue::from_str(&ip.to_string())
                .map_err(|e| ProxyError::config_error(format!("Invalid real ip: {}", e)))?;
            headers.insert(HeaderName::from_static(REAL_IP_HEADER), value);
        }
        Ok(headers)
    }

    /// 拨号、升级并启动新的连接管理器
    async fn establish(self: &Arc<Self>) -> Result<()> {
        let config = &self.config;
        let deadline = config.handshake_timeout();

        let url = self.url()?;
        let dialer = TlsDialer::new(config.host(), config.port(), Arc::clone(config.tls()));
        let stream = dialer.connect(deadline).await?;
        let ws = connect_upgrade(stream, url.as_str(), self.upgrade_headers()?, deadline)
            .await
            .map_err(|e| ProxyError::dial_failed(dialer.addr(), e))?;

        // 每次建连都换一个新的带宽限制器
        let limiter = config
            .bandwidth_limiter_cfg()
            .map(|cfg| Arc::new(SharedBandwidthLimiter::new(cfg)));
        if let Some(old) = std::mem::replace(&mut *self.bandwidth.write(), limiter) {
            old.stop();
        }

        let weak = Arc::downgrade(self);
        let proxy: Weak<dyn ProxyInstance> = weak;
        let peer = PeerInfo::new(config.name(), config.host());
        let manager = ConnectionManager::new(ws, peer, proxy);
        manager.start()?;

        self.manager.write().replace(manager);
        info!("Connected to {} as '{}'", url, config.name());
        Ok(())
    }

    /// 重连守护：周期检查连接状态，断线后重连并调用重连回调
    async fn supervise(self: Arc<Self>, scope: CancellationToken) {
        let interval = self.config.reconnect_policy().reconnect_interval;
        loop {
            if !sleep_or_cancel(&scope, interval).await {
                break;
            }
            if self.is_connected() {
                continue;
            }

            warn!("Connection to {} lost, reconnecting", self.config.hosts());
            if !self.reconnect(&scope).await {
                break;
            }
            info!("Reconnected to {}", self.config.hosts());
            for callback in self.on_reconnect.snapshot() {
                callback();
            }
        }
        debug!("Reconnect supervisor of '{}' exited", self.config.name());
    }

    /// 重试直到成功；被取消时返回 false
    async fn reconnect(self: &Arc<Self>, scope: &CancellationToken) -> bool {
        let policy = self.config.reconnect_policy();
        if !sleep_or_cancel(scope, policy.startup_delay).await {
            return false;
        }

        let mut backoff = Backoff::new(policy.initial_backoff, policy.max_backoff);
        let mut failures: u64 = 0;
        loop {
            if scope.is_cancelled() {
                return false;
            }

            let result = tokio::select! {
                _ = scope.cancelled() => return false,
                result = self.establish() => result,
            };
            let Err(e) = result else {
                return true;
            };

            failures += 1;
            if failures % LOG_EVERY_N_FAILURES == 0 {
                error!(
                    "Reconnect to {} failed {} times, last error: {}",
                    self.config.hosts(),
                    failures,
                    e
                );
            }

            if !sleep_or_cancel(scope, backoff.next_delay()).await {
                return false;
            }
        }
    }
}

/// 拼出 `wss://host:port/path`，路径为空时使用 `/`
fn endpoint_url(host: &str, port: u16, path: &str) -> Result<Url> {
    let mut url = Url::parse(&format!("wss://{}:{}", host, port)).map_err(|e| {
        ProxyError::config_error(format!("Invalid endpoint {}:{}: {}", host, port, e))
    })?;
    if !path.is_empty() {
        url.set_path(path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        let url = endpoint_url("127.0.0.1", 8443, "").unwrap();
        assert_eq!(url.as_str(), "wss://127.0.0.1:8443/");

        let url = endpoint_url("center.local", 9000, "/ws/edge").unwrap();
        assert_eq!(url.host_str(), Some("center.local"));
        assert_eq!(url.port(), Some(9000));
        assert_eq!(url.path(), "/ws/edge");

        // wss 默认端口不出现在 URL 中
        assert_eq!(endpoint_url("center", 443, "").unwrap().as_str(), "wss://center/");
    }

    #[test]
    fn test_endpoint_url_rejects_bad_host() {
        let err = endpoint_url("bad host", 8443, "").unwrap_err();
        assert!(err.is_config_error());
    }
}
