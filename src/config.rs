// 代理配置模块：运行期的 ProxyConfig 与文件格式 ProxySettings

mod settings;
mod validator;

pub use settings::{
    BandwidthSettings, LimitSettings, ProxyMode, ProxySection, ProxySettings, RpsSettings,
    TlsSettings,
};
pub use validator::ConfigValidator;

use crate::error::{ProxyError, Result};
use crate::handler::{MessageHandler, RouteInfo};
use crate::limiter::{BandwidthLimiterConfig, RpsLimiterConfig};
use crate::tls::{TlsInfo, TlsMaterial};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 升级请求头默认大小上限（字节）
pub const DEFAULT_HEADER_SIZE_LIMIT: usize = 1024;
/// 默认读超时
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// 默认读请求头超时
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
/// 默认写超时
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// 默认 TLS / WebSocket 握手超时
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 心跳参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// 两次 Ping 之间的间隔
    pub interval: Duration,
    /// 超过该时长没有收到 Pong / Ping 即判定对端失联
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }
}

/// 客户端重连策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// 每次建连前的等待，给服务端留出就绪时间
    pub startup_delay: Duration,
    /// 重连守护任务检查连接状态的周期
    pub reconnect_interval: Duration,
    /// 拨号失败后的初始退避
    pub initial_backoff: Duration,
    /// 退避上限
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(3),
            reconnect_interval: Duration::from_secs(3),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(128),
        }
    }
}

/// 单个代理（服务端或客户端）的配置
///
/// 通过构造器方法在 `start` 之前修改；启动后只读。
/// 唯一的例外是 [`ProxyConfig::update_tls_ca`]，它追加到线程安全的 CA 池。
pub struct ProxyConfig {
    name: String,
    host: String,
    port: u16,
    url_path: String,
    tls: Arc<TlsMaterial>,
    handler: Option<Arc<dyn MessageHandler>>,
    header_size_limit: usize,
    read_timeout: Duration,
    read_header_timeout: Duration,
    write_timeout: Duration,
    handshake_timeout: Duration,
    rps_limiter_cfg: Option<RpsLimiterConfig>,
    bandwidth_limiter_cfg: Option<BandwidthLimiterConfig>,
    heartbeat: HeartbeatConfig,
    reconnect: ReconnectPolicy,
    real_ip: Option<Ipv4Addr>,
    /// 与代理生命周期绑定的取消信号，每次 start 重新创建
    scope: Mutex<CancellationToken>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("name", &self.name)
            .field("hosts", &self.hosts())
            .field("tls", &self.tls)
            .field("has_handler", &self.handler.is_some())
            .field("header_size_limit", &self.header_size_limit)
            .field("read_timeout", &self.read_timeout)
            .field("read_header_timeout", &self.read_header_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("rps_limiter_cfg", &self.rps_limiter_cfg)
            .field("bandwidth_limiter_cfg", &self.bandwidth_limiter_cfg)
            .field("heartbeat", &self.heartbeat)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

impl ProxyConfig {
    /// 创建配置并加载 TLS 材料
    pub fn initialize(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        tls_info: &TlsInfo,
    ) -> Result<Self> {
        Self::initialize_with_path(name, host, port, tls_info, "")
    }

    /// 创建配置，客户端可以附带 URL 路径
    pub fn initialize_with_path(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        tls_info: &TlsInfo,
        url_path: &str,
    ) -> Result<Self> {
        let name = name.into();
        let host = host.into();
        ConfigValidator::validate_name(&name)?;
        if host.trim().is_empty() {
            return Err(ProxyError::config_error("host cannot be empty"));
        }

        let tls = TlsMaterial::load(tls_info)?;
        let url_path = match url_path.trim() {
            "" => String::new(),
            p if p.starts_with('/') => p.to_string(),
            p => format!("/{}", p),
        };

        Ok(Self {
            name,
            host,
            port,
            url_path,
            tls: Arc::new(tls),
            handler: None,
            header_size_limit: DEFAULT_HEADER_SIZE_LIMIT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            read_header_timeout: DEFAULT_READ_HEADER_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            rps_limiter_cfg: None,
            bandwidth_limiter_cfg: None,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
            real_ip: None,
            scope: Mutex::new(CancellationToken::new()),
        })
    }

    /// 追加受信 CA：服务端扩充客户端 CA 池，客户端扩充根 CA 池
    pub fn update_tls_ca(&self, pem: &[u8]) -> Result<()> {
        self.tls.add_ca_pem(pem)
    }

    pub fn set_rps_limiter_cfg(&mut self, rps: f64, burst: u32) -> Result<()> {
        self.rps_limiter_cfg = Some(RpsLimiterConfig::new(rps, burst)?);
        Ok(())
    }

    /// `reserve_rate` 为 None 或负数时使用默认值 0.5
    pub fn set_bandwidth_limiter_cfg(
        &mut self,
        max_throughput: u64,
        period: Duration,
        reserve_rate: Option<f64>,
    ) -> Result<()> {
        self.bandwidth_limiter_cfg = Some(BandwidthLimiterConfig::new(
            max_throughput,
            period,
            reserve_rate,
        )?);
        Ok(())
    }

    /// 为零的值表示使用默认值
    pub fn set_timeout(&mut self, read: Duration, write: Duration, read_header: Duration) {
        self.read_timeout = or_default(read, DEFAULT_READ_TIMEOUT);
        self.write_timeout = or_default(write, DEFAULT_WRITE_TIMEOUT);
        self.read_header_timeout = or_default(read_header, DEFAULT_READ_HEADER_TIMEOUT);
    }

    /// 为零表示使用默认值 1024
    pub fn set_size_limit(&mut self, header_limit: usize) {
        self.header_size_limit = if header_limit == 0 {
            DEFAULT_HEADER_SIZE_LIMIT
        } else {
            header_limit
        };
    }

    pub fn set_handshake_timeout(&mut self, timeout: Duration) {
        self.handshake_timeout = or_default(timeout, DEFAULT_HANDSHAKE_TIMEOUT);
    }

    pub fn set_heartbeat(&mut self, interval: Duration, timeout: Duration) -> Result<()> {
        ConfigValidator::validate_heartbeat(interval, timeout)?;
        self.heartbeat = HeartbeatConfig { interval, timeout };
        Ok(())
    }

    pub fn set_reconnect_policy(&mut self, policy: ReconnectPolicy) -> Result<()> {
        ConfigValidator::validate_reconnect_policy(&policy)?;
        self.reconnect = policy;
        Ok(())
    }

    /// 客户端升级请求中携带的 X-Real-IP
    pub fn set_real_ip(&mut self, ip: Ipv4Addr) {
        self.real_ip = Some(ip);
    }

    pub fn set_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handler = Some(handler);
    }

    /// 把路由登记转交给消息处理器；未设置处理器时只记录日志
    pub fn register_handlers(&self, routes: &[RouteInfo]) -> Result<()> {
        let Some(handler) = self.handler.as_ref() else {
            warn!(
                "Proxy '{}' has no message handler, {} route(s) ignored",
                self.name,
                routes.len()
            );
            return Ok(());
        };
        for route in routes {
            handler.register(route.clone())?;
        }
        info!("Proxy '{}' registered {} route(s)", self.name, routes.len());
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url_path(&self) -> &str {
        &self.url_path
    }

    /// `host:port`，客户端附加 URL 路径
    pub fn hosts(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.url_path)
    }

    pub fn tls(&self) -> &Arc<TlsMaterial> {
        &self.tls
    }

    pub fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.clone()
    }

    pub fn header_size_limit(&self) -> usize {
        self.header_size_limit
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn read_header_timeout(&self) -> Duration {
        self.read_header_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn rps_limiter_cfg(&self) -> Option<RpsLimiterConfig> {
        self.rps_limiter_cfg
    }

    pub fn bandwidth_limiter_cfg(&self) -> Option<BandwidthLimiterConfig> {
        self.bandwidth_limiter_cfg
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        self.heartbeat
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect
    }

    pub fn real_ip(&self) -> Option<Ipv4Addr> {
        self.real_ip
    }

    /// 当前的代理生命周期信号
    pub fn scope(&self) -> CancellationToken {
        self.scope.lock().clone()
    }

    /// 取消旧的生命周期信号并换上新的
    pub(crate) fn renew_scope(&self) -> CancellationToken {
        let mut scope = self.scope.lock();
        scope.cancel();
        *scope = CancellationToken::new();
        scope.clone()
    }
}

fn or_default(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}
