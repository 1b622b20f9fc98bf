use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{ConfigValidator, ProxyConfig, ReconnectPolicy};
use crate::tls::TlsInfo;

/// 代理运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Server,
    Client,
}

/// `[proxy]` 段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    pub mode: ProxyMode,
    /// 逻辑名称（客户端作为 clientName 发送）
    pub name: String,
    pub host: String,
    pub port: u16,
    /// 客户端连接的 URL 路径
    #[serde(default)]
    pub path: String,
    /// 客户端上报的真实 IP
    #[serde(default)]
    pub real_ip: Option<Ipv4Addr>,
    /// 服务端最大并发连接数
    #[serde(default)]
    pub max_connections: Option<usize>,
}

/// `[tls]` 段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub ca: Option<PathBuf>,
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default = "default_verify_peer")]
    pub verify_peer: bool,
}

fn default_verify_peer() -> bool {
    true
}

/// `[limits]` 段，省略或为 0 的项使用默认值
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default)]
    pub header_size: usize,
    #[serde(default)]
    pub read_timeout_secs: u64,
    #[serde(default)]
    pub write_timeout_secs: u64,
    #[serde(default)]
    pub read_header_timeout_secs: u64,
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(default)]
    pub heartbeat_timeout_secs: Option<u64>,
    #[serde(default)]
    pub reconnect_interval_secs: Option<u64>,
    #[serde(default)]
    pub max_backoff_secs: Option<u64>,
}

/// `[rps_limiter]` 段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpsSettings {
    pub rps: f64,
    pub burst: u32,
}

/// `[bandwidth_limiter]` 段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthSettings {
    pub max_throughput: u64,
    pub period_ms: u64,
    #[serde(default)]
    pub reserve_rate: Option<f64>,
}

/// 配置文件格式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    pub proxy: ProxySection,
    pub tls: TlsSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub rps_limiter: Option<RpsSettings>,
    #[serde(default)]
    pub bandwidth_limiter: Option<BandwidthSettings>,
}

impl ProxySettings {
    /// 从 TOML 文件加载
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let settings: ProxySettings =
            toml::from_str(content).context("Failed to parse proxy configuration")?;
        settings
            .validate()
            .context("Configuration validation failed")?;
        Ok(settings)
    }

    /// 不涉及文件系统的静态检查
    pub fn validate(&self) -> crate::Result<()> {
        ConfigValidator::validate_name(&self.proxy.name)?;
        match self.proxy.mode {
            ProxyMode::Server => {
                ConfigValidator::validate_listen_addr(&self.proxy.host, self.proxy.port)?;
            }
            ProxyMode::Client => {
                ConfigValidator::validate_serial_number(&self.proxy.name)?;
                ConfigValidator::validate_port(self.proxy.port, "proxy.port")?;
            }
        }
        if self.proxy.max_connections == Some(0) {
            return Err(crate::ProxyError::config_error(
                "proxy.max_connections must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn tls_info(&self) -> TlsInfo {
        TlsInfo {
            ca_path: self.tls.ca.as_deref().map(expand).unwrap_or_default(),
            cert_path: expand(&self.tls.cert),
            key_path: expand(&self.tls.key),
            verify_peer: self.tls.verify_peer,
        }
    }

    /// 转换为运行期配置（会读取 TLS 文件）
    pub fn into_config(self) -> crate::Result<ProxyConfig> {
        let tls_info = self.tls_info();
        let mut config = ProxyConfig::initialize_with_path(
            self.proxy.name,
            self.proxy.host,
            self.proxy.port,
            &tls_info,
            &self.proxy.path,
        )?;

        let limits = &self.limits;
        config.set_size_limit(limits.header_size);
        config.set_timeout(
            Duration::from_secs(limits.read_timeout_secs),
            Duration::from_secs(limits.write_timeout_secs),
            Duration::from_secs(limits.read_header_timeout_secs),
        );

        let heartbeat = config.heartbeat();
        config.set_heartbeat(
            limits
                .heartbeat_interval_secs
                .map_or(heartbeat.interval, Duration::from_secs),
            limits
                .heartbeat_timeout_secs
                .map_or(heartbeat.timeout, Duration::from_secs),
        )?;

        let mut policy = ReconnectPolicy::default();
        if let Some(secs) = limits.reconnect_interval_secs {
            policy.reconnect_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = limits.max_backoff_secs {
            policy.max_backoff = Duration::from_secs(secs);
        }
        config.set_reconnect_policy(policy)?;

        if let Some(rps) = &self.rps_limiter {
            config.set_rps_limiter_cfg(rps.rps, rps.burst)?;
        }
        if let Some(bw) = &self.bandwidth_limiter {
            config.set_bandwidth_limiter_cfg(
                bw.max_throughput,
                Duration::from_millis(bw.period_ms),
                bw.reserve_rate,
            )?;
        }
        if let Some(ip) = self.proxy.real_ip {
            config.set_real_ip(ip);
        }

        Ok(config)
    }
}

/// 展开路径中的 `~`
fn expand(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
}
