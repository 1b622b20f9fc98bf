use crate::error::{ProxyError, Result};
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

use super::ReconnectPolicy;

const SERIAL_NUMBER_PATTERN: &str = r"^[a-zA-Z0-9]([-_a-zA-Z0-9]{0,62}[a-zA-Z0-9])?$";

fn serial_number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SERIAL_NUMBER_PATTERN).expect("serial number pattern is valid"))
}

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证名称不为空
    pub fn validate_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(ProxyError::config_error("name cannot be empty"));
        }
        Ok(())
    }

    /// 序列号：字母数字开头结尾，中间允许 `-` 和 `_`，最长 64 个字符
    pub fn is_valid_serial_number(sn: &str) -> bool {
        serial_number_regex().is_match(sn)
    }

    pub fn validate_serial_number(sn: &str) -> Result<()> {
        if !Self::is_valid_serial_number(sn) {
            return Err(ProxyError::config_error(format!(
                "invalid serial number: {:?}",
                sn
            )));
        }
        Ok(())
    }

    /// 验证 IPv4 点分十进制地址
    pub fn parse_ipv4(addr: &str) -> Result<Ipv4Addr> {
        addr.parse::<Ipv4Addr>()
            .map_err(|_| ProxyError::config_error(format!("invalid IPv4 address: {:?}", addr)))
    }

    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            return Err(ProxyError::config_error(format!(
                "{}: port cannot be 0",
                context
            )));
        }
        Ok(())
    }

    /// 服务端监听地址：必须是 IPv4 且端口非零
    pub fn validate_listen_addr(host: &str, port: u16) -> Result<Ipv4Addr> {
        let ip = Self::parse_ipv4(host)?;
        Self::validate_port(port, "listen address")?;
        Ok(ip)
    }

    pub fn validate_heartbeat(interval: Duration, timeout: Duration) -> Result<()> {
        if interval.is_zero() || timeout.is_zero() {
            return Err(ProxyError::config_error(
                "heartbeat interval and timeout must be greater than 0",
            ));
        }
        if timeout <= interval {
            warn!(
                "heartbeat timeout ({:?}) is not greater than interval ({:?}), \
                 peers may be dropped between two pings",
                timeout, interval
            );
        }
        Ok(())
    }

    pub fn validate_reconnect_policy(policy: &ReconnectPolicy) -> Result<()> {
        if policy.reconnect_interval.is_zero() {
            return Err(ProxyError::config_error(
                "reconnect interval must be greater than 0",
            ));
        }
        if policy.initial_backoff.is_zero() {
            return Err(ProxyError::config_error(
                "initial backoff must be greater than 0",
            ));
        }
        if policy.max_backoff < policy.initial_backoff {
            return Err(ProxyError::config_error(format!(
                "max backoff ({:?}) cannot be less than initial backoff ({:?})",
                policy.max_backoff, policy.initial_backoff
            )));
        }
        Ok(())
    }
}
