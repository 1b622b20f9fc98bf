use super::RequestLimiter;
use crate::error::{ProxyError, Result};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

/// 令牌桶参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RpsLimiterConfig {
    /// 每秒补充的令牌数，可以是小数
    pub rps: f64,
    /// 桶容量
    pub burst: u32,
}

impl RpsLimiterConfig {
    pub fn new(rps: f64, burst: u32) -> Result<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return Err(ProxyError::config_error(format!(
                "rps must be greater than 0, got {}",
                rps
            )));
        }
        if burst == 0 {
            return Err(ProxyError::config_error("burst must be greater than 0"));
        }
        refill_period(rps)?;
        Ok(Self { rps, burst })
    }

    fn quota(&self) -> Result<Quota> {
        let burst = NonZeroU32::new(self.burst)
            .ok_or_else(|| ProxyError::config_error("burst must be greater than 0"))?;
        let period = refill_period(self.rps)?;
        Quota::with_period(period)
            .map(|q| q.allow_burst(burst))
            .ok_or_else(|| ProxyError::config_error(format!("rps {} is too large", self.rps)))
    }
}

/// 补充一个令牌的间隔，必须能用 `Duration` 表示且不为零
fn refill_period(rps: f64) -> Result<Duration> {
    let period = Duration::try_from_secs_f64(1.0 / rps).map_err(|_| {
        ProxyError::config_error(format!("rps {} is too small", rps))
    })?;
    if period.is_zero() {
        return Err(ProxyError::config_error(format!("rps {} is too large", rps)));
    }
    Ok(period)
}

/// 单个连接的请求速率限制器
#[derive(Debug)]
pub struct RpsLimiter {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
    config: RpsLimiterConfig,
}

impl RpsLimiter {
    pub fn new(config: RpsLimiterConfig) -> Result<Self> {
        let quota = config.quota()?;
        Ok(Self {
            inner: GovernorLimiter::direct(quota),
            config,
        })
    }

    pub fn config(&self) -> &RpsLimiterConfig {
        &self.config
    }
}

impl RequestLimiter for RpsLimiter {
    fn allow(&self) -> bool {
        self.inner.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(RpsLimiterConfig::new(0.0, 1).unwrap_err().is_config_error());
        assert!(RpsLimiterConfig::new(-1.0, 1).is_err());
        assert!(RpsLimiterConfig::new(f64::NAN, 1).is_err());
        assert!(RpsLimiterConfig::new(1.0, 0).is_err());
        assert!(RpsLimiterConfig::new(0.5, 1).is_ok());
    }

    #[test]
    fn test_extreme_rates_rejected() {
        assert!(RpsLimiterConfig::new(1e-300, 1).unwrap_err().is_config_error());
        assert!(RpsLimiterConfig::new(f64::MIN_POSITIVE, 1).is_err());
        assert!(RpsLimiterConfig::new(1e300, 1).unwrap_err().is_config_error());

        // 绕过构造函数的配置同样不会 panic
        let config = RpsLimiterConfig {
            rps: 1e-300,
            burst: 1,
        };
        assert!(RpsLimiter::new(config).unwrap_err().is_config_error());

        assert!(RpsLimiterConfig::new(0.001, 1).is_ok());
    }

    #[test]
    fn test_burst_then_deny() {
        let limiter = RpsLimiter::new(RpsLimiterConfig::new(1.0, 10).unwrap()).unwrap();

        // 前 10 个请求应该立即通过（burst）
        for _ in 0..10 {
            assert!(limiter.allow());
        }

        // 第 11 个请求应该被限流
        assert!(!limiter.allow());
    }

    #[tokio::test]
    async fn test_refill() {
        let limiter = RpsLimiter::new(RpsLimiterConfig::new(100.0, 2).unwrap()).unwrap();
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());

        // 100 rps 时 10ms 补充一个令牌
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.allow());
    }
}
