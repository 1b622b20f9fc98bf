use super::BandwidthLimiter;
use crate::error::{ProxyError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// 未指定或为负数时使用的预留比例
pub const DEFAULT_RESERVE_RATE: f64 = 0.5;

/// 共享带宽限制参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandwidthLimiterConfig {
    /// 每个窗口允许的最大字节数
    pub max_throughput: u64,
    /// 窗口长度
    #[serde(with = "duration_millis")]
    pub period: Duration,
    /// 为已注册对端平均预留的比例，取值 [0, 1)
    pub reserve_rate: f64,
}

impl BandwidthLimiterConfig {
    /// `reserve_rate` 为 None 或负数时取 [`DEFAULT_RESERVE_RATE`]
    pub fn new(max_throughput: u64, period: Duration, reserve_rate: Option<f64>) -> Result<Self> {
        if max_throughput == 0 {
            return Err(ProxyError::config_error(
                "max throughput must be greater than 0",
            ));
        }
        if period.is_zero() {
            return Err(ProxyError::config_error("period must be greater than 0"));
        }
        let reserve_rate = match reserve_rate {
            Some(rate) if rate >= 0.0 => rate,
            _ => DEFAULT_RESERVE_RATE,
        };
        if reserve_rate >= 1.0 {
            return Err(ProxyError::config_error(format!(
                "reserve rate must be in [0, 1), got {}",
                reserve_rate
            )));
        }
        Ok(Self {
            max_throughput,
            period,
            reserve_rate,
        })
    }

    fn shared_cap(&self) -> u64 {
        (self.max_throughput as f64 * (1.0 - self.reserve_rate)) as u64
    }

    fn reserved_cap(&self) -> u64 {
        self.max_throughput - self.shared_cap()
    }
}

#[derive(Debug, Default)]
struct PeerUsage {
    /// 注册次数，同名对端可能短暂重叠
    refs: usize,
    reserved_used: u64,
}

#[derive(Debug)]
struct Window {
    start: Instant,
    total_used: u64,
    shared_used: u64,
    peers: HashMap<String, PeerUsage>,
    stopped: bool,
}

impl Window {
    fn roll(&mut self, now: Instant, period: Duration) {
        if now.duration_since(self.start) >= period {
            self.start = now;
            self.total_used = 0;
            self.shared_used = 0;
            for usage in self.peers.values_mut() {
                usage.reserved_used = 0;
            }
        }
    }
}

/// 所有对端共享的带宽限制器
///
/// 每个窗口的额度分为两部分：`max_throughput * (1 - reserve_rate)` 为公共额度，
/// 先到先得；其余部分在已注册对端之间平分，保证繁忙对端不会把安静对端饿死。
/// 窗口在访问时惰性滚动，不需要后台任务。
#[derive(Debug)]
pub struct SharedBandwidthLimiter {
    config: BandwidthLimiterConfig,
    window: Mutex<Window>,
}

impl SharedBandwidthLimiter {
    pub fn new(config: BandwidthLimiterConfig) -> Self {
        Self {
            config,
            window: Mutex::new(Window {
                start: Instant::now(),
                total_used: 0,
                shared_used: 0,
                peers: HashMap::new(),
                stopped: false,
            }),
        }
    }

    pub fn config(&self) -> &BandwidthLimiterConfig {
        &self.config
    }

    /// 某个序列号当前的注册次数
    pub fn registered(&self, sn: &str) -> usize {
        self.window.lock().peers.get(sn).map_or(0, |u| u.refs)
    }

    /// 当前注册的对端数量
    pub fn peer_count(&self) -> usize {
        self.window.lock().peers.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.window.lock().stopped
    }

    fn allow_at(&self, sn: &str, len: usize, now: Instant) -> bool {
        let len = len as u64;
        let mut guard = self.window.lock();
        let window = &mut *guard;
        if window.stopped {
            return false;
        }
        window.roll(now, self.config.period);

        if window.total_used + len > self.config.max_throughput {
            return false;
        }

        let peer_count = window.peers.len() as u64;
        let per_peer_reserve = if peer_count == 0 {
            0
        } else {
            self.config.reserved_cap() / peer_count
        };

        if let Some(usage) = window.peers.get_mut(sn) {
            if usage.reserved_used + len <= per_peer_reserve {
                usage.reserved_used += len;
                window.total_used += len;
                return true;
            }
        }

        if window.shared_used + len <= self.config.shared_cap() {
            window.shared_used += len;
            window.total_used += len;
            return true;
        }

        false
    }
}

impl BandwidthLimiter for SharedBandwidthLimiter {
    fn register(&self, sn: &str) {
        let mut window = self.window.lock();
        window.peers.entry(sn.to_string()).or_default().refs += 1;
        debug!("Bandwidth limiter registered peer {}", sn);
    }

    fn unregister(&self, sn: &str) {
        let mut guard = self.window.lock();
        let window = &mut *guard;
        if let Some(usage) = window.peers.get_mut(sn) {
            usage.refs = usage.refs.saturating_sub(1);
            if usage.refs == 0 {
                window.peers.remove(sn);
            }
        }
        debug!("Bandwidth limiter unregistered peer {}", sn);
    }

    fn allow(&self, sn: &str, len: usize) -> bool {
        self.allow_at(sn, len, Instant::now())
    }

    /// 停止后拒绝所有请求并清空对端记录
    fn stop(&self) {
        let mut window = self.window.lock();
        window.stopped = true;
        window.peers.clear();
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
