//! 按目标的熔断器
//!
//! Closed --连续 N 次失败--> Open --reset_timeout 到期--> HalfOpen（仅放行一次试探）
//! 试探成功回到 Closed，失败重新 Open 并重新计时。所有状态修改都在同一把锁内完成。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BreakerSection;
use crate::core::error::ProviderErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// Open 持续多久后进入 HalfOpen
    pub reset_timeout: Duration,
    /// 不计入熔断的错误类别（重试也不会好转的错误）
    pub excluded_kinds: Vec<ProviderErrorKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            excluded_kinds: vec![
                ProviderErrorKind::Authentication,
                ProviderErrorKind::InvalidRequest,
            ],
        }
    }
}

impl From<&BreakerSection> for CircuitBreakerConfig {
    fn from(section: &BreakerSection) -> Self {
        Self {
            failure_threshold: section.failure_threshold.max(1),
            reset_timeout: Duration::from_secs(section.reset_timeout_secs),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct CircuitStats {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    /// HalfOpen 下是否已有试探请求在途
    trial_in_flight: bool,
}

impl CircuitStats {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            opened_at_utc: None,
            last_failure: None,
            trial_in_flight: false,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_utc = Some(Utc::now());
        self.trial_in_flight = false;
    }
}

/// 对外可见的熔断状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// 熔断拒绝
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitRejected {
    pub state: CircuitState,
    /// 距离可以试探还有多久；HalfOpen 且试探在途时为 0
    pub retry_after: Duration,
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, CircuitStats>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitStats>> {
        self.circuits.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 调用前的准入检查；Open 到期时在此转为 HalfOpen 并占用唯一的试探名额
    pub fn try_acquire(&self, target: &str) -> Result<(), CircuitRejected> {
        let mut circuits = self.lock();
        let stats = circuits
            .entry(target.to_string())
            .or_insert_with(CircuitStats::new);

        match stats.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = stats.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    stats.state = CircuitState::HalfOpen;
                    stats.trial_in_flight = true;
                    info!(circuit = %target, "Circuit transitioned from OPEN to HALF-OPEN");
                    Ok(())
                } else {
                    Err(CircuitRejected {
                        state: CircuitState::Open,
                        retry_after: self.config.reset_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if stats.trial_in_flight {
                    debug!(circuit = %target, "Half-open trial already in flight, rejecting");
                    Err(CircuitRejected {
                        state: CircuitState::HalfOpen,
                        retry_after: Duration::ZERO,
                    })
                } else {
                    stats.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self, target: &str) {
        let mut circuits = self.lock();
        let stats = circuits
            .entry(target.to_string())
            .or_insert_with(CircuitStats::new);
        stats.consecutive_failures = 0;
        if stats.state != CircuitState::Closed {
            info!(circuit = %target, from = %stats.state, "Circuit closed after successful call");
            stats.state = CircuitState::Closed;
            stats.opened_at = None;
            stats.opened_at_utc = None;
        }
        stats.trial_in_flight = false;
    }

    pub fn record_failure(&self, target: &str) {
        let mut circuits = self.lock();
        let stats = circuits
            .entry(target.to_string())
            .or_insert_with(CircuitStats::new);
        stats.consecutive_failures += 1;
        stats.last_failure = Some(Utc::now());

        match stats.state {
            CircuitState::Closed => {
                if stats.consecutive_failures >= self.config.failure_threshold {
                    stats.open();
                    warn!(
                        circuit = %target,
                        failures = stats.consecutive_failures,
                        "Circuit transitioned from CLOSED to OPEN"
                    );
                }
            }
            CircuitState::HalfOpen => {
                stats.open();
                warn!(circuit = %target, "Half-open trial failed, circuit re-opened");
            }
            // 打开前已放行的调用晚到的失败，只计数
            CircuitState::Open => {}
        }
    }

    /// 该类别是否计入熔断
    pub fn is_excluded(&self, kind: ProviderErrorKind) -> bool {
        self.config.excluded_kinds.contains(&kind)
    }

    /// 不计入结果地归还 HalfOpen 试探名额（被排除的错误类别）
    pub fn release(&self, target: &str) {
        if let Some(stats) = self.lock().get_mut(target) {
            stats.trial_in_flight = false;
        }
    }

    pub fn state(&self, target: &str) -> CircuitState {
        self.lock()
            .get(target)
            .map(|s| s.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, target: &str) -> Option<CircuitSnapshot> {
        self.lock().get(target).map(|s| CircuitSnapshot {
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            opened_at: s.opened_at_utc,
            last_failure: s.last_failure,
        })
    }

    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.lock().keys().cloned().collect();
        targets.sort();
        targets
    }

    pub fn reset(&self, target: &str) {
        if let Some(stats) = self.lock().get_mut(target) {
            *stats = CircuitStats::new();
            info!(circuit = %target, "Circuit manually reset");
        }
    }
}
