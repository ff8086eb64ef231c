//! 调度器配置模块
//!
//! 提供调度器配置结构和 Builder 模式，用于配置 tick 时长和对象池容量。

use crate::error::TimerError;
use crate::wheel::DEFAULT_TICK_DURATION;
use std::time::Duration;

/// 有界对象池的默认容量（超出部分直接丢弃，不再复用）
pub const DEFAULT_BOUNDED_POOL_CAPACITY: usize = 1 << 8;

/// 调度器配置
///
/// # 示例
/// ```no_run
/// use kestrel_tick_timer::SchedulerConfig;
/// use std::time::Duration;
///
/// // 使用默认配置（10ms tick，无界对象池）
/// let config = SchedulerConfig::default();
///
/// // 使用 Builder 自定义配置
/// let config = SchedulerConfig::builder()
///     .tick_duration(Duration::from_millis(20))
///     .pool_capacity(1024)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// 每个 tick 的时间长度
    pub tick_duration: Duration,
    /// 对象池容量上限，`None` 表示无界
    pub pool_capacity: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_duration: DEFAULT_TICK_DURATION,
            pool_capacity: None,
        }
    }
}

impl SchedulerConfig {
    /// 创建配置构建器
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }
}

/// 调度器配置构建器
#[derive(Debug, Clone)]
pub struct SchedulerConfigBuilder {
    tick_duration: Duration,
    pool_capacity: Option<usize>,
}

impl Default for SchedulerConfigBuilder {
    fn default() -> Self {
        let config = SchedulerConfig::default();
        Self {
            tick_duration: config.tick_duration,
            pool_capacity: config.pool_capacity,
        }
    }
}

impl SchedulerConfigBuilder {
    /// 设置 tick 时长
    pub fn tick_duration(mut self, duration: Duration) -> Self {
        self.tick_duration = duration;
        self
    }

    /// 设置对象池容量上限
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    /// 使用有界对象池的默认容量
    pub fn bounded_pool(self) -> Self {
        self.pool_capacity(DEFAULT_BOUNDED_POOL_CAPACITY)
    }

    /// 使用无界对象池
    pub fn unbounded_pool(mut self) -> Self {
        self.pool_capacity = None;
        self
    }

    /// 构建配置并进行验证
    ///
    /// # 验证规则
    /// - tick_duration 必须大于 0
    /// - pool_capacity 如果设置，必须大于 0
    pub fn build(self) -> Result<SchedulerConfig, TimerError> {
        if self.tick_duration.is_zero() {
            return Err(TimerError::InvalidConfiguration {
                field: "tick_duration".to_string(),
                reason: "tick 时长必须大于 0".to_string(),
            });
        }

        if self.pool_capacity == Some(0) {
            return Err(TimerError::InvalidConfiguration {
                field: "pool_capacity".to_string(),
                reason: "对象池容量必须大于 0".to_string(),
            });
        }

        Ok(SchedulerConfig {
            tick_duration: self.tick_duration,
            pool_capacity: self.pool_capacity,
        })
    }
}
