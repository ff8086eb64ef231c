//! # 分层时间轮 tick 定时器
//!
//! 基于分层时间轮（Hierarchical Timing Wheel）算法实现的 tick 定时调度器，
//! 适合网络协议中大量重传、心跳、超时定时器的场景。
//!
//! ## 特性
//!
//! - **O(1) 插入和删除**: 五层时间轮，定位只需要移位和掩码
//! - **逐 tick 追赶**: 宿主推进不及时时逐个补齐错过的 tick，不丢失任何到期回调
//! - **回调内重入**: 回调可以通过 [`TimerContext`] 新增、删除、修改定时器（包括自身）
//! - **对象复用**: 执行完毕或被删除的定时器实体归还对象池
//! - **异步驱动**: 可选的 [`TimerDriver`] 基于 tokio 周期性推进调度器
//!
//! ## 快速开始
//!
//! ```
//! use kestrel_tick_timer::{RepeatPolicy, Scheduler};
//! use std::time::Duration;
//!
//! let mut scheduler: Scheduler<u32> = Scheduler::with_defaults();
//!
//! // 每 20ms 执行一次，最多 3 次
//! scheduler
//!     .add(
//!         Duration::from_millis(20),
//!         RepeatPolicy::Exactly(3),
//!         |ctx, hits| {
//!             *hits += 1;
//!             println!("定时器 {} 第 {} 次执行", ctx.task_id(), hits);
//!         },
//!         0,
//!     )
//!     .unwrap();
//!
//! // 宿主按墙钟时间推进
//! let epoch = scheduler.epoch();
//! let fired = scheduler.advance(epoch + Duration::from_millis(100));
//! assert_eq!(fired, 3);
//! assert!(scheduler.is_empty());
//! ```
//!
//! ## 架构说明
//!
//! ### 时间轮
//!
//! | 层级 | 槽位数 | 单个槽位跨度 | 覆盖范围（10ms tick） |
//! |---|---|---|---|
//! | 0 | 256 | 1 tick | 2.56 秒 |
//! | 1 | 64 | 2^8 tick | 约 2.7 分钟 |
//! | 2 | 64 | 2^14 tick | 约 2.9 小时 |
//! | 3 | 64 | 2^20 tick | 约 7.8 天 |
//! | 4 | 64 | 2^26 tick | 约 1.4 年 |
//!
//! 到期跨度超过 2^32-1 个 tick 的定时器会被截断到最大跨度。
//! 第 0 层指针每转一圈，更粗层级中以当前 tick 为起点的槽位被展开到更细的层级。
//!
//! ### 性能优化
//!
//! - 槽位使用 `SmallVec` 存放任务 ID，少量任务时不分配堆内存
//! - 使用 `FxHashMap`（rustc-hash）作为 ID 索引
//! - 删除只把槽位项置空，句柄携带槽位代数以拒绝过期句柄
//! - 驱动器使用 `parking_lot::Mutex` 共享调度器

mod config;
mod error;
mod pool;
mod scheduler;
mod task;
mod timer;
mod wheel;

// 重新导出公共 API
pub use config::{SchedulerConfig, SchedulerConfigBuilder, DEFAULT_BOUNDED_POOL_CAPACITY};
pub use error::{Result, TimerError};
pub use pool::{ObjectPool, Poolable};
pub use scheduler::{Scheduler, TimerContext, TimerUpdate};
pub use task::{RepeatPolicy, TaskId, TimerCallback};
pub use timer::TimerDriver;
pub use wheel::{
    level_for_span, level_index, DEFAULT_TICK_DURATION, LEVEL0_SLOTS, LEVELS, LEVEL_SLOTS,
    MAX_SPAN_TICKS,
};
