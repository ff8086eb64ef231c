use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::scheduler::{Scheduler, TimerContext, TimerUpdate};
use crate::task::{RepeatPolicy, TaskId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// 基于 tokio 的时间轮驱动器
///
/// 在后台任务中按 tick 时长周期性地推进调度器。调度器由
/// `Arc<parking_lot::Mutex<_>>` 共享，回调在持有锁的情况下执行，
/// 因此回调中只能通过 [`TimerContext`] 操作定时器，不能再调用驱动器的方法。
pub struct TimerDriver<P: Send + 'static = ()> {
    /// 调度器（使用 Arc<Mutex> 保证线程安全）
    scheduler: Arc<Mutex<Scheduler<P>>>,

    /// 后台 tick 循环任务句柄
    tick_handle: Option<JoinHandle<()>>,
}

impl<P: Send + 'static> TimerDriver<P> {
    /// 创建驱动器并启动后台 tick 循环
    ///
    /// 必须在 tokio 运行时中调用。
    ///
    /// # 示例
    /// ```no_run
    /// use kestrel_tick_timer::{SchedulerConfig, TimerDriver};
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let config = SchedulerConfig::builder()
    ///         .tick_duration(Duration::from_millis(5))
    ///         .build()
    ///         .unwrap();
    ///     let driver: TimerDriver<u64> = TimerDriver::new(config);
    /// }
    /// ```
    pub fn new(config: SchedulerConfig) -> Self {
        let tick_duration = config.tick_duration;
        let epoch = Instant::now().into_std();
        let scheduler = Arc::new(Mutex::new(Scheduler::with_epoch(config, epoch)));
        let scheduler_clone = Arc::clone(&scheduler);

        // 启动后台 tick 循环
        let tick_handle = tokio::spawn(async move {
            Self::tick_loop(scheduler_clone, tick_duration).await;
        });

        Self {
            scheduler,
            tick_handle: Some(tick_handle),
        }
    }

    /// 创建带默认配置的驱动器
    /// - tick 时长: 10ms
    /// - 对象池: 无界
    pub fn with_defaults() -> Self {
        Self::new(SchedulerConfig::default())
    }

    /// 新增定时器，参见 [`Scheduler::add`]
    ///
    /// # 示例
    /// ```no_run
    /// use kestrel_tick_timer::{RepeatPolicy, TimerDriver};
    /// use std::sync::atomic::{AtomicU32, Ordering};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let driver = TimerDriver::with_defaults();
    ///     let counter = Arc::new(AtomicU32::new(0));
    ///     let counter_clone = Arc::clone(&counter);
    ///
    ///     driver
    ///         .add(
    ///             Duration::from_millis(100),
    ///             RepeatPolicy::Exactly(3),
    ///             move |_ctx, _| {
    ///                 counter_clone.fetch_add(1, Ordering::SeqCst);
    ///             },
    ///             (),
    ///         )
    ///         .unwrap();
    ///
    ///     tokio::time::sleep(Duration::from_millis(500)).await;
    ///     println!("fired {} times", counter.load(Ordering::SeqCst));
    /// }
    /// ```
    pub fn add<F>(
        &self,
        interval: Duration,
        repeat: RepeatPolicy,
        callback: F,
        payload: P,
    ) -> Result<TaskId>
    where
        F: FnMut(&mut TimerContext<'_, P>, &mut P) + Send + 'static,
    {
        self.scheduler.lock().add(interval, repeat, callback, payload)
    }

    /// 新增只执行一次的延迟任务
    pub fn add_once<F>(&self, delay: Duration, callback: F, payload: P) -> Result<TaskId>
    where
        F: FnMut(&mut TimerContext<'_, P>, &mut P) + Send + 'static,
    {
        self.scheduler.lock().add_once(delay, callback, payload)
    }

    /// 删除定时器
    pub fn remove(&self, id: TaskId) -> Result<()> {
        self.scheduler.lock().remove(id)
    }

    /// 修改定时器
    pub fn modify(&self, id: TaskId, update: TimerUpdate<P>) -> Result<()> {
        self.scheduler.lock().modify(id, update)
    }

    /// 推迟定时器
    pub fn postpone(&self, id: TaskId, interval: Duration) -> Result<()> {
        self.scheduler.lock().postpone(id, interval)
    }

    /// 获取当前活跃的定时器数量
    pub fn task_count(&self) -> usize {
        self.scheduler.lock().task_count()
    }

    /// 共享的调度器句柄
    pub fn scheduler(&self) -> Arc<Mutex<Scheduler<P>>> {
        Arc::clone(&self.scheduler)
    }

    /// 核心 tick 循环
    async fn tick_loop(scheduler: Arc<Mutex<Scheduler<P>>>, tick_duration: Duration) {
        let mut interval = tokio::time::interval(tick_duration);
        // 错过的 tick 由调度器按流逝时间追赶，这里不需要补发
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let now = interval.tick().await;
            scheduler.lock().advance(now.into_std());
        }
    }

    /// 停止驱动器
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.tick_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl<P: Send + 'static> Drop for TimerDriver<P> {
    fn drop(&mut self) {
        if let Some(handle) = self.tick_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_driver_creation() {
        let driver: TimerDriver = TimerDriver::with_defaults();
        assert_eq!(driver.task_count(), 0);
        assert_eq!(
            driver.scheduler().lock().tick_duration(),
            Duration::from_millis(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_once() {
        let driver: TimerDriver = TimerDriver::with_defaults();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        driver
            .add_once(
                Duration::from_millis(50),
                move |_ctx, _| {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                },
                (),
            )
            .unwrap();

        // 等待定时器触发
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(driver.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_exactly() {
        let driver: TimerDriver = TimerDriver::with_defaults();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        driver
            .add(
                Duration::from_millis(20),
                RepeatPolicy::Exactly(3),
                move |_ctx, _| {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                },
                (),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_timer() {
        let driver: TimerDriver = TimerDriver::with_defaults();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let id = driver
            .add_once(
                Duration::from_millis(100),
                move |_ctx, _| {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                },
                (),
            )
            .unwrap();

        // 立即删除
        driver.remove(id).unwrap();
        assert_eq!(driver.remove(id), Err(TimerError::NotFound(id)));

        // 等待足够长时间确保定时器不会触发
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_postpone_through_driver() {
        let driver: TimerDriver = TimerDriver::with_defaults();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let id = driver
            .add_once(
                Duration::from_millis(50),
                move |_ctx, _| {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                },
                (),
            )
            .unwrap();
        driver.postpone(id, Duration::from_millis(300)).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modify_through_driver() {
        let driver: TimerDriver<u32> = TimerDriver::with_defaults();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let id = driver
            .add(
                Duration::from_millis(10),
                RepeatPolicy::Infinite,
                move |_ctx, step: &mut u32| {
                    counter_clone.fetch_add(*step, Ordering::SeqCst);
                },
                1,
            )
            .unwrap();

        driver
            .modify(id, TimerUpdate::new().repeat(RepeatPolicy::Exactly(2)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(driver.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_ticking() {
        let driver: TimerDriver = TimerDriver::with_defaults();
        let scheduler = driver.scheduler();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        driver
            .add(
                Duration::from_millis(10),
                RepeatPolicy::Infinite,
                move |_ctx, _| {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                },
                (),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(55)).await;
        driver.shutdown().await;
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 4);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), fired);
        assert_eq!(scheduler.lock().task_count(), 1);
    }
}
