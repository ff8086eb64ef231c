//! 分层时间轮调度器
//!
//! 调度器持有时间轮存储、tick 指针、ID 索引和延迟回收列表，实现插入、逐级展开
//! （cascade）、触发、删除、修改以及追赶式推进。
//!
//! - `current_tick`：时间轮指针，最近一个已经处理完毕的 tick
//! - `target_tick`：推进需要追赶到的 tick，由流逝的墙钟时间除以 tick 时长得到
//!
//! 每处理一个 tick：先把指针加一；如果第 0 层下标回绕到 0，把更粗层级中以该 tick
//! 为起点的槽位展开到更细的层级（粗层先展开）；然后把第 0 层对应槽位整体换出，
//! 依次执行其中的回调。tick 永远不会被跳过，否则会漏掉必需的展开步骤。

use crate::config::SchedulerConfig;
use crate::error::{Result, TimerError};
use crate::pool::ObjectPool;
use crate::task::{Binding, RepeatPolicy, TaskId, TimerTask};
use crate::wheel::{
    self, SlotEntries, SlotHandle, Wheel, LEVEL0_SLOTS, LEVELS, LEVEL_SLOTS, MAX_SPAN_TICKS,
};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// 定时器修改内容
///
/// 回调和用户数据只能成对替换，避免新回调收到旧数据。
///
/// # 示例
/// ```
/// use kestrel_tick_timer::{RepeatPolicy, TimerUpdate};
///
/// let update: TimerUpdate<u32> = TimerUpdate::new()
///     .repeat(RepeatPolicy::Exactly(10))
///     .callback(|_ctx, value| *value += 1, 0);
/// ```
pub struct TimerUpdate<P> {
    repeat: Option<RepeatPolicy>,
    binding: Option<Binding<P>>,
}

impl<P> TimerUpdate<P> {
    pub fn new() -> Self {
        Self {
            repeat: None,
            binding: None,
        }
    }

    /// 设置新的重复策略
    pub fn repeat(mut self, repeat: RepeatPolicy) -> Self {
        self.repeat = Some(repeat);
        self
    }

    /// 同时替换回调和用户数据
    pub fn callback<F>(mut self, callback: F, payload: P) -> Self
    where
        F: FnMut(&mut TimerContext<'_, P>, &mut P) + Send + 'static,
    {
        self.binding = Some(Binding::new(callback, payload));
        self
    }
}

impl<P> Default for TimerUpdate<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// 回调执行时的调度上下文
///
/// 回调可以通过它新增、删除、修改定时器，包括正在执行的定时器自身。
/// 这些修改只作用于时间轮中的槽位，不会影响当前正在处理的批次。
pub struct TimerContext<'a, P> {
    scheduler: &'a mut Scheduler<P>,
    task_id: TaskId,
}

impl<'a, P> TimerContext<'a, P> {
    /// 正在执行的定时器 ID
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// 正在处理的 tick
    pub fn current_tick(&self) -> u64 {
        self.scheduler.current_tick
    }

    /// 本次推进的目标 tick
    pub fn target_tick(&self) -> u64 {
        self.scheduler.target_tick
    }

    /// 活跃定时器数量
    pub fn task_count(&self) -> usize {
        self.scheduler.task_count()
    }

    /// 新增定时器，参见 [`Scheduler::add`]
    pub fn add<F>(
        &mut self,
        interval: Duration,
        repeat: RepeatPolicy,
        callback: F,
        payload: P,
    ) -> Result<TaskId>
    where
        F: FnMut(&mut TimerContext<'_, P>, &mut P) + Send + 'static,
    {
        self.scheduler.add(interval, repeat, callback, payload)
    }

    /// 以 tick 为单位新增定时器，参见 [`Scheduler::add_ticks`]
    pub fn add_ticks<F>(
        &mut self,
        ticks: u64,
        repeat: RepeatPolicy,
        callback: F,
        payload: P,
    ) -> Result<TaskId>
    where
        F: FnMut(&mut TimerContext<'_, P>, &mut P) + Send + 'static,
    {
        self.scheduler.add_ticks(ticks, repeat, callback, payload)
    }

    /// 删除定时器，参见 [`Scheduler::remove`]
    pub fn remove(&mut self, id: TaskId) -> Result<()> {
        self.scheduler.remove(id)
    }

    /// 修改定时器，参见 [`Scheduler::modify`]
    pub fn modify(&mut self, id: TaskId, update: TimerUpdate<P>) -> Result<()> {
        self.scheduler.modify(id, update)
    }

    /// 推迟定时器，参见 [`Scheduler::postpone`]
    pub fn postpone(&mut self, id: TaskId, interval: Duration) -> Result<()> {
        self.scheduler.postpone(id, interval)
    }

    /// 取消正在执行的定时器自身
    pub fn cancel(&mut self) -> Result<()> {
        self.scheduler.remove(self.task_id)
    }
}

/// 分层时间轮调度器
///
/// 单线程使用：所有修改操作都需要 `&mut self`，跨线程共享时需要外部加锁
/// （参见 [`TimerDriver`](crate::TimerDriver)）。
///
/// # 示例
/// ```
/// use kestrel_tick_timer::{RepeatPolicy, Scheduler};
/// use std::time::Duration;
///
/// let mut scheduler: Scheduler<u32> = Scheduler::with_defaults();
/// let id = scheduler
///     .add(Duration::from_millis(20), RepeatPolicy::Infinite, |_ctx, hits| *hits += 1, 0)
///     .unwrap();
///
/// let epoch = scheduler.epoch();
/// assert_eq!(scheduler.advance(epoch + Duration::from_millis(25)), 1);
/// assert_eq!(scheduler.advance(epoch + Duration::from_millis(45)), 1);
/// scheduler.remove(id).unwrap();
/// ```
pub struct Scheduler<P = ()> {
    wheel: Wheel,

    current_tick: u64,

    target_tick: u64,

    tick_duration: Duration,

    /// 计时起点
    epoch: Instant,

    /// ID 索引，持有所有有效实体
    tasks: FxHashMap<TaskId, TimerTask<P>>,

    /// 推进过程中被删除、等待归还对象池的实体
    deferred_release: Vec<TimerTask<P>>,

    pool: ObjectPool<TimerTask<P>>,

    /// 换出槽位时使用的临时批次，复用其内存
    scratch: SlotEntries,

    next_id: u64,

    advancing: bool,
}

impl<P> Scheduler<P> {
    /// 创建调度器，计时起点为当前时刻
    ///
    /// 配置参数已在 `SchedulerConfig::builder().build()` 中验证，因此此方法不会失败。
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_epoch(config, Instant::now())
    }

    /// 使用默认配置创建调度器
    /// - tick 时长: 10ms
    /// - 对象池: 无界
    pub fn with_defaults() -> Self {
        Self::new(SchedulerConfig::default())
    }

    /// 创建调度器并指定计时起点
    pub fn with_epoch(config: SchedulerConfig, epoch: Instant) -> Self {
        debug_assert!(!config.tick_duration.is_zero());

        Self {
            wheel: Wheel::new(),
            current_tick: 0,
            target_tick: 0,
            tick_duration: config.tick_duration,
            epoch,
            tasks: FxHashMap::default(),
            deferred_release: Vec::new(),
            pool: ObjectPool::with_limit(config.pool_capacity),
            scratch: SlotEntries::new(),
            next_id: 1,
            advancing: false,
        }
    }

    /// 时间轮指针：最近一个已处理完毕的 tick
    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    /// 推进需要追赶到的 tick
    pub fn target_tick(&self) -> u64 {
        self.target_tick
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// 活跃定时器数量
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 定时器是否仍然有效
    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// 定时器下一次到期的 tick
    pub fn due_tick(&self, id: TaskId) -> Option<u64> {
        self.tasks.get(&id).map(|task| task.due_tick)
    }

    /// 定时器已执行次数
    pub fn invocation_count(&self, id: TaskId) -> Option<u32> {
        self.tasks.get(&id).map(|task| task.invocation_count)
    }

    pub fn repeat_policy(&self, id: TaskId) -> Option<RepeatPolicy> {
        self.tasks.get(&id).map(|task| task.repeat)
    }

    /// 定时器当前所在的 (层级, 槽位下标)
    pub fn location(&self, id: TaskId) -> Option<(usize, usize)> {
        self.tasks
            .get(&id)
            .and_then(|task| task.slot_handle)
            .map(|handle| handle.location())
    }

    /// 按插入顺序列出某个槽位中的定时器
    ///
    /// # Panics
    /// `level` 或 `index` 越界时 panic。
    pub fn slot_tasks(&self, level: usize, index: usize) -> Vec<TaskId> {
        assert!(level < LEVELS, "层级越界: {}", level);
        let slots = if level == 0 { LEVEL0_SLOTS } else { LEVEL_SLOTS };
        assert!(index < slots, "第 {} 层槽位下标越界: {}", level, index);
        self.wheel.slot_at(level, index).ids().collect()
    }

    /// 驻留在时间轮槽位中的定时器数量
    pub fn resident_count(&self) -> usize {
        self.wheel.len()
    }

    /// 对象池中可复用的实体数量
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    /// 计算时长对应的 tick 数（向下取整，至少 1 个 tick）
    pub fn duration_to_ticks(&self, duration: Duration) -> u64 {
        let ticks = duration.as_nanos() / self.tick_duration.as_nanos();
        u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
    }

    /// 新增定时器
    ///
    /// # 参数
    /// - `interval`: 首次延迟，同时也是重复执行的间隔
    /// - `repeat`: 重复策略
    /// - `callback`: 回调
    /// - `payload`: 与回调绑定的用户数据
    ///
    /// # 返回
    /// - `Ok(TaskId)`: 新定时器的 ID
    /// - `Err(TimerError::InvalidArgument)`: 间隔为 0 或执行次数为 0
    pub fn add<F>(
        &mut self,
        interval: Duration,
        repeat: RepeatPolicy,
        callback: F,
        payload: P,
    ) -> Result<TaskId>
    where
        F: FnMut(&mut TimerContext<'_, P>, &mut P) + Send + 'static,
    {
        if interval.is_zero() {
            return Err(TimerError::InvalidArgument {
                reason: "定时器间隔必须大于 0",
            });
        }
        let ticks = self.duration_to_ticks(interval);
        self.add_ticks(ticks, repeat, callback, payload)
    }

    /// 新增只执行一次的延迟任务
    pub fn add_once<F>(&mut self, delay: Duration, callback: F, payload: P) -> Result<TaskId>
    where
        F: FnMut(&mut TimerContext<'_, P>, &mut P) + Send + 'static,
    {
        self.add(delay, RepeatPolicy::Once, callback, payload)
    }

    /// 以 tick 为单位新增定时器
    ///
    /// 到期 tick 从 `target_tick` 起算，推进过程中新增的定时器不会与已消费的 tick 错序。
    pub fn add_ticks<F>(
        &mut self,
        ticks: u64,
        repeat: RepeatPolicy,
        callback: F,
        payload: P,
    ) -> Result<TaskId>
    where
        F: FnMut(&mut TimerContext<'_, P>, &mut P) + Send + 'static,
    {
        if ticks == 0 {
            return Err(TimerError::InvalidArgument {
                reason: "定时器间隔必须大于 0",
            });
        }
        repeat.validate()?;
        let id = self.mint_id()?;

        let mut task = self.pool.acquire();
        let due_tick = self.target_tick.saturating_add(ticks);
        task.init(id, due_tick, ticks, repeat, Binding::new(callback, payload));
        Self::place(&mut self.wheel, self.current_tick, &mut task, false);

        trace!(task_id = %id, due_tick, ?repeat, "定时器已添加");
        self.tasks.insert(id, task);
        Ok(id)
    }

    /// 删除定时器
    ///
    /// 实体立即失效并从槽位中摘除；推进过程中的删除延迟到推进结束后归还对象池。
    pub fn remove(&mut self, id: TaskId) -> Result<()> {
        let mut task = self.tasks.remove(&id).ok_or(TimerError::NotFound(id))?;
        task.valid = false;

        if let Some(handle) = task.slot_handle.take() {
            if self.wheel.remove(handle, id) {
                self.compact_if_needed(handle.slot);
            }
        }

        if self.advancing {
            self.deferred_release.push(task);
        } else {
            self.pool.release(task);
        }
        debug!(task_id = %id, "定时器已删除");
        Ok(())
    }

    /// 修改定时器的重复策略和/或回调
    ///
    /// # 返回
    /// - `Err(TimerError::NotFound)`: 该 ID 从未由本调度器分配
    /// - `Err(TimerError::InvalidState)`: 定时器已被删除或执行完毕
    /// - `Err(TimerError::InvalidArgument)`: 新的重复策略不合法
    pub fn modify(&mut self, id: TaskId, update: TimerUpdate<P>) -> Result<()> {
        if let Some(repeat) = &update.repeat {
            repeat.validate()?;
        }
        let error = self.lookup_error(id);
        let task = self.tasks.get_mut(&id).ok_or(error)?;
        if !task.valid {
            return Err(TimerError::InvalidState(id));
        }

        if let Some(repeat) = update.repeat {
            task.set_repeat(repeat);
        }
        if let Some(binding) = update.binding {
            task.binding = Some(binding);
        }
        trace!(task_id = %id, "定时器已修改");
        Ok(())
    }

    /// 推迟定时器（保持原 TaskId）
    ///
    /// 新间隔同时作为之后重复执行的间隔，到期 tick 从 `target_tick` 重新计算。
    pub fn postpone(&mut self, id: TaskId, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(TimerError::InvalidArgument {
                reason: "定时器间隔必须大于 0",
            });
        }
        let ticks = self.duration_to_ticks(interval);
        self.postpone_ticks(id, ticks)
    }

    /// 以 tick 为单位推迟定时器
    pub fn postpone_ticks(&mut self, id: TaskId, ticks: u64) -> Result<()> {
        if ticks == 0 {
            return Err(TimerError::InvalidArgument {
                reason: "定时器间隔必须大于 0",
            });
        }
        let error = self.lookup_error(id);
        let task = self.tasks.get_mut(&id).ok_or(error)?;

        let old_slot = task.slot_handle.take().and_then(|handle| {
            self.wheel.remove(handle, id).then_some(handle.slot)
        });

        task.interval_ticks = ticks;
        task.due_tick = self.target_tick.saturating_add(ticks);
        Self::place(&mut self.wheel, self.current_tick, task, false);
        trace!(task_id = %id, due_tick = task.due_tick, "定时器已推迟");

        if let Some(slot) = old_slot {
            self.compact_if_needed(slot);
        }
        Ok(())
    }

    /// 按墙钟时间推进时间轮
    ///
    /// 目标 tick 为 `(now - epoch) / tick_duration`（向下取整），逐个处理
    /// `current_tick + 1 ..= target_tick` 中的每一个 tick。
    ///
    /// # 返回
    /// 本次推进中执行的回调次数
    pub fn advance(&mut self, now: Instant) -> usize {
        let elapsed = now.saturating_duration_since(self.epoch);
        let ticks = elapsed.as_nanos() / self.tick_duration.as_nanos();
        let ticks = u64::try_from(ticks).unwrap_or(u64::MAX);
        self.target_tick = self.target_tick.max(ticks);
        self.run_until_target()
    }

    /// 手动推进固定数量的 tick
    pub fn advance_ticks(&mut self, ticks: u64) -> Result<usize> {
        if ticks == 0 {
            return Err(TimerError::InvalidArgument {
                reason: "推进的 tick 数必须大于 0",
            });
        }
        self.target_tick = self.target_tick.saturating_add(ticks);
        Ok(self.run_until_target())
    }

    fn run_until_target(&mut self) -> usize {
        let start = self.current_tick;
        let mut fired = 0;

        self.advancing = true;
        while self.current_tick < self.target_tick {
            self.current_tick += 1;
            let tick = self.current_tick;
            self.cascade(tick);
            fired += self.fire_tick(tick);
        }
        self.advancing = false;

        let pool = &mut self.pool;
        for task in self.deferred_release.drain(..) {
            pool.release(task);
        }

        if self.current_tick > start {
            debug!(from = start, to = self.current_tick, fired, "时间轮推进完成");
        }
        fired
    }

    /// 第 0 层下标回绕到 0 时，把以 `tick` 为起点的粗层槽位展开到更细的层级
    fn cascade(&mut self, tick: u64) {
        if wheel::level_index(0, tick) != 0 {
            return;
        }

        let mut top = 1;
        while top + 1 < LEVELS && tick % wheel::level_granularity(top + 1) == 0 {
            top += 1;
        }

        for level in (1..=top).rev() {
            self.cascade_slot(level, wheel::level_index(level, tick));
        }
    }

    fn cascade_slot(&mut self, level: usize, index: usize) {
        let mut batch = mem::take(&mut self.scratch);
        let (slot, generation) = self.wheel.swap_slot(level, index, &mut batch);
        let current = self.current_tick;
        let mut moved = 0usize;

        for (position, entry) in batch.drain(..).enumerate() {
            let Some(id) = entry else { continue };
            let handle = SlotHandle {
                slot,
                position: position as u32,
                generation,
            };
            // 删除和推迟都会立即摘除槽位项，这里只剩有效的定时器
            let Some(task) = self.tasks.get_mut(&id) else { continue };
            if task.slot_handle != Some(handle) {
                continue;
            }
            debug_assert!(task.due_tick >= current, "展开时定时器 {} 已过期", id);

            Self::place(&mut self.wheel, current, task, true);
            debug_assert!(
                task.slot_handle
                    .map(|handle| handle.location().0 < level)
                    .unwrap_or(false),
                "展开后定时器 {} 没有落入更细的层级",
                id
            );
            moved += 1;
        }

        self.scratch = batch;
        if moved > 0 {
            trace!(level, index, moved, tick = current, "槽位已展开");
        }
    }

    /// 执行第 0 层 `tick` 对应槽位中的所有定时器
    fn fire_tick(&mut self, tick: u64) -> usize {
        // 先整体换出，回调中对时间轮的修改只会作用于空的活动槽位
        let mut batch = mem::take(&mut self.scratch);
        let (slot, generation) = self
            .wheel
            .swap_slot(0, wheel::level_index(0, tick), &mut batch);
        let mut fired = 0;

        for (position, entry) in batch.drain(..).enumerate() {
            let Some(id) = entry else { continue };
            let handle = SlotHandle {
                slot,
                position: position as u32,
                generation,
            };

            // 被同批次中更早的回调删除或推迟的定时器直接跳过
            let Some(task) = self.tasks.get_mut(&id) else { continue };
            if task.slot_handle != Some(handle) {
                continue;
            }
            debug_assert!(task.valid);
            debug_assert!(task.due_tick <= tick, "定时器 {} 提前触发", id);

            task.slot_handle = None;
            let Some(mut binding) = task.binding.take() else { continue };

            // 回调 panic 后记录日志，继续处理本批次
            let outcome = {
                let mut ctx = TimerContext {
                    scheduler: self,
                    task_id: id,
                };
                panic::catch_unwind(AssertUnwindSafe(|| {
                    (binding.callback)(&mut ctx, &mut binding.payload)
                }))
            };
            if let Err(cause) = outcome {
                error!(task_id = %id, tick, panic = panic_message(&*cause), "定时器回调 panic");
            }
            fired += 1;
            self.finish_firing(id, binding);
        }

        self.scratch = batch;
        fired
    }

    /// 回调执行后决定定时器是重新调度还是失效
    fn finish_firing(&mut self, id: TaskId, binding: Binding<P>) {
        let current = self.current_tick;
        let Some(task) = self.tasks.get_mut(&id) else {
            // 回调中删除了自身，实体已在延迟回收列表中
            return;
        };

        // 回调中替换过回调时丢弃旧的
        if task.binding.is_none() {
            task.binding = Some(binding);
        }
        task.invocation_count = task.invocation_count.saturating_add(1);

        // 回调中推迟过自身：保留新的位置，即使执行次数已用完也再执行一次
        if task.slot_handle.is_some() {
            return;
        }

        if task.repeat.continues_after(task.invocation_count) {
            task.due_tick = current.saturating_add(task.interval_ticks);
            Self::place(&mut self.wheel, current, task, false);
            return;
        }

        if let Some(mut task) = self.tasks.remove(&id) {
            task.valid = false;
            trace!(task_id = %id, invocations = task.invocation_count, "定时器执行完毕");
            self.pool.release(task);
        }
    }

    /// 把实体放入时间轮
    ///
    /// 层级由到期 tick 与时间轮指针的跨度决定。已到期的实体进入第 0 层：
    /// 展开过程中放入当前 tick 的槽位（本轮随即触发），否则放入下一个待处理 tick 的槽位。
    fn place(storage: &mut Wheel, current: u64, task: &mut TimerTask<P>, in_cascade: bool) {
        let overdue =
            task.due_tick < current || (task.due_tick == current && !in_cascade);

        let (level, index) = if overdue {
            let tick = if in_cascade { current } else { current + 1 };
            (0, wheel::level_index(0, tick))
        } else {
            let mut span = task.due_tick - current;
            if span > MAX_SPAN_TICKS {
                warn!(
                    task_id = %task.id,
                    span,
                    max = MAX_SPAN_TICKS,
                    "定时器跨度超出时间轮上限，已截断"
                );
                span = MAX_SPAN_TICKS;
                task.due_tick = current + MAX_SPAN_TICKS;
            }
            let level = wheel::level_for_span(span);
            (level, wheel::level_index(level, task.due_tick))
        };

        task.slot_handle = Some(storage.insert(task.id, level, index));
    }

    fn compact_if_needed(&mut self, slot: u16) {
        if !self.wheel.needs_compaction(slot) {
            return;
        }
        for (id, handle) in self.wheel.compact(slot) {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.slot_handle = Some(handle);
            }
        }
    }

    fn mint_id(&mut self) -> Result<TaskId> {
        let raw = self.next_id;
        self.next_id = raw.checked_add(1).ok_or(TimerError::IdSpaceExhausted)?;
        Ok(TaskId::from_raw(raw))
    }

    /// 查找失败时的错误：分配过的 ID 说明定时器已失效，否则不存在
    fn lookup_error(&self, id: TaskId) -> TimerError {
        let raw = id.as_u64();
        if raw != 0 && raw < self.next_id {
            TimerError::InvalidState(id)
        } else {
            TimerError::NotFound(id)
        }
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    if let Some(message) = cause.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message
    } else {
        "<非字符串 panic>"
    }
}
