use crate::error::{Result, TimerError};
use crate::pool::Poolable;
use crate::scheduler::TimerContext;
use crate::wheel::SlotHandle;
use std::fmt;

/// 定时器任务的唯一标识符
///
/// 由调度器按创建顺序单调递增分配，0 保留不用，运行期间永不复用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        TaskId(raw)
    }

    /// 获取任务 ID 的数值
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 定时器回调
///
/// 回调在推进时间轮的线程上同步执行，第一个参数是调度上下文（可以在回调中
/// 新增、删除、修改定时器），第二个参数是与回调绑定的用户数据。
pub type TimerCallback<P> = Box<dyn FnMut(&mut TimerContext<'_, P>, &mut P) + Send>;

/// 重复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatPolicy {
    /// 无限循环执行
    Infinite,
    /// 只执行一次
    Once,
    /// 精确执行 n 次（n 必须大于 0）
    Exactly(u32),
}

impl RepeatPolicy {
    /// 执行次数上限，`None` 表示无限
    pub fn bound(&self) -> Option<u32> {
        match self {
            RepeatPolicy::Infinite => None,
            RepeatPolicy::Once => Some(1),
            RepeatPolicy::Exactly(n) => Some(*n),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let RepeatPolicy::Exactly(0) = self {
            return Err(TimerError::InvalidArgument {
                reason: "执行次数必须为无限或大于 0",
            });
        }
        Ok(())
    }

    /// 已执行 `invocations` 次后是否还需要继续执行
    #[inline]
    pub fn continues_after(&self, invocations: u32) -> bool {
        match self.bound() {
            None => true,
            Some(bound) => invocations < bound,
        }
    }

    /// 相对 `previous` 是否放宽了执行次数（新上限更大，或为无限）
    pub fn widens(&self, previous: &RepeatPolicy) -> bool {
        match (self.bound(), previous.bound()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(new), Some(old)) => new > old,
        }
    }
}

/// 回调与用户数据的绑定，二者只能一起替换
pub(crate) struct Binding<P> {
    pub callback: TimerCallback<P>,
    pub payload: P,
}

impl<P> Binding<P> {
    pub fn new<F>(callback: F, payload: P) -> Self
    where
        F: FnMut(&mut TimerContext<'_, P>, &mut P) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
            payload,
        }
    }
}

/// 定时器实体
///
/// 处于有效状态且不在执行中时，恰好驻留在时间轮的一个槽位里；
/// 无效的实体不会驻留在任何槽位中，要么正在执行，要么等待归还对象池。
pub(crate) struct TimerTask<P> {
    pub id: TaskId,

    /// 下一次到期的绝对 tick
    pub due_tick: u64,

    /// 重新调度时追加的 tick 数
    pub interval_ticks: u64,

    pub repeat: RepeatPolicy,

    /// 已执行次数
    pub invocation_count: u32,

    /// 执行中或已回收时为 None
    pub binding: Option<Binding<P>>,

    pub valid: bool,

    /// 当前所在槽位，不驻留时为 None
    pub slot_handle: Option<SlotHandle>,
}

impl<P> TimerTask<P> {
    /// 初始化从对象池取出的实体
    pub fn init(
        &mut self,
        id: TaskId,
        due_tick: u64,
        interval_ticks: u64,
        repeat: RepeatPolicy,
        binding: Binding<P>,
    ) {
        self.id = id;
        self.due_tick = due_tick;
        self.interval_ticks = interval_ticks;
        self.repeat = repeat;
        self.invocation_count = 0;
        self.binding = Some(binding);
        self.valid = true;
        self.slot_handle = None;
    }

    /// 修改重复策略；放宽时清空执行次数
    pub fn set_repeat(&mut self, repeat: RepeatPolicy) {
        if repeat.widens(&self.repeat) {
            self.invocation_count = 0;
        }
        self.repeat = repeat;
    }
}

impl<P> Default for TimerTask<P> {
    fn default() -> Self {
        Self {
            id: TaskId(0),
            due_tick: 0,
            interval_ticks: 0,
            repeat: RepeatPolicy::Once,
            invocation_count: 0,
            binding: None,
            valid: false,
            slot_handle: None,
        }
    }
}

impl<P> Poolable for TimerTask<P> {
    fn reset(&mut self) {
        self.id = TaskId(0);
        self.due_tick = 0;
        self.interval_ticks = 0;
        self.repeat = RepeatPolicy::Once;
        self.invocation_count = 0;
        self.binding = None;
        self.valid = false;
        self.slot_handle = None;
    }
}
