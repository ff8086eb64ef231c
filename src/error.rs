use crate::task::TaskId;
use thiserror::Error;

/// 定时器错误类型
///
/// 只在边界操作（add / remove / modify / postpone / advance_ticks / 配置构建）中返回，
/// 时间轮推进的热路径不会产生错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    /// 参数不合法（间隔为 0、执行次数为 0 等）
    #[error("参数不合法: {reason}")]
    InvalidArgument { reason: &'static str },

    /// 任务 ID 不存在
    #[error("定时器 {0} 不存在")]
    NotFound(TaskId),

    /// 定时器已失效（已删除或执行次数已耗尽）
    #[error("定时器 {0} 已失效")]
    InvalidState(TaskId),

    /// 任务 ID 已耗尽，不会回绕复用旧 ID
    #[error("定时器 ID 已耗尽")]
    IdSpaceExhausted,

    /// 配置无效
    #[error("配置项 {field} 无效: {reason}")]
    InvalidConfiguration { field: String, reason: String },
}

/// 本 crate 的 Result 别名
pub type Result<T> = std::result::Result<T, TimerError>;
