//! 定时器实体对象池
//!
//! 回收的实体在归还时被重置，下次申请时直接复用，避免频繁分配。

/// 可被对象池复用的类型
pub trait Poolable: Default {
    /// 把对象恢复到构造时的默认状态
    fn reset(&mut self);
}

/// 简单对象池
///
/// 默认无界；设置容量上限后，超出部分的对象直接丢弃。
/// 容量只影响内存占用，不影响行为。
#[derive(Debug)]
pub struct ObjectPool<T> {
    objects: Vec<T>,
    capacity_limit: Option<usize>,
}

impl<T: Poolable> ObjectPool<T> {
    /// 创建无界对象池
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            capacity_limit: None,
        }
    }

    /// 创建有界对象池
    pub fn bounded(limit: usize) -> Self {
        Self {
            objects: Vec::with_capacity(limit.min(1024)),
            capacity_limit: Some(limit),
        }
    }

    /// 按可选上限创建对象池
    pub fn with_limit(limit: Option<usize>) -> Self {
        match limit {
            Some(limit) => Self::bounded(limit),
            None => Self::new(),
        }
    }

    /// 申请一个对象：优先复用已回收的对象，否则新建
    #[inline]
    pub fn acquire(&mut self) -> T {
        self.objects.pop().unwrap_or_default()
    }

    /// 归还对象
    ///
    /// 对象会先被重置；有界池已满时直接丢弃。
    #[inline]
    pub fn release(&mut self, mut obj: T) {
        obj.reset();
        match self.capacity_limit {
            Some(limit) if self.objects.len() >= limit => {}
            _ => self.objects.push(obj),
        }
    }

    /// 当前池中可复用的对象数量
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// 容量上限
    pub fn capacity_limit(&self) -> Option<usize> {
        self.capacity_limit
    }
}

impl<T: Poolable> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
