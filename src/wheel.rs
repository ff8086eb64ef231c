//! 分层时间轮存储
//!
//! 所有槽位存放在一个扁平数组中，按层级划分：
//!
//! | 层级 | 槽位数 | 单个槽位跨度（tick） |
//! |---|---|---|
//! | 0 | 256 | 1 |
//! | 1 | 64 | 2^8 |
//! | 2 | 64 | 2^14 |
//! | 3 | 64 | 2^20 |
//! | 4 | 64 | 2^26 |
//!
//! 槽位数都是 2 的幂次方，定位只需要移位和掩码。
//! 槽位内部按插入顺序保存任务 ID，删除时置为空位（O(1)），
//! 配合代数（generation）校验拒绝过期句柄。

use crate::task::TaskId;
use smallvec::SmallVec;
use std::mem;
use std::time::Duration;

/// 默认 tick 时长
pub const DEFAULT_TICK_DURATION: Duration = Duration::from_millis(10);

/// 层级数量
pub const LEVELS: usize = 5;

const LEVEL0_BITS: u32 = 8;
const LEVEL_BITS: u32 = 6;

/// 第 0 层槽位数
pub const LEVEL0_SLOTS: usize = 1 << LEVEL0_BITS;

/// 第 1~4 层每层槽位数
pub const LEVEL_SLOTS: usize = 1 << LEVEL_BITS;

const LEVEL0_MASK: u64 = (LEVEL0_SLOTS - 1) as u64;
const LEVEL_MASK: u64 = (LEVEL_SLOTS - 1) as u64;

/// 可表示的最大跨度（tick），超出的到期时间会被截断
pub const MAX_SPAN_TICKS: u64 = u32::MAX as u64;

/// 槽位总数
pub const TOTAL_SLOTS: usize = LEVEL0_SLOTS + (LEVELS - 1) * LEVEL_SLOTS;

/// 空位数超过该值且多于有效项时压缩槽位
const COMPACT_THRESHOLD: usize = 32;

pub(crate) type SlotEntries = SmallVec<[Option<TaskId>; 4]>;

/// 第 `level` 层槽位的位移量
#[inline]
pub const fn level_shift(level: usize) -> u32 {
    if level == 0 {
        0
    } else {
        LEVEL0_BITS + (level as u32 - 1) * LEVEL_BITS
    }
}

/// 第 `level` 层单个槽位覆盖的 tick 范围起点对齐单位，同时也是进入该层的最小跨度
#[inline]
pub const fn level_granularity(level: usize) -> u64 {
    1u64 << level_shift(level)
}

/// 计算 `tick` 在第 `level` 层的槽位下标
#[inline]
pub const fn level_index(level: usize, tick: u64) -> usize {
    if level == 0 {
        (tick & LEVEL0_MASK) as usize
    } else {
        ((tick >> level_shift(level)) & LEVEL_MASK) as usize
    }
}

/// 按跨度选择层级
#[inline]
pub const fn level_for_span(span: u64) -> usize {
    let mut level = 1;
    while level < LEVELS {
        if span < level_granularity(level) {
            return level - 1;
        }
        level += 1;
    }
    LEVELS - 1
}

#[inline]
const fn flat_index(level: usize, index: usize) -> usize {
    if level == 0 {
        index
    } else {
        LEVEL0_SLOTS + (level - 1) * LEVEL_SLOTS + index
    }
}

#[inline]
const fn split_flat(flat: usize) -> (usize, usize) {
    if flat < LEVEL0_SLOTS {
        (0, flat)
    } else {
        let rest = flat - LEVEL0_SLOTS;
        (rest / LEVEL_SLOTS + 1, rest % LEVEL_SLOTS)
    }
}

/// 槽位句柄：槽位、槽内位置、写入时的槽位代数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotHandle {
    pub slot: u16,
    pub position: u32,
    pub generation: u32,
}

impl SlotHandle {
    /// 所在的 (层级, 下标)
    pub fn location(&self) -> (usize, usize) {
        split_flat(self.slot as usize)
    }
}

/// 单个槽位
#[derive(Default)]
pub(crate) struct Slot {
    entries: SlotEntries,
    live: usize,
    generation: u32,
}

impl Slot {
    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[allow(dead_code)]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// 按插入顺序遍历有效任务
    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.entries.iter().flatten().copied()
    }

    fn dead(&self) -> usize {
        self.entries.len() - self.live
    }
}

/// 时间轮存储
pub(crate) struct Wheel {
    slots: Vec<Slot>,
    len: usize,
}

impl Wheel {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(TOTAL_SLOTS);
        slots.resize_with(TOTAL_SLOTS, Slot::default);
        Self { slots, len: 0 }
    }

    /// 驻留在所有槽位中的任务总数
    pub fn len(&self) -> usize {
        self.len
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn slot_at(&self, level: usize, index: usize) -> &Slot {
        &self.slots[flat_index(level, index)]
    }

    /// 追加到槽位末尾，返回句柄
    #[inline]
    pub fn insert(&mut self, id: TaskId, level: usize, index: usize) -> SlotHandle {
        debug_assert!(level < LEVELS);
        debug_assert!(index < if level == 0 { LEVEL0_SLOTS } else { LEVEL_SLOTS });

        let flat = flat_index(level, index);
        let slot = &mut self.slots[flat];
        let position = slot.entries.len() as u32;
        slot.entries.push(Some(id));
        slot.live += 1;
        self.len += 1;

        SlotHandle {
            slot: flat as u16,
            position,
            generation: slot.generation,
        }
    }

    /// 按句柄移除任务
    ///
    /// 句柄过期（槽位已被整体取走或压缩）或位置上不是该任务时什么也不做，返回 false。
    #[inline]
    pub fn remove(&mut self, handle: SlotHandle, id: TaskId) -> bool {
        let slot = &mut self.slots[handle.slot as usize];
        if slot.generation != handle.generation {
            return false;
        }

        let position = handle.position as usize;
        match slot.entries.get_mut(position) {
            Some(entry) if *entry == Some(id) => *entry = None,
            _ => return false,
        }
        slot.live -= 1;
        self.len -= 1;

        // 尾部空位直接弹出
        while let Some(None) = slot.entries.last() {
            slot.entries.pop();
        }
        true
    }

    /// 把槽位内容与空的 `scratch` 交换
    ///
    /// 返回 (扁平下标, 交换前的代数)。交换后槽位代数加一，
    /// 指向旧内容的句柄全部失效。
    #[inline]
    pub fn swap_slot(
        &mut self,
        level: usize,
        index: usize,
        scratch: &mut SlotEntries,
    ) -> (u16, u32) {
        debug_assert!(scratch.is_empty());

        let flat = flat_index(level, index);
        let slot = &mut self.slots[flat];
        let generation = slot.generation;
        mem::swap(&mut slot.entries, scratch);
        self.len -= slot.live;
        slot.live = 0;
        slot.generation = generation.wrapping_add(1);

        (flat as u16, generation)
    }

    /// 空位是否多到需要压缩
    pub fn needs_compaction(&self, flat: u16) -> bool {
        let slot = &self.slots[flat as usize];
        slot.dead() >= COMPACT_THRESHOLD && slot.dead() > slot.live
    }

    /// 去掉槽位中的空位，返回每个有效任务的新句柄
    pub fn compact(&mut self, flat: u16) -> Vec<(TaskId, SlotHandle)> {
        let slot = &mut self.slots[flat as usize];
        slot.entries.retain(|entry| entry.is_some());
        slot.generation = slot.generation.wrapping_add(1);

        let generation = slot.generation;
        slot.entries
            .iter()
            .flatten()
            .enumerate()
            .map(|(position, &id)| {
                (
                    id,
                    SlotHandle {
                        slot: flat,
                        position: position as u32,
                        generation,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> TaskId {
        TaskId::from_raw(raw)
    }

    #[test]
    fn test_level_index() {
        assert_eq!(level_index(0, 1000), 1000 & 255);
        assert_eq!(level_index(1, 1000), (1000 >> 8) & 63);
        assert_eq!(level_index(2, 1 << 14), 1);
        assert_eq!(level_index(3, 5 << 20), 5);
        assert_eq!(level_index(4, 63 << 26), 63);
        assert_eq!(level_index(4, 64 << 26), 0);
    }

    #[test]
    fn test_level_for_span() {
        assert_eq!(level_for_span(0), 0);
        assert_eq!(level_for_span(255), 0);
        assert_eq!(level_for_span(256), 1);
        assert_eq!(level_for_span((1 << 14) - 1), 1);
        assert_eq!(level_for_span(1 << 14), 2);
        assert_eq!(level_for_span((1 << 20) - 1), 2);
        assert_eq!(level_for_span(1 << 20), 3);
        assert_eq!(level_for_span((1 << 26) - 1), 3);
        assert_eq!(level_for_span(1 << 26), 4);
        assert_eq!(level_for_span(MAX_SPAN_TICKS), 4);
    }

    #[test]
    fn test_flat_index_roundtrip_bounds() {
        assert_eq!(TOTAL_SLOTS, 512);
        assert_eq!(split_flat(flat_index(0, 255)), (0, 255));
        assert_eq!(split_flat(flat_index(1, 0)), (1, 0));
        assert_eq!(split_flat(flat_index(4, 63)), (4, 63));
        assert_eq!(flat_index(4, 63), TOTAL_SLOTS - 1);
    }

    #[test]
    fn test_insert_keeps_fifo_order() {
        let mut wheel = Wheel::new();
        for raw in 1..=5 {
            wheel.insert(id(raw), 0, 7);
        }
        let ids: Vec<_> = wheel.slot_at(0, 7).ids().map(|id| id.as_u64()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(wheel.len(), 5);
    }

    #[test]
    fn test_remove_by_handle() {
        let mut wheel = Wheel::new();
        let h1 = wheel.insert(id(1), 2, 3);
        let h2 = wheel.insert(id(2), 2, 3);
        let h3 = wheel.insert(id(3), 2, 3);
        assert_eq!(h2.location(), (2, 3));

        assert!(wheel.remove(h2, id(2)));
        // 重复删除是空操作
        assert!(!wheel.remove(h2, id(2)));
        // 句柄与 ID 不匹配
        assert!(!wheel.remove(h1, id(3)));

        let ids: Vec<_> = wheel.slot_at(2, 3).ids().map(|id| id.as_u64()).collect();
        assert_eq!(ids, vec![1, 3]);

        assert!(wheel.remove(h3, id(3)));
        assert!(wheel.remove(h1, id(1)));
        assert!(wheel.slot_at(2, 3).is_empty());
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_swap_slot_invalidates_handles() {
        let mut wheel = Wheel::new();
        let handle = wheel.insert(id(1), 0, 0);
        wheel.insert(id(2), 0, 0);

        let mut scratch = SlotEntries::new();
        let (flat, generation) = wheel.swap_slot(0, 0, &mut scratch);
        assert_eq!(flat, 0);
        assert_eq!(generation, handle.generation);
        assert_eq!(scratch.len(), 2);
        assert!(wheel.is_empty());
        assert_eq!(wheel.slot_at(0, 0).generation(), generation + 1);

        // 旧句柄被拒绝
        assert!(!wheel.remove(handle, id(1)));

        // 新插入的任务拿到新代数
        let fresh = wheel.insert(id(3), 0, 0);
        assert_eq!(fresh.generation, generation + 1);
        assert_eq!(fresh.position, 0);
    }

    #[test]
    fn test_compaction() {
        let mut wheel = Wheel::new();
        let handles: Vec<_> = (1..=100).map(|raw| wheel.insert(id(raw), 1, 5)).collect();
        for (i, handle) in handles.iter().enumerate().take(90) {
            assert!(wheel.remove(*handle, id(i as u64 + 1)));
        }
        let flat = handles[0].slot;
        assert!(wheel.needs_compaction(flat));

        let moved = wheel.compact(flat);
        assert_eq!(moved.len(), 10);
        assert_eq!(moved[0].0, id(91));
        assert_eq!(moved[0].1.position, 0);
        assert!(!wheel.needs_compaction(flat));

        // 旧句柄失效，新句柄可用
        assert!(!wheel.remove(handles[95], id(96)));
        let (task_id, handle) = moved[5];
        assert_eq!(task_id, id(96));
        assert!(wheel.remove(handle, task_id));
        assert_eq!(wheel.len(), 9);
    }
}
