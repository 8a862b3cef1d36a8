//! 帧缓冲池 (Frame Buffer Pool)
//!
//! 启动时一次性分配 C 个固定大小的槽位, 所有视频流共享.
//! 每个槽位保存一帧 letterbox 之后的 CHW f32 张量.
//!
//! 槽位状态: Free → Filled (acquire) → InFlight (进入批次) → Returned (release) → 可再次 acquire
//!
//! 句柄带代数 (generation), 每次归还 +1, 旧句柄再次归还即为重复释放,
//! 这是内部一致性错误, 会使整个池失效 (poisoned).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::PoolError;

/// 槽位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// 从未使用
    Free,
    /// 已被视频源获取并写入
    Filled,
    /// 属于一个正在推理的批次
    InFlight,
    /// 已归还, 可复用
    Returned,
}

impl SlotState {
    pub fn name(&self) -> &'static str {
        match self {
            SlotState::Free => "Free",
            SlotState::Filled => "Filled",
            SlotState::InFlight => "InFlight",
            SlotState::Returned => "Returned",
        }
    }

    fn is_available(&self) -> bool {
        matches!(self, SlotState::Free | SlotState::Returned)
    }
}

/// 槽位句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: u32,
    generation: u32,
}

impl SlotHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// `acquire` 结果; 池满不是错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Slot(SlotHandle),
    Busy,
}

/// 缓冲池统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub filled: usize,
    pub in_flight: usize,
    pub acquired_total: u64,
    pub released_total: u64,
}

#[derive(Debug, Clone, Copy)]
struct SlotMeta {
    state: SlotState,
    generation: u32,
}

struct PoolState {
    slots: Vec<SlotMeta>,
    free: VecDeque<u32>,
    poisoned: bool,
    acquired_total: u64,
    released_total: u64,
}

pub struct FramePool {
    state: Mutex<PoolState>,
    released: Condvar,
    buffers: Vec<Mutex<Vec<f32>>>,
    slot_len: usize,
}

impl FramePool {
    /// 分配 `capacity` 个槽位, 每个 `slot_len` 个 f32
    pub fn new(capacity: usize, slot_len: usize) -> Result<Self, PoolError> {
        let alloc_err = || PoolError::Allocation {
            capacity,
            slot_len,
        };
        if capacity == 0 || slot_len == 0 || capacity > u32::MAX as usize {
            return Err(alloc_err());
        }
        capacity.checked_mul(slot_len).ok_or_else(alloc_err)?;

        let mut buffers = Vec::new();
        buffers.try_reserve_exact(capacity).map_err(|_| alloc_err())?;
        for _ in 0..capacity {
            let mut buf: Vec<f32> = Vec::new();
            buf.try_reserve_exact(slot_len).map_err(|_| alloc_err())?;
            buf.resize(slot_len, 0.0);
            buffers.push(Mutex::new(buf));
        }

        let slots = vec![
            SlotMeta {
                state: SlotState::Free,
                generation: 0,
            };
            capacity
        ];
        Ok(Self {
            state: Mutex::new(PoolState {
                slots,
                free: (0..capacity as u32).collect(),
                poisoned: false,
                acquired_total: 0,
                released_total: 0,
            }),
            released: Condvar::new(),
            buffers,
            slot_len,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// 非阻塞获取一个槽位
    pub fn acquire(&self) -> Result<Acquire, PoolError> {
        let mut state = self.lock();
        Self::take_free(&mut state)
    }

    /// 等待最多 `timeout` 直到有槽位被归还
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Acquire, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            match Self::take_free(&mut state)? {
                Acquire::Busy => {}
                slot => return Ok(slot),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Acquire::Busy);
            }
            state = self
                .released
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|p| p.into_inner().0);
        }
    }

    fn take_free(state: &mut PoolState) -> Result<Acquire, PoolError> {
        if state.poisoned {
            return Err(PoolError::Poisoned);
        }
        let Some(index) = state.free.pop_front() else {
            return Ok(Acquire::Busy);
        };
        let meta = &mut state.slots[index as usize];
        if !meta.state.is_available() {
            state.poisoned = true;
            return Err(PoolError::InvalidState {
                index,
                expected: "Free",
                actual: meta.state.name(),
            });
        }
        meta.state = SlotState::Filled;
        let handle = SlotHandle {
            index,
            generation: meta.generation,
        };
        state.acquired_total += 1;
        Ok(Acquire::Slot(handle))
    }

    /// Filled → InFlight
    pub fn mark_in_flight(&self, handle: SlotHandle) -> Result<(), PoolError> {
        let mut state = self.lock();
        let meta = Self::meta_mut(&mut state, handle)?;
        match meta.state {
            SlotState::Filled => {
                meta.state = SlotState::InFlight;
                Ok(())
            }
            SlotState::InFlight => Ok(()),
            other => Err(PoolError::InvalidState {
                index: handle.index,
                expected: "Filled",
                actual: other.name(),
            }),
        }
    }

    /// 归还槽位; 重复归还使池失效
    pub fn release(&self, handle: SlotHandle) -> Result<(), PoolError> {
        let mut state = self.lock();
        let Some(meta) = state.slots.get_mut(handle.index as usize) else {
            state.poisoned = true;
            return Err(PoolError::StaleHandle {
                index: handle.index,
                generation: handle.generation,
            });
        };
        if meta.generation != handle.generation || meta.state.is_available() {
            state.poisoned = true;
            tracing::error!(
                slot = handle.index,
                generation = handle.generation,
                "❌ frame pool slot released twice, pool poisoned"
            );
            return Err(PoolError::DoubleRelease {
                index: handle.index,
                generation: handle.generation,
            });
        }
        meta.state = SlotState::Returned;
        meta.generation = meta.generation.wrapping_add(1);
        state.free.push_back(handle.index);
        state.released_total += 1;
        drop(state);
        self.released.notify_one();
        Ok(())
    }

    fn meta_mut(state: &mut PoolState, handle: SlotHandle) -> Result<&mut SlotMeta, PoolError> {
        match state.slots.get_mut(handle.index as usize) {
            Some(meta) if meta.generation == handle.generation => Ok(meta),
            _ => Err(PoolError::StaleHandle {
                index: handle.index,
                generation: handle.generation,
            }),
        }
    }

    fn check(&self, handle: SlotHandle, allowed: &[SlotState]) -> Result<(), PoolError> {
        let mut state = self.lock();
        let meta = Self::meta_mut(&mut state, handle)?;
        if allowed.contains(&meta.state) {
            Ok(())
        } else {
            Err(PoolError::InvalidState {
                index: handle.index,
                expected: allowed[0].name(),
                actual: meta.state.name(),
            })
        }
    }

    /// 写入槽位张量 (仅 Filled 状态)
    pub fn write<R>(
        &self,
        handle: SlotHandle,
        f: impl FnOnce(&mut [f32]) -> R,
    ) -> Result<R, PoolError> {
        self.check(handle, &[SlotState::Filled])?;
        let mut buf = self.buffers[handle.index as usize]
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        Ok(f(&mut buf))
    }

    /// 读取槽位张量 (Filled 或 InFlight)
    pub fn read<R>(&self, handle: SlotHandle, f: impl FnOnce(&[f32]) -> R) -> Result<R, PoolError> {
        self.check(handle, &[SlotState::InFlight, SlotState::Filled])?;
        let buf = self.buffers[handle.index as usize]
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        Ok(f(&buf))
    }

    pub fn state_of(&self, index: u32) -> Option<SlotState> {
        self.lock().slots.get(index as usize).map(|m| m.state)
    }

    pub fn is_poisoned(&self) -> bool {
        self.lock().poisoned
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let mut stats = PoolStats {
            capacity: state.slots.len(),
            acquired_total: state.acquired_total,
            released_total: state.released_total,
            ..Default::default()
        };
        for meta in &state.slots {
            match meta.state {
                SlotState::Free | SlotState::Returned => stats.free += 1,
                SlotState::Filled => stats.filled += 1,
                SlotState::InFlight => stats.in_flight += 1,
            }
        }
        stats
    }
}
