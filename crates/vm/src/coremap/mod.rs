//! Coremap 模块
//!
//! 跟踪每个物理帧的状态，并为用户帧维护一条 FIFO 所有权队列，用于选择置换牺牲帧。
//!
//! ## 帧状态
//!
//! 每个帧恰好处于一种状态（见 [`FrameState`]）：
//!
//! - **Reserved**：内核镜像占用，永不分配
//! - **Untouched**：从未分配过的内存，位于“新内存池”中
//! - **Free**：释放后可复用
//! - **KernelHead / KernelTail**：内核多帧分配，长度记在首帧
//! - **User**：单帧用户分配，记录所属地址空间（弱引用）与虚拟页，并在 FIFO 队列中
//! - **Transit**：已经摘下、正在交给新主人（置换或刚从空闲帧中取出）
//!
//! ## 分配策略
//!
//! 内核分配：先在空闲帧中找连续的一段，再从新内存池中取。
//!
//! 用户分配：空闲帧 → 新内存池 → 置换。置换总是选 FIFO 队首，
//! 即最早分配的用户页，与访问频率无关。
//!
//! ## 锁
//!
//! 帧表、FIFO 队列和新内存池各有一把锁。需要同时持有时顺序固定为
//! 帧表 → 队列。换出 I/O 期间不持有任何锁：先在锁内摘下牺牲帧，
//! 解锁写交换区，再分别锁住属主页表和帧表提交结果。
//! 因此 FIFO 顺序只是近似的，其他 CPU 可以在中间插入新的分配。
//!
//! 刚分配的用户帧在内容装好之前处于“钉住”状态，置换会跳过它，
//! 由缺页处理在提交页表项后调用 [`Coremap::unpin`]。

mod queue;

pub use queue::OwnershipQueue;

use crate::address::{AlignOps, PAGE_SIZE, Paddr, UsizeConvert, Vaddr};
use crate::address_space::{AddressSpace, AsId};
use crate::arch_ops::{ArchVmOps, frame_mut};
use crate::error::{VmError, VmResult};
use crate::page_table::PteState;
use crate::stats::VmStats;
use crate::swap::SwapStore;
use crate::tlb::Tlb;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use sync::SpinLock;

/// 帧状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// 内核镜像占用
    Reserved,
    /// 从未分配
    Untouched,
    /// 已释放，可复用
    Free,
    /// 内核分配的首帧，`run` 为连续帧数
    KernelHead {
        /// 连续帧数
        run: usize,
    },
    /// 内核分配的后续帧
    KernelTail,
    /// 用户帧
    User,
    /// 正在交给新主人
    Transit,
}

#[derive(Debug, Clone)]
struct FrameOwner {
    id: AsId,
    space: Weak<AddressSpace>,
}

/// 被选中的置换帧：帧号、原属主和原虚拟页
type Victim = (usize, Option<FrameOwner>, Vaddr);

#[derive(Debug, Clone)]
struct CoremapEntry {
    state: FrameState,
    owner: Option<FrameOwner>,
    /// 用户帧对应的虚拟页
    vaddr: Vaddr,
    /// 内容尚未装好，不能被置换
    pinned: bool,
}

impl CoremapEntry {
    fn with_state(state: FrameState) -> Self {
        Self {
            state,
            owner: None,
            vaddr: Vaddr(0),
            pinned: false,
        }
    }
}

/// 从未分配过的内存 `[next, end)`
#[derive(Debug, Default)]
struct FreshRam {
    next: usize,
    end: usize,
}

/// 各状态的帧数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// 总帧数
    pub total: usize,
    /// 内核镜像占用
    pub reserved: usize,
    /// 从未分配
    pub untouched: usize,
    /// 已释放
    pub free: usize,
    /// 内核分配
    pub kernel: usize,
    /// 用户帧
    pub user: usize,
}

/// 物理帧表
pub struct Coremap {
    arch: &'static dyn ArchVmOps,
    active: AtomicBool,
    frames: SpinLock<Vec<CoremapEntry>>,
    queue: SpinLock<OwnershipQueue>,
    fresh: SpinLock<FreshRam>,
}

impl Coremap {
    /// 创建未激活的 coremap
    pub fn new(arch: &'static dyn ArchVmOps) -> Self {
        Self {
            arch,
            active: AtomicBool::new(false),
            frames: SpinLock::new(Vec::new()),
            queue: SpinLock::new(OwnershipQueue::default()),
            fresh: SpinLock::new(FreshRam::default()),
        }
    }

    /// 按物理内存布局建立帧表并激活
    ///
    /// `ram_first_free` 之前的帧视为内核镜像，永不分配。
    pub fn init(&self) {
        let nframes = self.arch.ram_size() / PAGE_SIZE;
        let first = Paddr(self.arch.ram_first_free())
            .align_up_to_page()
            .frame_index()
            .min(nframes);

        let table: Vec<CoremapEntry> = (0..nframes)
            .map(|i| {
                CoremapEntry::with_state(if i < first {
                    FrameState::Reserved
                } else {
                    FrameState::Untouched
                })
            })
            .collect();
        *self.frames.lock() = table;
        *self.queue.lock() = OwnershipQueue::with_capacity(nframes);
        *self.fresh.lock() = FreshRam {
            next: first,
            end: nframes,
        };
        self.active.store(true, Ordering::Release);
        log::info!(
            "coremap: {} frames, {} reserved by the kernel image",
            nframes,
            first
        );
    }

    /// 停用并丢弃帧表
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        *self.frames.lock() = Vec::new();
        *self.queue.lock() = OwnershipQueue::default();
        *self.fresh.lock() = FreshRam::default();
    }

    /// 是否已激活
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// 从新内存池中取 `n` 个连续帧
    fn steal(&self, n: usize) -> Option<usize> {
        let mut fresh = self.fresh.lock();
        if fresh.next + n > fresh.end {
            return None;
        }
        let first = fresh.next;
        fresh.next += n;
        Some(first)
    }

    fn mark_kernel_run(frames: &mut [CoremapEntry], first: usize, n: usize) {
        frames[first] = CoremapEntry::with_state(FrameState::KernelHead { run: n });
        for entry in &mut frames[first + 1..first + n] {
            *entry = CoremapEntry::with_state(FrameState::KernelTail);
        }
    }

    fn find_free_run(frames: &[CoremapEntry], n: usize) -> Option<usize> {
        let mut run = 0;
        for (i, entry) in frames.iter().enumerate() {
            if entry.state == FrameState::Free {
                run += 1;
                if run == n {
                    return Some(i + 1 - n);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// 为内核分配 `n` 个连续帧，返回首帧物理地址
    ///
    /// 先找连续的空闲帧，找不到再从新内存池中取。都失败时返回 `None`。
    pub fn reserve_frames(&self, n: usize) -> Option<Paddr> {
        if n == 0 || !self.is_active() {
            return None;
        }
        {
            let mut frames = self.frames.lock();
            if let Some(first) = Self::find_free_run(&frames, n) {
                Self::mark_kernel_run(&mut frames, first, n);
                return Some(Paddr::from_frame_index(first));
            }
        }
        let first = self.steal(n)?;
        Self::mark_kernel_run(&mut self.frames.lock(), first, n);
        Some(Paddr::from_frame_index(first))
    }

    /// 释放 [`Coremap::reserve_frames`] 分配的整段帧
    ///
    /// `paddr` 必须是某次分配返回的首帧地址。
    pub fn release_frames(&self, paddr: Paddr) {
        if !self.is_active() {
            return;
        }
        let index = paddr.frame_index();
        let mut frames = self.frames.lock();
        let state = frames.get(index).map(|e| e.state);
        debug_assert!(
            matches!(state, Some(FrameState::KernelHead { .. })),
            "coremap: release_frames({:?}) is not a run base ({:?})",
            paddr,
            state
        );
        let Some(FrameState::KernelHead { run }) = state else {
            log::warn!("coremap: ignoring release of {:?} in state {:?}", paddr, state);
            return;
        };
        for entry in &mut frames[index..index + run] {
            *entry = CoremapEntry::with_state(FrameState::Free);
        }
    }

    /// 在空闲帧中取一帧，标记为在途
    fn claim_free(&self) -> Option<usize> {
        let mut frames = self.frames.lock();
        let index = frames.iter().position(|e| e.state == FrameState::Free)?;
        frames[index].state = FrameState::Transit;
        Some(index)
    }

    /// 记录新主人并追加到 FIFO 队尾
    fn install_user(&self, index: usize, owner: FrameOwner, vaddr: Vaddr, pinned: bool) {
        let mut frames = self.frames.lock();
        let mut queue = self.queue.lock();
        debug_assert!(matches!(
            frames[index].state,
            FrameState::Transit | FrameState::Untouched
        ));
        frames[index] = CoremapEntry {
            state: FrameState::User,
            owner: Some(owner),
            vaddr,
            pinned,
        };
        queue.push_back(index);
    }

    /// 为 `space` 的虚拟页 `vaddr` 分配一个用户帧
    ///
    /// 依次尝试空闲帧、新内存池和置换。返回的帧处于钉住状态，
    /// 装好内容后需调用 [`Coremap::unpin`]。
    pub fn reserve_user_frame(
        &self,
        vaddr: Vaddr,
        space: &Arc<AddressSpace>,
        swap: &SwapStore,
        tlb: &Tlb,
        stats: &VmStats,
    ) -> VmResult<Paddr> {
        assert!(vaddr.is_page_aligned(), "coremap: unaligned user page {:?}", vaddr);
        if !self.is_active() {
            return Err(VmError::OutOfMemory);
        }
        let index = loop {
            if let Some(index) = self.claim_free().or_else(|| self.steal(1)) {
                break index;
            }
            match self.pick_victim()? {
                Some(victim) => break self.evict(victim, swap, tlb, stats)?,
                // 全部被钉住：等持有者装完内容后重试
                None => core::hint::spin_loop(),
            }
        };
        let owner = FrameOwner {
            id: space.id(),
            space: Arc::downgrade(space),
        };
        self.install_user(index, owner, vaddr, true);
        Ok(Paddr::from_frame_index(index))
    }

    /// 从队首摘下第一个未钉住的帧
    ///
    /// 队列为空时返回 [`VmError::OutOfMemory`]；全部帧都被钉住时返回 `None`，
    /// 由调用者释放锁后重试。
    fn pick_victim(&self) -> VmResult<Option<Victim>> {
        let mut frames = self.frames.lock();
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return Err(VmError::OutOfMemory);
        }
        for _ in 0..queue.len() {
            let Some(index) = queue.pop_front() else {
                break;
            };
            let entry = &mut frames[index];
            if entry.pinned {
                queue.push_back(index);
                continue;
            }
            entry.state = FrameState::Transit;
            let owner = entry.owner.take();
            let vaddr = core::mem::take(&mut entry.vaddr);
            return Ok(Some((index, owner, vaddr)));
        }
        Ok(None)
    }

    /// 置换出一个用户帧，返回可以直接复用的帧号
    fn evict(
        &self,
        (victim, owner, vaddr): Victim,
        swap: &SwapStore,
        tlb: &Tlb,
        stats: &VmStats,
    ) -> VmResult<usize> {
        let paddr = Paddr::from_frame_index(victim);
        tlb.invalidate_frame(paddr);

        let Some(space) = owner.as_ref().and_then(|o| o.space.upgrade()) else {
            // 属主已经不存在，内容无需保存
            log::debug!("coremap: evicting orphan frame {:?}", paddr);
            return Ok(victim);
        };

        // SAFETY: 帧处于在途状态，不在队列中，只有这里访问
        let content = unsafe { frame_mut(self.arch, paddr) };
        let slot = match swap.write_out(content, stats) {
            Ok(slot) => slot,
            Err(err) => {
                if let Some(owner) = owner {
                    self.install_user(victim, owner, vaddr, false);
                }
                return Err(err);
            }
        };

        let mut table = space.table();
        let recorded = match table.lookup_mut(vaddr) {
            Some(entry) if entry.state() == PteState::Present(paddr) => {
                entry.set(PteState::Swapped(slot));
                true
            }
            _ => false,
        };
        drop(table);
        if recorded {
            log::debug!(
                "coremap: evicted as {} page {:?} from {:?} to swap slot {}",
                space.id().as_usize(),
                vaddr,
                paddr,
                slot.index()
            );
        } else {
            // 页表项在换出期间被销毁
            swap.free_slot(slot);
        }
        Ok(victim)
    }

    /// 内容装好后允许置换
    pub fn unpin(&self, paddr: Paddr) {
        if let Some(entry) = self.frames.lock().get_mut(paddr.frame_index()) {
            entry.pinned = false;
        }
    }

    /// 释放一个用户帧：从 FIFO 队列中摘除并放回空闲帧
    pub fn release_user_frame(&self, paddr: Paddr) {
        if !self.is_active() {
            return;
        }
        let index = paddr.frame_index();
        let mut frames = self.frames.lock();
        let mut queue = self.queue.lock();
        let state = frames.get(index).map(|e| e.state);
        debug_assert_eq!(state, Some(FrameState::User), "coremap: not a user frame {:?}", paddr);
        if state != Some(FrameState::User) {
            return;
        }
        queue.unlink(index);
        frames[index] = CoremapEntry::with_state(FrameState::Free);
    }

    /// 仅当帧仍属于 (`id`, `vaddr`) 时释放，返回是否释放
    ///
    /// 正在被置换的帧不属于任何人，由置换方负责。
    pub(crate) fn release_owned_frame(&self, paddr: Paddr, id: AsId, vaddr: Vaddr) -> bool {
        if !self.is_active() {
            return false;
        }
        let index = paddr.frame_index();
        let mut frames = self.frames.lock();
        let mut queue = self.queue.lock();
        let owned = frames.get(index).is_some_and(|e| {
            e.state == FrameState::User
                && e.vaddr == vaddr
                && e.owner.as_ref().is_some_and(|o| o.id == id)
        });
        if owned {
            queue.unlink(index);
            frames[index] = CoremapEntry::with_state(FrameState::Free);
        }
        owned
    }

    /// 帧的状态
    pub fn frame_state(&self, paddr: Paddr) -> Option<FrameState> {
        self.frames.lock().get(paddr.frame_index()).map(|e| e.state)
    }

    /// 用户帧的 (属主, 虚拟页)
    pub fn owner_of(&self, paddr: Paddr) -> Option<(AsId, Vaddr)> {
        let frames = self.frames.lock();
        let entry = frames.get(paddr.frame_index())?;
        entry.owner.as_ref().map(|o| (o.id, entry.vaddr))
    }

    /// FIFO 队列中的帧，从最早到最晚
    pub fn fifo_order(&self) -> Vec<Paddr> {
        self.queue
            .lock()
            .iter()
            .map(Paddr::from_frame_index)
            .collect()
    }

    /// 各状态的帧数
    pub fn frame_stats(&self) -> FrameStats {
        let frames = self.frames.lock();
        let mut stats = FrameStats {
            total: frames.len(),
            ..FrameStats::default()
        };
        for entry in frames.iter() {
            match entry.state {
                FrameState::Reserved => stats.reserved += 1,
                FrameState::Untouched => stats.untouched += 1,
                FrameState::Free => stats.free += 1,
                FrameState::KernelHead { .. } | FrameState::KernelTail => stats.kernel += 1,
                FrameState::User | FrameState::Transit => stats.user += 1,
            }
        }
        stats
    }

    /// 物理地址转内核虚拟地址
    pub fn paddr_to_kvaddr(&self, paddr: Paddr) -> usize {
        self.arch.paddr_to_kvaddr(paddr.as_usize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(states: &[FrameState]) -> Vec<CoremapEntry> {
        states.iter().map(|s| CoremapEntry::with_state(*s)).collect()
    }

    #[test]
    fn test_find_free_run() {
        use FrameState::*;
        let frames = entries(&[Reserved, Free, User, Free, Free, Free, KernelTail]);
        assert_eq!(Coremap::find_free_run(&frames, 1), Some(1));
        assert_eq!(Coremap::find_free_run(&frames, 2), Some(3));
        assert_eq!(Coremap::find_free_run(&frames, 3), Some(3));
        assert_eq!(Coremap::find_free_run(&frames, 4), None);
    }

    #[test]
    fn test_mark_kernel_run() {
        use FrameState::*;
        let mut frames = entries(&[Free, Free, Free, Free]);
        Coremap::mark_kernel_run(&mut frames, 1, 3);
        assert_eq!(frames[0].state, Free);
        assert_eq!(frames[1].state, KernelHead { run: 3 });
        assert_eq!(frames[2].state, KernelTail);
        assert_eq!(frames[3].state, KernelTail);
    }
}
