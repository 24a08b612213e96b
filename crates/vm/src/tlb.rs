//! 软件管理的 TLB
//!
//! 每个槽保存一对 `(entryhi, entrylo)`：
//!
//! - `entryhi`：虚拟页号（高 20 位）
//! - `entrylo`：物理页号（高 20 位）加 `DIRTY`（可写）与 `VALID` 位
//!
//! 插入时优先使用无效槽，没有无效槽时按轮转计数器选出替换槽。
//! 所有槽操作都在关闭本地中断的情况下进行。

use crate::address::{Paddr, UsizeConvert, Vaddr};
use crate::arch_ops::ArchVmOps;
use crate::stats::{StatKind, VmStats};
use core::sync::atomic::{AtomicUsize, Ordering};
use sync::IntrGuard;

/// 一个 TLB 槽的内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    /// entryhi
    pub hi: u32,
    /// entrylo
    pub lo: u32,
}

impl TlbEntry {
    /// entryhi 中的虚拟页号
    pub const HI_VPAGE: u32 = 0xffff_f000;
    /// entrylo 中的物理页号
    pub const LO_PPAGE: u32 = 0xffff_f000;
    /// 可写
    pub const LO_DIRTY: u32 = 0x0000_0400;
    /// 有效
    pub const LO_VALID: u32 = 0x0000_0200;

    /// 第 `slot` 个槽的无效内容
    ///
    /// 每个槽使用不同的 entryhi，位于内核段，永远不会和用户地址匹配。
    pub const fn invalid(slot: usize) -> Self {
        Self {
            hi: ((0x81000 + slot as u32) << 12),
            lo: 0,
        }
    }

    /// 构造一个有效映射
    pub fn new(vaddr: Vaddr, paddr: Paddr, readonly: bool) -> Self {
        let mut lo = (paddr.as_usize() as u32 & Self::LO_PPAGE) | Self::LO_VALID;
        if !readonly {
            lo |= Self::LO_DIRTY;
        }
        Self {
            hi: vaddr.as_usize() as u32 & Self::HI_VPAGE,
            lo,
        }
    }

    /// 是否有效
    pub fn is_valid(&self) -> bool {
        self.lo & Self::LO_VALID != 0
    }

    /// 是否可写
    pub fn is_writable(&self) -> bool {
        self.lo & Self::LO_DIRTY != 0
    }

    /// 映射的虚拟页
    pub fn vaddr(&self) -> Vaddr {
        Vaddr((self.hi & Self::HI_VPAGE) as usize)
    }

    /// 映射的物理帧
    pub fn paddr(&self) -> Paddr {
        Paddr((self.lo & Self::LO_PPAGE) as usize)
    }
}

/// TLB 管理器
pub struct Tlb {
    arch: &'static dyn ArchVmOps,
    /// 轮转替换计数器
    next_victim: AtomicUsize,
}

impl Tlb {
    /// 创建管理器
    pub fn new(arch: &'static dyn ArchVmOps) -> Self {
        Self {
            arch,
            next_victim: AtomicUsize::new(0),
        }
    }

    fn round_robin_victim(&self, slots: usize) -> usize {
        self.next_victim.fetch_add(1, Ordering::Relaxed) % slots
    }

    /// 装入 `vaddr -> paddr` 的映射，`readonly` 为假时标记为可写
    ///
    /// 同一虚拟页已有映射时原地覆盖，否则优先填入无效槽，
    /// 都没有时替换轮转选出的槽。
    pub fn insert(&self, vaddr: Vaddr, paddr: Paddr, readonly: bool, stats: &VmStats) {
        let entry = TlbEntry::new(vaddr, paddr, readonly);
        let slots = self.arch.num_tlb_entries();
        let _guard = IntrGuard::new();

        let mut free = None;
        for slot in 0..slots {
            let cur = self.arch.tlb_read(slot);
            if cur.is_valid() && cur.hi == entry.hi {
                // 不能出现两个匹配同一页的槽
                free = Some(slot);
                break;
            }
            if free.is_none() && !cur.is_valid() {
                free = Some(slot);
            }
        }

        let slot = match free {
            Some(slot) => {
                stats.increment(StatKind::TlbFaultsWithFree);
                slot
            }
            None => {
                stats.increment(StatKind::TlbFaultsWithReplace);
                self.round_robin_victim(slots)
            }
        };
        log::trace!("tlb: slot {} <- {:?} -> {:?} ro={}", slot, vaddr, paddr, readonly);
        self.arch.tlb_write(slot, entry);
    }

    /// 使全部槽失效（切换地址空间时调用）
    pub fn invalidate_all(&self, stats: &VmStats) {
        let _guard = IntrGuard::new();
        for slot in 0..self.arch.num_tlb_entries() {
            self.arch.tlb_write(slot, TlbEntry::invalid(slot));
        }
        stats.increment(StatKind::TlbInvalidations);
    }

    /// 使映射到 `paddr` 的槽失效，返回失效的槽数
    pub fn invalidate_frame(&self, paddr: Paddr) -> usize {
        let _guard = IntrGuard::new();
        let mut cleared = 0;
        for slot in 0..self.arch.num_tlb_entries() {
            let cur = self.arch.tlb_read(slot);
            if cur.is_valid() && cur.paddr() == paddr {
                self.arch.tlb_write(slot, TlbEntry::invalid(slot));
                cleared += 1;
            }
        }
        cleared
    }

    /// 查找 `vaddr` 所在页的有效映射
    pub fn lookup(&self, vaddr: Vaddr) -> Option<TlbEntry> {
        let hi = vaddr.as_usize() as u32 & TlbEntry::HI_VPAGE;
        let _guard = IntrGuard::new();
        (0..self.arch.num_tlb_entries())
            .map(|slot| self.arch.tlb_read(slot))
            .find(|e| e.is_valid() && e.hi == hi)
    }
}
