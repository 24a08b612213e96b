//! 缺页处理
//!
//! 每次 TLB 缺失都会进入 [`Vm::fault`]：
//!
//! 1. 没有当前进程或地址空间 → [`VmError::NoAddressSpace`]
//! 2. 地址按页对齐后按段分类，不属于任何段 → [`VmError::BadAddress`]
//! 3. 写代码段（或经由只读 TLB 项写入）→ [`VmError::ProtectionViolation`]
//! 4. 页已在内存中：只重新装入 TLB
//! 5. 否则分配一个用户帧（可能触发置换），按页表项状态填充内容：
//!    交换区中的页换入，代码/数据页从镜像读入，栈页填零；
//!    然后提交页表项并装入 TLB
//!
//! 缺页处理可能阻塞（交换区与镜像 I/O），不能在中断上下文中调用，
//! 调用时也不能持有任何自旋锁。

use crate::address::{AlignOps, Paddr, Vaddr};
use crate::address_space::AddressSpace;
use crate::arch_ops::{assert_can_sleep, frame_mut};
use crate::error::{VmError, VmResult};
use crate::loader::{self, LoadOutcome};
use crate::page_table::{PteState, SegmentKind};
use crate::stats::StatKind;
use crate::vm::Vm;
use alloc::sync::Arc;

/// 缺页类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// 读缺失
    Read,
    /// 写缺失
    Write,
    /// 写只读 TLB 项
    ReadOnly,
}

impl FaultKind {
    /// 由陷入代码转换，未知代码返回 `None`
    pub const fn from_code(code: usize) -> Option<Self> {
        match code {
            0 => Some(FaultKind::Read),
            1 => Some(FaultKind::Write),
            2 => Some(FaultKind::ReadOnly),
            _ => None,
        }
    }
}

/// 新帧内容的来源
enum Filled {
    Zeroed,
    Image,
    Swap,
}

impl Vm {
    /// 处理当前进程在 `addr` 处的缺页
    pub fn fault(&self, kind: FaultKind, addr: Vaddr) -> VmResult<()> {
        assert_can_sleep(self.arch());
        let space = self
            .process()
            .current_address_space()
            .ok_or(VmError::NoAddressSpace)?;
        self.fault_in(&space, kind, addr)
    }

    /// 处理 `space` 在 `addr` 处的缺页
    pub fn fault_in(&self, space: &Arc<AddressSpace>, kind: FaultKind, addr: Vaddr) -> VmResult<()> {
        let page = addr.align_down_to_page();
        log::debug!(
            "vm: {:?} fault at {:?} in as {}",
            kind,
            addr,
            space.id().as_usize()
        );

        let (seg_kind, page_index, state) = {
            let table = space.table();
            let seg_kind = table.classify(page).ok_or(VmError::BadAddress)?;
            let seg = table.segment(seg_kind);
            let index = seg.page_index(page);
            (seg_kind, index, seg.entries()[index].state())
        };

        let readonly = seg_kind == SegmentKind::Code;
        if kind == FaultKind::ReadOnly || (readonly && kind == FaultKind::Write) {
            log::debug!("vm: write to read-only page {:?}", page);
            return Err(VmError::ProtectionViolation);
        }

        if let PteState::Present(paddr) = state {
            self.stats().increment(StatKind::TlbReloads);
            self.install(page, paddr, readonly);
            return Ok(());
        }

        let paddr = self.coremap().reserve_user_frame(
            page,
            space,
            self.swap(),
            self.tlb(),
            self.stats(),
        )?;
        let filled = match self.fill_frame(space, seg_kind, page_index, state, paddr) {
            Ok(filled) => filled,
            Err(err) => {
                self.coremap().release_user_frame(paddr);
                return Err(err);
            }
        };

        let mut table = space.table();
        let current = table.lookup_mut(page).map(|entry| {
            let before = entry.state();
            if !entry.is_present() {
                entry.set(PteState::Present(paddr));
            }
            before
        });
        drop(table);

        match current {
            Some(PteState::Present(existing)) => {
                // 其他路径已经装入了这一页
                self.coremap().release_user_frame(paddr);
                self.stats().increment(StatKind::TlbReloads);
                self.install(page, existing, readonly);
                Ok(())
            }
            Some(_) => {
                self.coremap().unpin(paddr);
                self.stats().increment(match filled {
                    Filled::Zeroed => StatKind::PageFaultsZeroed,
                    Filled::Image | Filled::Swap => StatKind::PageFaultsDisk,
                });
                match filled {
                    Filled::Image => self.stats().increment(StatKind::PageFaultsElf),
                    Filled::Swap => self.stats().increment(StatKind::PageFaultsSwap),
                    Filled::Zeroed => {}
                }
                self.install(page, paddr, readonly);
                Ok(())
            }
            None => {
                // 地址空间在装入期间被销毁
                self.coremap().release_user_frame(paddr);
                Err(VmError::BadAddress)
            }
        }
    }

    fn fill_frame(
        &self,
        space: &AddressSpace,
        kind: SegmentKind,
        page_index: usize,
        state: PteState,
        paddr: Paddr,
    ) -> VmResult<Filled> {
        // SAFETY: 帧刚分配且处于钉住状态，只有本次缺页访问
        let frame = unsafe { frame_mut(self.arch(), paddr) };
        match (state, kind) {
            (PteState::Swapped(slot), _) => {
                self.swap().read_in(slot, frame)?;
                Ok(Filled::Swap)
            }
            (_, SegmentKind::Stack) => {
                frame.fill(0);
                Ok(Filled::Zeroed)
            }
            _ => {
                let image = space.image().ok_or(VmError::InvalidExecutable)?;
                match loader::load_page(self.fs(), &image, kind, page_index, frame)? {
                    LoadOutcome::Read => Ok(Filled::Image),
                    LoadOutcome::ZeroFilled => Ok(Filled::Zeroed),
                }
            }
        }
    }

    fn install(&self, page: Vaddr, paddr: Paddr, readonly: bool) {
        self.stats().increment(StatKind::TlbFaults);
        self.tlb().insert(page, paddr, readonly, self.stats());
    }
}
