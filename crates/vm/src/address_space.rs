//! 地址空间
//!
//! 一个用户进程的虚拟地址空间：代码段、数据段、栈段，以及可执行镜像的路径。
//! 页的内容按需装入，见 [`crate::fault`]。
//!
//! 生命周期：
//!
//! 1. [`AddressSpace::new`] 创建三段都未定义的空间；
//! 2. 加载程序时按程序头调用两次 [`AddressSpace::define_region`]（代码、数据），
//!    再调用 [`AddressSpace::define_stack`]；
//! 3. 进程退出时由 [`crate::Vm::destroy_address_space`] 释放所有物理帧与交换槽。
//!
//! coremap 只持有地址空间的弱引用，销毁顺序保证帧先于地址空间被释放。

use crate::address::{AlignOps, PAGE_SIZE, UsizeConvert, Vaddr};
use crate::config::{VmConfig, vm_config};
use crate::error::{VmError, VmResult};
use crate::page_table::{PageTable, PageTableEntry, SegmentKind, SegmentPerms};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use sync::{SpinLock, SpinLockGuard};

/// 地址空间编号，进程内唯一、不复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(usize);

static NEXT_AS_ID: AtomicUsize = AtomicUsize::new(1);

impl AsId {
    fn alloc() -> Self {
        AsId(NEXT_AS_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 数值
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// 用户地址空间
#[derive(Debug)]
pub struct AddressSpace {
    id: AsId,
    table: SpinLock<PageTable>,
    image: SpinLock<Option<String>>,
}

impl AddressSpace {
    /// 创建三段都未定义的地址空间
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: AsId::alloc(),
            table: SpinLock::new(PageTable::new()),
            image: SpinLock::new(None),
        })
    }

    /// 创建地址空间并记录可执行镜像路径
    pub fn with_image(path: &str) -> Arc<Self> {
        let space = Self::new();
        space.set_image(path);
        space
    }

    /// 编号
    pub fn id(&self) -> AsId {
        self.id
    }

    /// 设置可执行镜像路径
    pub fn set_image(&self, path: &str) {
        *self.image.lock() = Some(path.to_string());
    }

    /// 可执行镜像路径
    pub fn image(&self) -> Option<String> {
        self.image.lock().clone()
    }

    pub(crate) fn take_image(&self) -> Option<String> {
        self.image.lock().take()
    }

    /// 定义一个区域
    ///
    /// 区域向外扩展到页边界。第一次调用定义代码段（总是只读），
    /// 第二次定义数据段，之后的调用返回 [`VmError::InvalidRegion`]。
    /// 区域末端超出地址范围时返回 [`VmError::InvalidExecutable`]。
    pub fn define_region(&self, vaddr: Vaddr, size: usize, perms: SegmentPerms) -> VmResult<()> {
        let base = vaddr.align_down_to_page();
        let Some(end) = vaddr
            .as_usize()
            .checked_add(size)
            .and_then(|end| end.checked_add(PAGE_SIZE - 1))
            .map(|end| Vaddr(end).align_down_to_page())
        else {
            log::warn!("as {}: region {:?}+{:#x} wraps around", self.id.0, vaddr, size);
            return Err(VmError::InvalidExecutable);
        };
        let npages = (end.as_usize() - base.as_usize()) / PAGE_SIZE;

        let mut table = self.table.lock();
        let kind = [SegmentKind::Code, SegmentKind::Data]
            .into_iter()
            .find(|kind| !table.segment(*kind).is_defined())
            .ok_or(VmError::InvalidRegion)?;
        table.segment_mut(kind).define(base, npages, perms);
        log::debug!(
            "as {}: {:?} segment {:?}..{:?} ({} pages, {:?})",
            self.id.0,
            kind,
            base,
            end,
            npages,
            perms
        );
        Ok(())
    }

    /// 按已注册的配置定义栈段，返回初始用户栈指针
    pub fn define_stack(&self) -> VmResult<Vaddr> {
        self.define_stack_with(vm_config())
    }

    /// 按给定配置定义栈段：紧挨 `user_stack_top` 之下的 `stack_pages` 页
    ///
    /// 栈段只能定义一次。
    pub fn define_stack_with(&self, config: &dyn VmConfig) -> VmResult<Vaddr> {
        let top = Vaddr(config.user_stack_top());
        let npages = config.stack_pages();
        let base = Vaddr(top.as_usize() - npages * PAGE_SIZE);

        let mut table = self.table.lock();
        let stack = table.segment_mut(SegmentKind::Stack);
        if stack.is_defined() {
            return Err(VmError::InvalidRegion);
        }
        stack.define(base, npages, SegmentPerms::READ | SegmentPerms::WRITE);
        Ok(top)
    }

    /// `vaddr` 所属的段
    pub fn classify(&self, vaddr: Vaddr) -> Option<SegmentKind> {
        self.table.lock().classify(vaddr)
    }

    /// `vaddr` 所在页的页表项（拷贝）
    pub fn lookup_entry(&self, vaddr: Vaddr) -> Option<PageTableEntry> {
        self.table.lock().lookup(vaddr).copied()
    }

    /// 某一段的 (起始地址, 页数)；未定义时返回 `None`
    pub fn segment_bounds(&self, kind: SegmentKind) -> Option<(Vaddr, usize)> {
        let table = self.table.lock();
        let seg = table.segment(kind);
        seg.is_defined().then(|| (seg.base(), seg.npages()))
    }

    /// (在内存中的页数, 在交换区中的页数)
    pub fn residency(&self) -> (usize, usize) {
        self.table.lock().residency()
    }

    pub(crate) fn table(&self) -> SpinLockGuard<'_, PageTable> {
        self.table.lock()
    }

    /// 取走三段的全部页表项
    pub(crate) fn take_segments(&self) -> Vec<(SegmentKind, Vec<(Vaddr, PageTableEntry)>)> {
        let mut table = self.table.lock();
        [SegmentKind::Code, SegmentKind::Data, SegmentKind::Stack]
            .into_iter()
            .map(|kind| (kind, table.segment_mut(kind).take_entries()))
            .collect()
    }
}
