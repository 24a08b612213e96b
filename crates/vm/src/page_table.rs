//! 页表模块
//!
//! 每个地址空间只有三个固定段（代码、数据、栈），每段一个扁平的页表项数组，
//! 不需要多级页表。
//!
//! 代码段和数据段按 `(vaddr - base) / PAGE_SIZE` 索引；
//! 栈段向下增长，索引 0 对应紧挨栈顶的那一页。

use crate::address::{AlignOps, PAGE_SIZE, Paddr, UsizeConvert, Vaddr};
use crate::swap::SwapSlot;
use alloc::vec::Vec;

bitflags::bitflags! {
    /// 区域权限（由可执行镜像的程序头给出）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegmentPerms: u8 {
        /// 可读
        const READ = 0b100;
        /// 可写
        const WRITE = 0b010;
        /// 可执行
        const EXEC = 0b001;
    }
}

/// 段种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// 代码段（只读）
    Code,
    /// 数据段
    Data,
    /// 栈段
    Stack,
}

/// 页的内容所在位置
///
/// 一页的内容只能在一个地方：物理帧、交换槽，或者还没有被装入。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PteState {
    /// 从未装入
    #[default]
    NotLoaded,
    /// 在物理帧中
    Present(Paddr),
    /// 只在交换区中
    Swapped(SwapSlot),
}

/// 页表项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry {
    state: PteState,
}

impl PageTableEntry {
    /// 当前状态
    pub fn state(&self) -> PteState {
        self.state
    }

    /// 是否在内存中
    pub fn is_present(&self) -> bool {
        matches!(self.state, PteState::Present(_))
    }

    /// 所在物理帧
    pub fn paddr(&self) -> Option<Paddr> {
        match self.state {
            PteState::Present(paddr) => Some(paddr),
            _ => None,
        }
    }

    /// 所在交换槽
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.state {
            PteState::Swapped(slot) => Some(slot),
            _ => None,
        }
    }

    pub(crate) fn set(&mut self, state: PteState) {
        self.state = state;
    }
}

/// 一个段
#[derive(Debug)]
pub struct Segment {
    kind: SegmentKind,
    /// 最低地址（页对齐）
    base: Vaddr,
    npages: usize,
    perms: SegmentPerms,
    entries: Vec<PageTableEntry>,
    defined: bool,
}

impl Segment {
    pub(crate) const fn empty(kind: SegmentKind) -> Self {
        Self {
            kind,
            base: Vaddr(0),
            npages: 0,
            perms: SegmentPerms::empty(),
            entries: Vec::new(),
            defined: false,
        }
    }

    /// 设置范围并分配全部为“未装入”的页表项
    pub(crate) fn define(&mut self, base: Vaddr, npages: usize, perms: SegmentPerms) {
        debug_assert!(base.is_page_aligned());
        self.base = base;
        self.npages = npages;
        self.perms = perms;
        self.entries = alloc::vec![PageTableEntry::default(); npages];
        self.defined = true;
    }

    /// 段种类
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// 最低地址
    pub fn base(&self) -> Vaddr {
        self.base
    }

    /// 结束地址（不含）
    pub fn top(&self) -> Vaddr {
        self.base + self.npages * PAGE_SIZE
    }

    /// 页数
    pub fn npages(&self) -> usize {
        self.npages
    }

    /// 定义时给出的权限
    pub fn perms(&self) -> SegmentPerms {
        self.perms
    }

    /// 是否只读；代码段总是只读
    pub fn is_readonly(&self) -> bool {
        self.kind == SegmentKind::Code
    }

    /// 是否已定义
    pub fn is_defined(&self) -> bool {
        self.defined
    }

    /// 是否包含 `vaddr`
    pub fn contains(&self, vaddr: Vaddr) -> bool {
        self.defined && vaddr >= self.base && vaddr < self.top()
    }

    /// `vaddr` 所在页在页表项数组中的下标
    ///
    /// 调用者需保证 [`Segment::contains`] 成立。
    pub fn page_index(&self, vaddr: Vaddr) -> usize {
        let page = vaddr.align_down_to_page();
        match self.kind {
            SegmentKind::Stack => (self.top().as_usize() - page.as_usize()) / PAGE_SIZE - 1,
            _ => (page.as_usize() - self.base.as_usize()) / PAGE_SIZE,
        }
    }

    /// 下标对应的页起始地址，[`Segment::page_index`] 的逆运算
    pub fn page_vaddr(&self, index: usize) -> Vaddr {
        match self.kind {
            SegmentKind::Stack => Vaddr(self.top().as_usize() - (index + 1) * PAGE_SIZE),
            _ => self.base + index * PAGE_SIZE,
        }
    }

    /// 全部页表项
    pub fn entries(&self) -> &[PageTableEntry] {
        &self.entries
    }

    /// 取走全部页表项，段回到未定义状态
    pub(crate) fn take_entries(&mut self) -> Vec<(Vaddr, PageTableEntry)> {
        let entries = core::mem::take(&mut self.entries);
        let pairs = entries
            .into_iter()
            .enumerate()
            .map(|(i, e)| (self.page_vaddr(i), e))
            .collect();
        *self = Self::empty(self.kind);
        pairs
    }
}

/// 三段式页表
#[derive(Debug)]
pub struct PageTable {
    code: Segment,
    data: Segment,
    stack: Segment,
}

impl PageTable {
    /// 三段都未定义的页表
    pub const fn new() -> Self {
        Self {
            code: Segment::empty(SegmentKind::Code),
            data: Segment::empty(SegmentKind::Data),
            stack: Segment::empty(SegmentKind::Stack),
        }
    }

    /// 取得某一段
    pub fn segment(&self, kind: SegmentKind) -> &Segment {
        match kind {
            SegmentKind::Code => &self.code,
            SegmentKind::Data => &self.data,
            SegmentKind::Stack => &self.stack,
        }
    }

    pub(crate) fn segment_mut(&mut self, kind: SegmentKind) -> &mut Segment {
        match kind {
            SegmentKind::Code => &mut self.code,
            SegmentKind::Data => &mut self.data,
            SegmentKind::Stack => &mut self.stack,
        }
    }

    /// 按代码、数据、栈的顺序找出包含 `vaddr` 的段
    pub fn classify(&self, vaddr: Vaddr) -> Option<SegmentKind> {
        [&self.code, &self.data, &self.stack]
            .into_iter()
            .find(|seg| seg.contains(vaddr))
            .map(|seg| seg.kind)
    }

    /// 查找 `vaddr` 所在页的页表项
    pub fn lookup(&self, vaddr: Vaddr) -> Option<&PageTableEntry> {
        let seg = self.segment(self.classify(vaddr)?);
        seg.entries.get(seg.page_index(vaddr))
    }

    pub(crate) fn lookup_mut(&mut self, vaddr: Vaddr) -> Option<&mut PageTableEntry> {
        let kind = self.classify(vaddr)?;
        let seg = self.segment_mut(kind);
        let index = seg.page_index(vaddr);
        seg.entries.get_mut(index)
    }

    /// 统计 (在内存中的页数, 在交换区中的页数)
    pub fn residency(&self) -> (usize, usize) {
        [&self.code, &self.data, &self.stack]
            .into_iter()
            .flat_map(|seg| seg.entries.iter())
            .fold((0, 0), |(present, swapped), e| match e.state {
                PteState::Present(_) => (present + 1, swapped),
                PteState::Swapped(_) => (present, swapped + 1),
                PteState::NotLoaded => (present, swapped),
            })
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
