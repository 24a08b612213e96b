//! 架构相关虚拟内存操作 trait 定义和注册

use crate::address::{PAGE_SIZE, Paddr, UsizeConvert};
use crate::tlb::TlbEntry;
use core::sync::atomic::{AtomicUsize, Ordering};

/// 架构相关虚拟内存操作
///
/// 抽象了物理内存布局、内核直接映射以及软件管理 TLB 的按槽读写。
/// 内核需要为具体平台实现此 trait。
pub trait ArchVmOps: Send + Sync {
    /// 物理内存大小（字节）
    fn ram_size(&self) -> usize;

    /// 内核镜像之后第一个可用的物理地址
    fn ram_first_free(&self) -> usize;

    /// 将物理地址转换为内核直接映射区的虚拟地址
    fn paddr_to_kvaddr(&self, paddr: usize) -> usize;

    /// 将内核直接映射区的虚拟地址转换为物理地址
    fn kvaddr_to_paddr(&self, kvaddr: usize) -> usize;

    /// 当前 CPU 的 TLB 槽数
    fn num_tlb_entries(&self) -> usize;

    /// 读取一个 TLB 槽
    fn tlb_read(&self, slot: usize) -> TlbEntry;

    /// 写入一个 TLB 槽
    fn tlb_write(&self, slot: usize, entry: TlbEntry);

    /// 当前是否处于中断上下文（不可睡眠）
    fn in_interrupt(&self) -> bool;
}

/// 以字节切片访问一个物理帧
///
/// # Safety
/// 调用者必须独占该帧（刚分配、或已从所有权队列中摘下）
pub(crate) unsafe fn frame_mut(arch: &dyn ArchVmOps, paddr: Paddr) -> &mut [u8] {
    let kva = arch.paddr_to_kvaddr(paddr.as_usize());
    // SAFETY: 直接映射区覆盖全部物理内存，帧大小为 PAGE_SIZE
    unsafe { core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE) }
}

/// 断言当前上下文可以睡眠
#[inline]
pub(crate) fn assert_can_sleep(arch: &dyn ArchVmOps) {
    assert!(!arch.in_interrupt(), "vm: blocking operation in interrupt context");
}

static ARCH_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static ARCH_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册架构操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_arch_ops(ops: &'static dyn ArchVmOps) {
    let ptr = ops as *const dyn ArchVmOps;
    // SAFETY: 将 fat pointer 拆分为 data 和 vtable 两部分存储
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn ArchVmOps, (usize, usize)>(ptr) };
    ARCH_OPS_VTABLE.store(vtable, Ordering::Release);
    ARCH_OPS_DATA.store(data, Ordering::Release);
}

/// 获取已注册的架构操作实现
///
/// # Panics
/// 如果尚未调用 [`register_arch_ops`] 注册实现，则 panic
#[inline]
pub fn arch_ops() -> &'static dyn ArchVmOps {
    let data = ARCH_OPS_DATA.load(Ordering::Acquire);
    let vtable = ARCH_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("vm: ArchVmOps not registered");
    }
    // SAFETY: 重组 fat pointer
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn ArchVmOps>((data, vtable)) }
}
