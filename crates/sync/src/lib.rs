//! 同步原语
//!
//! 为虚拟内存子系统提供短临界区使用的锁：
//!
//! - [`SpinLock`]：基于 [`lock_api`] 的不可重入自旋锁，持锁期间关闭本地中断
//! - [`IntrGuard`]：仅关闭本地中断的 RAII 保护器（例如写 TLB 时使用）
//!
//! 自旋锁绝不能跨越可能阻塞的操作（磁盘 I/O、交换区读写）持有。
//!
//! # 架构依赖
//!
//! 中断开关通过 [`ArchOps`] trait 注入，
//! 使用前必须调用 [`register_arch_ops`] 注册实现。

#![no_std]

mod intr_guard;
mod raw_spin_lock;

pub use intr_guard::IntrGuard;
pub use raw_spin_lock::{RawSpinLock, SpinLock, SpinLockGuard};

use core::sync::atomic::{AtomicUsize, Ordering};

/// 架构相关操作
///
/// 由内核（或测试中的 mock）实现并注册。
pub trait ArchOps: Send + Sync {
    /// 读取并关闭本地中断，返回之前的中断状态
    ///
    /// # Safety
    /// 返回值必须原样交还给 [`ArchOps::restore_interrupts`]
    unsafe fn read_and_disable_interrupts(&self) -> usize;

    /// 恢复中断状态
    ///
    /// # Safety
    /// `flags` 必须来自之前的 [`ArchOps::read_and_disable_interrupts`]
    unsafe fn restore_interrupts(&self, flags: usize);
}

static ARCH_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static ARCH_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册架构操作实现
///
/// # Safety
/// 必须在单线程环境下、任何加锁操作之前调用
pub unsafe fn register_arch_ops(ops: &'static dyn ArchOps) {
    let ptr = ops as *const dyn ArchOps;
    // SAFETY: fat pointer 的布局是 (data, vtable)
    let (data, vtable) = unsafe { core::mem::transmute::<*const dyn ArchOps, (usize, usize)>(ptr) };
    ARCH_OPS_VTABLE.store(vtable, Ordering::Release);
    ARCH_OPS_DATA.store(data, Ordering::Release);
}

#[inline]
pub(crate) fn arch_ops() -> &'static dyn ArchOps {
    let data = ARCH_OPS_DATA.load(Ordering::Acquire);
    let vtable = ARCH_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("sync: ArchOps not registered, call register_arch_ops first");
    }
    // SAFETY: data 与 vtable 由 register_arch_ops 写入
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn ArchOps>((data, vtable)) }
}
