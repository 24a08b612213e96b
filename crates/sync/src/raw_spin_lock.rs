//! 自旋锁实现
//!
//! [`RawSpinLock`] 实现了 [`lock_api::RawMutex`]，
//! 上层通过 [`SpinLock`] / [`SpinLockGuard`] 类型别名使用。
//!
//! 获取锁时先关闭本地中断，再自旋等待锁标志；
//! 释放锁时先清除锁标志，再恢复获取前保存的中断状态。
//! 同一时刻只有一个持有者，因此保存的中断状态可以直接放在锁内部。

use crate::arch_ops;
use core::hint;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 不可重入的原始自旋锁
///
/// 在同一 CPU 上嵌套获取同一把锁会导致死锁。
#[derive(Debug)]
pub struct RawSpinLock {
    locked: AtomicBool,
    /// 获取锁之前的中断状态，仅由持有者读写
    saved_intr: AtomicUsize,
}

unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLock {
        locked: AtomicBool::new(false),
        saved_intr: AtomicUsize::new(0),
    };

    type GuardMarker = lock_api::GuardNoSend;

    fn lock(&self) {
        // SAFETY: 返回值在 unlock 中原样恢复
        let flags = unsafe { arch_ops().read_and_disable_interrupts() };
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        self.saved_intr.store(flags, Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        // SAFETY: 成功时返回值在 unlock 中恢复，失败时在下面立即恢复
        let flags = unsafe { arch_ops().read_and_disable_interrupts() };
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.saved_intr.store(flags, Ordering::Relaxed);
            true
        } else {
            // 获取失败，立即恢复中断状态
            // SAFETY: flags 来自上面的 read_and_disable_interrupts，锁未被本次调用持有
            unsafe { arch_ops().restore_interrupts(flags) };
            false
        }
    }

    unsafe fn unlock(&self) {
        let flags = self.saved_intr.load(Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        // SAFETY: flags 由 lock/try_lock 保存
        unsafe { arch_ops().restore_interrupts(flags) };
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// 提供互斥访问的自旋锁
///
/// # 示例
/// ```ignore
/// let lock = SpinLock::new(0);
/// {
///     let mut guard = lock.lock();
///     *guard += 1;
/// } // 离开作用域，释放锁并恢复中断
/// ```
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;

/// [`SpinLock`] 的 RAII 保护器
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;
