//! 中断保护器
//!
//! 只屏蔽**本地 CPU** 的中断，不提供跨 CPU 的互斥。
//! 访问每 CPU 独立的硬件状态（例如 TLB）时使用。

use crate::arch_ops;

/// 中断保护器，创建时关闭本地中断，销毁时恢复之前的状态。
///
/// # 示例
/// ```ignore
/// {
///     let _guard = IntrGuard::new();
///     // 写 TLB
/// }
/// ```
pub struct IntrGuard {
    flags: usize,
}

impl IntrGuard {
    /// 关闭本地中断并保存之前的状态
    pub fn new() -> Self {
        // SAFETY: flags 在 Drop 时原样恢复
        let flags = unsafe { arch_ops().read_and_disable_interrupts() };
        IntrGuard { flags }
    }
}

impl Default for IntrGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        unsafe { arch_ops().restore_interrupts(self.flags) };
    }
}

