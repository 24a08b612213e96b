//! 可切换的“当前进程”

use alloc::sync::Arc;
use sync::SpinLock;

/// 保存当前进程的地址空间
///
/// 泛型参数由使用方决定（`vm` 中为 `AddressSpace`）。
pub struct MockProcess<T> {
    current: SpinLock<Option<Arc<T>>>,
}

impl<T> MockProcess<T> {
    /// 创建一个没有当前进程的实例（相当于内核启动早期）
    pub const fn new() -> Self {
        Self {
            current: SpinLock::new(None),
        }
    }

    /// 切换当前地址空间
    pub fn switch_to(&self, space: Option<Arc<T>>) {
        *self.current.lock() = space;
    }

    /// 获取当前地址空间
    pub fn current(&self) -> Option<Arc<T>> {
        self.current.lock().clone()
    }
}

impl<T> Default for MockProcess<T> {
    fn default() -> Self {
        Self::new()
    }
}
