//! 进程上下文接口

use crate::address_space::AddressSpace;
use alloc::sync::Arc;

/// 进程子系统提供给虚拟内存的接口
pub trait ProcessOps: Send + Sync {
    /// 当前进程的地址空间；内核启动早期没有当前进程时返回 `None`
    fn current_address_space(&self) -> Option<Arc<AddressSpace>>;
}
