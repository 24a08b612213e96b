//! 虚拟内存配置 trait 定义和注册

use core::sync::atomic::{AtomicUsize, Ordering};

/// 虚拟内存配置常量
///
/// 内核实现此 trait 并注册；不需要定制时直接注册 [`DefaultVmConfig`]。
pub trait VmConfig: Send + Sync {
    /// 用户栈顶地址（栈段向下增长，不含此地址）
    fn user_stack_top(&self) -> usize;

    /// 栈段固定页数
    fn stack_pages(&self) -> usize;

    /// 交换文件路径
    fn swap_path(&self) -> &str;

    /// 交换文件大小（字节，按页向下取整）
    fn swap_size(&self) -> usize;
}

/// 默认配置
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultVmConfig;

impl DefaultVmConfig {
    /// 用户栈顶
    pub const USER_STACK_TOP: usize = 0x8000_0000;
    /// 栈段页数
    pub const STACK_PAGES: usize = 18;
    /// 交换文件路径
    pub const SWAP_PATH: &'static str = "emu0:SWAPFILE";
    /// 交换文件大小 (9 MiB)
    pub const SWAP_SIZE: usize = 9 * 1024 * 1024;
}

impl VmConfig for DefaultVmConfig {
    fn user_stack_top(&self) -> usize {
        Self::USER_STACK_TOP
    }

    fn stack_pages(&self) -> usize {
        Self::STACK_PAGES
    }

    fn swap_path(&self) -> &str {
        Self::SWAP_PATH
    }

    fn swap_size(&self) -> usize {
        Self::SWAP_SIZE
    }
}

static CONFIG_DATA: AtomicUsize = AtomicUsize::new(0);
static CONFIG_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册配置实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_config(config: &'static dyn VmConfig) {
    let ptr = config as *const dyn VmConfig;
    // SAFETY: 将 fat pointer 拆分为 data 和 vtable 两部分存储
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn VmConfig, (usize, usize)>(ptr) };
    CONFIG_VTABLE.store(vtable, Ordering::Release);
    CONFIG_DATA.store(data, Ordering::Release);
}

/// 获取已注册的配置实现
///
/// # Panics
/// 如果尚未调用 [`register_config`] 注册实现，则 panic
#[inline]
pub fn vm_config() -> &'static dyn VmConfig {
    let data = CONFIG_DATA.load(Ordering::Acquire);
    let vtable = CONFIG_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("vm: VmConfig not registered");
    }
    // SAFETY: 重组 fat pointer
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn VmConfig>((data, vtable)) }
}
