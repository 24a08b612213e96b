//! 虚拟内存管理器
//!
//! [`Vm`] 持有一个 coremap、一个交换区、一个 TLB 管理器和一组统计计数，
//! 由注入的架构操作、进程接口和文件系统接口构造。
//!
//! 内核全局只有一个实例，由 [`vm_bootstrap`] 建立、[`vm_shutdown`] 拆除，
//! 陷入处理通过 [`vm_fault`] 进入。测试可以直接构造私有的 [`Vm`]。

use crate::address::{Paddr, UsizeConvert, Vaddr};
use crate::address_space::AddressSpace;
use crate::arch_ops::{ArchVmOps, arch_ops, assert_can_sleep};
use crate::config::{VmConfig, vm_config};
use crate::coremap::Coremap;
use crate::error::{VmError, VmResult};
use crate::fault::FaultKind;
use crate::file::VmFs;
use crate::loader;
use crate::page_table::PteState;
use crate::process::ProcessOps;
use crate::stats::{VmStats, VmStatsSnapshot};
use crate::swap::SwapStore;
use crate::tlb::Tlb;
use alloc::sync::Arc;
use lazy_static::lazy_static;
use sync::SpinLock;

/// 虚拟内存管理器
pub struct Vm {
    arch: &'static dyn ArchVmOps,
    process: &'static dyn ProcessOps,
    fs: &'static dyn VmFs,
    coremap: Coremap,
    swap: SwapStore,
    tlb: Tlb,
    stats: VmStats,
}

impl Vm {
    /// 创建未初始化的管理器
    pub fn new(
        arch: &'static dyn ArchVmOps,
        process: &'static dyn ProcessOps,
        fs: &'static dyn VmFs,
    ) -> Self {
        Self {
            arch,
            process,
            fs,
            coremap: Coremap::new(arch),
            swap: SwapStore::new(),
            tlb: Tlb::new(arch),
            stats: VmStats::new(),
        }
    }

    /// 建立帧表、打开交换文件并开始统计
    pub fn init(&self, config: &dyn VmConfig) -> VmResult<()> {
        self.coremap.init();
        self.swap
            .init(self.fs, config.swap_path(), config.swap_size())?;
        self.stats.init();
        Ok(())
    }

    /// 打印统计并拆除全部结构，返回最终的统计快照
    pub fn shutdown(&self) -> VmStatsSnapshot {
        let snapshot = self.stats.report();
        self.stats.shutdown();
        self.swap.shutdown();
        self.coremap.shutdown();
        snapshot
    }

    /// 架构操作
    pub fn arch(&self) -> &'static dyn ArchVmOps {
        self.arch
    }

    /// 进程接口
    pub fn process(&self) -> &'static dyn ProcessOps {
        self.process
    }

    /// 文件系统接口
    pub fn fs(&self) -> &'static dyn VmFs {
        self.fs
    }

    /// 帧表
    pub fn coremap(&self) -> &Coremap {
        &self.coremap
    }

    /// 交换区
    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    /// TLB 管理器
    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// 统计
    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    /// 分配 `npages` 个连续的内核页，返回内核虚拟地址
    pub fn alloc_kpages(&self, npages: usize) -> Option<usize> {
        assert_can_sleep(self.arch);
        let paddr = self.coremap.reserve_frames(npages)?;
        Some(self.arch.paddr_to_kvaddr(paddr.as_usize()))
    }

    /// 释放 [`Vm::alloc_kpages`] 分配的页
    pub fn free_kpages(&self, kvaddr: usize) {
        let paddr = Paddr(self.arch.kvaddr_to_paddr(kvaddr));
        self.coremap.release_frames(paddr);
    }

    /// 切换到当前进程的地址空间：使整个 TLB 失效
    ///
    /// 没有地址空间的内核线程保留之前的映射。
    pub fn activate(&self) {
        if self.process.current_address_space().is_none() {
            return;
        }
        self.tlb.invalidate_all(&self.stats);
    }

    /// 离开地址空间，无需任何操作
    pub fn deactivate(&self) {}

    /// 加载镜像之前调用
    pub fn prepare_load(&self, _space: &AddressSpace) -> VmResult<()> {
        assert_can_sleep(self.arch);
        Ok(())
    }

    /// 加载镜像之后调用
    pub fn complete_load(&self, _space: &AddressSpace) -> VmResult<()> {
        assert_can_sleep(self.arch);
        Ok(())
    }

    /// 按镜像的程序头定义代码段和数据段并记录镜像路径，返回入口地址
    ///
    /// 页内容不在这里读入，而是在第一次访问时由缺页处理装入。
    pub fn load_executable(&self, space: &AddressSpace, path: &str) -> VmResult<Vaddr> {
        let layout = loader::read_layout(self.fs, path)?;
        self.prepare_load(space)?;
        for seg in &layout.segments {
            space.define_region(seg.vaddr, seg.memsz, seg.perms)?;
        }
        space.set_image(path);
        self.complete_load(space)?;
        log::debug!(
            "vm: {} loaded into as {}, entry {:?}",
            path,
            space.id().as_usize(),
            layout.entry
        );
        Ok(layout.entry)
    }

    /// 销毁地址空间：释放每一页占用的物理帧或交换槽，再丢弃镜像路径
    pub fn destroy_address_space(&self, space: &AddressSpace) {
        let mut frames = 0;
        let mut slots = 0;
        for (_, entries) in space.take_segments() {
            for (vaddr, entry) in entries {
                match entry.state() {
                    PteState::Present(paddr) => {
                        self.tlb.invalidate_frame(paddr);
                        if self.coremap.release_owned_frame(paddr, space.id(), vaddr) {
                            frames += 1;
                        }
                    }
                    PteState::Swapped(slot) => {
                        self.swap.free_slot(slot);
                        slots += 1;
                    }
                    PteState::NotLoaded => {}
                }
            }
        }
        space.take_image();
        log::debug!(
            "vm: destroyed as {}: {} frames and {} swap slots released",
            space.id().as_usize(),
            frames,
            slots
        );
    }
}

lazy_static! {
    /// 内核全局虚拟内存管理器
    static ref KERNEL_VM: SpinLock<Option<Arc<Vm>>> = SpinLock::new(None);
}

/// 用已注册的架构操作和配置建立全局管理器
pub fn vm_bootstrap(
    process: &'static dyn ProcessOps,
    fs: &'static dyn VmFs,
) -> VmResult<Arc<Vm>> {
    let vm = Arc::new(Vm::new(arch_ops(), process, fs));
    vm.init(vm_config())?;
    *KERNEL_VM.lock() = Some(vm.clone());
    log::info!("vm: bootstrap complete");
    Ok(vm)
}

/// 全局管理器；尚未建立时返回 `None`
pub fn kernel_vm() -> Option<Arc<Vm>> {
    KERNEL_VM.lock().clone()
}

/// 拆除全局管理器
pub fn vm_shutdown() -> Option<VmStatsSnapshot> {
    let vm = KERNEL_VM.lock().take()?;
    Some(vm.shutdown())
}

/// 陷入处理的入口
///
/// 进程级错误以负 errno 返回，由调用者终止出错的进程；
/// 系统级错误直接停机。
pub fn vm_fault(code: usize, addr: usize) -> Result<(), isize> {
    let kind = FaultKind::from_code(code).ok_or(VmError::BadFaultKind.to_errno())?;
    let vm = kernel_vm().ok_or(VmError::NoAddressSpace.to_errno())?;
    match vm.fault(kind, Vaddr(addr)) {
        Ok(()) => Ok(()),
        Err(err) if err.is_fatal() => err.escalate(),
        Err(err) => Err(err.to_errno()),
    }
}
