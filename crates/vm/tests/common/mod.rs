//! 集成测试公共部分：把 test-support 的 mock 接到 vm 的 trait 上

#![allow(dead_code)]

use std::sync::Arc;

use test_support::mock::arch::init_sync_arch_ops;
use test_support::mock::elf::ElfImageBuilder;
use test_support::mock::fs::{MemFile, MemFs};
use test_support::mock::mm::MockMachine;
use test_support::mock::process::MockProcess;
use vm::{
    AddressSpace, ArchVmOps, PAGE_SIZE, ProcessOps, TlbEntry, Vm, VmConfig, VmFile, VmFs,
};

pub const CODE_BASE: u32 = 0x40_0000;
pub const DATA_BASE: u32 = 0x41_0000;
pub const SWAP_PATH: &str = "emu0:SWAPFILE";

pub struct Machine(pub &'static MockMachine);

impl ArchVmOps for Machine {
    fn ram_size(&self) -> usize {
        self.0.ram_size()
    }

    fn ram_first_free(&self) -> usize {
        self.0.first_free()
    }

    fn paddr_to_kvaddr(&self, paddr: usize) -> usize {
        self.0.paddr_to_vaddr(paddr)
    }

    fn kvaddr_to_paddr(&self, kvaddr: usize) -> usize {
        self.0.vaddr_to_paddr(kvaddr)
    }

    fn num_tlb_entries(&self) -> usize {
        self.0.tlb_entries()
    }

    fn tlb_read(&self, slot: usize) -> TlbEntry {
        let (hi, lo) = self.0.tlb_read(slot);
        TlbEntry { hi, lo }
    }

    fn tlb_write(&self, slot: usize, entry: TlbEntry) {
        self.0.tlb_write(slot, entry.hi, entry.lo);
    }

    fn in_interrupt(&self) -> bool {
        self.0.in_interrupt()
    }
}

pub struct File(pub Arc<MemFile>);

impl VmFile for File {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        Ok(self.0.read_at(offset, buf))
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize> {
        Ok(self.0.write_at(offset, buf))
    }
}

pub struct Fs(pub MemFs);

impl VmFs for Fs {
    fn open(&self, path: &str, create: bool) -> Result<Arc<dyn VmFile>, isize> {
        match self.0.open(path, create) {
            Some(file) => Ok(Arc::new(File(file))),
            None => Err(-2),
        }
    }
}

pub struct Process(pub MockProcess<AddressSpace>);

impl ProcessOps for Process {
    fn current_address_space(&self) -> Option<Arc<AddressSpace>> {
        self.0.current()
    }
}

pub struct TestConfig {
    pub swap_pages: usize,
    pub stack_pages: usize,
}

impl VmConfig for TestConfig {
    fn user_stack_top(&self) -> usize {
        0x8000_0000
    }

    fn stack_pages(&self) -> usize {
        self.stack_pages
    }

    fn swap_path(&self) -> &str {
        SWAP_PATH
    }

    fn swap_size(&self) -> usize {
        self.swap_pages * PAGE_SIZE
    }
}

pub struct Harness {
    pub machine: &'static MockMachine,
    pub fs: &'static Fs,
    pub process: &'static Process,
    pub config: TestConfig,
    pub vm: Vm,
}

/// `frames` 个物理帧（其中 `reserved` 个给内核镜像）、8 个 TLB 槽、
/// `swap_pages` 个交换槽的私有虚拟内存管理器
pub fn harness(frames: usize, reserved: usize, swap_pages: usize) -> Harness {
    init_sync_arch_ops();
    let machine = MockMachine::leak(frames, reserved, 8);
    let arch: &'static Machine = Box::leak(Box::new(Machine(machine)));
    let fs: &'static Fs = Box::leak(Box::new(Fs(MemFs::with_create_capacity(
        swap_pages * PAGE_SIZE,
    ))));
    let process: &'static Process = Box::leak(Box::new(Process(MockProcess::new())));
    let config = TestConfig {
        swap_pages,
        stack_pages: 4,
    };
    let vm = Vm::new(arch, process, fs);
    vm.init(&config).unwrap();
    Harness {
        machine,
        fs,
        process,
        config,
        vm,
    }
}

impl Harness {
    /// 放入镜像并建立地址空间，不切换当前进程
    pub fn load(&self, path: &str, image: Vec<u8>) -> Arc<AddressSpace> {
        self.fs.0.insert(path, image);
        let space = AddressSpace::new();
        self.vm.load_executable(&space, path).unwrap();
        space.define_stack_with(&self.config).unwrap();
        space
    }

    /// 放入镜像，建立地址空间并设为当前进程
    pub fn spawn(&self, path: &str, image: Vec<u8>) -> Arc<AddressSpace> {
        let space = self.load(path, image);
        self.process.0.switch_to(Some(space.clone()));
        space
    }

    pub fn swap_file(&self) -> Arc<MemFile> {
        self.fs.0.file(SWAP_PATH).unwrap()
    }
}

/// 代码段在 `CODE_BASE`、数据段在 `DATA_BASE`（内存中 `data_mem` 字节）的镜像
pub fn two_segment_image(code: &[u8], data: &[u8], data_mem: u32) -> Vec<u8> {
    ElfImageBuilder::new()
        .entry(CODE_BASE)
        .load_segment(CODE_BASE, code, code.len() as u32, 0b101)
        .load_segment(DATA_BASE, data, data_mem, 0b110)
        .build()
}
