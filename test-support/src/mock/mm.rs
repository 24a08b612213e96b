//! 模拟机器：物理内存与软件管理的 TLB
//!
//! 物理地址 `p` 对应内核虚拟地址 `ram_base + p`（直接映射）。
//! TLB 只模拟一个 CPU，条目为 `(hi, lo)` 两个 32 位字。

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// 模拟机器
pub struct MockMachine {
    ram_base: *mut u8,
    ram_size: usize,
    first_free: usize,
    tlb: Vec<(AtomicU32, AtomicU32)>,
    in_interrupt: AtomicBool,
}

// Safety: 物理内存的并发访问规则由被测的帧分配器保证
unsafe impl Send for MockMachine {}
unsafe impl Sync for MockMachine {}

impl MockMachine {
    /// 页大小
    pub const PAGE_SIZE: usize = 4096;

    /// 创建一台拥有 `frames` 个物理帧的机器，其中前 `reserved` 帧视为内核镜像，
    /// TLB 有 `tlb_entries` 个槽位。
    ///
    /// 返回 `'static` 引用（泄漏），与内核中注册的全局对象生命周期一致。
    pub fn leak(frames: usize, reserved: usize, tlb_entries: usize) -> &'static MockMachine {
        assert!(reserved <= frames);
        let ram: &'static mut [u8] = Box::leak(vec![0u8; frames * Self::PAGE_SIZE].into_boxed_slice());
        let tlb = (0..tlb_entries)
            .map(|_| (AtomicU32::new(0), AtomicU32::new(0)))
            .collect();
        Box::leak(Box::new(MockMachine {
            ram_base: ram.as_mut_ptr(),
            ram_size: frames * Self::PAGE_SIZE,
            first_free: reserved * Self::PAGE_SIZE,
            tlb,
            in_interrupt: AtomicBool::new(false),
        }))
    }

    /// 物理内存大小（字节）
    pub fn ram_size(&self) -> usize {
        self.ram_size
    }

    /// 第一个未被内核镜像占用的物理地址
    pub fn first_free(&self) -> usize {
        self.first_free
    }

    /// 物理地址转换为（宿主机上的）内核虚拟地址
    pub fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        assert!(paddr < self.ram_size, "paddr {paddr:#x} outside mock RAM");
        self.ram_base as usize + paddr
    }

    /// 内核虚拟地址转换为物理地址
    pub fn vaddr_to_paddr(&self, vaddr: usize) -> usize {
        let paddr = vaddr - self.ram_base as usize;
        assert!(paddr < self.ram_size);
        paddr
    }

    /// 复制出一页物理内存的内容
    pub fn read_page(&self, paddr: usize) -> Vec<u8> {
        let base = paddr & !(Self::PAGE_SIZE - 1);
        // Safety: base 在模拟内存范围之内
        unsafe {
            core::slice::from_raw_parts(self.paddr_to_vaddr(base) as *const u8, Self::PAGE_SIZE)
        }
        .to_vec()
    }

    /// 直接写物理内存
    pub fn write_phys(&self, paddr: usize, bytes: &[u8]) {
        assert!(paddr + bytes.len() <= self.ram_size);
        // Safety: 范围已检查
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.paddr_to_vaddr(paddr) as *mut u8,
                bytes.len(),
            );
        }
    }

    /// TLB 槽位数
    pub fn tlb_entries(&self) -> usize {
        self.tlb.len()
    }

    /// 读取一个 TLB 槽位
    pub fn tlb_read(&self, slot: usize) -> (u32, u32) {
        let (hi, lo) = &self.tlb[slot];
        (hi.load(Ordering::SeqCst), lo.load(Ordering::SeqCst))
    }

    /// 写入一个 TLB 槽位
    pub fn tlb_write(&self, slot: usize, hi: u32, lo: u32) {
        let (h, l) = &self.tlb[slot];
        h.store(hi, Ordering::SeqCst);
        l.store(lo, Ordering::SeqCst);
    }

    /// 当前是否处于中断处理上下文
    pub fn in_interrupt(&self) -> bool {
        self.in_interrupt.load(Ordering::SeqCst)
    }

    /// 模拟进入/离开中断处理程序
    pub fn set_in_interrupt(&self, value: bool) {
        self.in_interrupt.store(value, Ordering::SeqCst);
    }
}
