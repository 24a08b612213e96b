//! 缺页处理的集成测试

mod common;

use common::{CODE_BASE, DATA_BASE, harness, two_segment_image};
use test_support::mock::elf::pattern;
use vm::{FaultKind, PAGE_SIZE, PteState, StatKind, Vaddr, VmError};

const STACK_TOP: usize = 0x8000_0000;

fn va(addr: u32) -> Vaddr {
    Vaddr(addr as usize)
}

fn present(space: &vm::AddressSpace, addr: Vaddr) -> usize {
    match space.lookup_entry(addr).map(|e| e.state()) {
        Some(PteState::Present(paddr)) => paddr.0,
        other => panic!("{:?} not present: {:?}", addr, other),
    }
}

/// 用 0xAA 填满全部可分配的帧，确认缺页会把帧清干净
fn scribble(h: &common::Harness) {
    let mut paddr = h.machine.first_free();
    while paddr < h.machine.ram_size() {
        h.machine.write_phys(paddr, &[0xAA; PAGE_SIZE]);
        paddr += PAGE_SIZE;
    }
}

#[test]
fn test_code_fault_reads_image_and_zero_tail() {
    let h = harness(8, 2, 8);
    scribble(&h);
    let code = pattern(1, PAGE_SIZE + 1904);
    let space = h.spawn("/bin/true", two_segment_image(&code, &pattern(2, 100), 100));

    h.vm.fault(FaultKind::Read, va(CODE_BASE + 10)).unwrap();
    let p0 = present(&space, va(CODE_BASE));
    assert_eq!(h.machine.read_page(p0), code[..PAGE_SIZE]);

    h.vm.fault(FaultKind::Read, va(CODE_BASE + PAGE_SIZE as u32)).unwrap();
    let p1 = present(&space, va(CODE_BASE + PAGE_SIZE as u32));
    let page = h.machine.read_page(p1);
    assert_eq!(page[..1904], code[PAGE_SIZE..]);
    assert!(page[1904..].iter().all(|&b| b == 0));

    let entry = h.vm.tlb().lookup(va(CODE_BASE)).unwrap();
    assert!(entry.is_valid());
    assert!(!entry.is_writable());
    assert_eq!(entry.paddr().0, p0);

    let stats = h.vm.stats().snapshot();
    assert_eq!(stats.get(StatKind::TlbFaults), 2);
    assert_eq!(stats.get(StatKind::PageFaultsDisk), 2);
    assert_eq!(stats.get(StatKind::PageFaultsElf), 2);
    assert_eq!(stats.get(StatKind::PageFaultsZeroed), 0);
    assert!(stats.is_consistent());
}

#[test]
fn test_bss_page_is_zero_filled() {
    let h = harness(8, 2, 8);
    scribble(&h);
    let data = pattern(3, 100);
    let space = h.spawn("/bin/bss", two_segment_image(&pattern(1, 64), &data, 3 * PAGE_SIZE as u32));

    let bss = va(DATA_BASE + 2 * PAGE_SIZE as u32);
    h.vm.fault(FaultKind::Write, bss + 8).unwrap();
    let paddr = present(&space, bss);
    assert!(h.machine.read_page(paddr).iter().all(|&b| b == 0));

    let entry = h.vm.tlb().lookup(bss).unwrap();
    assert!(entry.is_writable());

    h.vm.fault(FaultKind::Read, va(DATA_BASE)).unwrap();
    let first = h.machine.read_page(present(&space, va(DATA_BASE)));
    assert_eq!(first[..100], data[..]);
    assert!(first[100..].iter().all(|&b| b == 0));

    let stats = h.vm.stats().snapshot();
    assert_eq!(stats.get(StatKind::PageFaultsZeroed), 1);
    assert_eq!(stats.get(StatKind::PageFaultsElf), 1);
}

#[test]
fn test_stack_fault_is_zeroed_and_writable() {
    let h = harness(8, 2, 8);
    scribble(&h);
    let space = h.spawn("/bin/stack", two_segment_image(&pattern(1, 64), &pattern(2, 64), 64));

    let top_page = Vaddr(STACK_TOP - PAGE_SIZE);
    h.vm.fault(FaultKind::Write, Vaddr(STACK_TOP - 8)).unwrap();
    let paddr = present(&space, top_page);
    assert!(h.machine.read_page(paddr).iter().all(|&b| b == 0));
    assert!(h.vm.tlb().lookup(top_page).unwrap().is_writable());

    // 栈只有 4 页
    let below = Vaddr(STACK_TOP - 5 * PAGE_SIZE);
    assert_eq!(h.vm.fault(FaultKind::Write, below), Err(VmError::BadAddress));
}

#[test]
fn test_reload_does_not_touch_the_image() {
    let h = harness(8, 2, 8);
    let space = h.spawn("/bin/reload", two_segment_image(&pattern(1, 64), &pattern(2, 64), 64));
    let image = h.fs.0.file("/bin/reload").unwrap();

    h.vm.fault(FaultKind::Read, va(CODE_BASE)).unwrap();
    let paddr = present(&space, va(CODE_BASE));
    let reads = image.read_count();

    h.vm.activate();
    assert!(h.vm.tlb().lookup(va(CODE_BASE)).is_none());

    h.vm.fault(FaultKind::Read, va(CODE_BASE + 4)).unwrap();
    assert_eq!(present(&space, va(CODE_BASE)), paddr);
    assert_eq!(image.read_count(), reads);
    assert_eq!(h.vm.coremap().frame_stats().user, 1);

    let stats = h.vm.stats().snapshot();
    assert_eq!(stats.get(StatKind::TlbReloads), 1);
    assert_eq!(stats.get(StatKind::TlbInvalidations), 1);
    assert!(stats.is_consistent());
}

#[test]
fn test_write_to_code_is_rejected() {
    let h = harness(8, 2, 8);
    let space = h.spawn("/bin/ro", two_segment_image(&pattern(1, 64), &pattern(2, 64), 64));

    assert_eq!(
        h.vm.fault(FaultKind::Write, va(CODE_BASE)),
        Err(VmError::ProtectionViolation)
    );
    assert_eq!(
        h.vm.fault(FaultKind::ReadOnly, va(DATA_BASE)),
        Err(VmError::ProtectionViolation)
    );
    assert_eq!(space.residency(), (0, 0));
    assert_eq!(h.vm.stats().snapshot().get(StatKind::TlbFaults), 0);
}

#[test]
fn test_fault_outside_segments() {
    let h = harness(8, 2, 8);
    h.spawn("/bin/bad", two_segment_image(&pattern(1, 64), &pattern(2, 64), 64));

    assert_eq!(h.vm.fault(FaultKind::Read, Vaddr(0)), Err(VmError::BadAddress));
    assert_eq!(
        h.vm.fault(FaultKind::Read, va(DATA_BASE + PAGE_SIZE as u32)),
        Err(VmError::BadAddress)
    );
    assert_eq!(h.vm.coremap().frame_stats().user, 0);
}

#[test]
fn test_fault_without_address_space() {
    let h = harness(8, 2, 8);
    assert_eq!(
        h.vm.fault(FaultKind::Read, va(CODE_BASE)),
        Err(VmError::NoAddressSpace)
    );
    // 内核线程切换时保留 TLB
    h.vm.activate();
    assert_eq!(h.vm.stats().snapshot().get(StatKind::TlbInvalidations), 0);
}

#[test]
fn test_missing_image_fails_the_fault() {
    let h = harness(8, 2, 8);
    let space = h.spawn("/bin/gone", two_segment_image(&pattern(1, 64), &pattern(2, 64), 64));
    h.fs.0.insert("/bin/gone", b"garbage".to_vec());

    assert_eq!(
        h.vm.fault(FaultKind::Read, va(CODE_BASE)),
        Err(VmError::InvalidExecutable)
    );
    assert_eq!(space.residency(), (0, 0));
    assert_eq!(h.vm.coremap().frame_stats().user, 0);
    assert!(h.vm.coremap().fifo_order().is_empty());
}

#[test]
#[should_panic(expected = "interrupt context")]
fn test_fault_in_interrupt_panics() {
    let h = harness(8, 2, 8);
    h.spawn("/bin/irq", two_segment_image(&pattern(1, 64), &pattern(2, 64), 64));
    h.machine.set_in_interrupt(true);
    let _ = h.vm.fault(FaultKind::Read, va(CODE_BASE));
}

#[test]
fn test_full_tlb_replaces_slots_in_rotation() {
    let h = harness(16, 2, 8);
    let pages = 13;
    let space = h.spawn(
        "/bin/wide",
        two_segment_image(&pattern(1, 64), &pattern(2, 64), (pages * PAGE_SIZE) as u32),
    );
    let data_page = |i: usize| va(DATA_BASE + (i * PAGE_SIZE) as u32);
    let slot_vaddr = |slot: usize| {
        let (hi, lo) = h.machine.tlb_read(slot);
        vm::TlbEntry { hi, lo }.vaddr()
    };

    for i in 0..12 {
        h.vm.fault(FaultKind::Read, data_page(i)).unwrap();
    }
    let stats = h.vm.stats().snapshot();
    assert_eq!(stats.get(StatKind::TlbFaults), 12);
    assert_eq!(stats.get(StatKind::TlbFaultsWithFree), 8);
    assert_eq!(stats.get(StatKind::TlbFaultsWithReplace), 4);
    assert!(stats.is_consistent());

    // 前 8 页依次占满空槽，之后从 0 号槽开始轮转替换
    for slot in 0..4 {
        assert_eq!(slot_vaddr(slot), data_page(slot + 8));
    }
    for slot in 4..8 {
        assert_eq!(slot_vaddr(slot), data_page(slot));
    }
    for i in 0..4 {
        assert!(h.vm.tlb().lookup(data_page(i)).is_none());
    }
    for i in 4..12 {
        let entry = h.vm.tlb().lookup(data_page(i)).unwrap();
        assert_eq!(entry.paddr().0, present(&space, data_page(i)));
    }

    h.vm.fault(FaultKind::Read, data_page(12)).unwrap();
    assert_eq!(slot_vaddr(4), data_page(12));
    assert!(h.vm.tlb().lookup(data_page(4)).is_none());
    assert_eq!(h.vm.stats().snapshot().get(StatKind::TlbFaultsWithReplace), 5);

    // 页还在内存里，再次访问只重装 TLB
    h.vm.fault(FaultKind::Read, data_page(0)).unwrap();
    assert_eq!(slot_vaddr(5), data_page(0));
    let stats = h.vm.stats().snapshot();
    assert_eq!(stats.get(StatKind::TlbReloads), 1);
    assert_eq!(stats.get(StatKind::TlbFaultsWithReplace), 6);
    assert_eq!(space.residency(), (13, 0));
}
