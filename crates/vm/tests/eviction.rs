//! FIFO 置换与交换区的集成测试

mod common;

use common::{CODE_BASE, DATA_BASE, harness, two_segment_image};
use test_support::mock::elf::pattern;
use vm::{AddressSpace, FaultKind, PAGE_SIZE, PteState, StatKind, SwapSlot, Vaddr, VmError};

fn data_page(index: usize) -> Vaddr {
    Vaddr(DATA_BASE as usize + index * PAGE_SIZE)
}

fn state(space: &AddressSpace, addr: Vaddr) -> PteState {
    space.lookup_entry(addr).unwrap().state()
}

fn paddr_of(space: &AddressSpace, addr: Vaddr) -> usize {
    match state(space, addr) {
        PteState::Present(paddr) => paddr.0,
        other => panic!("{:?} not present: {:?}", addr, other),
    }
}

fn slot_of(space: &AddressSpace, addr: Vaddr) -> SwapSlot {
    match state(space, addr) {
        PteState::Swapped(slot) => slot,
        other => panic!("{:?} not swapped: {:?}", addr, other),
    }
}

fn image(data_pages: usize) -> Vec<u8> {
    two_segment_image(
        &pattern(1, 256),
        &pattern(2, 100),
        (data_pages * PAGE_SIZE) as u32,
    )
}

#[test]
fn test_single_frame_swaps_out_and_back() {
    let h = harness(3, 2, 8);
    let space = h.spawn("/bin/swap", image(2));
    let written = pattern(9, PAGE_SIZE);

    h.vm.fault(FaultKind::Write, data_page(0)).unwrap();
    let frame = paddr_of(&space, data_page(0));
    // 用户程序写了整页
    h.machine.write_phys(frame, &written);

    h.vm.fault(FaultKind::Read, Vaddr(CODE_BASE as usize)).unwrap();
    assert_eq!(paddr_of(&space, Vaddr(CODE_BASE as usize)), frame);
    let slot = slot_of(&space, data_page(0));
    assert!(h.vm.swap().is_slot_used(slot));
    assert!(h.vm.tlb().lookup(data_page(0)).is_none());
    let swapfile = h.swap_file().contents();
    assert_eq!(swapfile[slot.offset()..slot.offset() + PAGE_SIZE], written[..]);

    h.vm.fault(FaultKind::Read, data_page(0) + 12).unwrap();
    assert_eq!(paddr_of(&space, data_page(0)), frame);
    assert_eq!(h.machine.read_page(frame), written);
    assert!(!h.vm.swap().is_slot_used(slot));
    assert!(matches!(state(&space, Vaddr(CODE_BASE as usize)), PteState::Swapped(_)));
    assert_eq!(h.vm.swap().used_slots(), 1);

    let stats = h.vm.stats().snapshot();
    assert_eq!(stats.get(StatKind::SwapfileWrites), 2);
    assert_eq!(stats.get(StatKind::PageFaultsSwap), 1);
    assert_eq!(stats.get(StatKind::PageFaultsElf), 2);
    assert_eq!(stats.get(StatKind::PageFaultsDisk), 3);
    assert!(stats.is_consistent());
}

#[test]
fn test_victims_leave_in_fifo_order() {
    let h = harness(8, 2, 16);
    let space = h.spawn("/bin/fifo", image(8));

    let mut frames = Vec::new();
    for index in 0..6 {
        h.vm.fault(FaultKind::Write, data_page(index)).unwrap();
        frames.push(vm::Paddr(paddr_of(&space, data_page(index))));
    }
    assert_eq!(h.vm.coremap().fifo_order(), frames);
    assert_eq!(h.vm.coremap().frame_stats().user, 6);

    // 重新装入 TLB 不改变队列顺序
    h.vm.fault(FaultKind::Read, data_page(0)).unwrap();
    assert_eq!(h.vm.coremap().fifo_order(), frames);

    h.vm.fault(FaultKind::Write, data_page(6)).unwrap();
    slot_of(&space, data_page(0));
    assert_eq!(paddr_of(&space, data_page(6)), frames[0].0);
    assert_eq!(
        h.vm.coremap().owner_of(frames[0]),
        Some((space.id(), data_page(6)))
    );
    assert_eq!(h.vm.coremap().frame_state(frames[0]), Some(vm::FrameState::User));

    h.vm.fault(FaultKind::Write, data_page(7)).unwrap();
    slot_of(&space, data_page(1));
    assert_eq!(paddr_of(&space, data_page(7)), frames[1].0);

    let mut expected = frames[2..].to_vec();
    expected.extend_from_slice(&frames[..2]);
    assert_eq!(h.vm.coremap().fifo_order(), expected);
    assert_eq!(space.residency(), (6, 2));
}

#[test]
fn test_destroy_releases_frames_and_slots() {
    let h = harness(3, 2, 8);
    let space = h.spawn("/bin/destroy", image(2));

    h.vm.fault(FaultKind::Write, data_page(0)).unwrap();
    h.vm.fault(FaultKind::Write, data_page(1)).unwrap();
    assert_eq!(space.residency(), (1, 1));
    assert_eq!(h.vm.swap().used_slots(), 1);
    let before = h.vm.coremap().frame_stats();

    h.process.0.switch_to(None);
    h.vm.destroy_address_space(&space);

    let after = h.vm.coremap().frame_stats();
    assert_eq!(after.user, before.user - 1);
    assert_eq!(after.free, before.free + 1);
    assert_eq!(h.vm.swap().used_slots(), 0);
    assert!(h.vm.coremap().fifo_order().is_empty());
    assert!(space.lookup_entry(data_page(0)).is_none());
    assert_eq!(space.image(), None);

    // 释放的帧可以直接给下一个进程用，不再置换
    let next = h.spawn("/bin/next", image(1));
    h.vm.fault(FaultKind::Read, data_page(0)).unwrap();
    assert_eq!(next.residency(), (1, 0));
    assert_eq!(h.vm.stats().snapshot().get(StatKind::SwapfileWrites), 1);
}

#[test]
fn test_orphan_frame_is_reused_without_swapping() {
    let h = harness(3, 2, 8);
    let first = h.spawn("/bin/first", image(1));
    h.vm.fault(FaultKind::Write, data_page(0)).unwrap();
    h.process.0.switch_to(None);
    drop(first);

    let second = h.spawn("/bin/second", image(1));
    h.vm.fault(FaultKind::Read, Vaddr(CODE_BASE as usize)).unwrap();
    assert_eq!(second.residency(), (1, 0));
    assert_eq!(h.vm.swap().used_slots(), 0);
    assert_eq!(h.vm.stats().snapshot().get(StatKind::SwapfileWrites), 0);
}

#[test]
fn test_fault_waits_for_pinned_frame() {
    let h = harness(3, 2, 8);
    let holder = h.spawn("/bin/holder", image(1));
    let waiter = h.spawn("/bin/waiter", image(1));
    let vm = &h.vm;

    // 唯一的用户帧正在被另一个缺页装入内容
    let pinned = vm
        .coremap()
        .reserve_user_frame(data_page(0), &holder, vm.swap(), vm.tlb(), vm.stats())
        .unwrap();
    assert_eq!(vm.coremap().fifo_order(), vec![pinned]);

    std::thread::scope(|s| {
        let fault = s.spawn(|| vm.fault_in(&waiter, FaultKind::Read, data_page(0)));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!fault.is_finished());

        vm.coremap().unpin(pinned);
        assert_eq!(fault.join().unwrap(), Ok(()));
    });

    assert_eq!(paddr_of(&waiter, data_page(0)), pinned.0);
    assert_eq!(vm.coremap().fifo_order(), vec![pinned]);
    assert_eq!(waiter.residency(), (1, 0));
    // 持有者还没写页表项，换出的槽随即归还
    assert_eq!(vm.swap().used_slots(), 0);
    assert_eq!(vm.stats().snapshot().get(StatKind::SwapfileWrites), 1);
}

#[test]
fn test_out_of_swap_space_keeps_the_victim() {
    let h = harness(3, 2, 1);
    let space = h.spawn("/bin/full", image(3));

    h.vm.fault(FaultKind::Write, data_page(0)).unwrap();
    h.vm.fault(FaultKind::Write, data_page(1)).unwrap();
    let frame = paddr_of(&space, data_page(1));

    let err = h.vm.fault(FaultKind::Write, data_page(2)).unwrap_err();
    assert_eq!(err, VmError::OutOfSwapSpace);
    assert!(err.is_fatal());
    assert_eq!(paddr_of(&space, data_page(1)), frame);
    assert_eq!(state(&space, data_page(2)), PteState::NotLoaded);
    assert_eq!(h.vm.coremap().fifo_order(), vec![vm::Paddr(frame)]);
}

#[test]
fn test_short_swap_write_is_fatal() {
    let h = harness(3, 2, 8);
    let space = h.spawn("/bin/short", image(2));
    h.swap_file().set_transfer_limit(100);

    h.vm.fault(FaultKind::Write, data_page(0)).unwrap();
    let err = h.vm.fault(FaultKind::Write, data_page(1)).unwrap_err();
    assert_eq!(err, VmError::TruncatedIo);
    assert!(err.is_fatal());
    assert_eq!(h.vm.swap().used_slots(), 0);
    assert!(matches!(state(&space, data_page(0)), PteState::Present(_)));
}
