//! Demand-paging scenario tests: fault legality, first-touch zero fill,
//! heap growth, kernel copy helpers, and TLB bookkeeping.

mod common;

use common::*;
use uapi::errno;
use vm::{FaultKind, PAGE_SIZE, Pid, USER_STACK_TOP, Vaddr, VmError};

#[test]
fn test_first_fault_yields_zero_page() {
    let vm = build_vm(8, None, 1);
    let proc = spawn_proc(&vm, 1, 0, 2);

    vm.vm_fault(proc.pid(), FaultKind::Read, region_page(0))
        .expect("legal region fault");

    let mut buf = vec![0xFFu8; PAGE_SIZE];
    vm.read_bytes_at(&proc, region_page(0), &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0), "first touch must observe zeros");
}

#[test]
fn test_fault_on_unknown_pid_is_bad_address() {
    let vm = build_vm(4, None, 1);
    assert_eq!(
        vm.vm_fault(Pid(99), FaultKind::Read, region_page(0)),
        Err(VmError::BadAddress)
    );
}

#[test]
fn test_fault_legality_checks() {
    let vm = build_vm(8, None, 1);
    let proc = spawn_proc(&vm, 1, 0, 2);
    let pid = proc.pid();

    // Inside the region and inside the stack: legal.
    assert!(vm.vm_fault(pid, FaultKind::Write, region_page(1)).is_ok());
    assert!(
        vm.vm_fault(pid, FaultKind::Write, Vaddr(USER_STACK_TOP - PAGE_SIZE))
            .is_ok()
    );

    // At or above the stack top: rejected.
    assert_eq!(
        vm.vm_fault(pid, FaultKind::Read, Vaddr(USER_STACK_TOP)),
        Err(VmError::BadAddress)
    );
    // In the hole between heap bound and stack base: rejected.
    let (_, heap_bound) = proc.space().heap_bounds();
    assert_eq!(
        vm.vm_fault(pid, FaultKind::Read, heap_bound),
        Err(VmError::BadAddress)
    );
    // Below the heap but outside any region: rejected.
    assert_eq!(
        vm.vm_fault(pid, FaultKind::Read, Vaddr(0x1000)),
        Err(VmError::BadAddress)
    );
    assert_eq!(VmError::BadAddress.errno(), errno::EFAULT);
}

#[test]
fn test_refault_on_resident_page_is_idempotent() {
    let vm = build_vm(8, None, 1);
    let proc = spawn_proc(&vm, 1, 0, 1);
    fill_page(&vm, &proc, region_page(0), 7);

    let used = vm.coremap_used_bytes();
    for _ in 0..3 {
        vm.vm_fault(proc.pid(), FaultKind::Read, region_page(0)).unwrap();
    }
    assert_eq!(vm.coremap_used_bytes(), used);
    assert_page(&vm, &proc, region_page(0), 7);
}

#[test]
fn test_sbrk_grows_and_heap_pages_fault_in() {
    let vm = build_vm(8, None, 1);
    let proc = spawn_proc(&vm, 1, 0, 1);

    let (heap_base, _) = proc.space().heap_bounds();
    let old = vm.sbrk(&proc, 2).expect("grow heap");
    assert_eq!(old, heap_base);

    // Heap pages materialize on first touch, zero-filled.
    fill_page(&vm, &proc, heap_base, 11);
    assert_page(&vm, &proc, heap_base, 11);

    // Beyond the new bound is still the hole.
    let (_, bound) = proc.space().heap_bounds();
    assert_eq!(
        vm.vm_fault(proc.pid(), FaultKind::Read, bound),
        Err(VmError::BadAddress)
    );
}

#[test]
fn test_sbrk_shrink_releases_pages() {
    let vm = build_vm(8, None, 1);
    let proc = spawn_proc(&vm, 1, 0, 1);

    let (heap_base, _) = proc.space().heap_bounds();
    vm.sbrk(&proc, 3).unwrap();
    for n in 0..3 {
        fill_page(&vm, &proc, Vaddr(heap_base.as_usize() + n * PAGE_SIZE), n);
    }
    let used = vm.coremap_used_bytes();

    vm.sbrk(&proc, -2).expect("shrink heap");
    assert_eq!(vm.coremap_used_bytes(), used - 2 * PAGE_SIZE);

    // Shrinking below the heap base is a caller error.
    assert_eq!(vm.sbrk(&proc, -2), Err(VmError::InvalidArgument));

    // Regrown heap pages are fresh zero pages, not stale content.
    vm.sbrk(&proc, 2).unwrap();
    let second = Vaddr(heap_base.as_usize() + PAGE_SIZE);
    let mut buf = vec![0xFFu8; PAGE_SIZE];
    vm.read_bytes_at(&proc, second, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn test_copy_helpers_cross_page_boundaries() {
    let vm = build_vm(8, None, 1);
    let proc = spawn_proc(&vm, 1, 0, 3);

    // A write straddling two pages, at an unaligned offset.
    let va = Vaddr(REGION_BASE + PAGE_SIZE - 5);
    let data: Vec<u8> = (0..32u8).collect();
    vm.write_bytes_at(&proc, va, &data).unwrap();

    let mut back = vec![0u8; 32];
    vm.read_bytes_at(&proc, va, &mut back).unwrap();
    assert_eq!(back, data);

    // Both touched pages were materialized by the copy itself.
    assert!(proc.space().page_backing(va.page_floor()).is_some());
    assert!(
        proc.space()
            .page_backing(Vaddr(REGION_BASE + PAGE_SIZE).page_floor())
            .is_some()
    );
}

#[test]
fn test_fault_installs_tlb_entry_and_activate_flushes() {
    let vm = build_vm(8, None, 1);
    let proc = spawn_proc(&vm, 1, 0, 1);

    assert!(vm.tlb_probe(0, region_page(0)).is_none());
    vm.vm_fault(proc.pid(), FaultKind::Write, region_page(0)).unwrap();
    assert!(vm.tlb_probe(0, region_page(0)).is_some());

    // Context switch: the core's TLB is flushed; a later fault reinstalls.
    vm.as_activate(0);
    assert!(vm.tlb_probe(0, region_page(0)).is_none());
    vm.vm_fault(proc.pid(), FaultKind::Read, region_page(0)).unwrap();
    assert!(vm.tlb_probe(0, region_page(0)).is_some());
}

#[test]
#[should_panic(expected = "readonly fault")]
fn test_readonly_fault_is_fatal() {
    let vm = build_vm(4, None, 1);
    let proc = spawn_proc(&vm, 1, 0, 1);
    let _ = vm.vm_fault(proc.pid(), FaultKind::Readonly, region_page(0));
}
