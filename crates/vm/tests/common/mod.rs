//! Shared fixtures for the VM scenario tests.

#![allow(dead_code)]

use device::{BlockDriver, RamDisk};
use std::sync::{Arc, Mutex, OnceLock};
use vm::{
    AddressSpace, IpiSender, PAGE_SIZE, Pid, Process, RegionPerms, Vaddr, VmConfig, VmManager,
};

/// Base address used for the test data region.
pub const REGION_BASE: usize = 0x0040_0000;

/// IPI transport that services the target core's mailbox inline,
/// standing in for the remote core's trap handler. Every doorbell is
/// recorded so tests can assert which core was interrupted.
pub struct LoopbackIpi {
    vm: OnceLock<Arc<VmManager>>,
    sent: Mutex<Vec<usize>>,
}

impl LoopbackIpi {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackIpi {
            vm: OnceLock::new(),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn attach(&self, vm: Arc<VmManager>) {
        let _ = self.vm.set(vm);
    }

    /// Cores that have received a shootdown doorbell so far.
    pub fn sent(&self) -> Vec<usize> {
        self.sent.lock().unwrap().clone()
    }
}

impl IpiSender for LoopbackIpi {
    fn send(&self, target_core: usize) {
        self.sent.lock().unwrap().push(target_core);
        let vm = self.vm.get().expect("LoopbackIpi not attached to a VmManager");
        vm.tlb_shootdown(target_core);
    }
}

/// Build a VM with the given amount of managed RAM and optional swap.
pub fn build_vm(ram_pages: usize, swap_pages: Option<usize>, cores: usize) -> Arc<VmManager> {
    let (vm, _) = build_vm_with_ipi(ram_pages, swap_pages, cores);
    vm
}

/// Like [`build_vm`], also handing back the loopback transport for
/// tests that inspect the doorbell log.
pub fn build_vm_with_ipi(
    ram_pages: usize,
    swap_pages: Option<usize>,
    cores: usize,
) -> (Arc<VmManager>, Arc<LoopbackIpi>) {
    let ipi = LoopbackIpi::new();
    let dev =
        swap_pages.map(|pages| RamDisk::new(pages * PAGE_SIZE, 512) as Arc<dyn BlockDriver>);
    let vm = Arc::new(VmManager::new(VmConfig::new(ram_pages, cores), dev, ipi.clone()));
    ipi.attach(vm.clone());
    (vm, ipi)
}

/// Create and register a process with one read-write data region.
pub fn spawn_proc(
    vm: &Arc<VmManager>,
    pid: u32,
    core: usize,
    region_pages: usize,
) -> Arc<Process> {
    let space = vm.as_create();
    if region_pages > 0 {
        space
            .define_region(Vaddr(REGION_BASE), region_pages * PAGE_SIZE, RegionPerms::rw())
            .expect("define test region");
    }
    let proc = Process::new(Pid(pid), core, space);
    vm.registry().register(proc.clone());
    proc
}

/// Tear a process down in the required order: space first, then registry.
pub fn reap_proc(vm: &Arc<VmManager>, proc: &Arc<Process>) {
    vm.as_destroy(proc.space());
    vm.registry().unregister(proc.pid());
}

/// Virtual address of the n-th page of the test region.
pub fn region_page(n: usize) -> Vaddr {
    Vaddr(REGION_BASE + n * PAGE_SIZE)
}

/// Deterministic page-sized pattern derived from a seed.
pub fn page_pattern(seed: usize) -> Vec<u8> {
    (0..PAGE_SIZE)
        .map(|i| (seed.wrapping_mul(31).wrapping_add(i.wrapping_mul(7)) % 251) as u8)
        .collect()
}

/// Write `page_pattern(seed)` into the page at `va`.
pub fn fill_page(vm: &Arc<VmManager>, proc: &Arc<Process>, va: Vaddr, seed: usize) {
    vm.write_bytes_at(proc, va, &page_pattern(seed))
        .expect("fill_page");
}

/// Assert the page at `va` holds exactly `page_pattern(seed)`.
pub fn assert_page(vm: &Arc<VmManager>, proc: &Arc<Process>, va: Vaddr, seed: usize) {
    let mut buf = vec![0u8; PAGE_SIZE];
    vm.read_bytes_at(proc, va, &mut buf).expect("assert_page");
    assert_eq!(buf, page_pattern(seed), "page at {:#x} corrupted", va.as_usize());
}

/// Resident/swapped page counts of an address space.
pub fn backing_counts(space: &Arc<AddressSpace>, region_pages: usize) -> (usize, usize) {
    let mut resident = 0;
    let mut swapped = 0;
    for n in 0..region_pages {
        match space.page_backing(region_page(n).page_floor()) {
            Some(vm::PageBacking::Resident(_)) => resident += 1,
            Some(vm::PageBacking::Swapped(_)) => swapped += 1,
            None => {}
        }
    }
    (resident, swapped)
}
