#![allow(dead_code)]

use kernel_alloc::HeapBacking;
use kernel_alloc::vmm::VmmError;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{PagingHardware, PhysMapper};
use std::sync::Mutex;

pub const FRAME: u64 = 4096;
pub const MIB: u64 = 1024 * 1024;

#[repr(align(4096))]
pub struct Page(pub [u8; 4096]);

/// "Physical RAM": physical address `pa` is byte `pa` of the page vector.
pub struct TestPhys {
    _pages: Vec<Page>,
    base: *mut u8,
    len: usize,
}

unsafe impl Send for TestPhys {}
unsafe impl Sync for TestPhys {}

impl TestPhys {
    pub fn with_bytes(bytes: u64) -> Self {
        let n = usize::try_from(bytes / FRAME).unwrap();
        let mut pages: Vec<Page> = (0..n).map(|_| Page([0; 4096])).collect();
        let base = pages.as_mut_ptr().cast::<u8>();
        Self {
            _pages: pages,
            base,
            len: n * 4096,
        }
    }
}

impl PhysMapper for TestPhys {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let off = usize::try_from(pa.as_u64()).unwrap();
        assert!(off < self.len, "{pa} outside test RAM");
        unsafe { self.base.add(off) }
    }
}

/// Records invalidated pages.
#[derive(Default)]
pub struct TestPaging {
    pub flushed: Mutex<Vec<VirtualAddress>>,
}

impl PagingHardware for TestPaging {
    fn active_root(&self) -> PhysicalAddress {
        PhysicalAddress::zero()
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.flushed.lock().unwrap().push(va);
    }
}

/// Host memory standing in for a virtual range; every call succeeds.
pub struct HostRange {
    pages: Vec<Page>,
}

impl HostRange {
    pub fn new(pages: usize) -> Self {
        Self {
            pages: (0..pages).map(|_| Page([0; 4096])).collect(),
        }
    }

    pub fn start(&mut self) -> VirtualAddress {
        VirtualAddress::from_ptr(self.pages.as_mut_ptr())
    }

    pub fn len(&self) -> usize {
        self.pages.len() * 4096
    }
}

impl HeapBacking for HostRange {
    fn map_pages(&mut self, _start: VirtualAddress, _pages: usize) -> Result<(), VmmError> {
        Ok(())
    }
}
