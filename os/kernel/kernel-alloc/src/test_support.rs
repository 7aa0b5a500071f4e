//! Host stand-ins for physical memory and the MMU.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{PagingHardware, PhysMapper};
use std::sync::Mutex;

#[repr(align(4096))]
struct Aligned4K {
    _bytes: [u8; 4096],
}

/// "Physical RAM" backed by a vector of frames; `pa` is a byte offset.
pub struct TestPhys {
    _frames: Vec<Aligned4K>,
    base: *mut u8,
    len: usize,
}

// Safety: the pointer targets the owned vector; synchronization is the caller's.
unsafe impl Send for TestPhys {}
unsafe impl Sync for TestPhys {}

impl TestPhys {
    pub fn with_frames(n: usize) -> Self {
        let mut frames: Vec<Aligned4K> = (0..n).map(|_| Aligned4K { _bytes: [0; 4096] }).collect();
        let base = frames.as_mut_ptr().cast::<u8>();
        Self {
            _frames: frames,
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

/// Fixed root, recorded invalidations.
pub struct TestPaging {
    pub root: PhysicalAddress,
    pub flushed: Mutex<Vec<VirtualAddress>>,
}

impl TestPaging {
    pub fn new(root: PhysicalAddress) -> Self {
        Self {
            root,
            flushed: Mutex::new(Vec::new()),
        }
    }

    pub fn flushed(&self) -> Vec<VirtualAddress> {
        self.flushed.lock().unwrap().clone()
    }
}

impl PagingHardware for TestPaging {
    fn active_root(&self) -> PhysicalAddress {
        self.root
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.flushed.lock().unwrap().push(va);
    }
}
