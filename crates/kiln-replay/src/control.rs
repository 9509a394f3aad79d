//! Shared control block between the supervisor and its slaves.
//!
//! A single page of POD relaxed atomics plus a spinlock-protected bounded
//! ring of faulty module hashes. The layout is fixed and unversioned beyond
//! a magic/version pair: master and slaves are always the same binary. No
//! signalling primitive crosses the process boundary; readers poll and the
//! only synchronization event is slave termination itself.
//!
//! Each slave owns one attempt slot. Immediately before every risky driver
//! call it publishes, under the slot lock, the indices and module hashes of
//! the work it is about to hand the driver; the master reads the slot only
//! after observing the slave's termination, so a torn view is impossible in
//! practice and harmless in principle (hashes are diagnostic only).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use kiln_archive::Hash;

use crate::engine::PipelineKind;
use crate::stats::KindSnapshot;

pub const CONTROL_MAGIC: u32 = 0x4b49_4c4e; // "KILN"
pub const CONTROL_VERSION: u32 = 1;
pub const CONTROL_BLOCK_SIZE: usize = 4096;

/// Cumulative faulty-module publication, read by the progress role.
pub const FAULTY_RING_CAPACITY: usize = 64;
/// One attempt slot per concurrently running slave.
pub const SLAVE_SLOTS: usize = 32;
/// Per-attempt module hash bound: the maximum shader stage count of a
/// pipeline (graphics stages plus the task/mesh pair).
pub const MAX_ATTEMPT_MODULES: usize = 6;

const _: () = assert!(std::mem::size_of::<ControlBlock>() <= CONTROL_BLOCK_SIZE);

#[repr(C)]
#[derive(Debug, Default)]
pub struct KindProgress {
    pub total: AtomicU32,
    pub completed: AtomicU32,
    pub skipped: AtomicU32,
    pub successful: AtomicU32,
}

impl KindProgress {
    pub fn snapshot(&self) -> KindSnapshot {
        KindSnapshot {
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
        }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct SlaveSlot {
    current_graphics_index: AtomicU32,
    current_compute_index: AtomicU32,
    pipeline_attempted: AtomicU32,
    lock: AtomicU32,
    attempt_module_count: AtomicU32,
    _pad: AtomicU32,
    attempt_modules: [AtomicU64; MAX_ATTEMPT_MODULES],
}

/// Post-mortem view of a slot, taken by the master after slave termination.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub current_graphics_index: u32,
    pub current_compute_index: u32,
    pub pipeline_attempted: bool,
    pub attempt_modules: Vec<Hash>,
}

#[repr(C)]
#[derive(Debug)]
pub struct ControlBlock {
    magic: AtomicU32,
    version: AtomicU32,
    pub graphics: KindProgress,
    pub compute: KindProgress,
    pub total_modules: AtomicU32,
    pub banned_modules: AtomicU32,
    pub clean_crashes: AtomicU32,
    pub dirty_crashes: AtomicU32,
    ring_lock: AtomicU32,
    faulty_count: AtomicU32,
    faulty_ring: [AtomicU64; FAULTY_RING_CAPACITY],
    slots: [SlaveSlot; SLAVE_SLOTS],
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self {
            magic: AtomicU32::new(0),
            version: AtomicU32::new(0),
            graphics: KindProgress::default(),
            compute: KindProgress::default(),
            total_modules: AtomicU32::new(0),
            banned_modules: AtomicU32::new(0),
            clean_crashes: AtomicU32::new(0),
            dirty_crashes: AtomicU32::new(0),
            ring_lock: AtomicU32::new(0),
            faulty_count: AtomicU32::new(0),
            faulty_ring: std::array::from_fn(|_| AtomicU64::new(0)),
            slots: std::array::from_fn(|_| SlaveSlot::default()),
        }
    }
}

impl ControlBlock {
    /// Stamp a freshly mapped (zeroed) block.
    pub fn init(&self) {
        self.magic.store(CONTROL_MAGIC, Ordering::Relaxed);
        self.version.store(CONTROL_VERSION, Ordering::Relaxed);
    }

    pub fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Relaxed) == CONTROL_MAGIC
            && self.version.load(Ordering::Relaxed) == CONTROL_VERSION
    }

    pub fn kind(&self, kind: PipelineKind) -> &KindProgress {
        match kind {
            PipelineKind::Graphics => &self.graphics,
            PipelineKind::Compute => &self.compute,
        }
    }

    /// Publish the pipeline index a slave is about to hand to the driver.
    pub fn publish_pipeline_index(&self, slot: usize, kind: PipelineKind, index: u32) {
        let slot = &self.slots[slot];
        match kind {
            PipelineKind::Graphics => {
                slot.current_graphics_index.store(index, Ordering::Relaxed)
            }
            PipelineKind::Compute => slot.current_compute_index.store(index, Ordering::Relaxed),
        }
        slot.pipeline_attempted.store(1, Ordering::Release);
    }

    /// Publish the module hashes involved in the imminent driver call.
    pub fn publish_attempt_modules(&self, slot: usize, modules: &[Hash]) {
        let slot = &self.slots[slot];
        lock_spin(&slot.lock);
        let count = modules.len().min(MAX_ATTEMPT_MODULES);
        for (target, hash) in slot.attempt_modules.iter().zip(modules) {
            target.store(*hash, Ordering::Relaxed);
        }
        slot.attempt_module_count
            .store(count as u32, Ordering::Relaxed);
        unlock_spin(&slot.lock);
    }

    /// Post-mortem read. A slave killed mid-publication leaves the slot
    /// lock held forever, so the acquire is bounded; past the bound the
    /// (diagnostic-only) fields are read anyway.
    pub fn read_slot(&self, slot: usize) -> SlotSnapshot {
        let slot = &self.slots[slot];
        let locked = lock_spin_bounded(&slot.lock, 1 << 20);
        let count = slot.attempt_module_count.load(Ordering::Relaxed) as usize;
        let attempt_modules = slot.attempt_modules[..count.min(MAX_ATTEMPT_MODULES)]
            .iter()
            .map(|hash| hash.load(Ordering::Relaxed))
            .collect();
        let snapshot = SlotSnapshot {
            current_graphics_index: slot.current_graphics_index.load(Ordering::Relaxed),
            current_compute_index: slot.current_compute_index.load(Ordering::Relaxed),
            pipeline_attempted: slot.pipeline_attempted.load(Ordering::Acquire) != 0,
            attempt_modules,
        };
        if locked {
            unlock_spin(&slot.lock);
        }
        snapshot
    }

    /// Clear a slot before handing it to a new slave.
    pub fn reset_slot(&self, slot: usize) {
        let slot = &self.slots[slot];
        lock_spin(&slot.lock);
        slot.current_graphics_index.store(0, Ordering::Relaxed);
        slot.current_compute_index.store(0, Ordering::Relaxed);
        slot.pipeline_attempted.store(0, Ordering::Relaxed);
        slot.attempt_module_count.store(0, Ordering::Relaxed);
        unlock_spin(&slot.lock);
    }

    /// Append a faulty module hash to the ring. Returns false once the ring
    /// is full; the counters still record the ban.
    pub fn push_faulty_module(&self, hash: Hash) -> bool {
        lock_spin(&self.ring_lock);
        let count = self.faulty_count.load(Ordering::Relaxed) as usize;
        let pushed = if count < FAULTY_RING_CAPACITY {
            self.faulty_ring[count].store(hash, Ordering::Relaxed);
            self.faulty_count.store(count as u32 + 1, Ordering::Relaxed);
            true
        } else {
            false
        };
        unlock_spin(&self.ring_lock);
        pushed
    }

    pub fn faulty_modules(&self) -> Vec<Hash> {
        lock_spin(&self.ring_lock);
        let count = (self.faulty_count.load(Ordering::Relaxed) as usize).min(FAULTY_RING_CAPACITY);
        let hashes = self.faulty_ring[..count]
            .iter()
            .map(|hash| hash.load(Ordering::Relaxed))
            .collect();
        unlock_spin(&self.ring_lock);
        hashes
    }
}

fn lock_spin(lock: &AtomicU32) {
    while lock
        .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        std::hint::spin_loop();
    }
}

fn lock_spin_bounded(lock: &AtomicU32, max_spins: u32) -> bool {
    for _ in 0..max_spins {
        if lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return true;
        }
        std::hint::spin_loop();
    }
    false
}

fn unlock_spin(lock: &AtomicU32) {
    lock.store(0, Ordering::Release);
}

/// Where the control block lives: a private heap allocation (single process,
/// tests) or a shared mapping inherited across processes.
pub enum ControlRegion {
    Heap(Box<ControlBlock>),
    #[cfg(unix)]
    Mapped(shm::SharedMapping),
}

impl ControlRegion {
    pub fn new_heap() -> Arc<Self> {
        let region = Arc::new(Self::Heap(Box::default()));
        region.block().init();
        region
    }

    pub fn block(&self) -> &ControlBlock {
        match self {
            Self::Heap(block) => block,
            #[cfg(unix)]
            Self::Mapped(mapping) => mapping.block(),
        }
    }
}

/// A control region plus the attempt slot assigned to this process.
#[derive(Clone)]
pub struct ControlHandle {
    region: Arc<ControlRegion>,
    slot: usize,
}

impl ControlHandle {
    pub fn new(region: Arc<ControlRegion>, slot: usize) -> Self {
        assert!(slot < SLAVE_SLOTS, "slot {slot} out of range");
        Self { region, slot }
    }

    pub fn block(&self) -> &ControlBlock {
        self.region.block()
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[cfg(unix)]
pub mod shm {
    //! memfd-backed shared mapping of the control block.
    //!
    //! The only module that touches `libc`. The fd is created without
    //! `CLOEXEC` so spawned slaves inherit it at the same number, which is
    //! passed on their command line.

    use std::io;
    use std::os::unix::io::RawFd;
    use std::sync::Arc;

    use super::{ControlBlock, ControlRegion, CONTROL_BLOCK_SIZE};

    pub struct SharedMapping {
        ptr: *mut libc::c_void,
        fd: RawFd,
        owns_fd: bool,
    }

    // The mapping is shared memory full of atomics; the pointer itself is
    // stable for the lifetime of the mapping.
    unsafe impl Send for SharedMapping {}
    unsafe impl Sync for SharedMapping {}

    impl SharedMapping {
        /// Create a new zeroed control block region backed by a memfd.
        pub fn create() -> io::Result<Self> {
            let name = b"kiln-control\0";
            let fd = unsafe { libc::memfd_create(name.as_ptr().cast(), 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::ftruncate(fd, CONTROL_BLOCK_SIZE as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
            let mapping = Self::map(fd, true)?;
            mapping.block().init();
            Ok(mapping)
        }

        /// Attach to a region inherited from the parent process.
        pub fn from_inherited_fd(fd: RawFd) -> io::Result<Self> {
            let mapping = Self::map(fd, false)?;
            if !mapping.block().is_valid() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "shared control block has wrong magic/version",
                ));
            }
            Ok(mapping)
        }

        fn map(fd: RawFd, owns_fd: bool) -> io::Result<Self> {
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    CONTROL_BLOCK_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                if owns_fd {
                    unsafe { libc::close(fd) };
                }
                return Err(err);
            }
            Ok(Self { ptr, fd, owns_fd })
        }

        pub fn fd(&self) -> RawFd {
            self.fd
        }

        pub fn block(&self) -> &ControlBlock {
            // The mapping is at least CONTROL_BLOCK_SIZE bytes, page-aligned,
            // and ControlBlock is all atomics, for which zeroed memory is a
            // valid representation.
            unsafe { &*(self.ptr as *const ControlBlock) }
        }

        pub fn into_region(self) -> Arc<ControlRegion> {
            Arc::new(ControlRegion::Mapped(self))
        }
    }

    impl Drop for SharedMapping {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.ptr, CONTROL_BLOCK_SIZE);
                if self.owns_fd {
                    libc::close(self.fd);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn block_fits_one_page_and_layout_is_stable() {
        assert!(std::mem::size_of::<ControlBlock>() <= CONTROL_BLOCK_SIZE);
        assert_eq!(offset_of!(ControlBlock, magic), 0);
        assert_eq!(offset_of!(ControlBlock, version), 4);
        assert_eq!(offset_of!(ControlBlock, graphics), 8);
        assert_eq!(offset_of!(ControlBlock, compute), 24);
        assert_eq!(offset_of!(ControlBlock, total_modules), 40);
        assert_eq!(offset_of!(ControlBlock, ring_lock), 56);
        assert_eq!(offset_of!(ControlBlock, faulty_ring), 64);
        assert_eq!(
            offset_of!(ControlBlock, slots),
            64 + FAULTY_RING_CAPACITY * 8
        );
        assert_eq!(std::mem::size_of::<SlaveSlot>(), 24 + MAX_ATTEMPT_MODULES * 8);
    }

    #[test]
    fn slot_publication_round_trips() {
        let region = ControlRegion::new_heap();
        let block = region.block();
        assert!(block.is_valid());

        block.publish_attempt_modules(3, &[0xa, 0xb]);
        block.publish_pipeline_index(3, PipelineKind::Graphics, 17);

        let snapshot = block.read_slot(3);
        assert!(snapshot.pipeline_attempted);
        assert_eq!(snapshot.current_graphics_index, 17);
        assert_eq!(snapshot.attempt_modules, vec![0xa, 0xb]);

        block.reset_slot(3);
        let snapshot = block.read_slot(3);
        assert!(!snapshot.pipeline_attempted);
        assert!(snapshot.attempt_modules.is_empty());
    }

    #[test]
    fn faulty_ring_is_bounded() {
        let region = ControlRegion::new_heap();
        let block = region.block();
        for i in 0..FAULTY_RING_CAPACITY as u64 {
            assert!(block.push_faulty_module(i));
        }
        assert!(!block.push_faulty_module(0xdead));
        let hashes = block.faulty_modules();
        assert_eq!(hashes.len(), FAULTY_RING_CAPACITY);
        assert_eq!(hashes[0], 0);
        assert_eq!(hashes[FAULTY_RING_CAPACITY - 1], FAULTY_RING_CAPACITY as u64 - 1);
    }

    #[test]
    fn attempt_module_overflow_is_truncated() {
        let region = ControlRegion::new_heap();
        let block = region.block();
        let modules: Vec<u64> = (0..10).collect();
        block.publish_attempt_modules(0, &modules);
        let snapshot = block.read_slot(0);
        assert_eq!(snapshot.attempt_modules.len(), MAX_ATTEMPT_MODULES);
        assert_eq!(snapshot.attempt_modules, (0..6).collect::<Vec<u64>>());
    }

    #[cfg(unix)]
    #[test]
    fn shared_mapping_round_trips_counters() {
        let mapping = shm::SharedMapping::create().expect("create mapping");
        let fd = mapping.fd();
        mapping
            .block()
            .graphics
            .completed
            .store(5, std::sync::atomic::Ordering::Relaxed);

        let view = shm::SharedMapping::from_inherited_fd(fd).expect("attach");
        assert!(view.block().is_valid());
        assert_eq!(
            view.block()
                .graphics
                .completed
                .load(std::sync::atomic::Ordering::Relaxed),
            5
        );
    }
}
