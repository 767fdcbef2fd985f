//! Firmware handoff and the kernel heap.
//!
//! The bootloader leaves a Multiboot information block; the only parts the
//! kernel consumes are the memory-map entries (and the totals as a sanity
//! check). When the map is missing a 64 MiB fallback is synthesised so the
//! rest of boot can proceed on emulators with incomplete loaders.

use crate::frame_allocator;

/// Magic value in `eax` identifying a valid Multiboot handoff.
pub const MULTIBOOT_MAGIC: u32 = 0x2BAD_B002;

const FLAG_MEM: u32 = 1 << 0;
const FLAG_MMAP: u32 = 1 << 6;

/// Fallback memory size when no map is provided.
const FALLBACK_MEMORY: u64 = 64 * 1024 * 1024;

/// Multiboot information block, as laid out by the bootloader. Only the
/// fields up to the memory map are consumed.
#[repr(C, packed)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

/// One memory-map entry. `size` does not include itself, so the next entry
/// starts at `entry + size + 4`.
#[repr(C, packed)]
struct MmapEntry {
    size: u32,
    base: u64,
    length: u64,
    kind: u32,
}

/// Firmware classification of a physical region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Available,
    Reserved,
    AcpiReclaimable,
    Nvs,
    BadRam,
}

impl RegionKind {
    pub fn from_raw(raw: u32) -> RegionKind {
        match raw {
            1 => RegionKind::Available,
            3 => RegionKind::AcpiReclaimable,
            4 => RegionKind::Nvs,
            5 => RegionKind::BadRam,
            _ => RegionKind::Reserved,
        }
    }
}

/// A physical memory region from the firmware map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    const fn empty() -> MemoryRegion {
        MemoryRegion {
            base: 0,
            length: 0,
            kind: RegionKind::Reserved,
        }
    }
}

const MAX_REGIONS: usize = 32;

/// Bounded copy of the firmware memory map.
pub struct MemoryMap {
    regions: [MemoryRegion; MAX_REGIONS],
    count: usize,
}

impl MemoryMap {
    pub const fn new() -> MemoryMap {
        MemoryMap {
            regions: [MemoryRegion::empty(); MAX_REGIONS],
            count: 0,
        }
    }

    pub fn add_region(&mut self, region: MemoryRegion) {
        if self.count < MAX_REGIONS {
            self.regions[self.count] = region;
            self.count += 1;
        } else {
            klog::klog!(
                Warn,
                "memory: region table full, dropping base=0x{:x} len=0x{:x}",
                region.base,
                region.length
            );
        }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions[..self.count]
    }

    /// Bytes in Available regions.
    pub fn available_bytes(&self) -> u64 {
        self.regions()
            .iter()
            .filter(|r| r.kind == RegionKind::Available)
            .map(|r| r.length)
            .sum()
    }

    /// Map with the first MiB reserved and the rest of `total` available,
    /// used when the firmware supplies nothing usable.
    pub fn synthesized(total: u64) -> MemoryMap {
        let mut map = MemoryMap::new();
        map.add_region(MemoryRegion {
            base: 0,
            length: 0x10_0000,
            kind: RegionKind::Reserved,
        });
        map.add_region(MemoryRegion {
            base: 0x10_0000,
            length: total - 0x10_0000,
            kind: RegionKind::Available,
        });
        map
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        MemoryMap::new()
    }
}

/// Copy the firmware memory map out of the Multiboot info block.
///
/// A bad magic value or a missing map yields the synthesised 64 MiB layout.
///
/// # Safety
///
/// `info` must point at a Multiboot information block (or be null, in which
/// case the fallback map is returned), and the referenced memory-map buffer
/// must be readable.
pub unsafe fn parse_handoff(magic: u32, info: *const MultibootInfo) -> MemoryMap {
    if magic != MULTIBOOT_MAGIC || info.is_null() {
        klog::klog!(
            Warn,
            "memory: invalid multiboot magic 0x{:08x}, assuming {} MiB",
            magic,
            FALLBACK_MEMORY / (1024 * 1024)
        );
        return MemoryMap::synthesized(FALLBACK_MEMORY);
    }

    let flags = (*info).flags;
    if flags & FLAG_MEM != 0 {
        let mem_lower = (*info).mem_lower;
        let mem_upper = (*info).mem_upper;
        klog::klog!(
            Info,
            "memory: {} KiB lower, {} KiB upper",
            mem_lower,
            mem_upper
        );
    }

    if flags & FLAG_MMAP == 0 {
        klog::klog!(Warn, "memory: no memory map in handoff, assuming 64 MiB");
        return MemoryMap::synthesized(FALLBACK_MEMORY);
    }

    let mut map = MemoryMap::new();
    parse_mmap_buffer(
        (*info).mmap_addr as usize,
        (*info).mmap_length as usize,
        &mut map,
    );

    klog::klog!(
        Info,
        "memory: {} regions, {} KiB available",
        map.regions().len(),
        map.available_bytes() / 1024
    );
    map
}

/// Walk the raw memory-map buffer, appending each entry to `map`.
///
/// # Safety
///
/// `[addr, addr + length)` must be a readable buffer of memory-map entries.
unsafe fn parse_mmap_buffer(addr: usize, length: usize, map: &mut MemoryMap) {
    let end = addr + length;
    let mut current = addr;
    while current < end {
        let entry = current as *const MmapEntry;
        map.add_region(MemoryRegion {
            base: (*entry).base,
            length: (*entry).length,
            kind: RegionKind::from_raw((*entry).kind),
        });
        // The size field excludes itself.
        current += (*entry).size as usize + core::mem::size_of::<u32>();
    }
}

// ============================================================================
// Kernel heap
// ============================================================================

/// Size of the static kernel heap region.
pub const KERNEL_HEAP_SIZE: usize = 512 * 1024;

#[cfg(target_arch = "x86")]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[cfg(target_arch = "x86")]
static mut KERNEL_HEAP: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

/// Initialise the kernel heap over its static backing region.
///
/// Must run before anything allocates — in particular before the frame
/// allocator builds its bitmap.
#[cfg(target_arch = "x86")]
pub fn init_heap() {
    unsafe {
        ALLOCATOR
            .lock()
            .init(core::ptr::addr_of_mut!(KERNEL_HEAP) as *mut u8, KERNEL_HEAP_SIZE);
    }
    klog::klog!(Info, "memory: kernel heap {} KiB", KERNEL_HEAP_SIZE / 1024);
}

#[cfg(not(target_arch = "x86"))]
pub fn init_heap() {}

/// Heap bytes currently unused.
#[cfg(target_arch = "x86")]
pub fn heap_free() -> usize {
    ALLOCATOR.lock().free()
}

#[cfg(not(target_arch = "x86"))]
pub fn heap_free() -> usize {
    KERNEL_HEAP_SIZE
}

/// Combined physical and heap statistics.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub total_physical: usize,
    pub used_physical: usize,
    pub free_physical: usize,
    pub heap_total: usize,
    pub heap_free: usize,
}

impl MemoryStats {
    pub fn print(&self) {
        klog::klog_always!("=== Memory Statistics ===");
        klog::klog_always!(
            "Physical: {} KiB total, {} KiB used, {} KiB free",
            self.total_physical / 1024,
            self.used_physical / 1024,
            self.free_physical / 1024
        );
        klog::klog_always!(
            "Heap:     {} KiB used / {} KiB",
            (self.heap_total - self.heap_free) / 1024,
            self.heap_total / 1024
        );
    }
}

/// Snapshot current memory statistics from the global allocators.
pub fn stats() -> MemoryStats {
    let frames = frame_allocator::stats().unwrap_or_default();
    MemoryStats {
        total_physical: frames.total_bytes,
        used_physical: frames.used_bytes,
        free_physical: frames.free_bytes,
        heap_total: KERNEL_HEAP_SIZE,
        heap_free: heap_free(),
    }
}
