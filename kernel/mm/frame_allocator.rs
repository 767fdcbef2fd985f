//! Bitmap page-frame allocator.
//!
//! One bit per 4 KiB frame up to a 256 MiB ceiling; set means used or
//! reserved. Initialisation saturates the bitmap, clears frames inside
//! Available regions, then re-reserves the first MiB and the kernel image.
//! The final used count comes from rescanning the bitmap, which is the
//! authoritative state.

use crate::addr::{PhysAddr, PhysFrame, PAGE_SHIFT, PAGE_SIZE};
use crate::memory::{MemoryRegion, RegionKind};
use bit_vec::BitVec;
use spin::Mutex;

/// Highest physical address the allocator tracks.
const MAX_PHYSICAL_MEMORY: u64 = 256 * 1024 * 1024;
/// Number of tracked frames (bits in the bitmap).
const MAX_FRAMES: usize = (MAX_PHYSICAL_MEMORY / PAGE_SIZE as u64) as usize;
/// Allocations never come from below this address (BIOS and legacy space).
const LOW_MEMORY_BOUND: u32 = 0x10_0000;

/// Something that can hand out and take back physical frames. The VMM takes
/// its allocator through this trait so table construction is independent of
/// the global singleton.
pub trait FrameSource {
    fn allocate_frame(&mut self) -> Option<PhysFrame>;
    fn deallocate_frame(&mut self, frame: PhysFrame);
}

/// Allocator statistics in frames and bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
}

pub struct BitmapFrameAllocator {
    /// Set = used or reserved, clear = free.
    bitmap: BitVec,
    /// Frames under management, derived from the Available bytes in the map.
    total_frames: usize,
    used_frames: usize,
}

impl BitmapFrameAllocator {
    /// Build the allocator from the firmware memory map and the end of the
    /// kernel image.
    pub fn new(regions: &[MemoryRegion], kernel_end: u32) -> BitmapFrameAllocator {
        let mut allocator = BitmapFrameAllocator {
            bitmap: BitVec::from_elem(MAX_FRAMES, true),
            total_frames: 0,
            used_frames: 0,
        };

        let mut available_bytes: u64 = 0;
        for region in regions {
            if region.kind != RegionKind::Available {
                continue;
            }
            available_bytes += region.length;

            if region.base >= MAX_PHYSICAL_MEMORY {
                continue;
            }
            let end = (region.base + region.length).min(MAX_PHYSICAL_MEMORY);
            // Only frames fully inside the region become free.
            let start_pfn = (PhysAddr::new(region.base as u32).align_up().as_u32()
                >> PAGE_SHIFT) as usize;
            let end_pfn = (end >> PAGE_SHIFT) as usize;
            for pfn in start_pfn..end_pfn.min(MAX_FRAMES) {
                allocator.bitmap.set(pfn, false);
            }
        }

        allocator.total_frames =
            ((available_bytes / PAGE_SIZE as u64) as usize).min(MAX_FRAMES);

        // Re-reserve the first MiB (BIOS area) and the kernel image.
        allocator.reserve_range(0, LOW_MEMORY_BOUND);
        allocator.reserve_range(
            LOW_MEMORY_BOUND,
            PhysAddr::new(kernel_end).align_up().as_u32(),
        );

        // Recount: the bitmap is authoritative.
        allocator.used_frames = (0..allocator.total_frames)
            .filter(|&pfn| allocator.test(pfn))
            .count();

        allocator
    }

    #[inline]
    fn test(&self, pfn: usize) -> bool {
        // Out of range counts as used.
        self.bitmap.get(pfn).unwrap_or(true)
    }

    fn set(&mut self, pfn: usize) {
        if pfn < MAX_FRAMES {
            self.bitmap.set(pfn, true);
        }
    }

    fn clear(&mut self, pfn: usize) {
        if pfn < MAX_FRAMES {
            self.bitmap.set(pfn, false);
        }
    }

    /// Mark `[start, end)` used without touching the used counter; init only.
    fn reserve_range(&mut self, start: u32, end: u32) {
        let start_pfn = (start >> PAGE_SHIFT) as usize;
        let end_pfn = (end >> PAGE_SHIFT) as usize;
        for pfn in start_pfn..end_pfn.min(MAX_FRAMES) {
            self.bitmap.set(pfn, true);
        }
    }

    /// First run of `count` consecutive free frames at or above `start_pfn`.
    fn find_free_run(&self, count: usize, start_pfn: usize) -> Option<usize> {
        let mut consecutive = 0;
        let mut run_start = 0;
        for pfn in start_pfn..self.total_frames {
            if !self.test(pfn) {
                if consecutive == 0 {
                    run_start = pfn;
                }
                consecutive += 1;
                if consecutive == count {
                    return Some(run_start);
                }
            } else {
                consecutive = 0;
            }
        }
        None
    }

    /// Allocate one frame; first-fit from the 1 MiB bound.
    pub fn alloc_page(&mut self) -> Option<PhysFrame> {
        let start = (LOW_MEMORY_BOUND >> PAGE_SHIFT) as usize;
        let pfn = self.find_free_run(1, start)?;
        self.set(pfn);
        self.used_frames += 1;
        Some(PhysFrame::from_pfn(pfn as u32))
    }

    /// Allocate `count` physically contiguous frames; the lowest-PFN run
    /// wins.
    pub fn alloc_pages(&mut self, count: usize) -> Option<PhysFrame> {
        if count == 0 {
            return None;
        }
        let start = (LOW_MEMORY_BOUND >> PAGE_SHIFT) as usize;
        let pfn = self.find_free_run(count, start)?;
        for i in 0..count {
            self.set(pfn + i);
        }
        self.used_frames += count;
        Some(PhysFrame::from_pfn(pfn as u32))
    }

    /// Return one frame. Only frames currently marked used are released, so
    /// a stray double free cannot corrupt the counters.
    pub fn free_page(&mut self, frame: PhysFrame) {
        let pfn = frame.pfn() as usize;
        if pfn < self.total_frames && self.test(pfn) {
            self.clear(pfn);
            self.used_frames = self.used_frames.saturating_sub(1);
        }
    }

    /// Return `count` contiguous frames starting at `frame`.
    pub fn free_pages(&mut self, frame: PhysFrame, count: usize) {
        let base = frame.pfn() as usize;
        for pfn in base..base + count {
            if pfn < self.total_frames && self.test(pfn) {
                self.clear(pfn);
                self.used_frames = self.used_frames.saturating_sub(1);
            }
        }
    }

    /// Mark every frame overlapping `[base, base + length)` as used.
    /// Idempotent.
    pub fn mark_region_used(&mut self, base: u32, length: u32) {
        let start_pfn = (PhysAddr::new(base).align_down().as_u32() >> PAGE_SHIFT) as usize;
        let end_pfn =
            (PhysAddr::new(base.saturating_add(length)).align_up().as_u32() >> PAGE_SHIFT) as usize;
        for pfn in start_pfn..end_pfn.min(MAX_FRAMES) {
            if !self.test(pfn) {
                self.set(pfn);
                self.used_frames += 1;
            }
        }
    }

    /// Mark every frame fully inside `[base, base + length)` as free.
    /// Idempotent.
    pub fn mark_region_free(&mut self, base: u32, length: u32) {
        let start_pfn = (PhysAddr::new(base).align_up().as_u32() >> PAGE_SHIFT) as usize;
        let end_pfn =
            (PhysAddr::new(base.saturating_add(length)).align_down().as_u32() >> PAGE_SHIFT) as usize;
        for pfn in start_pfn..end_pfn.min(MAX_FRAMES) {
            if self.test(pfn) {
                self.clear(pfn);
                self.used_frames = self.used_frames.saturating_sub(1);
            }
        }
    }

    /// Is the frame currently marked used or reserved?
    pub fn is_used(&self, frame: PhysFrame) -> bool {
        self.test(frame.pfn() as usize)
    }

    pub fn stats(&self) -> FrameStats {
        let free = self.total_frames - self.used_frames;
        FrameStats {
            total_frames: self.total_frames,
            used_frames: self.used_frames,
            free_frames: free,
            total_bytes: self.total_frames * PAGE_SIZE,
            used_bytes: self.used_frames * PAGE_SIZE,
            free_bytes: free * PAGE_SIZE,
        }
    }

    pub fn print_stats(&self) {
        let stats = self.stats();
        klog::klog!(
            Info,
            "pmm: {} KiB total, {} KiB used, {} KiB free",
            stats.total_bytes / 1024,
            stats.used_bytes / 1024,
            stats.free_bytes / 1024
        );
        klog::klog!(
            Info,
            "pmm: {} frames total, {} used, {} free",
            stats.total_frames,
            stats.used_frames,
            stats.free_frames
        );
    }
}

impl FrameSource for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc_page()
    }

    fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.free_page(frame)
    }
}

// ============================================================================
// Global instance
// ============================================================================

static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

/// Install the global frame allocator. Called once from boot (and from test
/// fixtures that rebuild the kernel singletons).
pub fn install(allocator: BitmapFrameAllocator) {
    *FRAME_ALLOCATOR.lock() = Some(allocator);
}

/// Allocate one frame from the global allocator.
pub fn alloc_physical_page() -> Option<PhysFrame> {
    FRAME_ALLOCATOR.lock().as_mut()?.alloc_page()
}

/// Allocate `count` contiguous frames from the global allocator.
pub fn alloc_physical_pages(count: usize) -> Option<PhysFrame> {
    FRAME_ALLOCATOR.lock().as_mut()?.alloc_pages(count)
}

/// Free one frame back to the global allocator.
pub fn free_physical_page(frame: PhysFrame) {
    if let Some(allocator) = FRAME_ALLOCATOR.lock().as_mut() {
        allocator.free_page(frame);
    }
}

/// Free `count` contiguous frames back to the global allocator.
pub fn free_physical_pages(frame: PhysFrame, count: usize) {
    if let Some(allocator) = FRAME_ALLOCATOR.lock().as_mut() {
        allocator.free_pages(frame, count);
    }
}

/// Statistics of the global allocator, if installed.
pub fn stats() -> Option<FrameStats> {
    FRAME_ALLOCATOR.lock().as_ref().map(|a| a.stats())
}

/// Handle over the global allocator for callers that need a [`FrameSource`].
pub struct FrameAllocator;

impl FrameAllocator {
    pub fn new() -> FrameAllocator {
        FrameAllocator
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        FrameAllocator::new()
    }
}

impl FrameSource for FrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        alloc_physical_page()
    }

    fn deallocate_frame(&mut self, frame: PhysFrame) {
        free_physical_page(frame)
    }
}
