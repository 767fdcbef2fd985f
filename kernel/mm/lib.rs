//! Memory management for Ferrite OS: firmware handoff, the kernel heap, the
//! bitmap page-frame allocator, and the two-level paging VMM.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod frame_allocator;
pub mod memory;
pub mod page_table;
pub mod phys_window;

pub use addr::{PhysAddr, PhysFrame, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
pub use frame_allocator::{
    alloc_physical_page, alloc_physical_pages, free_physical_page, free_physical_pages,
    BitmapFrameAllocator, FrameAllocator, FrameSource, FrameStats,
};
pub use memory::{MemoryMap, MemoryRegion, MemoryStats, MultibootInfo, RegionKind, MULTIBOOT_MAGIC};
pub use page_table::{MapError, PageFaultInfo, PageFlags, PageTableEntry, Vmm, KERNEL_PDE_START};
pub use phys_window::PhysWindow;

pub fn init() {
    klog::klog_always!("Memory management initialized");
}
