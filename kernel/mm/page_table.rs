//! Two-level paging.
//!
//! An address space is one page-directory frame plus the page tables
//! reachable through it. The kernel directory identity-maps the first 4 MiB;
//! every process directory shares that first table and the kernel-half
//! entries (indices 768..1023) by reference, so switching directories can
//! never unmap the kernel.
//!
//! All physical access goes through a [`PhysWindow`], and every allocation
//! comes in through a [`FrameSource`] parameter, so the table walks here run
//! unchanged on the real machine and under the host test harness.

use crate::addr::{PhysAddr, PhysFrame, VirtAddr, PAGE_SIZE};
use crate::frame_allocator::{FrameAllocator, FrameSource};
use crate::phys_window::PhysWindow;
use bitflags::bitflags;
use spin::Mutex;

/// Entries per directory or table.
pub const PAGE_ENTRIES: usize = 1024;
/// First directory index belonging to the kernel half (3 GiB).
pub const KERNEL_PDE_START: usize = 768;
/// Bytes of linear space covered by one directory entry.
pub const PDE_SPAN: u32 = (PAGE_ENTRIES * PAGE_SIZE) as u32;

const FRAME_MASK: u32 = 0xFFFF_F000;
const FLAGS_MASK: u32 = 0x0000_0FFF;

bitflags! {
    /// Flag bits shared by PDEs and PTEs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// 4 MiB page; valid in a PDE only.
        const HUGE          = 1 << 7;
        /// Survives CR3 reloads.
        const GLOBAL        = 1 << 8;
    }
}

/// One 32-bit directory or table entry: a frame number plus flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> PageTableEntry {
        PageTableEntry(0)
    }

    pub fn new(frame: PhysFrame, flags: PageFlags) -> PageTableEntry {
        PageTableEntry((frame.start_address().as_u32() & FRAME_MASK) | flags.bits())
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub fn frame(self) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(self.0 & FRAME_MASK))
    }

    #[inline]
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }
}

/// Mapping failures surfaced to callers. A failed map leaves no partial
/// state behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The frame allocator could not supply an intermediate page table.
    FrameAllocationFailed,
}

/// Decoded page-fault error code.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// Set: protection violation. Clear: page not present.
    pub protection_violation: bool,
    pub write: bool,
    pub user_mode: bool,
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
}

impl PageFaultInfo {
    pub fn decode(error_code: u32) -> PageFaultInfo {
        PageFaultInfo {
            protection_violation: error_code & 1 != 0,
            write: error_code & 2 != 0,
            user_mode: error_code & 4 != 0,
            reserved_bit: error_code & 8 != 0,
            instruction_fetch: error_code & 16 != 0,
        }
    }
}

/// The virtual-memory manager: owns the kernel directory and tracks which
/// directory is installed in the translation register.
pub struct Vmm {
    window: PhysWindow,
    kernel_directory: PhysFrame,
    current_directory: PhysFrame,
}

impl Vmm {
    /// Build the kernel address space: a fresh directory whose entry 0
    /// points at an identity mapping of the first 4 MiB, marked
    /// user-accessible so code in low memory stays executable from Ring 3.
    pub fn new(window: PhysWindow, frames: &mut dyn FrameSource) -> Result<Vmm, MapError> {
        let directory = frames
            .allocate_frame()
            .ok_or(MapError::FrameAllocationFailed)?;
        let identity_table = match frames.allocate_frame() {
            Some(frame) => frame,
            None => {
                frames.deallocate_frame(directory);
                return Err(MapError::FrameAllocationFailed);
            }
        };

        let vmm = Vmm {
            window,
            kernel_directory: directory,
            current_directory: directory,
        };

        unsafe {
            vmm.window.zero_frame(directory);
            vmm.window.zero_frame(identity_table);

            let identity_flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
            for i in 0..PAGE_ENTRIES {
                let phys = PhysFrame::from_pfn(i as u32);
                vmm.write_entry(identity_table, i, PageTableEntry::new(phys, identity_flags));
            }
            vmm.write_entry(
                directory,
                0,
                PageTableEntry::new(identity_table, identity_flags),
            );
        }

        Ok(vmm)
    }

    /// Load the kernel directory and turn paging on. Boot path only.
    #[cfg(target_arch = "x86")]
    pub fn enable(&self) {
        unsafe {
            arch::instructions::write_cr3(self.kernel_directory.start_address().as_u32());
            arch::instructions::enable_paging();
        }
        klog::klog!(
            Info,
            "vmm: paging enabled, kernel directory at 0x{:08x}",
            self.kernel_directory.start_address().as_u32()
        );
    }

    pub fn window(&self) -> PhysWindow {
        self.window
    }

    pub fn kernel_directory(&self) -> PhysFrame {
        self.kernel_directory
    }

    pub fn current_directory(&self) -> PhysFrame {
        self.current_directory
    }

    #[inline]
    fn entry_addr(&self, table: PhysFrame, index: usize) -> PhysAddr {
        PhysAddr::new(table.start_address().as_u32() + (index * 4) as u32)
    }

    fn read_entry(&self, table: PhysFrame, index: usize) -> PageTableEntry {
        unsafe { PageTableEntry(self.window.read_u32(self.entry_addr(table, index))) }
    }

    /// Read one entry of a page directory. Diagnostics and self-tests.
    pub fn directory_entry(&self, directory: PhysFrame, index: usize) -> PageTableEntry {
        self.read_entry(directory, index)
    }

    unsafe fn write_entry(&self, table: PhysFrame, index: usize, entry: PageTableEntry) {
        self.window.write_u32(self.entry_addr(table, index), entry.raw());
    }

    /// Create a fresh process directory: user half empty, kernel half and
    /// the identity table shared with the kernel directory.
    pub fn create_directory(&self, frames: &mut dyn FrameSource) -> Result<PhysFrame, MapError> {
        let directory = frames
            .allocate_frame()
            .ok_or(MapError::FrameAllocationFailed)?;
        unsafe {
            self.window.zero_frame(directory);
            // Shared identity mapping of low memory.
            self.write_entry(directory, 0, self.read_entry(self.kernel_directory, 0));
            // Kernel half, copied by reference: same page-table frames.
            for i in KERNEL_PDE_START..PAGE_ENTRIES {
                self.write_entry(directory, i, self.read_entry(self.kernel_directory, i));
            }
        }
        Ok(directory)
    }

    /// Tear down a process directory: every user frame, every user page
    /// table, then the directory itself. Entry 0 (the shared identity table)
    /// and the kernel half are left alone. Destroying the kernel directory
    /// is refused.
    pub fn destroy_directory(&mut self, directory: PhysFrame, frames: &mut dyn FrameSource) {
        if directory == self.kernel_directory {
            return;
        }

        for pde_index in 1..KERNEL_PDE_START {
            let pde = self.read_entry(directory, pde_index);
            if !pde.is_present() {
                continue;
            }
            let table = pde.frame();
            for pte_index in 0..PAGE_ENTRIES {
                let pte = self.read_entry(table, pte_index);
                if pte.is_present() {
                    frames.deallocate_frame(pte.frame());
                }
            }
            frames.deallocate_frame(table);
        }

        frames.deallocate_frame(directory);
    }

    /// Install `directory` as the active address space.
    pub fn switch_to(&mut self, directory: PhysFrame) {
        if directory != self.current_directory {
            self.current_directory = directory;
            unsafe { arch::instructions::write_cr3(directory.start_address().as_u32()) };
        }
    }

    /// Page table covering `virt` in `directory`, optionally allocating it.
    fn table_for(
        &mut self,
        directory: PhysFrame,
        virt: VirtAddr,
        create: bool,
        frames: &mut dyn FrameSource,
    ) -> Result<Option<PhysFrame>, MapError> {
        let pde_index = virt.directory_index();
        let pde = self.read_entry(directory, pde_index);
        if pde.is_present() {
            return Ok(Some(pde.frame()));
        }
        if !create {
            return Ok(None);
        }

        let table = frames
            .allocate_frame()
            .ok_or(MapError::FrameAllocationFailed)?;
        unsafe {
            self.window.zero_frame(table);
            self.write_entry(
                directory,
                pde_index,
                PageTableEntry::new(
                    table,
                    PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
                ),
            );
        }
        Ok(Some(table))
    }

    /// Map `virt` to `phys` in a specific directory. A present PTE is
    /// overwritten; the TLB entry is invalidated when the directory is the
    /// active one.
    pub fn map_in(
        &mut self,
        directory: PhysFrame,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
        frames: &mut dyn FrameSource,
    ) -> Result<(), MapError> {
        let table = self
            .table_for(directory, virt, true, frames)?
            .expect("table_for(create) returned no table");
        let entry = PageTableEntry::new(
            PhysFrame::containing_address(phys),
            flags | PageFlags::PRESENT,
        );
        unsafe { self.write_entry(table, virt.table_index(), entry) };
        if directory == self.current_directory {
            arch::instructions::flush_tlb_page(virt.align_down().as_u32());
        }
        Ok(())
    }

    /// Map into the active directory.
    pub fn map(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
        frames: &mut dyn FrameSource,
    ) -> Result<(), MapError> {
        self.map_in(self.current_directory, virt, phys, flags, frames)
    }

    /// Clear the PTE for `virt` in `directory`. Unmapping an absent page is
    /// a silent no-op.
    pub fn unmap_in(&mut self, directory: PhysFrame, virt: VirtAddr) {
        let pde = self.read_entry(directory, virt.directory_index());
        if !pde.is_present() {
            return;
        }
        unsafe { self.write_entry(pde.frame(), virt.table_index(), PageTableEntry::empty()) };
        if directory == self.current_directory {
            arch::instructions::flush_tlb_page(virt.align_down().as_u32());
        }
    }

    /// Unmap from the active directory.
    pub fn unmap(&mut self, virt: VirtAddr) {
        self.unmap_in(self.current_directory, virt)
    }

    /// Physical address behind `virt` in `directory`, or `None` when any
    /// level is absent.
    pub fn translate_in(&self, directory: PhysFrame, virt: VirtAddr) -> Option<PhysAddr> {
        self.translate_with_flags_in(directory, virt).map(|(p, _)| p)
    }

    /// Like [`Vmm::translate_in`] but also returns the PTE flags.
    pub fn translate_with_flags_in(
        &self,
        directory: PhysFrame,
        virt: VirtAddr,
    ) -> Option<(PhysAddr, PageFlags)> {
        let pde = self.read_entry(directory, virt.directory_index());
        if !pde.is_present() {
            return None;
        }
        let pte = self.read_entry(pde.frame(), virt.table_index());
        if !pte.is_present() {
            return None;
        }
        Some((
            PhysAddr::new(pte.frame().start_address().as_u32() | virt.page_offset()),
            pte.flags(),
        ))
    }

    /// Translate in the active directory.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.translate_in(self.current_directory, virt)
    }

    pub fn translate_with_flags(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        self.translate_with_flags_in(self.current_directory, virt)
    }

    pub fn is_mapped(&self, virt: VirtAddr) -> bool {
        self.translate(virt).is_some()
    }

    /// Map a contiguous range in the active directory. On failure every page
    /// mapped by this call is unmapped again before the error is returned.
    pub fn map_range(
        &mut self,
        virt_start: VirtAddr,
        phys_start: PhysAddr,
        size: usize,
        flags: PageFlags,
        frames: &mut dyn FrameSource,
    ) -> Result<(), MapError> {
        let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        for i in 0..pages {
            let offset = (i * PAGE_SIZE) as u32;
            let virt = VirtAddr::new(virt_start.as_u32() + offset);
            let phys = PhysAddr::new(phys_start.as_u32() + offset);
            if let Err(e) = self.map(virt, phys, flags, frames) {
                self.unmap_range(virt_start, i * PAGE_SIZE);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmap a contiguous range in the active directory.
    pub fn unmap_range(&mut self, virt_start: VirtAddr, size: usize) {
        let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        for i in 0..pages {
            self.unmap(VirtAddr::new(virt_start.as_u32() + (i * PAGE_SIZE) as u32));
        }
    }

    /// Allocate a frame, map it at `virt`, and zero it. The frame goes back
    /// to the allocator if the mapping fails.
    pub fn alloc_page_at(
        &mut self,
        virt: VirtAddr,
        flags: PageFlags,
        frames: &mut dyn FrameSource,
    ) -> Result<(), MapError> {
        let frame = frames
            .allocate_frame()
            .ok_or(MapError::FrameAllocationFailed)?;
        if let Err(e) = self.map(virt, frame.start_address(), flags, frames) {
            frames.deallocate_frame(frame);
            return Err(e);
        }
        unsafe { self.window.zero_frame(frame) };
        Ok(())
    }

    /// Unmap `virt` and free the frame behind it, if any.
    pub fn free_page_at(&mut self, virt: VirtAddr, frames: &mut dyn FrameSource) {
        if let Some(phys) = self.translate(virt) {
            self.unmap(virt);
            frames.deallocate_frame(PhysFrame::containing_address(phys));
        }
    }

    /// Log the present PDEs of the active directory.
    pub fn dump_directory(&self) {
        let dir = self.current_directory;
        klog::klog_always!(
            "vmm: directory 0x{:08x}",
            dir.start_address().as_u32()
        );
        for i in 0..PAGE_ENTRIES {
            let pde = self.read_entry(dir, i);
            if pde.is_present() {
                let base = (i as u32) * PDE_SPAN;
                klog::klog_always!(
                    "  PDE[{:4}] -> table 0x{:08x} (virt 0x{:08x}..0x{:08x})",
                    i,
                    pde.frame().start_address().as_u32(),
                    base,
                    base.wrapping_add(PDE_SPAN - 1)
                );
            }
        }
    }
}

// ============================================================================
// Global instance
// ============================================================================

static VMM: Mutex<Option<Vmm>> = Mutex::new(None);

/// Install the global VMM. Called once from boot (and from test fixtures).
pub fn install(vmm: Vmm) {
    *VMM.lock() = Some(vmm);
}

/// Run `f` against the global VMM. Returns `None` before installation.
///
/// Interrupts stay masked while the lock is held: the timer path switches
/// directories, and an interrupt arriving mid-operation would spin on the
/// same lock. Lock order: the VMM lock is taken before the frame-allocator
/// lock, everywhere.
pub fn with_vmm<R>(f: impl FnOnce(&mut Vmm) -> R) -> Option<R> {
    arch::instructions::without_interrupts(|| VMM.lock().as_mut().map(f))
}

pub fn kernel_directory() -> Option<PhysFrame> {
    with_vmm(|v| v.kernel_directory())
}

pub fn current_directory() -> Option<PhysFrame> {
    with_vmm(|v| v.current_directory())
}

pub fn phys_window() -> Option<PhysWindow> {
    with_vmm(|v| v.window())
}

pub fn create_directory() -> Option<PhysFrame> {
    with_vmm(|vmm| vmm.create_directory(&mut FrameAllocator::new()).ok())?
}

pub fn destroy_directory(directory: PhysFrame) {
    with_vmm(|vmm| vmm.destroy_directory(directory, &mut FrameAllocator::new()));
}

pub fn switch_to(directory: PhysFrame) {
    with_vmm(|vmm| vmm.switch_to(directory));
}

pub fn map_in(
    directory: PhysFrame,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageFlags,
) -> Result<(), MapError> {
    with_vmm(|vmm| vmm.map_in(directory, virt, phys, flags, &mut FrameAllocator::new()))
        .unwrap_or(Err(MapError::FrameAllocationFailed))
}

pub fn map(virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> Result<(), MapError> {
    with_vmm(|vmm| vmm.map(virt, phys, flags, &mut FrameAllocator::new()))
        .unwrap_or(Err(MapError::FrameAllocationFailed))
}

pub fn unmap(virt: VirtAddr) {
    with_vmm(|vmm| vmm.unmap(virt));
}

pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    with_vmm(|vmm| vmm.translate(virt))?
}

pub fn translate_with_flags(virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
    with_vmm(|vmm| vmm.translate_with_flags(virt))?
}

pub fn alloc_page_at(virt: VirtAddr, flags: PageFlags) -> Result<(), MapError> {
    with_vmm(|vmm| vmm.alloc_page_at(virt, flags, &mut FrameAllocator::new()))
        .unwrap_or(Err(MapError::FrameAllocationFailed))
}

pub fn free_page_at(virt: VirtAddr) {
    with_vmm(|vmm| vmm.free_page_at(virt, &mut FrameAllocator::new()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_allocator::BitmapFrameAllocator;
    use crate::memory::{MemoryRegion, RegionKind};

    /// 16 MiB of simulated physical memory with a PMM configured over it.
    struct SimMachine {
        #[allow(dead_code)]
        backing: Vec<u8>,
        window: PhysWindow,
        frames: BitmapFrameAllocator,
    }

    impl SimMachine {
        fn new() -> SimMachine {
            const SIM_BYTES: usize = 16 * 1024 * 1024;
            let backing = vec![0u8; SIM_BYTES];
            let window = PhysWindow::at_offset(backing.as_ptr() as usize);
            let regions = [
                MemoryRegion {
                    base: 0,
                    length: 0x10_0000,
                    kind: RegionKind::Reserved,
                },
                MemoryRegion {
                    base: 0x10_0000,
                    length: (SIM_BYTES - 0x10_0000) as u64,
                    kind: RegionKind::Available,
                },
            ];
            let frames = BitmapFrameAllocator::new(&regions, 0x20_0000);
            SimMachine {
                backing,
                window,
                frames,
            }
        }
    }

    const RW_USER: PageFlags = PageFlags::WRITABLE.union(PageFlags::USER);

    #[test]
    fn map_translate_unmap_round_trip() {
        let mut sim = SimMachine::new();
        let mut vmm = Vmm::new(sim.window, &mut sim.frames).unwrap();

        let virt = VirtAddr::new(0x40_0000);
        let phys = PhysAddr::new(0x80_0000);
        vmm.map(virt, phys, RW_USER, &mut sim.frames).unwrap();

        assert_eq!(vmm.translate(virt), Some(phys));
        // Offsets within the page carry through.
        assert_eq!(
            vmm.translate(VirtAddr::new(0x40_0ABC)),
            Some(PhysAddr::new(0x80_0ABC))
        );

        vmm.unmap(virt);
        assert_eq!(vmm.translate(virt), None);
    }

    #[test]
    fn mapped_page_carries_written_data() {
        let mut sim = SimMachine::new();
        let mut vmm = Vmm::new(sim.window, &mut sim.frames).unwrap();

        let virt = VirtAddr::new(0x40_0000);
        let frame = sim.frames.alloc_page().unwrap();
        vmm.map(virt, frame.start_address(), RW_USER, &mut sim.frames)
            .unwrap();

        let phys = vmm.translate(virt).unwrap();
        unsafe {
            sim.window.write_u32(phys, 0xDEAD_BEEF);
            assert_eq!(sim.window.read_u32(phys), 0xDEAD_BEEF);
        }

        vmm.unmap(virt);
        assert_eq!(vmm.translate(virt), None);
    }

    #[test]
    fn identity_window_covers_low_memory() {
        let mut sim = SimMachine::new();
        let vmm = Vmm::new(sim.window, &mut sim.frames).unwrap();
        // The first 4 MiB are identity-mapped in the kernel directory.
        assert_eq!(
            vmm.translate(VirtAddr::new(0x0010_1234)),
            Some(PhysAddr::new(0x0010_1234))
        );
        assert_eq!(
            vmm.translate(VirtAddr::new(0x003F_F000)),
            Some(PhysAddr::new(0x003F_F000))
        );
        // Beyond the identity table nothing is mapped yet.
        assert_eq!(vmm.translate(VirtAddr::new(0x0040_0000)), None);
    }

    #[test]
    fn overwriting_a_live_pte_takes_the_new_frame() {
        let mut sim = SimMachine::new();
        let mut vmm = Vmm::new(sim.window, &mut sim.frames).unwrap();

        let virt = VirtAddr::new(0x50_0000);
        vmm.map(virt, PhysAddr::new(0x80_0000), RW_USER, &mut sim.frames)
            .unwrap();
        vmm.map(virt, PhysAddr::new(0x90_0000), RW_USER, &mut sim.frames)
            .unwrap();
        assert_eq!(vmm.translate(virt), Some(PhysAddr::new(0x90_0000)));
    }

    #[test]
    fn unmapping_absent_page_is_noop() {
        let mut sim = SimMachine::new();
        let mut vmm = Vmm::new(sim.window, &mut sim.frames).unwrap();
        vmm.unmap(VirtAddr::new(0x7000_0000));
        // PDE absent entirely.
        assert_eq!(vmm.translate(VirtAddr::new(0x7000_0000)), None);
    }

    #[test]
    fn kernel_half_is_shared_between_directories() {
        let mut sim = SimMachine::new();
        let mut vmm = Vmm::new(sim.window, &mut sim.frames).unwrap();

        // Give the kernel half a populated entry so the comparison is not
        // vacuous.
        let kernel_virt = VirtAddr::new(0xC010_0000);
        vmm.map(
            kernel_virt,
            PhysAddr::new(0x30_0000),
            PageFlags::WRITABLE,
            &mut sim.frames,
        )
        .unwrap();

        let dir_a = vmm.create_directory(&mut sim.frames).unwrap();
        let dir_b = vmm.create_directory(&mut sim.frames).unwrap();
        for i in KERNEL_PDE_START..PAGE_ENTRIES {
            let a = vmm.read_entry(dir_a, i);
            let b = vmm.read_entry(dir_b, i);
            assert_eq!(a, b);
            if a.is_present() {
                assert_eq!(a.frame(), vmm.read_entry(vmm.kernel_directory(), i).frame());
            }
        }
        // Both directories resolve the kernel mapping identically.
        assert_eq!(
            vmm.translate_in(dir_a, kernel_virt),
            Some(PhysAddr::new(0x30_0000))
        );
        assert_eq!(
            vmm.translate_in(dir_b, kernel_virt),
            Some(PhysAddr::new(0x30_0000))
        );
    }

    #[test]
    fn destroy_directory_returns_every_frame() {
        let mut sim = SimMachine::new();
        let mut vmm = Vmm::new(sim.window, &mut sim.frames).unwrap();

        let before = sim.frames.stats().used_frames;
        let dir = vmm.create_directory(&mut sim.frames).unwrap();

        // Map a handful of allocated frames across two page tables.
        let old_current = vmm.current_directory();
        vmm.switch_to(dir);
        for i in 0..4u32 {
            let frame = sim.frames.alloc_page().unwrap();
            vmm.map(
                VirtAddr::new(0x40_0000 + i * 0x1000),
                frame.start_address(),
                RW_USER,
                &mut sim.frames,
            )
            .unwrap();
        }
        let frame = sim.frames.alloc_page().unwrap();
        vmm.map(
            VirtAddr::new(0x0800_0000),
            frame.start_address(),
            RW_USER,
            &mut sim.frames,
        )
        .unwrap();
        vmm.switch_to(old_current);

        vmm.destroy_directory(dir, &mut sim.frames);
        assert_eq!(sim.frames.stats().used_frames, before);
    }

    #[test]
    fn destroy_spares_kernel_directory_and_shared_tables() {
        let mut sim = SimMachine::new();
        let mut vmm = Vmm::new(sim.window, &mut sim.frames).unwrap();

        let before = sim.frames.stats().used_frames;
        // Refused outright.
        let kernel_dir = vmm.kernel_directory();
        vmm.destroy_directory(kernel_dir, &mut sim.frames);
        assert_eq!(sim.frames.stats().used_frames, before);

        // Destroying a process directory must not touch the shared identity
        // table: low translations in the kernel directory stay intact.
        let dir = vmm.create_directory(&mut sim.frames).unwrap();
        vmm.destroy_directory(dir, &mut sim.frames);
        assert_eq!(
            vmm.translate(VirtAddr::new(0x0010_0000)),
            Some(PhysAddr::new(0x0010_0000))
        );
        assert_eq!(sim.frames.stats().used_frames, before);
    }

    #[test]
    fn map_range_rolls_back_on_allocation_failure() {
        let mut sim = SimMachine::new();
        let mut vmm = Vmm::new(sim.window, &mut sim.frames).unwrap();

        // Exhaust the allocator so the second page's table allocation fails.
        let mut hoard = Vec::new();
        loop {
            match sim.frames.alloc_page() {
                Some(f) => hoard.push(f),
                None => break,
            }
        }
        // One frame back: enough for the first page table, not the second.
        sim.frames.free_page(hoard.pop().unwrap());

        let result = vmm.map_range(
            VirtAddr::new(0x40_0000),
            PhysAddr::new(0x80_0000),
            // Spans two PDEs, forcing two table allocations.
            2 * PDE_SPAN as usize,
            RW_USER,
            &mut sim.frames,
        );
        assert_eq!(result, Err(MapError::FrameAllocationFailed));
        // The partially mapped leading pages were unmapped again.
        assert_eq!(vmm.translate(VirtAddr::new(0x40_0000)), None);
    }

    #[test]
    fn alloc_page_at_zeroes_and_rolls_back() {
        let mut sim = SimMachine::new();
        let mut vmm = Vmm::new(sim.window, &mut sim.frames).unwrap();

        let virt = VirtAddr::new(0x60_0000);
        vmm.alloc_page_at(virt, RW_USER, &mut sim.frames).unwrap();
        let phys = vmm.translate(virt).unwrap();
        for offset in (0..PAGE_SIZE as u32).step_by(512) {
            unsafe {
                assert_eq!(sim.window.read_u32(PhysAddr::new(phys.as_u32() + offset)), 0);
            }
        }

        let used_before = sim.frames.stats().used_frames;
        vmm.free_page_at(virt, &mut sim.frames);
        assert_eq!(vmm.translate(virt), None);
        // The data frame came back; the intermediate table stays.
        assert_eq!(sim.frames.stats().used_frames, used_before - 1);
    }

    #[test]
    fn page_fault_decode() {
        let info = PageFaultInfo::decode(0b00111);
        assert!(info.protection_violation);
        assert!(info.write);
        assert!(info.user_mode);
        assert!(!info.reserved_bit);

        let info = PageFaultInfo::decode(0);
        assert!(!info.protection_violation);
        assert!(!info.write);
        assert!(!info.user_mode);
    }
}
