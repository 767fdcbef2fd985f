//! Process table and control blocks.
//!
//! A fixed table of 32 slots; the idle process owns PID 0 and slot 0
//! permanently. PIDs are assigned monotonically and never reused, so a
//! stale PID can never resolve to a recycled slot's new owner.

use crate::context::Context;
use alloc::string::String;
use alloc::string::ToString;
use core::sync::atomic::{AtomicU32, Ordering};
use lazy_static::lazy_static;
use mm::{PageFlags, PhysAddr, PhysFrame, VirtAddr, PAGE_SIZE};
use spin::Mutex;

pub type Pid = u32;

/// Size of the process table.
pub const MAX_PROCESSES: usize = 32;

/// Top of the user stack region; the stack page maps just below.
pub const USER_STACK_TOP: u32 = 0xC000_0000;
/// Virtual address of the single user-stack page.
pub const USER_STACK_PAGE: u32 = USER_STACK_TOP - PAGE_SIZE as u32;

/// Scheduler quantum in timer ticks (100 ms at 100 Hz).
pub const DEFAULT_QUANTUM: u32 = 10;

/// End of the identity-mapped low region; code there resolves without a
/// translation.
const IDENTITY_LIMIT: u32 = 0x40_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Slot is free.
    Unused,
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// Scheduling class, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    Idle,
    Regular,
    ForegroundServer,
    TimeCritical,
}

impl PriorityClass {
    /// Base of this class's 32-slot priority band.
    pub fn base(self) -> u8 {
        match self {
            PriorityClass::Idle => 0,
            PriorityClass::Regular => 32,
            PriorityClass::ForegroundServer => 64,
            PriorityClass::TimeCritical => 96,
        }
    }
}

/// Process control block.
#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub state: ProcessState,
    pub name: String,
    pub class: PriorityClass,
    /// Priority adjustment within the class band, -15..=15.
    pub delta: i8,
    /// Remaining quantum, in ticks.
    pub time_slice: u32,
    /// Ticks consumed over the process lifetime.
    pub total_ticks: u64,
    pub parent: Pid,
    pub exit_code: u32,
    pub child_count: u32,
    /// Physical frame of the page directory; `None` means the kernel
    /// address space (idle only).
    pub page_directory: Option<PhysFrame>,
    /// Frame backing the kernel stack.
    pub kernel_stack_frame: Option<PhysFrame>,
    /// Top of the kernel stack; what TSS.esp0 must hold while this process
    /// runs in user mode. Zero for the idle process (boot stack).
    pub kernel_stack_top: u32,
    /// Register image the first dispatch enters Ring 3 with. After that,
    /// the live image is the trap frame on the process's kernel stack.
    pub context: Context,
    /// Suspended kernel execution state, swapped by the scheduler.
    pub kernel_context: arch::KernelContext,
}

impl Process {
    fn unused() -> Process {
        Process {
            pid: 0,
            state: ProcessState::Unused,
            name: String::new(),
            class: PriorityClass::Regular,
            delta: 0,
            time_slice: 0,
            total_ticks: 0,
            parent: 0,
            exit_code: 0,
            child_count: 0,
            page_directory: None,
            kernel_stack_frame: None,
            kernel_stack_top: 0,
            context: Context::new(),
            kernel_context: arch::KernelContext::new(),
        }
    }
}

/// Errors out of process creation. Every failure leaves the table and both
/// memory managers exactly as they were.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    TableFull,
    OutOfMemory,
    MappingFailed,
    NotFound,
}

pub struct ProcessTable {
    slots: alloc::vec::Vec<Process>,
    next_pid: Pid,
}

impl ProcessTable {
    const fn new() -> ProcessTable {
        ProcessTable {
            slots: alloc::vec::Vec::new(),
            next_pid: 1,
        }
    }

    pub fn slots(&self) -> &[Process] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [Process] {
        &mut self.slots
    }

    pub fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|p| p.pid == pid && p.state != ProcessState::Unused)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slot_of(pid).map(|i| &self.slots[i])
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        let slot = self.slot_of(pid)?;
        Some(&mut self.slots[slot])
    }

    fn find_unused_slot(&self) -> Option<usize> {
        self.slots.iter().position(|p| p.state == ProcessState::Unused)
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }
}

lazy_static! {
    pub static ref PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
}

static CURRENT_PID: AtomicU32 = AtomicU32::new(0);

/// Reset the table and install the idle process in slot 0, Running, owning
/// the kernel address space.
pub fn init() {
    let kernel_dir = mm::page_table::kernel_directory();

    let mut table = PROCESS_TABLE.lock();
    table.slots.clear();
    for _ in 0..MAX_PROCESSES {
        table.slots.push(Process::unused());
    }
    table.next_pid = 1;

    let idle = &mut table.slots[0];
    idle.pid = 0;
    idle.state = ProcessState::Running;
    idle.class = PriorityClass::Idle;
    idle.name = "idle".to_string();
    idle.page_directory = kernel_dir;
    drop(table);

    CURRENT_PID.store(0, Ordering::Release);
    klog::klog!(Info, "process: table initialized, idle process installed");
}

/// PID of the process currently running on this CPU.
pub fn current() -> Pid {
    CURRENT_PID.load(Ordering::Acquire)
}

/// Install `pid` as the running process and point TSS.esp0 at its kernel
/// stack so the next user-mode trap lands correctly.
pub fn set_current(pid: Pid) {
    CURRENT_PID.store(pid, Ordering::Release);
    let stack_top = PROCESS_TABLE
        .lock()
        .get(pid)
        .map(|p| p.kernel_stack_top)
        .unwrap_or(0);
    if stack_top != 0 {
        arch::gdt::set_kernel_stack(stack_top);
    }
}

/// Create a process that will first run at `entry` in Ring 3.
///
/// Builds, in order: a slot and PID, an address space, a kernel-stack frame,
/// a user-stack frame mapped below [`USER_STACK_TOP`], and a user-visible
/// mapping of the entry code page. Any failure unwinds the earlier steps in
/// reverse before returning.
pub fn create(name: &str, entry: VirtAddr, class: PriorityClass) -> Result<Pid, ProcessError> {
    let parent = current();

    let mut table = PROCESS_TABLE.lock();
    let slot = table.find_unused_slot().ok_or(ProcessError::TableFull)?;
    let pid = table.allocate_pid();
    // Drop the table lock across the memory work. Creation runs in kernel
    // context on one CPU, so the chosen slot cannot be claimed meanwhile.
    drop(table);

    let directory = mm::page_table::create_directory().ok_or(ProcessError::OutOfMemory)?;

    let kernel_stack_frame = match mm::alloc_physical_page() {
        Some(frame) => frame,
        None => {
            mm::page_table::destroy_directory(directory);
            return Err(ProcessError::OutOfMemory);
        }
    };

    let user_stack_frame = match mm::alloc_physical_page() {
        Some(frame) => frame,
        None => {
            mm::free_physical_page(kernel_stack_frame);
            mm::page_table::destroy_directory(directory);
            return Err(ProcessError::OutOfMemory);
        }
    };

    let stack_flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
    if mm::page_table::map_in(
        directory,
        VirtAddr::new(USER_STACK_PAGE),
        user_stack_frame.start_address(),
        stack_flags,
    )
    .is_err()
    {
        mm::free_physical_page(user_stack_frame);
        mm::free_physical_page(kernel_stack_frame);
        mm::page_table::destroy_directory(directory);
        return Err(ProcessError::MappingFailed);
    }

    // The code page containing the entry point must be user-readable and
    // executable in the new address space. Resolve it through the current
    // directory; inside the identity window the address is its own frame.
    let code_page = entry.align_down();
    let code_phys = mm::page_table::translate(code_page).unwrap_or_else(|| {
        debug_assert!(code_page.as_u32() < IDENTITY_LIMIT);
        PhysAddr::new(code_page.as_u32())
    });
    if mm::page_table::map_in(
        directory,
        code_page,
        code_phys,
        PageFlags::PRESENT | PageFlags::USER,
    )
    .is_err()
    {
        mm::free_physical_page(user_stack_frame);
        mm::free_physical_page(kernel_stack_frame);
        mm::page_table::destroy_directory(directory);
        return Err(ProcessError::MappingFailed);
    }

    // Seed the fresh kernel stack so the first context switch lands in the
    // user-entry thunk: the saved stack pointer aims at a word holding its
    // address.
    let kernel_stack_top = kernel_stack_frame.start_address().as_u32() + PAGE_SIZE as u32;
    let thunk_slot = kernel_stack_top - 4;
    if let Some(window) = mm::page_table::phys_window() {
        unsafe { window.write_u32(PhysAddr::new(thunk_slot), first_dispatch_addr()) };
    }

    let mut table = PROCESS_TABLE.lock();
    let process = &mut table.slots[slot];
    process.pid = pid;
    process.state = ProcessState::Ready;
    process.name = name.to_string();
    process.class = class;
    process.delta = 0;
    process.time_slice = DEFAULT_QUANTUM;
    process.total_ticks = 0;
    process.parent = parent;
    process.exit_code = 0;
    process.child_count = 0;
    process.page_directory = Some(directory);
    process.kernel_stack_frame = Some(kernel_stack_frame);
    process.kernel_stack_top = kernel_stack_top;
    process.context = Context::new_user(entry.as_u32(), USER_STACK_TOP - 4);
    process.kernel_context = arch::KernelContext::new();
    process.kernel_context.esp = thunk_slot;

    if parent != 0 {
        if let Some(parent_slot) = table.slot_of(parent) {
            table.slots[parent_slot].child_count += 1;
        }
    }
    drop(table);

    klog::klog!(
        Info,
        "process: created '{}' (pid {}) entry=0x{:08x}",
        name,
        pid,
        entry.as_u32()
    );
    Ok(pid)
}

/// Terminate `pid`, recording `exit_code`.
///
/// The parent's child count drops, any children are reparented to the idle
/// process, the kernel-stack frame and the address space are returned, and
/// the slot becomes Unused. When the dying process owns the installed
/// directory, the kernel directory is installed first so the teardown never
/// pulls the mappings out from under the running CPU. Returns `true` when
/// the caller just terminated itself and must not return to the process.
pub fn exit(pid: Pid, exit_code: u32) -> bool {
    if pid == 0 {
        // The idle process is never reaped.
        return false;
    }

    let mut table = PROCESS_TABLE.lock();
    let slot = match table.slot_of(pid) {
        Some(slot) => slot,
        None => return false,
    };

    let parent = table.slots[slot].parent;
    let directory = table.slots[slot].page_directory.take();
    let kernel_stack = table.slots[slot].kernel_stack_frame.take();
    table.slots[slot].exit_code = exit_code;
    table.slots[slot].state = ProcessState::Terminated;

    klog::klog!(
        Info,
        "process: '{}' (pid {}) exited with code {}",
        table.slots[slot].name,
        pid,
        exit_code
    );

    if parent != 0 {
        if let Some(parent_slot) = table.slot_of(parent) {
            let count = &mut table.slots[parent_slot].child_count;
            *count = count.saturating_sub(1);
        }
    }

    // Orphans are adopted by the idle process.
    for other in table.slots.iter_mut() {
        if other.state != ProcessState::Unused && other.parent == pid {
            other.parent = 0;
        }
    }

    table.slots[slot].state = ProcessState::Unused;
    table.slots[slot].pid = 0;
    drop(table);

    // The frame is only reachable through the allocator from here on; this
    // control flow abandons the stack at the next dispatch and never
    // resumes it.
    if let Some(frame) = kernel_stack {
        mm::free_physical_page(frame);
    }

    if let Some(directory) = directory {
        if mm::page_table::current_directory() == Some(directory) {
            if let Some(kernel) = mm::page_table::kernel_directory() {
                mm::page_table::switch_to(kernel);
            }
        }
        mm::page_table::destroy_directory(directory);
    }

    pid == current()
}

/// First code a fresh process's kernel flow runs, entered by the context
/// switch on the process's own stack with interrupts disabled. Drops to
/// Ring 3 at the entry state recorded in the PCB.
#[cfg(target_arch = "x86")]
extern "C" fn first_dispatch() -> ! {
    let context = {
        let table = PROCESS_TABLE.lock();
        table.get(current()).map(|p| p.context)
    };
    match context {
        Some(ctx) => unsafe { arch::usermode::enter_usermode(ctx.eip, ctx.esp) },
        None => arch::instructions::halt_loop(),
    }
}

fn first_dispatch_addr() -> u32 {
    #[cfg(target_arch = "x86")]
    {
        first_dispatch as u32
    }
    #[cfg(not(target_arch = "x86"))]
    {
        0
    }
}

// ============================================================================
// Read-only accessors
// ============================================================================

pub fn state_of(pid: Pid) -> Option<ProcessState> {
    PROCESS_TABLE.lock().get(pid).map(|p| p.state)
}

pub fn parent_of(pid: Pid) -> Option<Pid> {
    PROCESS_TABLE.lock().get(pid).map(|p| p.parent)
}

pub fn child_count_of(pid: Pid) -> Option<u32> {
    PROCESS_TABLE.lock().get(pid).map(|p| p.child_count)
}

/// Fill `out` with the PIDs of `pid`'s children; returns how many were
/// written.
pub fn list_children(pid: Pid, out: &mut [Pid]) -> usize {
    let table = PROCESS_TABLE.lock();
    let mut count = 0;
    for process in table.slots() {
        if count == out.len() {
            break;
        }
        if process.state != ProcessState::Unused && process.parent == pid {
            out[count] = process.pid;
            count += 1;
        }
    }
    count
}

/// Run `f` against the PCB for `pid`, if it is live.
pub fn with_process<R>(pid: Pid, f: impl FnOnce(&Process) -> R) -> Option<R> {
    PROCESS_TABLE.lock().get(pid).map(f)
}

/// Count of live (non-Unused) slots.
pub fn live_count() -> usize {
    PROCESS_TABLE
        .lock()
        .slots()
        .iter()
        .filter(|p| p.state != ProcessState::Unused)
        .count()
}

/// Log the process table, one line per live slot.
pub fn print_table() {
    let table = PROCESS_TABLE.lock();
    klog::klog_always!("PID  STATE       CLASS             PARENT  CHILDREN  NAME");
    for process in table.slots() {
        if process.state == ProcessState::Unused {
            continue;
        }
        klog::klog_always!(
            "{:<4} {:<11} {:<17} {:<7} {:<9} {}",
            process.pid,
            match process.state {
                ProcessState::Unused => "UNUSED",
                ProcessState::Ready => "READY",
                ProcessState::Running => "RUNNING",
                ProcessState::Blocked => "BLOCKED",
                ProcessState::Terminated => "TERMINATED",
            },
            match process.class {
                PriorityClass::Idle => "Idle",
                PriorityClass::Regular => "Regular",
                PriorityClass::ForegroundServer => "ForegroundServer",
                PriorityClass::TimeCritical => "TimeCritical",
            },
            process.parent,
            process.child_count,
            process.name
        );
    }
}
