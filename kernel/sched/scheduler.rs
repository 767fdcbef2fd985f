//! Round-robin scheduler for the single-CPU build.
//!
//! Each process runs its kernel flow on its own kernel stack; dispatch
//! swaps those flows with `switch_context`. A preempted process is parked
//! inside its own timer handler, its user registers held by the trap frame
//! on its own stack; resuming it unwinds that handler and the interrupt
//! return restores the user state. A fresh process's stack is seeded to
//! start in the user-entry thunk instead.

use arch::KernelContext;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_core::process::{
    self, ProcessState, ProcessTable, DEFAULT_QUANTUM, MAX_PROCESSES, PROCESS_TABLE,
};
use spin::Mutex;

static SCHEDULING_ENABLED: AtomicBool = AtomicBool::new(false);

/// Parking spot for the kernel state of a flow that will never resume
/// (a process that exited on its own stack).
static ORPHAN_CONTEXT: Mutex<KernelContext> = Mutex::new(KernelContext::new());

#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerStats {
    pub total_ticks: u64,
    pub context_switches: u64,
}

static STATS: Mutex<SchedulerStats> = Mutex::new(SchedulerStats {
    total_ticks: 0,
    context_switches: 0,
});

/// Scheduling starts disabled; nothing preempts until [`start`].
pub fn init() {
    SCHEDULING_ENABLED.store(false, Ordering::Release);
    *STATS.lock() = SchedulerStats::default();
    klog::klog!(Info, "sched: round-robin scheduler initialized (disabled)");
}

/// Enable preemption; the next timer tick may dispatch.
pub fn start() {
    SCHEDULING_ENABLED.store(true, Ordering::Release);
    klog::klog!(Info, "sched: scheduling enabled");
}

pub fn is_enabled() -> bool {
    SCHEDULING_ENABLED.load(Ordering::Acquire)
}

pub fn stats() -> SchedulerStats {
    *STATS.lock()
}

/// Timer-tick entry, called from the IRQ0 handler.
///
/// Burns one quantum tick off the running process and dispatches when the
/// slice is gone.
pub fn tick() {
    if !is_enabled() {
        return;
    }
    STATS.lock().total_ticks += 1;

    let expired = {
        let mut table = PROCESS_TABLE.lock();
        let current = process::current();
        match table.get_mut(current) {
            Some(p) => {
                p.total_ticks += 1;
                if p.time_slice > 0 {
                    p.time_slice -= 1;
                }
                p.time_slice == 0
            }
            // The running process vanished (self-exit without reschedule);
            // pick a successor immediately.
            None => true,
        }
    };

    if expired {
        schedule();
    }
}

/// Voluntarily give up the remainder of the quantum.
pub fn yield_now() {
    {
        let mut table = PROCESS_TABLE.lock();
        let current = process::current();
        if let Some(p) = table.get_mut(current) {
            p.time_slice = 0;
        }
    }
    schedule();
}

/// One full round-robin pass over the table, starting just past the current
/// PID. First Ready slot with a non-zero PID wins; the idle slot is the
/// fallback.
fn select_next(table: &ProcessTable, current_pid: u32) -> usize {
    let start = (current_pid as usize + 1) % MAX_PROCESSES;
    for i in 0..MAX_PROCESSES {
        let index = (start + i) % MAX_PROCESSES;
        let slot = &table.slots()[index];
        if slot.state == ProcessState::Ready && slot.pid != 0 {
            return index;
        }
    }
    0
}

/// Select the next runnable process and switch to it. Returns when this
/// process is scheduled again (never, if it has exited).
///
/// The whole dispatch runs with interrupts masked; the mask is restored by
/// whichever flow resumes, each inside its own call.
pub fn schedule() {
    if !is_enabled() {
        return;
    }

    arch::instructions::without_interrupts(|| {
        let current_pid = process::current();
        let (next_pid, next_directory, old_context, new_context) = {
            let mut table = PROCESS_TABLE.lock();
            let current_slot = table.slot_of(current_pid);
            let next_slot = select_next(&table, current_pid);
            if current_slot == Some(next_slot) {
                // Nothing else runnable; keep going.
                return;
            }

            if let Some(slot) = current_slot {
                let outgoing = &mut table.slots_mut()[slot];
                if outgoing.state == ProcessState::Running {
                    outgoing.state = ProcessState::Ready;
                }
            }

            let incoming = &mut table.slots_mut()[next_slot];
            incoming.state = ProcessState::Running;
            incoming.time_slice = DEFAULT_QUANTUM;
            let next_pid = incoming.pid;
            let next_directory = incoming.page_directory;

            // Raw context pointers survive the lock drop: the table's slots
            // never move after init, and the switch completes before anyone
            // else can touch them on a single CPU.
            let new_context =
                &mut table.slots_mut()[next_slot].kernel_context as *mut KernelContext;
            let old_context = match current_slot {
                Some(slot) => &mut table.slots_mut()[slot].kernel_context as *mut KernelContext,
                // The outgoing flow belongs to a reaped process; its state
                // is written where nobody will ever resume it.
                None => &mut *ORPHAN_CONTEXT.lock() as *mut KernelContext,
            };
            (next_pid, next_directory, old_context, new_context)
        };

        STATS.lock().context_switches += 1;

        if let Some(directory) = next_directory {
            if mm::page_table::current_directory() != Some(directory) {
                mm::page_table::switch_to(directory);
            }
        }

        // Also repoints TSS.esp0 at the incoming kernel stack, so the next
        // trap out of Ring 3 lands on the right stack.
        process::set_current(next_pid);

        unsafe { arch::switch_context(old_context, new_context) };
        // Back: something dispatched this process again.
    });
}

/// Take `pid` out of the Ready set.
pub fn block(pid: u32) {
    let mut table = PROCESS_TABLE.lock();
    if let Some(p) = table.get_mut(pid) {
        if matches!(p.state, ProcessState::Ready | ProcessState::Running) {
            p.state = ProcessState::Blocked;
        }
    }
}

/// Put a blocked `pid` back into the Ready set.
pub fn unblock(pid: u32) {
    let mut table = PROCESS_TABLE.lock();
    if let Some(p) = table.get_mut(pid) {
        if p.state == ProcessState::Blocked {
            p.state = ProcessState::Ready;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arch::interrupts::TrapFrame;
    use kernel_core::process::PriorityClass;
    use mm::frame_allocator::BitmapFrameAllocator;
    use mm::memory::{MemoryRegion, RegionKind};
    use mm::{PhysWindow, VirtAddr};
    use std::collections::HashMap;
    use std::sync::{Mutex as StdMutex, MutexGuard};

    static FIXTURE: StdMutex<()> = StdMutex::new(());

    const SIM_BYTES: usize = 16 * 1024 * 1024;
    const TEST_ENTRY: u32 = 0x10_0000;

    struct SchedFixture {
        _guard: MutexGuard<'static, ()>,
        _backing: Vec<u8>,
    }

    fn setup() -> SchedFixture {
        let guard = FIXTURE.lock().unwrap_or_else(|e| e.into_inner());
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
        let mut frames = BitmapFrameAllocator::new(&regions, 0x20_0000);
        let vmm = mm::Vmm::new(window, &mut frames).unwrap();
        mm::frame_allocator::install(frames);
        mm::page_table::install(vmm);
        process::init();
        init();
        SchedFixture {
            _guard: guard,
            _backing: backing,
        }
    }

    fn spawn(name: &str) -> u32 {
        process::create(name, VirtAddr::new(TEST_ENTRY), PriorityClass::Regular).unwrap()
    }

    /// Drive `count` timer ticks, returning the dispatch sequence (PID at
    /// each context switch).
    fn run_ticks(count: usize) -> Vec<u32> {
        let mut dispatches = Vec::new();
        let mut previous = process::current();
        for _ in 0..count {
            tick();
            let now = process::current();
            if now != previous {
                dispatches.push(now);
                previous = now;
            }
        }
        dispatches
    }

    #[test]
    fn disabled_scheduler_never_dispatches() {
        let _fx = setup();
        spawn("a");
        tick();
        assert_eq!(process::current(), 0);
    }

    #[test]
    fn equal_priority_rotation_is_fair() {
        let _fx = setup();
        let a = spawn("a");
        let b = spawn("b");
        let c = spawn("c");
        start();

        // 300 ticks at a 10-tick quantum: 30 dispatches, 10 per process.
        let dispatches = run_ticks(300);

        let mut counts: HashMap<u32, usize> = HashMap::new();
        for pid in &dispatches {
            *counts.entry(*pid).or_default() += 1;
        }
        let runs_a = counts.get(&a).copied().unwrap_or(0);
        let runs_b = counts.get(&b).copied().unwrap_or(0);
        let runs_c = counts.get(&c).copied().unwrap_or(0);
        assert!(runs_a >= 9 && runs_a <= 11, "a ran {} times", runs_a);
        assert!((runs_a as i64 - runs_b as i64).abs() <= 1);
        assert!((runs_b as i64 - runs_c as i64).abs() <= 1);
        // The idle process never runs while real work is Ready.
        assert_eq!(counts.get(&0), None);

        // Consumed ticks match: ~100 each over 300 ticks.
        let ticks_a = process::with_process(a, |p| p.total_ticks).unwrap();
        let ticks_b = process::with_process(b, |p| p.total_ticks).unwrap();
        assert!((ticks_a as i64 - ticks_b as i64).abs() <= DEFAULT_QUANTUM as i64);
    }

    #[test]
    fn rotation_follows_pid_order() {
        let _fx = setup();
        let a = spawn("a");
        let b = spawn("b");
        let c = spawn("c");
        start();
        let dispatches = run_ticks(100);
        // A first (scan starts past the idle PID), then B, C, wrapping.
        assert!(dispatches.len() >= 6);
        assert_eq!(&dispatches[..6], &[a, b, c, a, b, c]);
    }

    #[test]
    fn dispatch_installs_address_space_and_kernel_stack() {
        let _fx = setup();
        let a = spawn("a");
        start();

        run_ticks(10);
        assert_eq!(process::current(), a);
        assert_eq!(process::state_of(a), Some(ProcessState::Running));
        assert_eq!(
            process::with_process(a, |p| p.time_slice).unwrap(),
            DEFAULT_QUANTUM - 9
        );

        // TSS.esp0 tracks A's kernel stack, and the address space switched.
        let expected_stack = process::with_process(a, |p| p.kernel_stack_top).unwrap();
        assert_eq!(arch::gdt::kernel_stack(), expected_stack);
        let dir = process::with_process(a, |p| p.page_directory).unwrap();
        assert_eq!(mm::page_table::current_directory(), dir);
    }

    #[test]
    fn fresh_process_is_seeded_for_user_entry() {
        let _fx = setup();
        let a = spawn("a");
        process::with_process(a, |p| {
            assert!(p.context.is_user());
            assert_eq!(p.context.eip, TEST_ENTRY);
            assert_eq!(p.context.esp, kernel_core::USER_STACK_TOP - 4);
            // The kernel flow starts at the seeded slot just under the
            // stack top.
            assert_eq!(p.kernel_context.esp, p.kernel_stack_top - 4);
        })
        .unwrap();
    }

    #[test]
    fn preempted_process_goes_ready_and_back() {
        let _fx = setup();
        let a = spawn("a");
        let b = spawn("b");
        start();

        run_ticks(10);
        assert_eq!(process::current(), a);
        assert_eq!(process::state_of(b), Some(ProcessState::Ready));

        run_ticks(10);
        assert_eq!(process::current(), b);
        assert_eq!(process::state_of(a), Some(ProcessState::Ready));

        run_ticks(10);
        assert_eq!(process::current(), a);
        assert_eq!(process::state_of(a), Some(ProcessState::Running));
    }

    #[test]
    fn yield_switches_before_quantum_expires() {
        let _fx = setup();
        let a = spawn("a");
        let b = spawn("b");
        start();

        run_ticks(10);
        assert_eq!(process::current(), a);
        assert!(process::with_process(a, |p| p.time_slice).unwrap() > 0);

        yield_now();
        assert_eq!(process::current(), b);
    }

    #[test]
    fn blocked_process_is_skipped_until_unblocked() {
        let _fx = setup();
        let a = spawn("a");
        let b = spawn("b");
        start();

        run_ticks(10);
        assert_eq!(process::current(), a);

        block(b);
        let dispatches = run_ticks(40);
        assert!(!dispatches.contains(&b));

        unblock(b);
        let dispatches = run_ticks(20);
        assert!(dispatches.contains(&b));
    }

    #[test]
    fn exited_process_leaves_the_rotation() {
        let _fx = setup();
        kernel_core::syscall::register_reschedule(schedule);
        let x = spawn("x");
        let a = spawn("a");
        let b = spawn("b");
        start();

        run_ticks(10);
        assert_eq!(process::current(), x);

        // X terminates itself through the system-call path.
        let mut frame: TrapFrame = unsafe { core::mem::zeroed() };
        frame.eax = kernel_core::syscall::SYS_EXIT;
        frame.ebx = 0;
        kernel_core::syscall::dispatch(&mut frame);

        // The reschedule hook already picked a successor.
        assert_ne!(process::current(), x);
        assert_eq!(process::state_of(x), None);

        // Remaining quanta alternate between the two survivors.
        let dispatches = run_ticks(60);
        assert!(dispatches.len() >= 4);
        for pair in dispatches.windows(2) {
            assert_ne!(pair[0], pair[1]);
            assert!(pair[0] == a || pair[0] == b);
        }
        assert_eq!(process::live_count(), 3); // idle + a + b
    }

    #[test]
    fn lone_process_alternates_with_idle() {
        let _fx = setup();
        let a = spawn("a");
        start();

        run_ticks(10);
        assert_eq!(process::current(), a);

        // With nobody else Ready, the quantum expiry falls back to idle,
        // and the next expiry brings A back.
        let dispatches = run_ticks(25);
        assert!(dispatches.contains(&0));
        assert!(dispatches.contains(&a));
    }
}
