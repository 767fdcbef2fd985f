//! Trap-handler wiring for the kernel binary.
//!
//! Connects the vectors the arch layer dispatches to the subsystems that
//! own them: the page-fault reporter, the timer-driven scheduler tick, the
//! keyboard event feed, and the system-call demultiplexer.

use arch::interrupts::TrapFrame;
use arch::{IRQ_BASE, SYSCALL_VECTOR};

const PAGE_FAULT_VECTOR: u8 = 14;
const TIMER_VECTOR: u8 = IRQ_BASE;
const KEYBOARD_VECTOR: u8 = IRQ_BASE + 1;

pub fn init() {
    arch::register_handler(PAGE_FAULT_VECTOR, page_fault_handler);
    arch::register_handler(TIMER_VECTOR, timer_handler);
    arch::register_handler(KEYBOARD_VECTOR, keyboard_handler);
    arch::register_handler(SYSCALL_VECTOR, syscall_handler);
    arch::pic::unmask(1);
    klog::klog!(Info, "interrupts: handlers registered");
}

/// Timer tick: count it and drive the scheduler. The tick may suspend this
/// flow inside the dispatcher; it unwinds back through here whenever the
/// interrupted process is scheduled again.
fn timer_handler(_frame: &mut TrapFrame) {
    arch::pit::on_tick();
    sched::tick();
}

/// Keyboard IRQ: pull the scan code and feed the event ring.
fn keyboard_handler(_frame: &mut TrapFrame) {
    let scancode = unsafe { arch::port::inb(0x60) };
    drivers::keyboard::handle_scancode(scancode);
}

fn syscall_handler(frame: &mut TrapFrame) {
    kernel_core::syscall::dispatch(frame);
}

/// Page faults are fatal: report the faulting address and the decoded error
/// code, dump the register frame, and halt.
fn page_fault_handler(frame: &mut TrapFrame) {
    let fault_addr = arch::instructions::read_cr2();
    let info = mm::PageFaultInfo::decode(frame.err_code);

    drivers::vga_buffer::set_color(
        drivers::vga_buffer::Color::White,
        drivers::vga_buffer::Color::Red,
    );
    klog::klog_always!("");
    klog::klog_always!("*** PAGE FAULT at 0x{:08x} ***", fault_addr);
    klog::klog_always!(
        "  {} / {} access / {} mode{}{}",
        if info.protection_violation {
            "protection violation"
        } else {
            "page not present"
        },
        if info.write { "write" } else { "read" },
        if info.user_mode { "user" } else { "kernel" },
        if info.instruction_fetch {
            " / instruction fetch"
        } else {
            ""
        },
        if info.reserved_bit { " / reserved bit" } else { "" },
    );
    arch::interrupts::dump_frame(frame);
    arch::instructions::halt_loop();
}
