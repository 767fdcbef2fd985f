//! Trap dispatch.
//!
//! The assembly stubs in `idt.rs` push a [`TrapFrame`] and call into
//! [`dispatch`], which routes to whatever handler a subsystem registered for
//! the vector. External interrupts are acknowledged to the PIC before the
//! handler runs — the timer handler may suspend the flow inside the
//! scheduler, so the acknowledgement cannot wait for it to return.
//! Unhandled CPU exceptions dump the register frame and halt.

use crate::instructions;
use crate::pic;
use spin::Mutex;

/// Vector of the first external interrupt (master PIC offset).
pub const IRQ_BASE: u8 = 32;
/// Last external-interrupt vector (slave PIC).
pub const IRQ_LAST: u8 = 47;
/// Software-interrupt vector for system calls, callable from Ring 3.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Register snapshot pushed by the trap entry stubs, low address first.
///
/// Layout is dictated by the stub's push sequence: four data selectors,
/// `pusha`, the vector and error code, then the CPU-pushed return frame.
/// The final two fields exist only when the trap came from Ring 3.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Kernel esp at `pusha` time; ignored by `popa` on the way out.
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub int_no: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Pushed by the CPU only on a privilege change (trap from Ring 3).
    pub user_esp: u32,
    /// Pushed by the CPU only on a privilege change.
    pub ss: u32,
}

// The stubs and the return path both hard-code this layout.
const _: () = assert!(core::mem::size_of::<TrapFrame>() == 19 * 4);

impl TrapFrame {
    /// Returns `true` when the trap interrupted Ring 3 code.
    #[inline]
    pub fn from_user_mode(&self) -> bool {
        self.cs & 0x3 == 3
    }
}

pub type InterruptHandler = fn(&mut TrapFrame);

const NO_HANDLER: Option<InterruptHandler> = None;
static HANDLERS: Mutex<[Option<InterruptHandler>; 256]> = Mutex::new([NO_HANDLER; 256]);

/// Route `vector` to `handler`. Replaces any previous registration.
pub fn register_handler(vector: u8, handler: InterruptHandler) {
    HANDLERS.lock()[vector as usize] = Some(handler);
}

/// Names of the 32 CPU exceptions, indexed by vector.
pub static EXCEPTION_NAMES: [&str; 32] = [
    "Division By Zero",
    "Debug",
    "Non Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating Point Exception",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating Point Exception",
    "Virtualization Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Security Exception",
    "Reserved",
];

/// Central trap dispatcher, called from the assembly stubs with interrupts
/// masked. Must not take locks a handler also wants across the call.
pub fn dispatch(frame: &mut TrapFrame) {
    let vector = frame.int_no as u8;

    // External interrupts are acknowledged up front: the timer handler may
    // suspend this control flow inside the scheduler, and the controller
    // must not sit with the IRQ in service until the flow resumes.
    // Slave first for vectors on the second controller, then the master.
    if (IRQ_BASE..=IRQ_LAST).contains(&vector) {
        pic::end_of_interrupt(vector);
    }

    // Copy the registration out so the table lock is not held while the
    // handler runs.
    let handler = HANDLERS.lock()[vector as usize];

    if let Some(handler) = handler {
        handler(frame);
    } else if vector < 32 {
        fatal_exception(frame);
    }
}

/// Dump the register frame for an exception nobody claimed, then halt.
fn fatal_exception(frame: &TrapFrame) -> ! {
    drivers::vga_buffer::set_color(
        drivers::vga_buffer::Color::White,
        drivers::vga_buffer::Color::Red,
    );
    klog::klog_always!("");
    klog::klog_always!("*** KERNEL PANIC ***");
    klog::klog_always!(
        "Exception: {} (vector {})",
        EXCEPTION_NAMES[frame.int_no as usize],
        frame.int_no
    );
    klog::klog_always!("Error Code: 0x{:x}", frame.err_code);
    dump_frame(frame);
    instructions::halt_loop();
}

/// Print the full register snapshot. Shared by the exception path and the
/// page-fault handler.
pub fn dump_frame(frame: &TrapFrame) {
    klog::klog_always!("EIP: 0x{:08x}  CS: 0x{:04x}", frame.eip, frame.cs);
    klog::klog_always!("EFLAGS: 0x{:08x}", frame.eflags);
    klog::klog_always!(
        "EAX: 0x{:08x}  EBX: 0x{:08x}  ECX: 0x{:08x}  EDX: 0x{:08x}",
        frame.eax,
        frame.ebx,
        frame.ecx,
        frame.edx
    );
    klog::klog_always!(
        "ESP: 0x{:08x}  EBP: 0x{:08x}  ESI: 0x{:08x}  EDI: 0x{:08x}",
        frame.esp,
        frame.ebp,
        frame.esi,
        frame.edi
    );
    if frame.from_user_mode() {
        klog::klog_always!("User ESP: 0x{:08x}  SS: 0x{:04x}", frame.user_esp, frame.ss);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn frame_for_vector(vector: u32) -> TrapFrame {
        let mut frame: TrapFrame = unsafe { core::mem::zeroed() };
        frame.int_no = vector;
        frame.cs = crate::gdt::KERNEL_CODE_SELECTOR as u32;
        frame
    }

    #[test]
    fn registered_handler_receives_frame() {
        static HITS: AtomicU32 = AtomicU32::new(0);
        fn probe(frame: &mut TrapFrame) {
            HITS.fetch_add(1, Ordering::SeqCst);
            frame.eax = 0x1234;
        }
        register_handler(200, probe);
        let mut frame = frame_for_vector(200);
        dispatch(&mut frame);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        assert_eq!(frame.eax, 0x1234);
    }

    #[test]
    fn unregistered_high_vector_is_ignored() {
        let mut frame = frame_for_vector(201);
        dispatch(&mut frame); // must not panic or halt
    }

    #[test]
    fn user_mode_detection_uses_cs_rpl() {
        let mut frame = frame_for_vector(0x80);
        frame.cs = crate::gdt::USER_CODE_SELECTOR as u32;
        assert!(frame.from_user_mode());
        frame.cs = crate::gdt::KERNEL_CODE_SELECTOR as u32;
        assert!(!frame.from_user_mode());
    }
}
