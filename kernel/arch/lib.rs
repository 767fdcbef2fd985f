//! i386 architecture support for Ferrite OS.
//!
//! Everything that touches a privileged instruction, an I/O port, or an
//! exact on-stack layout lives here: GDT/TSS, IDT and trap stubs, the 8259
//! PIC, the PIT, control registers and the kernel-to-user transition.
//! Inline assembly is gated on `target_arch = "x86"`; the data structures
//! and the trap-dispatch logic build (and unit-test) on a host toolchain.

#![cfg_attr(not(test), no_std)]

pub mod context_switch;
pub mod gdt;
pub mod idt;
pub mod instructions;
pub mod interrupts;
pub mod pic;
pub mod pit;
pub mod port;
pub mod usermode;

pub use context_switch::{switch_context, KernelContext};
pub use gdt::{
    set_kernel_stack, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR,
    USER_DATA_SELECTOR,
};
pub use interrupts::{register_handler, TrapFrame, IRQ_BASE, SYSCALL_VECTOR};
