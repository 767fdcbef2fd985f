//! IDT construction and the trap entry stubs.
//!
//! Every vector funnels through `trap_common`, which saves the register
//! frame described by [`crate::interrupts::TrapFrame`], switches to kernel
//! data selectors, and calls the dispatcher with a pointer to the frame.
//! Vectors whose exceptions push a CPU error code skip the dummy push.

#![cfg(target_arch = "x86")]

use crate::gdt::KERNEL_CODE_SELECTOR;
use crate::pic;
use spin::Mutex;

/// Gate flags: present, DPL 0, 32-bit interrupt gate.
const GATE_KERNEL: u8 = 0x8E;
/// Gate flags: present, DPL 3 (callable from Ring 3), 32-bit interrupt gate.
const GATE_USER: u8 = 0xEE;

#[derive(Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    base_lo: u16,
    selector: u16,
    zero: u8,
    flags: u8,
    base_hi: u16,
}

impl IdtEntry {
    const fn missing() -> IdtEntry {
        IdtEntry {
            base_lo: 0,
            selector: 0,
            zero: 0,
            flags: 0,
            base_hi: 0,
        }
    }

    fn new(handler: u32, selector: u16, flags: u8) -> IdtEntry {
        IdtEntry {
            base_lo: (handler & 0xFFFF) as u16,
            selector,
            zero: 0,
            flags,
            base_hi: (handler >> 16) as u16,
        }
    }
}

static IDT: Mutex<[IdtEntry; 256]> = Mutex::new([IdtEntry::missing(); 256]);

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

// ============================================================================
// Entry stubs
// ============================================================================

macro_rules! trap_stub {
    ($name:literal, $vector:literal) => {
        core::arch::global_asm!(
            concat!(
                ".section .text\n",
                ".global ", $name, "\n",
                $name, ":\n",
                "    pushl $0\n",
                "    pushl $", $vector, "\n",
                "    jmp trap_common\n",
            ),
            options(att_syntax)
        );
    };
    ($name:literal, $vector:literal, error_code) => {
        core::arch::global_asm!(
            concat!(
                ".section .text\n",
                ".global ", $name, "\n",
                $name, ":\n",
                "    pushl $", $vector, "\n",
                "    jmp trap_common\n",
            ),
            options(att_syntax)
        );
    };
}

// CPU exceptions 0..31. Vectors 8, 10-14 and 17 push a hardware error code.
trap_stub!("isr0", 0);
trap_stub!("isr1", 1);
trap_stub!("isr2", 2);
trap_stub!("isr3", 3);
trap_stub!("isr4", 4);
trap_stub!("isr5", 5);
trap_stub!("isr6", 6);
trap_stub!("isr7", 7);
trap_stub!("isr8", 8, error_code);
trap_stub!("isr9", 9);
trap_stub!("isr10", 10, error_code);
trap_stub!("isr11", 11, error_code);
trap_stub!("isr12", 12, error_code);
trap_stub!("isr13", 13, error_code);
trap_stub!("isr14", 14, error_code);
trap_stub!("isr15", 15);
trap_stub!("isr16", 16);
trap_stub!("isr17", 17, error_code);
trap_stub!("isr18", 18);
trap_stub!("isr19", 19);
trap_stub!("isr20", 20);
trap_stub!("isr21", 21);
trap_stub!("isr22", 22);
trap_stub!("isr23", 23);
trap_stub!("isr24", 24);
trap_stub!("isr25", 25);
trap_stub!("isr26", 26);
trap_stub!("isr27", 27);
trap_stub!("isr28", 28);
trap_stub!("isr29", 29);
trap_stub!("isr30", 30);
trap_stub!("isr31", 31);

// External interrupts 32..47 (remapped PIC).
trap_stub!("irq0", 32);
trap_stub!("irq1", 33);
trap_stub!("irq2", 34);
trap_stub!("irq3", 35);
trap_stub!("irq4", 36);
trap_stub!("irq5", 37);
trap_stub!("irq6", 38);
trap_stub!("irq7", 39);
trap_stub!("irq8", 40);
trap_stub!("irq9", 41);
trap_stub!("irq10", 42);
trap_stub!("irq11", 43);
trap_stub!("irq12", 44);
trap_stub!("irq13", 45);
trap_stub!("irq14", 46);
trap_stub!("irq15", 47);

// System call gate.
trap_stub!("isr128", 128);

// Common save/dispatch/restore path. The push sequence here is the single
// source of truth for the TrapFrame layout; the size assertion next to the
// struct keeps the two in lockstep.
core::arch::global_asm!(
    r#"
.section .text
trap_common:
    pushal
    pushl %ds
    pushl %es
    pushl %fs
    pushl %gs
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %fs
    movw %ax, %gs
    pushl %esp
    call trap_dispatch_entry
    addl $4, %esp
    popl %gs
    popl %fs
    popl %es
    popl %ds
    popal
    addl $8, %esp
    iretl
"#,
    options(att_syntax)
);

#[no_mangle]
extern "C" fn trap_dispatch_entry(frame: *mut crate::interrupts::TrapFrame) {
    unsafe { crate::interrupts::dispatch(&mut *frame) };
}

extern "C" {
    fn isr0();
    fn isr1();
    fn isr2();
    fn isr3();
    fn isr4();
    fn isr5();
    fn isr6();
    fn isr7();
    fn isr8();
    fn isr9();
    fn isr10();
    fn isr11();
    fn isr12();
    fn isr13();
    fn isr14();
    fn isr15();
    fn isr16();
    fn isr17();
    fn isr18();
    fn isr19();
    fn isr20();
    fn isr21();
    fn isr22();
    fn isr23();
    fn isr24();
    fn isr25();
    fn isr26();
    fn isr27();
    fn isr28();
    fn isr29();
    fn isr30();
    fn isr31();
    fn irq0();
    fn irq1();
    fn irq2();
    fn irq3();
    fn irq4();
    fn irq5();
    fn irq6();
    fn irq7();
    fn irq8();
    fn irq9();
    fn irq10();
    fn irq11();
    fn irq12();
    fn irq13();
    fn irq14();
    fn irq15();
    fn isr128();
}

/// Install all gates, remap the PIC, and load the IDT.
pub fn init() {
    pic::remap();

    let exception_stubs: [unsafe extern "C" fn(); 32] = [
        isr0, isr1, isr2, isr3, isr4, isr5, isr6, isr7, isr8, isr9, isr10, isr11, isr12, isr13,
        isr14, isr15, isr16, isr17, isr18, isr19, isr20, isr21, isr22, isr23, isr24, isr25, isr26,
        isr27, isr28, isr29, isr30, isr31,
    ];
    let irq_stubs: [unsafe extern "C" fn(); 16] = [
        irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11, irq12, irq13,
        irq14, irq15,
    ];

    {
        let mut idt = IDT.lock();
        for (vector, stub) in exception_stubs.iter().enumerate() {
            idt[vector] = IdtEntry::new(*stub as u32, KERNEL_CODE_SELECTOR, GATE_KERNEL);
        }
        for (i, stub) in irq_stubs.iter().enumerate() {
            idt[32 + i] = IdtEntry::new(*stub as u32, KERNEL_CODE_SELECTOR, GATE_KERNEL);
        }
        // int 0x80 must be reachable from Ring 3.
        idt[0x80] = IdtEntry::new(isr128 as u32, KERNEL_CODE_SELECTOR, GATE_USER);
    }

    let pointer = DescriptorTablePointer {
        limit: (core::mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: IDT.as_mut_ptr() as u32,
    };
    unsafe {
        core::arch::asm!(
            "lidt [{}]",
            in(reg) &pointer as *const DescriptorTablePointer,
            options(nostack)
        );
    }
}
