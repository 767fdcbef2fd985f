//! Multiboot header and the 32-bit entry shim.
//!
//! The bootloader jumps to `_start` with the magic value in `eax` and the
//! info-block pointer in `ebx`; the shim installs the boot stack and hands
//! both to `kmain` as C arguments.

core::arch::global_asm!(
    r#"
.section .multiboot
.align 4
.long 0x1BADB002            /* magic */
.long 0x00000003            /* flags: page-align modules, want memory info */
.long -(0x1BADB002 + 0x00000003)

.section .bss
.align 16
boot_stack_bottom:
.skip 16384
boot_stack_top:

.section .text
.global _start
_start:
    mov esp, offset boot_stack_top
    push ebx                /* multiboot info pointer */
    push eax                /* magic */
    call kmain
1:
    cli
    hlt
    jmp 1b
"#
);
