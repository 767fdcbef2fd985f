//! Kernel-to-user mode transition.
//!
//! The only way into Ring 3 is `iret` with a five-word privilege-change
//! frame: {user SS, user ESP, EFLAGS, user CS, user EIP}. The reverse
//! direction is taken by the CPU itself on a trap, landing on the kernel
//! stack held in TSS.esp0 — which must already point at the resumed
//! process's kernel stack (see [`crate::gdt::set_kernel_stack`]).

/// EFLAGS for freshly entered user code: IF set, everything else clear.
pub const USER_EFLAGS: u32 = 0x202;

/// Jump to Ring 3 at `entry` with the given user stack pointer.
///
/// Loads the user data selectors, builds the iret frame, and drops
/// privilege. Interrupts are enabled by the pushed EFLAGS, not before.
///
/// # Safety
///
/// - `entry` must be mapped user-executable in the current address space.
/// - `user_stack` must be mapped user-writable.
/// - TSS.esp0 must point at a valid kernel stack for the return trip.
#[cfg(target_arch = "x86")]
#[unsafe(naked)]
pub unsafe extern "C" fn enter_usermode(_entry: u32, _user_stack: u32) -> ! {
    core::arch::naked_asm!(
        "mov ecx, [esp + 4]", // entry point
        "mov edx, [esp + 8]", // user stack top
        "mov ax, {udata}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "push {udata}",  // SS: user data
        "push edx",      // ESP
        "push {eflags}", // EFLAGS: IF set
        "push {ucode}",  // CS: user code
        "push ecx",      // EIP
        "iretd",
        udata = const crate::gdt::USER_DATA_SELECTOR as u32,
        ucode = const crate::gdt::USER_CODE_SELECTOR as u32,
        eflags = const USER_EFLAGS,
    )
}

#[cfg(not(target_arch = "x86"))]
pub unsafe extern "C" fn enter_usermode(_entry: u32, _user_stack: u32) -> ! {
    unreachable!("user-mode transition requires an i386 target")
}
