//! Demo user-mode processes.
//!
//! These run in Ring 3 out of the identity-mapped kernel text and talk to
//! the kernel exclusively through `int 0x80`. Three of them write their
//! letter forever; the fourth writes five times and exits, demonstrating
//! reaping and rescheduling.

use kernel_core::process::PriorityClass;
use mm::VirtAddr;

/// Write syscall from user mode: fd 1, returns bytes written.
fn sys_write(buf: &[u8]) -> u32 {
    let result: u32;
    unsafe {
        core::arch::asm!(
            "int 0x80",
            inout("eax") 2u32 => result,
            in("ebx") 1u32,
            in("ecx") buf.as_ptr(),
            in("edx") buf.len() as u32,
        );
    }
    result
}

/// Exit syscall; never returns.
fn sys_exit(code: u32) -> ! {
    unsafe {
        core::arch::asm!(
            "int 0x80",
            in("eax") 1u32,
            in("ebx") code,
            options(noreturn),
        );
    }
}

/// Burn some user-mode cycles between writes.
fn delay() {
    for _ in 0..400_000 {
        core::hint::spin_loop();
    }
}

extern "C" fn writer_a() -> ! {
    loop {
        sys_write(b"A");
        delay();
    }
}

extern "C" fn writer_b() -> ! {
    loop {
        sys_write(b"B");
        delay();
    }
}

extern "C" fn writer_c() -> ! {
    loop {
        sys_write(b"C");
        delay();
    }
}

extern "C" fn writer_x() -> ! {
    for _ in 0..5 {
        sys_write(b"X");
        delay();
    }
    sys_exit(0);
}

/// Create the demo processes. They stay Ready until the scheduler starts.
pub fn launch() {
    let demos: [(&str, extern "C" fn() -> !); 4] = [
        ("writer_x", writer_x),
        ("writer_a", writer_a),
        ("writer_b", writer_b),
        ("writer_c", writer_c),
    ];
    for (name, entry) in demos {
        match kernel_core::process::create(
            name,
            VirtAddr::new(entry as u32),
            PriorityClass::Regular,
        ) {
            Ok(pid) => klog::klog!(Info, "demo: {} is pid {}", name, pid),
            Err(e) => klog::klog!(Error, "demo: failed to create {}: {:?}", name, e),
        }
    }
}
