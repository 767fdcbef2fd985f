//! System-call demultiplexer.
//!
//! Vector 0x80, number in `eax`, arguments in `ebx`/`ecx`/`edx`. The result
//! goes back in `eax`; failures are reported as -1, never by terminating
//! the caller. The one exception is Exit, which never returns to the
//! caller: it tears the process down and enters the registered reschedule
//! hook, which hands the CPU to another process.

use crate::process;
use crate::usercopy;
use arch::interrupts::TrapFrame;
use mm::VirtAddr;
use spin::Mutex;

pub const SYS_EXIT: u32 = 1;
pub const SYS_WRITE: u32 = 2;
pub const SYS_READ: u32 = 3;
pub const SYS_FORK: u32 = 4;
pub const SYS_EXEC: u32 = 5;
pub const SYS_GETPID: u32 = 6;

/// The defined failure value, -1 as an unsigned register.
pub const SYSCALL_ERROR: u32 = u32::MAX;

/// Largest single Write the kernel will service.
const WRITE_MAX: u32 = 0x10_0000;

/// Console output collaborator for fd 1 and 2.
type ConsoleWrite = fn(&[u8]);

/// Invoked after the caller terminated itself; must hand the CPU to another
/// process. The dying kernel flow never returns from it.
type RescheduleHook = fn();

static CONSOLE: Mutex<Option<ConsoleWrite>> = Mutex::new(None);
static RESCHEDULE: Mutex<Option<RescheduleHook>> = Mutex::new(None);

/// Route fd 1/2 output. The kernel installs the text console here.
pub fn register_console(sink: ConsoleWrite) {
    *CONSOLE.lock() = Some(sink);
}

/// Install the scheduler entry used when a process exits itself.
pub fn register_reschedule(hook: RescheduleHook) {
    *RESCHEDULE.lock() = Some(hook);
}

/// Handle one `int 0x80`. Runs in Ring 0 on the caller's kernel stack.
pub fn dispatch(frame: &mut TrapFrame) {
    let number = frame.eax;
    match number {
        SYS_EXIT => {
            let exit_code = frame.ebx;
            let pid = process::current();
            let was_self = process::exit(pid, exit_code);
            if was_self {
                // The caller is gone; hand the CPU to someone else.
                let hook = *RESCHEDULE.lock();
                if let Some(hook) = hook {
                    hook();
                }
            }
        }
        SYS_WRITE => {
            frame.eax = sys_write(frame.ebx, frame.ecx, frame.edx);
        }
        SYS_READ => {
            frame.eax = SYSCALL_ERROR;
        }
        SYS_FORK => {
            klog::klog!(Debug, "syscall: fork not implemented");
            frame.eax = SYSCALL_ERROR;
        }
        SYS_EXEC => {
            klog::klog!(Debug, "syscall: exec not implemented");
            frame.eax = SYSCALL_ERROR;
        }
        SYS_GETPID => {
            frame.eax = process::current();
        }
        _ => {
            klog::klog!(Warn, "syscall: unknown number {}", number);
            frame.eax = SYSCALL_ERROR;
        }
    }
}

/// Write `len` bytes from the user buffer at `buf` to fd `fd`.
///
/// Only fd 1 and 2 are backed (both by the console). The entire buffer is
/// validated through the address space before the first byte is emitted.
fn sys_write(fd: u32, buf: u32, len: u32) -> u32 {
    if fd != 1 && fd != 2 {
        return SYSCALL_ERROR;
    }
    if len > WRITE_MAX {
        return SYSCALL_ERROR;
    }

    let sink = *CONSOLE.lock();
    let Some(sink) = sink else {
        return SYSCALL_ERROR;
    };

    match usercopy::for_each_user_chunk(VirtAddr::new(buf), len as usize, |chunk| sink(chunk)) {
        Ok(()) => len,
        Err(_) => SYSCALL_ERROR,
    }
}
