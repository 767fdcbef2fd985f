//! Process management core: the process table, saved contexts, user-memory
//! access, and the system-call surface.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod context;
pub mod process;
pub mod syscall;
pub mod usercopy;

pub use context::Context;
pub use process::{
    Pid, PriorityClass, Process, ProcessError, ProcessState, DEFAULT_QUANTUM, MAX_PROCESSES,
    PROCESS_TABLE, USER_STACK_PAGE, USER_STACK_TOP,
};
