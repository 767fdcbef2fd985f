//! Ferrite OS kernel entry.
//!
//! Boot order matters: console and descriptor tables first, then the
//! memory managers (heap before PMM before VMM), then the timer, the
//! system-call surface, the process table, and finally the scheduler. The
//! main loop drains the input-event ring and halts between interrupts.

#![cfg_attr(target_arch = "x86", no_std, no_main)]

extern crate alloc;

#[macro_use]
extern crate drivers;
#[macro_use]
extern crate klog;

#[cfg(target_arch = "x86")]
mod boot;
#[cfg(target_arch = "x86")]
mod interrupts;
#[cfg(target_arch = "x86")]
mod process_demo;
#[cfg(target_arch = "x86")]
mod runtime_tests;

#[cfg(target_arch = "x86")]
mod kernel {
    use crate::{interrupts, process_demo, runtime_tests};
    use drivers::vga_buffer::{self, Color};
    use drivers::EventKind;

    extern "C" {
        /// Placed by the linker script just past the kernel image.
        static __kernel_end: u8;
    }

    /// Console sink for system-call Write on fd 1/2.
    fn console_write(bytes: &[u8]) {
        vga_buffer::write_bytes(bytes);
    }

    #[no_mangle]
    pub extern "C" fn kmain(magic: u32, info: *const mm::MultibootInfo) -> ! {
        arch::instructions::disable_interrupts();

        vga_buffer::clear();
        vga_buffer::set_color(Color::LightCyan, Color::Black);
        println!("=====================================");
        println!("  Ferrite OS v0.3");
        println!("=====================================");
        println!();
        vga_buffer::set_color(Color::LightGrey, Color::Black);

        klog::set_level(klog::Level::Info);

        let kernel_end = unsafe { core::ptr::addr_of!(__kernel_end) as u32 };
        klog_always!("[boot] kernel image ends at 0x{:08x}", kernel_end);
        klog_always!("[boot] multiboot magic 0x{:08x}", magic);

        arch::gdt::init();
        klog_always!("[boot] GDT and TSS loaded");
        arch::idt::init();
        klog_always!("[boot] IDT loaded, PIC remapped");
        interrupts::init();

        mm::memory::init_heap();
        let map = unsafe { mm::memory::parse_handoff(magic, info) };
        let frame_allocator = mm::BitmapFrameAllocator::new(map.regions(), kernel_end);
        frame_allocator.print_stats();
        mm::frame_allocator::install(frame_allocator);

        let mut frames = mm::FrameAllocator::new();
        let vmm = mm::Vmm::new(mm::PhysWindow::identity(), &mut frames)
            .expect("FATAL: cannot build the kernel address space");
        vmm.enable();
        mm::page_table::install(vmm);

        arch::pit::init(100);

        kernel_core::syscall::register_console(console_write);
        kernel_core::syscall::register_reschedule(sched::schedule);

        kernel_core::process::init();
        sched::init();

        runtime_tests::run();

        process_demo::launch();
        kernel_core::process::print_table();
        sched::start();

        vga_buffer::set_color(Color::LightGreen, Color::Black);
        println!("System ready.");
        vga_buffer::set_color(Color::LightGrey, Color::Black);

        arch::instructions::enable_interrupts();

        // Idle loop: PID 0. Drain input events, then halt until the next
        // interrupt; the timer preempts into the demo processes. The event
        // ring and the console are shared with interrupt-driven paths, so
        // both are touched with interrupts masked — a preemption while a
        // lock is held here would wedge the next Write syscall.
        loop {
            loop {
                let event = arch::instructions::without_interrupts(drivers::pop_event);
                if event.kind == EventKind::None {
                    break;
                }
                if event.kind == EventKind::KeyDown {
                    let ascii = event.data[0];
                    if ascii != 0 {
                        arch::instructions::without_interrupts(|| vga_buffer::putc(ascii));
                    }
                }
            }
            arch::instructions::hlt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        arch::instructions::disable_interrupts();
        vga_buffer::set_color(Color::White, Color::Red);
        klog_always!("");
        klog_always!("*** KERNEL PANIC ***");
        klog_always!("{}", info);
        arch::instructions::halt_loop();
    }
}

/// The bare-metal image is produced for the i686 target; building the
/// package on a host toolchain yields this stub.
#[cfg(not(target_arch = "x86"))]
fn main() {
    eprintln!("ferrite-kernel: build with the i686-ferrite target to produce a bootable image");
}
