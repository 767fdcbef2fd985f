//! Boot-time self tests.
//!
//! Run after the memory managers and the process table are up but before
//! scheduling starts, exercising the same paths the host unit tests cover —
//! except here the page tables are live and the writes go through real
//! translations.

use kernel_core::process::{self, PriorityClass};
use mm::{PageFlags, PhysFrame, VirtAddr};

struct TestReport {
    passed: u32,
    failed: u32,
}

impl TestReport {
    fn record(&mut self, name: &str, ok: bool) {
        if ok {
            self.passed += 1;
            klog::klog_always!("  [PASS] {}", name);
        } else {
            self.failed += 1;
            klog::klog_always!("  [FAIL] {}", name);
        }
    }
}

pub fn run() {
    klog::klog_always!("Running kernel self-tests...");
    let mut report = TestReport {
        passed: 0,
        failed: 0,
    };

    report.record("pmm.conservation", pmm_conservation());
    report.record("pmm.reservation", pmm_reservation());
    report.record("vmm.map_roundtrip", vmm_map_roundtrip());
    report.record("vmm.kernel_half_shared", vmm_kernel_half_shared());
    report.record("vmm.teardown_conservation", vmm_teardown_conservation());
    report.record("process.exit_reparents", process_exit_reparents());

    klog::klog_always!(
        "Self-tests: {} passed, {} failed",
        report.passed,
        report.failed
    );
}

fn used_frames() -> usize {
    mm::frame_allocator::stats().map(|s| s.used_frames).unwrap_or(0)
}

/// total = used + free across an alloc/free cycle; no double handout.
fn pmm_conservation() -> bool {
    let Some(stats) = mm::frame_allocator::stats() else {
        return false;
    };
    if stats.used_frames + stats.free_frames != stats.total_frames {
        return false;
    }

    let mut held = [PhysFrame::from_pfn(0); 16];
    for slot in held.iter_mut() {
        match mm::alloc_physical_page() {
            Some(frame) => *slot = frame,
            None => return false,
        }
    }
    // All distinct.
    for i in 0..held.len() {
        for j in i + 1..held.len() {
            if held[i] == held[j] {
                return false;
            }
        }
    }
    let before = used_frames();
    for frame in held {
        mm::free_physical_page(frame);
    }
    used_frames() == before - 16
}

/// Nothing below the 1 MiB bound is ever handed out.
fn pmm_reservation() -> bool {
    let Some(frame) = mm::alloc_physical_page() else {
        return false;
    };
    let ok = frame.pfn() >= 0x100;
    mm::free_physical_page(frame);
    ok
}

/// Map a fresh frame, write through the virtual address, read it back.
fn vmm_map_roundtrip() -> bool {
    let virt = VirtAddr::new(0x40_0000);
    let Some(frame) = mm::alloc_physical_page() else {
        return false;
    };
    if mm::page_table::map(
        virt,
        frame.start_address(),
        PageFlags::WRITABLE | PageFlags::USER,
    )
    .is_err()
    {
        mm::free_physical_page(frame);
        return false;
    }

    let mut ok = mm::page_table::translate(virt) == Some(frame.start_address());

    // Paging is live: this store goes through the new PTE.
    unsafe {
        let p = virt.as_u32() as *mut u32;
        core::ptr::write_volatile(p, 0xDEAD_BEEF);
        ok &= core::ptr::read_volatile(p) == 0xDEAD_BEEF;
    }

    mm::page_table::unmap(virt);
    ok &= mm::page_table::translate(virt).is_none();
    mm::free_physical_page(frame);
    ok
}

/// Two fresh directories share the kernel-half page tables by reference.
fn vmm_kernel_half_shared() -> bool {
    let Some(dir_a) = mm::page_table::create_directory() else {
        return false;
    };
    let Some(dir_b) = mm::page_table::create_directory() else {
        mm::page_table::destroy_directory(dir_a);
        return false;
    };

    let ok = mm::page_table::with_vmm(|vmm| {
        for i in mm::KERNEL_PDE_START..1024 {
            if vmm.directory_entry(dir_a, i) != vmm.directory_entry(dir_b, i) {
                return false;
            }
        }
        // The shared identity table as well.
        vmm.directory_entry(dir_a, 0) == vmm.directory_entry(dir_b, 0)
    })
    .unwrap_or(false);

    mm::page_table::destroy_directory(dir_a);
    mm::page_table::destroy_directory(dir_b);
    ok
}

/// create + map + destroy returns the frame counters to their start.
fn vmm_teardown_conservation() -> bool {
    let before = used_frames();
    let Some(dir) = mm::page_table::create_directory() else {
        return false;
    };
    for i in 0..4u32 {
        let Some(frame) = mm::alloc_physical_page() else {
            mm::page_table::destroy_directory(dir);
            return false;
        };
        if mm::page_table::map_in(
            dir,
            VirtAddr::new(0x50_0000 + i * 0x1000),
            frame.start_address(),
            PageFlags::WRITABLE | PageFlags::USER,
        )
        .is_err()
        {
            mm::free_physical_page(frame);
            mm::page_table::destroy_directory(dir);
            return false;
        }
    }
    mm::page_table::destroy_directory(dir);
    used_frames() == before
}

/// Exiting a parent adopts its children out to the idle process.
fn process_exit_reparents() -> bool {
    let entry = VirtAddr::new(process_exit_reparents as u32 & !0xFFF);
    let Ok(parent) = process::create("selftest_parent", entry, PriorityClass::Regular) else {
        return false;
    };
    process::set_current(parent);
    let c1 = process::create("selftest_child1", entry, PriorityClass::Regular);
    let c2 = process::create("selftest_child2", entry, PriorityClass::Regular);
    process::set_current(0);
    let (Ok(c1), Ok(c2)) = (c1, c2) else {
        return false;
    };

    let mut ok = process::child_count_of(parent) == Some(2);
    process::exit(parent, 0);
    ok &= process::parent_of(c1) == Some(0);
    ok &= process::parent_of(c2) == Some(0);
    ok &= process::state_of(parent).is_none();

    process::exit(c1, 0);
    process::exit(c2, 0);
    ok
}
