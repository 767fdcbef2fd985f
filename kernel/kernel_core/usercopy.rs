//! Safe access to user-supplied buffers.
//!
//! System calls receive raw user pointers. Nothing here dereferences one:
//! each page is translated through the current address space first, and the
//! bytes are moved through the physical window. An unmapped page anywhere in
//! the range fails the whole operation before any byte is touched.

use mm::{VirtAddr, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCopyError {
    /// Some page of the range is not mapped in the current address space.
    Unmapped,
    /// The range wraps the end of the address space.
    BadRange,
}

/// Check that every page of `[virt, virt + len)` is mapped in the current
/// directory.
pub fn validate_user_range(virt: VirtAddr, len: usize) -> Result<(), UserCopyError> {
    if len == 0 {
        return Ok(());
    }
    let start = virt.as_u32();
    let end = start
        .checked_add(len as u32 - 1)
        .ok_or(UserCopyError::BadRange)?;

    let mut page = VirtAddr::new(start).align_down().as_u32();
    loop {
        if mm::page_table::translate(VirtAddr::new(page)).is_none() {
            return Err(UserCopyError::Unmapped);
        }
        match page.checked_add(PAGE_SIZE as u32) {
            Some(next) if next <= end => page = next,
            _ => break,
        }
    }
    Ok(())
}

/// Stream the user bytes at `[virt, virt + len)` to `f` in page-bounded
/// chunks, after validating the entire range.
pub fn for_each_user_chunk(
    virt: VirtAddr,
    len: usize,
    mut f: impl FnMut(&[u8]),
) -> Result<(), UserCopyError> {
    validate_user_range(virt, len)?;
    let window = mm::page_table::phys_window().ok_or(UserCopyError::Unmapped)?;

    let mut remaining = len;
    let mut cursor = virt.as_u32();
    let mut chunk = [0u8; 256];
    while remaining > 0 {
        // Stay within one page and one chunk buffer per step.
        let page_left = PAGE_SIZE - (cursor as usize & (PAGE_SIZE - 1));
        let step = remaining.min(page_left).min(chunk.len());

        let phys = mm::page_table::translate(VirtAddr::new(cursor))
            .ok_or(UserCopyError::Unmapped)?;
        unsafe { window.read_bytes(phys, &mut chunk[..step]) };
        f(&chunk[..step]);

        cursor = cursor.wrapping_add(step as u32);
        remaining -= step;
    }
    Ok(())
}
