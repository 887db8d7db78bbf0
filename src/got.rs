//! GOT (jtoc) coherency engine.
//!
//! Keeps each worker's local-store mirror of the host global offset table
//! extending outward only: numerics grow downward from the jtoc midpoint,
//! references grow upward. `reload_got` computes the minimal, alignment
//! respecting set of DMAs needed to bring a worker's cached window up to
//! the host's current bounds, grounded directly on the original
//! `reloadJtoc`/`loadTocTables` pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::boot::BootRecord;
use crate::dal::WorkerDevice;
use crate::error::DalError;
use crate::memory_layout::{JTOC_PTR, PROXY_TAG_GROUP, TIB_TABLE, SIZE_STATICS_TABLE};

/// A worker's cached mirror of `[start, end)` host GOT bytes, addressed in
/// host address space. Bounds are the *unaligned* offsets actually
/// requested, not the 16-byte-rounded DMA targets used to move them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GotWindow {
    pub start: u64,
    pub end: u64,
}

/// Per-worker GOT state: this worker's cached window. Whether a reload
/// is owed lives in the pool-wide `all_dirty` flags passed to
/// [`reload_got`], not here — a single worker's own slot in that array
/// is its dirty bit.
pub struct GotState {
    pub window: Mutex<GotWindow>,
}

impl GotState {
    pub fn new(window: GotWindow) -> Self {
        Self {
            window: Mutex::new(window),
        }
    }
}

fn is_4_aligned(addr: u64) -> bool {
    addr & 0x3 == 0
}

fn is_16_aligned(addr: u64) -> bool {
    addr & 0xF == 0
}

fn numeric_ls_addr(jtoc_ptr: u64, addr: u64) -> u32 {
    (JTOC_PTR as i64 + (addr as i64 - jtoc_ptr as i64)) as u32
}

fn reference_ls_addr(jtoc_ptr: u64, addr: u64) -> u32 {
    (JTOC_PTR as i64 + (addr as i64 - jtoc_ptr as i64)) as u32
}

/// Fan out the host-level dirty flag to every worker's dirty flag, then
/// reload this worker's window if its own flag is set. No-op if neither
/// applies, matching `reloadJtoc`'s early-skip.
pub fn reload_got(
    device: &dyn WorkerDevice,
    boot_record: &BootRecord,
    all_dirty: &[AtomicBool],
    worker_idx: usize,
    got: &GotState,
) -> Result<(), DalError> {
    if boot_record.take_jtoc_dirty() {
        for flag in all_dirty {
            flag.store(true, Ordering::Release);
        }
    }

    if !all_dirty[worker_idx].swap(false, Ordering::AcqRel) {
        return Ok(());
    }

    let jtoc_ptr = boot_record.jtoc_ptr();
    let numeric_offset = boot_record.numeric_offset();
    let reference_offset = boot_record.reference_offset();

    boot_record.set_last_cached_numeric_offset(numeric_offset);
    boot_record.set_last_cached_reference_offset(reference_offset);

    let new_start = (jtoc_ptr as i64 + numeric_offset) as u64;
    let new_end = (jtoc_ptr as i64 + reference_offset) as u64;

    let mut window = got.window.lock().unwrap();
    extend_numeric(device, boot_record, jtoc_ptr, new_start, &mut window.start)?;
    extend_reference(device, boot_record, jtoc_ptr, new_end, &mut window.end)?;

    Ok(())
}

fn host_bytes(boot_record: &BootRecord, addr: u64, len: usize) -> Vec<u8> {
    boot_record.got_slice(addr, len)
}

/// Numeric side: extend the cached window downward to cover `new_start`,
/// mirroring `reloadJtoc`'s five-step dance.
fn extend_numeric(
    device: &dyn WorkerDevice,
    boot_record: &BootRecord,
    jtoc_ptr: u64,
    mut new_start: u64,
    old_start: &mut u64,
) -> Result<(), DalError> {
    if new_start >= *old_start {
        return Ok(());
    }
    let target = new_start;

    if !is_4_aligned(new_start) {
        let bytes = host_bytes(boot_record, new_start, 4);
        device.dma_get(
            numeric_ls_addr(jtoc_ptr, new_start),
            new_start,
            &bytes,
            PROXY_TAG_GROUP,
        )?;
        new_start += 4;
    }
    if new_start < *old_start && !is_16_aligned(new_start) {
        let len = if new_start + 4 == *old_start { 4 } else { 8 };
        let bytes = host_bytes(boot_record, new_start, len);
        device.dma_get(
            numeric_ls_addr(jtoc_ptr, new_start),
            new_start,
            &bytes,
            PROXY_TAG_GROUP,
        )?;
        new_start += len as u64;
    }
    if new_start < *old_start && !is_4_aligned(*old_start) {
        *old_start -= 4;
        let bytes = host_bytes(boot_record, *old_start, 4);
        device.dma_get(
            numeric_ls_addr(jtoc_ptr, *old_start),
            *old_start,
            &bytes,
            PROXY_TAG_GROUP,
        )?;
    }
    if new_start < *old_start && !is_16_aligned(*old_start) {
        let len = if new_start + 4 == *old_start { 4 } else { 8 };
        *old_start -= len as u64;
        let bytes = host_bytes(boot_record, *old_start, len);
        device.dma_get(
            numeric_ls_addr(jtoc_ptr, *old_start),
            *old_start,
            &bytes,
            PROXY_TAG_GROUP,
        )?;
    }
    if new_start < *old_start {
        let len = (*old_start - new_start) as usize;
        let bytes = host_bytes(boot_record, new_start, len);
        device.dma_get(
            numeric_ls_addr(jtoc_ptr, new_start),
            new_start,
            &bytes,
            PROXY_TAG_GROUP,
        )?;
    }

    *old_start = target;
    Ok(())
}

/// Reference side: extend the cached window upward to cover `new_end`,
/// symmetric to [`extend_numeric`].
fn extend_reference(
    device: &dyn WorkerDevice,
    boot_record: &BootRecord,
    jtoc_ptr: u64,
    mut new_end: u64,
    old_end: &mut u64,
) -> Result<(), DalError> {
    if new_end <= *old_end {
        return Ok(());
    }
    let target = new_end;

    if !is_4_aligned(new_end) {
        new_end -= 4;
        let bytes = host_bytes(boot_record, new_end, 4);
        device.dma_get(
            reference_ls_addr(jtoc_ptr, new_end),
            new_end,
            &bytes,
            PROXY_TAG_GROUP,
        )?;
    }
    if new_end > *old_end && !is_16_aligned(new_end) {
        let len = if new_end - 4 == *old_end { 4 } else { 8 };
        new_end -= len as u64;
        let bytes = host_bytes(boot_record, new_end, len);
        device.dma_get(
            reference_ls_addr(jtoc_ptr, new_end),
            new_end,
            &bytes,
            PROXY_TAG_GROUP,
        )?;
    }
    if new_end > *old_end && !is_4_aligned(*old_end) {
        let bytes = host_bytes(boot_record, *old_end, 4);
        device.dma_get(
            reference_ls_addr(jtoc_ptr, *old_end),
            *old_end,
            &bytes,
            PROXY_TAG_GROUP,
        )?;
        *old_end += 4;
    }
    if new_end > *old_end && !is_16_aligned(*old_end) {
        let len = if new_end - 4 == *old_end { 4 } else { 8 };
        let bytes = host_bytes(boot_record, *old_end, len);
        device.dma_get(
            reference_ls_addr(jtoc_ptr, *old_end),
            *old_end,
            &bytes,
            PROXY_TAG_GROUP,
        )?;
        *old_end += len as u64;
    }
    if new_end > *old_end {
        let len = (new_end - *old_end) as usize;
        let bytes = host_bytes(boot_record, *old_end, len);
        device.dma_get(
            reference_ls_addr(jtoc_ptr, *old_end),
            *old_end,
            &bytes,
            PROXY_TAG_GROUP,
        )?;
    }

    *old_end = target;
    Ok(())
}

/// Re-DMA the TIB and statics-size tables in full, always run alongside a
/// GOT reload.
pub fn load_toc_tables(device: &dyn WorkerDevice, boot_record: &BootRecord) -> Result<(), DalError> {
    let tibs = boot_record.class_tibs_table();
    device.dma_get(TIB_TABLE, 0, tibs, PROXY_TAG_GROUP)?;
    let statics_size = boot_record.statics_size_table();
    device.dma_get(SIZE_STATICS_TABLE, 0, statics_size, PROXY_TAG_GROUP)?;
    Ok(())
}
