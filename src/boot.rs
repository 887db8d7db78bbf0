//! Boot Coordinator.
//!
//! Brings a set of raw device handles up to identified, runtime-loaded
//! workers: context construction, the identity handshake (phys-id
//! resolution + reorder), the runtime image DMA batch, and the
//! VM-started handshake. Grounded on the original's `spuCtrlFunc` phase
//! sequence (`startSpuThreads` → `waitForSpus` → `loadRuntimeOnSpus` →
//! `waitForRuntime`).
//!
//! The process-wide pool lifecycle and support-thread spawn (phases 7-8
//! of the original spec) live in [`crate::worker`], which calls the
//! phase functions here in order.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use log::{info, warn};

use crate::codes::RUNTIME_COPY_COMPLETE;
use crate::dal::{InboxMode, WorkerDevice};
use crate::error::BootError;
use crate::got::{GotState, GotWindow};
use crate::memory_layout::{
    ceil16, floor16, CODE_ENTRYPOINT, CODE_ENTRYPOINT_END, JTOC_PTR, PROXY_TAG_GROUP,
    RUNTIME_CODE_START, SIZE_STATICS_TABLE, TIB_TABLE,
};

/// Host-side record describing the memory regions the core DMAs onto
/// every worker. Supplied by the embedding VM; the core only ever writes
/// the fields documented below as core-owned.
pub struct BootRecord {
    got_base: u64,
    middle_offset: i64,
    got: Mutex<Vec<u8>>,
    numeric_offset: AtomicI64,
    reference_offset: AtomicI64,
    /// Core-owned: last offsets actually mirrored to every worker.
    last_cached_numeric_offset: AtomicI64,
    last_cached_reference_offset: AtomicI64,
    /// Set by the VM, cleared by the core on pickup.
    jtoc_dirty: AtomicBool,
    ool_runtime_code: Vec<u8>,
    runtime_entry_method: Vec<u8>,
    class_tibs_table: Vec<u8>,
    statics_size_table: Vec<u8>,
    fake_trap_strs: Vec<String>,
    /// Core-owned.
    no_sub_arch_procs: AtomicUsize,
    /// Core-owned.
    boot_complete: AtomicBool,
}

impl BootRecord {
    pub fn jtoc_ptr(&self) -> u64 {
        (self.got_base as i64 + self.middle_offset) as u64
    }

    pub fn numeric_offset(&self) -> i64 {
        self.numeric_offset.load(Ordering::Acquire)
    }

    pub fn reference_offset(&self) -> i64 {
        self.reference_offset.load(Ordering::Acquire)
    }

    /// VM-side write: record a new current numeric offset.
    pub fn set_numeric_offset(&self, value: i64) {
        self.numeric_offset.store(value, Ordering::Release);
    }

    /// VM-side write: record a new current reference offset.
    pub fn set_reference_offset(&self, value: i64) {
        self.reference_offset.store(value, Ordering::Release);
    }

    /// Core-side write, recorded once a reload has mirrored up to these
    /// offsets.
    pub fn set_last_cached_numeric_offset(&self, value: i64) {
        self.last_cached_numeric_offset.store(value, Ordering::Release);
    }

    pub fn set_last_cached_reference_offset(&self, value: i64) {
        self.last_cached_reference_offset.store(value, Ordering::Release);
    }

    /// VM-side write: mark the GOT dirty, to be picked up by the next
    /// `reloadGot` call on any worker.
    pub fn mark_jtoc_dirty(&self) {
        self.jtoc_dirty.store(true, Ordering::Release);
    }

    /// Core-side: atomically read-and-clear the dirty flag.
    pub fn take_jtoc_dirty(&self) -> bool {
        self.jtoc_dirty.swap(false, Ordering::AcqRel)
    }

    /// Copy of `len` host GOT bytes starting at host address `addr`.
    pub fn got_slice(&self, addr: u64, len: usize) -> Vec<u8> {
        let start = (addr - self.got_base) as usize;
        self.got.lock().unwrap()[start..start + len].to_vec()
    }

    pub fn ool_runtime_code(&self) -> &[u8] {
        &self.ool_runtime_code
    }

    pub fn runtime_entry_method(&self) -> &[u8] {
        &self.runtime_entry_method
    }

    pub fn class_tibs_table(&self) -> &[u8] {
        &self.class_tibs_table
    }

    pub fn statics_size_table(&self) -> &[u8] {
        &self.statics_size_table
    }

    pub fn fake_trap_str(&self, index: usize) -> Option<&str> {
        self.fake_trap_strs.get(index).map(String::as_str)
    }

    pub fn set_no_sub_arch_procs(&self, n: usize) {
        self.no_sub_arch_procs.store(n, Ordering::Release);
    }

    pub fn no_sub_arch_procs(&self) -> usize {
        self.no_sub_arch_procs.load(Ordering::Acquire)
    }

    pub fn mark_boot_complete(&self) {
        self.boot_complete.store(true, Ordering::Release);
    }

    pub fn is_boot_complete(&self) -> bool {
        self.boot_complete.load(Ordering::Acquire)
    }
}

pub struct BootRecordBuilder {
    got_base: u64,
    middle_offset: i64,
    got: Vec<u8>,
    ool_runtime_code: Vec<u8>,
    runtime_entry_method: Vec<u8>,
    class_tibs_table: Vec<u8>,
    statics_size_table: Vec<u8>,
    fake_trap_strs: Vec<String>,
}

impl BootRecordBuilder {
    /// A generously sized zeroed GOT buffer is allocated by default so
    /// tests can address it without separately sizing it; embedders with
    /// a real host GOT should use [`Self::with_got`].
    pub fn new(got_base: u64, middle_offset: i64) -> Self {
        Self {
            got_base,
            middle_offset,
            got: vec![0u8; 0x40000],
            ool_runtime_code: Vec::new(),
            runtime_entry_method: Vec::new(),
            class_tibs_table: vec![0u8; crate::memory_layout::TIB_TABLE_LENGTH as usize],
            statics_size_table: vec![0u8; crate::memory_layout::SIZE_STATICS_TABLE_LENGTH as usize],
            fake_trap_strs: Vec::new(),
        }
    }

    pub fn with_got(mut self, bytes: Vec<u8>) -> Self {
        self.got = bytes;
        self
    }

    pub fn with_ool_runtime_code(mut self, bytes: Vec<u8>) -> Self {
        self.ool_runtime_code = bytes;
        self
    }

    pub fn with_runtime_entry_method(mut self, bytes: Vec<u8>) -> Self {
        self.runtime_entry_method = bytes;
        self
    }

    pub fn with_class_tibs_table(mut self, bytes: Vec<u8>) -> Self {
        self.class_tibs_table = bytes;
        self
    }

    pub fn with_statics_size_table(mut self, bytes: Vec<u8>) -> Self {
        self.statics_size_table = bytes;
        self
    }

    pub fn with_fake_trap_strs(mut self, strs: Vec<String>) -> Self {
        self.fake_trap_strs = strs;
        self
    }

    pub fn build(self) -> BootRecord {
        BootRecord {
            got_base: self.got_base,
            middle_offset: self.middle_offset,
            got: Mutex::new(self.got),
            numeric_offset: AtomicI64::new(0),
            reference_offset: AtomicI64::new(0),
            last_cached_numeric_offset: AtomicI64::new(0),
            last_cached_reference_offset: AtomicI64::new(0),
            jtoc_dirty: AtomicBool::new(false),
            ool_runtime_code: self.ool_runtime_code,
            runtime_entry_method: self.runtime_entry_method,
            class_tibs_table: self.class_tibs_table,
            statics_size_table: self.statics_size_table,
            fake_trap_strs: self.fake_trap_strs,
            no_sub_arch_procs: AtomicUsize::new(0),
            boot_complete: AtomicBool::new(false),
        }
    }
}

/// Resolves an auxiliary processor's `speId` (plus gang and host pid) to
/// its kernel-assigned physical id. The real implementation reads a
/// `/spu/...` sysfs path; tests substitute a fixed mapping.
pub trait PhysIdResolver: Send + Sync {
    fn resolve(&self, spe_id: u64, gang: u64, pid: u32) -> i32;
}

/// Reads `/spu/gang-<pid>-<gang>/spethread-<pid>-<speId>/phys-id`,
/// mirroring the original `getPhysID`. Returns `-1` if the path is
/// absent or unreadable.
pub struct FilesystemPhysIdResolver;

impl PhysIdResolver for FilesystemPhysIdResolver {
    fn resolve(&self, spe_id: u64, gang: u64, pid: u32) -> i32 {
        let path = format!("/spu/gang-{pid}-{gang}/spethread-{pid}-{spe_id}/phys-id");
        match fs::read_to_string(&path) {
            Ok(contents) => contents
                .lines()
                .next()
                .and_then(|line| {
                    let trimmed = line.trim();
                    if let Some(hex) = trimmed.strip_prefix("0x") {
                        i32::from_str_radix(hex, 16).ok()
                    } else {
                        trimmed.parse().ok()
                    }
                })
                .unwrap_or(-1),
            Err(_) => -1,
        }
    }
}

/// Assigns physical ids by the order workers are handshaked, for tests
/// and the in-process simulator where there is no real sysfs.
pub struct StaticPhysIdResolver {
    ids: Vec<i32>,
}

impl StaticPhysIdResolver {
    pub fn new(ids: Vec<i32>) -> Self {
        Self { ids }
    }
}

impl PhysIdResolver for StaticPhysIdResolver {
    fn resolve(&self, spe_id: u64, _gang: u64, _pid: u32) -> i32 {
        self.ids.get(spe_id as usize).copied().unwrap_or(-1)
    }
}

/// Phase 1 (construction) is device-creation, which belongs to whatever
/// concrete `WorkerDevice` an embedder builds; this core only drives the
/// sequence from "bootloader image already loaded" onward.
pub fn bootstrap_context(
    device: &dyn WorkerDevice,
    image: &[u8],
    worker_idx: usize,
) -> Result<(), BootError> {
    let _ = worker_idx;
    device.program_load(image).map_err(BootError::Dal)?;
    device.event_handler_create().map_err(BootError::Dal)?;
    Ok(())
}

/// Phase 2: identity handshake. Blocks on the interrupt mailbox for the
/// worker's 64-bit `speId`, resolves it to a physical id, and writes that
/// id back so the bootloader can identify itself in later diagnostics.
pub fn identity_handshake(
    device: &dyn WorkerDevice,
    worker_idx: usize,
    resolver: &dyn PhysIdResolver,
    gang: u64,
    pid: u32,
) -> Result<i32, BootError> {
    let mut words = [0u32; 2];
    device
        .intr_outbox_read(&mut words)
        .map_err(BootError::Dal)?;
    let spe_id = ((words[0] as u64) << 32) | words[1] as u64;
    let phys_id = resolver.resolve(spe_id, gang, pid);
    if phys_id < 0 {
        return Err(BootError::PhysIdUnavailable { worker: worker_idx });
    }
    device
        .inbox_write(&[phys_id as u32], InboxMode::AllBlocking)
        .map_err(BootError::Dal)?;
    Ok(phys_id)
}

/// Phase 3: sort worker indices ascending by physical id. Required
/// because every later lookup addresses workers by index.
pub fn stable_reorder(phys_ids: &[i32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..phys_ids.len()).collect();
    order.sort_by_key(|&i| phys_ids[i]);
    order
}

/// Phase 4: DMA the runtime image (out-of-line code, entry method, GOT
/// active window, class tables) onto one worker's local store. Returns
/// the window this worker now has cached.
pub fn load_runtime_image(
    device: &dyn WorkerDevice,
    boot_record: &BootRecord,
    worker_idx: usize,
) -> Result<GotWindow, BootError> {
    let code = boot_record.ool_runtime_code();
    let code_end = RUNTIME_CODE_START + code.len() as u32;
    if code_end >= CODE_ENTRYPOINT {
        return Err(BootError::RuntimeCodeTooLong {
            worker: worker_idx,
            end: code_end,
            limit: CODE_ENTRYPOINT,
        });
    }
    device
        .dma_get(RUNTIME_CODE_START, 0, code, PROXY_TAG_GROUP)
        .map_err(BootError::Dal)?;

    let entry = boot_record.runtime_entry_method();
    let entry_end = CODE_ENTRYPOINT + entry.len() as u32;
    if entry_end >= CODE_ENTRYPOINT_END {
        return Err(BootError::RuntimeEntryTooLong {
            worker: worker_idx,
            end: entry_end,
            limit: CODE_ENTRYPOINT_END,
        });
    }
    device
        .dma_get(CODE_ENTRYPOINT, 0, entry, PROXY_TAG_GROUP)
        .map_err(BootError::Dal)?;

    let jtoc_ptr = boot_record.jtoc_ptr();
    let numeric_offset = boot_record.numeric_offset();
    let reference_offset = boot_record.reference_offset();
    boot_record.set_last_cached_numeric_offset(numeric_offset);
    boot_record.set_last_cached_reference_offset(reference_offset);
    boot_record.take_jtoc_dirty();

    let new_start = (jtoc_ptr as i64 + numeric_offset) as u64;
    let new_end = (jtoc_ptr as i64 + reference_offset) as u64;
    let jtoc_start = floor16(new_start);
    let jtoc_end = ceil16(new_end);
    let length = (jtoc_end - jtoc_start) as usize;

    let target = floor16((JTOC_PTR as i64 + numeric_offset) as u64) as u32;
    let bytes = boot_record.got_slice(jtoc_start, length);
    device
        .dma_get(target, jtoc_start, &bytes, PROXY_TAG_GROUP)
        .map_err(BootError::Dal)?;

    device
        .dma_get(TIB_TABLE, 0, boot_record.class_tibs_table(), PROXY_TAG_GROUP)
        .map_err(BootError::Dal)?;
    device
        .dma_get(
            SIZE_STATICS_TABLE,
            0,
            boot_record.statics_size_table(),
            PROXY_TAG_GROUP,
        )
        .map_err(BootError::Dal)?;

    Ok(GotWindow {
        start: new_start,
        end: new_end,
    })
}

/// Phase 5: fence the image-load DMAs, then release the bootloader so it
/// jumps to `CODE_ENTRYPOINT`.
pub fn fence_and_release(device: &dyn WorkerDevice, worker_idx: usize) -> Result<(), BootError> {
    let _ = worker_idx;
    device.dma_wait(PROXY_TAG_GROUP).map_err(BootError::Dal)?;
    device
        .inbox_write(&[RUNTIME_COPY_COMPLETE], InboxMode::AnyNonBlocking)
        .map_err(BootError::Dal)?;
    Ok(())
}

/// Phase 6: block for the guest runtime's started signal and validate it
/// against this worker's resolved physical id.
pub fn await_vm_started(
    device: &dyn WorkerDevice,
    worker_idx: usize,
    phys_id: i32,
) -> Result<(), BootError> {
    use crate::codes::JAVA_VM_STARTED;

    let mut words = [0u32; 2];
    device
        .intr_outbox_read(&mut words)
        .map_err(BootError::Dal)?;
    if words[0] == JAVA_VM_STARTED && words[1] == phys_id as u32 {
        Ok(())
    } else {
        Err(BootError::VmStartMismatch {
            worker: worker_idx,
            expected_phys_id: phys_id,
            got_0: words[0],
            got_1: words[1],
        })
    }
}

/// Aggregate bring-up for one worker, phases 2 through 6, used by
/// [`crate::worker::WorkerPool::boot`] once contexts already exist.
pub struct BroughtUpWorker {
    pub phys_id: i32,
    pub got: GotState,
}

pub fn bring_up_worker(
    device: &dyn WorkerDevice,
    boot_record: &BootRecord,
    worker_idx: usize,
    resolver: &dyn PhysIdResolver,
    gang: u64,
    pid: u32,
) -> Result<BroughtUpWorker, BootError> {
    let phys_id = identity_handshake(device, worker_idx, resolver, gang, pid)?;
    let window = load_runtime_image(device, boot_record, worker_idx)?;
    fence_and_release(device, worker_idx)?;
    await_vm_started(device, worker_idx, phys_id)?;
    info!("worker {worker_idx} (phys id {phys_id}) transitioned to guest runtime");
    Ok(BroughtUpWorker {
        phys_id,
        got: GotState::new(window),
    })
}

pub fn warn_worker_count_clipped(requested: usize, usable: usize) {
    if requested > usable {
        warn!("only {usable} auxiliary processors available, requested {requested}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::sim::sim_pair;

    #[test]
    fn stable_reorder_sorts_ascending_by_phys_id() {
        let order = stable_reorder(&[5, 1, 3]);
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn identity_handshake_resolves_and_writes_back_phys_id() {
        let (host, guest) = sim_pair();
        let t = std::thread::spawn(move || {
            guest.send_intr(&[0, 7]);
            guest.recv_inbox(1)
        });
        let resolver = StaticPhysIdResolver::new(vec![3]);
        let phys_id = identity_handshake(&host, 0, &resolver, 1, 100).unwrap();
        assert_eq!(phys_id, 3);
        assert_eq!(t.join().unwrap(), vec![3]);
    }

    #[test]
    fn identity_handshake_fails_on_unresolvable_phys_id() {
        let (host, guest) = sim_pair();
        let t = std::thread::spawn(move || guest.send_intr(&[0, 9]));
        let resolver = StaticPhysIdResolver::new(vec![]);
        let err = identity_handshake(&host, 0, &resolver, 1, 100).unwrap_err();
        assert!(matches!(err, BootError::PhysIdUnavailable { worker: 0 }));
        t.join().unwrap();
    }

    #[test]
    fn load_runtime_image_rejects_oversized_ool_code() {
        let (host, _guest) = sim_pair();
        let boot_record = BootRecordBuilder::new(0, 0)
            .with_ool_runtime_code(vec![0u8; CODE_ENTRYPOINT as usize + 10])
            .build();
        let err = load_runtime_image(&host, &boot_record, 0).unwrap_err();
        assert!(matches!(err, BootError::RuntimeCodeTooLong { worker: 0, .. }));
    }

    #[test]
    fn load_runtime_image_lands_entry_method_bytes() {
        let (host, _guest) = sim_pair();
        let entry = vec![0xAB; 32];
        let boot_record = BootRecordBuilder::new(0, 0)
            .with_runtime_entry_method(entry.clone())
            .build();
        load_runtime_image(&host, &boot_record, 0).unwrap();
        assert_eq!(host.peek_local_store(CODE_ENTRYPOINT, 32), entry);
    }

    #[test]
    fn await_vm_started_mismatch_is_fatal() {
        let (host, guest) = sim_pair();
        let t = std::thread::spawn(move || guest.send_intr(&[0xFFFF, 0xFFFF]));
        let err = await_vm_started(&host, 0, 3).unwrap_err();
        assert!(matches!(err, BootError::VmStartMismatch { worker: 0, .. }));
        t.join().unwrap();
    }
}
