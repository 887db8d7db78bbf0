//! Work Queue & Scheduler.
//!
//! A single LIFO queue of migration-slot indices shared by every
//! support thread, plus the submission helper and the per-worker loop
//! that drains it. Grounded on the original's intrusive `workToDo`
//! linked list and `spu_support_thread` affinity re-queue loop — the
//! slot itself is never copied onto the queue, only its index.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use log::error;

use crate::boot::BootRecord;
use crate::console::Console;
use crate::dal::WorkerDevice;
use crate::error::ProtocolError;
use crate::got::GotState;
use crate::protocol;
use crate::slot::{RetKind, SlotTable};

/// Shared LIFO list of pending migration slot indices.
pub struct WorkQueue {
    queue: Mutex<VecDeque<usize>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Push `slot` to the front of the queue and wake every waiting
    /// support thread.
    fn push_front(&self, slot: usize) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_front(slot);
        self.cond.notify_all();
    }

    /// Re-queue a slot whose affinity didn't match this worker, exactly
    /// where a fresh submission would land.
    pub fn requeue(&self, slot: usize) {
        self.push_front(slot);
    }

    /// Block until a slot is available, or until [`Self::shutdown`] has
    /// been called and the queue has drained. `None` means "stop".
    fn wait_pop(&self) -> Option<usize> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(slot) = queue.pop_front() {
                return Some(slot);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            queue = self.cond.wait(queue).unwrap();
        }
    }

    /// Signal every blocked support thread to wake and exit once the
    /// queue is empty, the cancellation point support threads reach
    /// while waiting on `workCond`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reserve a slot and push it onto the queue; this is the full
/// `submitMigration` operation, combining §4.4's reservation and
/// enqueue steps.
#[allow(clippy::too_many_arguments)]
pub fn submit_migration(
    slots: &SlotTable,
    queue: &WorkQueue,
    ret_type: RetKind,
    proc_affinity: i32,
    method_class_toc_offset: i32,
    method_sub_arch_offset: i32,
    params_start: u64,
    params: Vec<u32>,
) -> Result<usize, ProtocolError> {
    let request = slots.reserve(
        ret_type,
        proc_affinity,
        method_class_toc_offset,
        method_sub_arch_offset,
        params_start,
        params,
    )?;
    queue.push_front(request.slot);
    Ok(request.slot)
}

/// One worker's scheduler loop: pop a slot, execute it if its affinity
/// matches this worker, otherwise re-queue unchanged. Runs until
/// [`WorkQueue::shutdown`] drains the queue empty.
#[allow(clippy::too_many_arguments)]
pub fn support_thread_loop(
    worker_idx: usize,
    device: &dyn WorkerDevice,
    queue: &WorkQueue,
    slots: &SlotTable,
    boot_record: &BootRecord,
    all_dirty: &[AtomicBool],
    got: &GotState,
    console: &dyn Console,
    fake_trap_lock: &parking_lot::Mutex<()>,
) {
    while let Some(slot) = queue.wait_pop() {
        let request = slots.request(slot);
        if request.proc_affinity == -1 || request.proc_affinity == worker_idx as i32 {
            if let Err(err) = protocol::run_migration(
                device,
                boot_record,
                all_dirty,
                worker_idx,
                got,
                slots,
                &request,
                console,
                fake_trap_lock,
            ) {
                error!("worker {worker_idx} migration in slot {slot} failed: {err}");
            }
        } else {
            queue.requeue(slot);
        }
    }
}
