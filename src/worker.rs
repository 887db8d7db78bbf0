//! Worker Pool.
//!
//! Owns the process-wide lifecycle every other module assumes exists
//! exactly once per embedding VM: one boot thread and one support thread
//! per auxiliary processor, the shared slot table and work queue, and
//! the per-worker GOT state plus the dirty-flag fan-out array threaded
//! through every [`crate::got::reload_got`] call. Grounded on the
//! original's `spuCtrlFunc`/`initSPUs`/`spu_support_thread` trio and the
//! gang-wide teardown in `DestroySPUs`.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         embedding VM / JIT                        │
//! └───────────────────────────────────────────────────────────────────┘
//!                                 │ syscall facade
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          WorkerPool                                │
//! │  ┌──────────┐  ┌────────────┐  ┌───────────┐  ┌────────────────┐  │
//! │  │ boot::*  │  │ SlotTable  │  │ WorkQueue │  │ per-worker GOT  │  │
//! │  └──────────┘  └────────────┘  └───────────┘  └────────────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//!                                 │ one boot + support thread each
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    WorkerDevice (real hw / SimWorker)              │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use lazy_static::lazy_static;
use log::info;

use crate::boot::{self, BootRecord, BroughtUpWorker, PhysIdResolver};
use crate::config::AuxConfig;
use crate::console::Console;
use crate::dal::WorkerDevice;
use crate::error::{AuxError, BootError};
use crate::got::GotState;
use crate::memory_layout::CODE_ENTRYPOINT;
use crate::slot::{RetKind, SlotTable};
use crate::syscall;
use crate::workqueue::{self, WorkQueue};

/// One brought-up auxiliary processor: its device handle, resolved
/// physical id, and cached GOT window. Indexed by position in
/// [`WorkerPool::workers`], which is the phys-id-sorted order, not the
/// order devices were handed to [`WorkerPool::boot`].
pub struct WorkerDescriptor {
    pub device: Arc<dyn WorkerDevice>,
    pub phys_id: i32,
    pub got: GotState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Init,
    Running,
    ShuttingDown,
    Joined,
}

/// Process-wide control structure for a booted set of auxiliary
/// processors. Construct via [`WorkerPool::boot`]; everything downstream
/// (migrations, status polls, shutdown) goes through this handle.
pub struct WorkerPool {
    workers: Vec<WorkerDescriptor>,
    all_dirty: Vec<AtomicBool>,
    slots: SlotTable,
    queue: Arc<WorkQueue>,
    boot_record: Arc<BootRecord>,
    console: Arc<dyn Console>,
    fake_trap_lock: Arc<parking_lot::Mutex<()>>,
    boot_threads: Mutex<Vec<JoinHandle<()>>>,
    support_threads: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    /// Phases 1-8: bring every device up to the guest runtime, reorder by
    /// physical id, then spawn one support thread per worker. Each
    /// device's phases 1-6 run concurrently on its own boot thread,
    /// mirroring the original's one-thread-per-SPU bring-up.
    #[allow(clippy::too_many_arguments)]
    pub fn boot(
        config: &AuxConfig,
        devices: Vec<Arc<dyn WorkerDevice>>,
        image: &[u8],
        boot_record: Arc<BootRecord>,
        resolver: Arc<dyn PhysIdResolver>,
        gang: u64,
        pid: u32,
        console: Arc<dyn Console>,
    ) -> Result<Arc<WorkerPool>, AuxError> {
        let usable = devices.len();
        let n = config.resolve_worker_count(usable);
        if let Some(requested) = config.requested_workers {
            boot::warn_worker_count_clipped(requested, usable.min(config.max_workers));
        }
        let devices: Vec<_> = devices.into_iter().take(n).collect();
        if devices.is_empty() {
            return Err(BootError::NoUsableWorkers.into());
        }

        let mut handles: Vec<JoinHandle<Result<BroughtUpWorker, BootError>>> =
            Vec::with_capacity(devices.len());
        for (idx, device) in devices.iter().cloned().enumerate() {
            let boot_record = boot_record.clone();
            let resolver = resolver.clone();
            let image = image.to_vec();
            handles.push(std::thread::spawn(move || {
                boot::bootstrap_context(device.as_ref(), &image, idx)?;
                boot::bring_up_worker(device.as_ref(), &boot_record, idx, resolver.as_ref(), gang, pid)
            }));
        }

        let mut brought_up: Vec<Option<BroughtUpWorker>> = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = handle.join().expect("boot thread panicked");
            brought_up.push(Some(result?));
        }

        let phys_ids: Vec<i32> = brought_up
            .iter()
            .map(|b| b.as_ref().unwrap().phys_id)
            .collect();
        let order = boot::stable_reorder(&phys_ids);

        let mut workers = Vec::with_capacity(order.len());
        for &orig_idx in &order {
            let brought = brought_up[orig_idx].take().expect("each boot index visited once");
            workers.push(WorkerDescriptor {
                device: devices[orig_idx].clone(),
                phys_id: brought.phys_id,
                got: brought.got,
            });
        }

        boot_record.set_no_sub_arch_procs(workers.len());
        boot_record.mark_boot_complete();

        let all_dirty = (0..workers.len()).map(|_| AtomicBool::new(false)).collect();

        let pool = Arc::new(WorkerPool {
            workers,
            all_dirty,
            slots: SlotTable::new(config.max_migrations),
            queue: Arc::new(WorkQueue::new()),
            boot_record,
            console,
            fake_trap_lock: Arc::new(parking_lot::Mutex::new(())),
            boot_threads: Mutex::new(Vec::new()),
            support_threads: Mutex::new(Vec::new()),
            state: Mutex::new(PoolState::Init),
        });

        *pool.boot_threads.lock().unwrap() = spawn_boot_threads(&pool);
        let threads = spawn_support_threads(&pool);
        *pool.support_threads.lock().unwrap() = threads;
        *pool.state.lock().unwrap() = PoolState::Running;
        info!("worker pool booted with {} auxiliary processors", pool.workers.len());

        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn worker(&self, worker_idx: usize) -> Result<&WorkerDescriptor, AuxError> {
        self.workers
            .get(worker_idx)
            .ok_or(AuxError::InvalidWorker(worker_idx))
    }

    pub fn bind_processor(&self, worker_idx: usize, proc_obj: u32) -> Result<(), AuxError> {
        let worker = self.worker(worker_idx)?;
        syscall::bind_processor(worker.device.as_ref(), proc_obj).map_err(AuxError::from)
    }

    /// Submit a migration for whichever support thread picks it up next.
    #[allow(clippy::too_many_arguments)]
    pub fn migrate_to_sub_arch(
        &self,
        ret_type: RetKind,
        proc_affinity: i32,
        method_class_toc_offset: i32,
        method_sub_arch_offset: i32,
        params_start: u64,
        params: Vec<u32>,
    ) -> Result<usize, AuxError> {
        syscall::migrate_to_sub_arch(
            &self.slots,
            &self.queue,
            ret_type,
            proc_affinity,
            method_class_toc_offset,
            method_sub_arch_offset,
            params_start,
            params,
        )
        .map_err(AuxError::from)
    }

    pub fn check_status(&self, status: &mut [i32]) {
        syscall::check_status(&self.slots, status);
    }

    pub fn get_int_return(&self, slot: usize) -> Result<i32, AuxError> {
        syscall::get_int_return(&self.slots, slot).map_err(AuxError::from)
    }

    pub fn get_float_return(&self, slot: usize) -> Result<f32, AuxError> {
        syscall::get_float_return(&self.slots, slot).map_err(AuxError::from)
    }

    pub fn get_long_return(&self, slot: usize) -> Result<i64, AuxError> {
        syscall::get_long_return(&self.slots, slot).map_err(AuxError::from)
    }

    pub fn get_double_return(&self, slot: usize) -> Result<f64, AuxError> {
        syscall::get_double_return(&self.slots, slot).map_err(AuxError::from)
    }

    pub fn get_ref_return(&self, slot: usize) -> Result<u32, AuxError> {
        syscall::get_ref_return(&self.slots, slot).map_err(AuxError::from)
    }

    /// Phase 7-8 teardown: stop handing out new work, wake every support
    /// thread so it drains and exits, then release each worker's event
    /// handler and context. Idempotent — a second call is a no-op.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != PoolState::Running {
                return;
            }
            *state = PoolState::ShuttingDown;
        }

        self.queue.shutdown();
        for thread in self.support_threads.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
        for worker in &self.workers {
            worker.device.event_handler_destroy();
            worker.device.context_destroy();
        }
        // context_destroy above is what unblocks a real backend's
        // context_run; the simulator returns from it immediately.
        for thread in self.boot_threads.lock().unwrap().drain(..) {
            let _ = thread.join();
        }

        *self.state.lock().unwrap() = PoolState::Joined;
        info!("worker pool shut down, {} workers released", self.workers.len());
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock().unwrap() == PoolState::Running
    }
}

/// One thread per worker that blocks for the worker's entire lifetime in
/// `context_run`, mirroring the original's `spuCtrlFunc` boot thread:
/// on real hardware this only returns once `context_destroy` tears the
/// context down during [`WorkerPool::shutdown`].
fn spawn_boot_threads(pool: &Arc<WorkerPool>) -> Vec<JoinHandle<()>> {
    (0..pool.workers.len())
        .map(|idx| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                if let Err(err) = pool.workers[idx].device.context_run(CODE_ENTRYPOINT) {
                    log::error!("worker {idx} context_run exited with error: {err}");
                }
            })
        })
        .collect()
}

fn spawn_support_threads(pool: &Arc<WorkerPool>) -> Vec<JoinHandle<()>> {
    (0..pool.workers.len())
        .map(|idx| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let worker = &pool.workers[idx];
                workqueue::support_thread_loop(
                    idx,
                    worker.device.as_ref(),
                    &pool.queue,
                    &pool.slots,
                    &pool.boot_record,
                    &pool.all_dirty,
                    &worker.got,
                    pool.console.as_ref(),
                    &pool.fake_trap_lock,
                );
            })
        })
        .collect()
}

lazy_static! {
    static ref GLOBAL_POOL: Mutex<Option<Arc<WorkerPool>>> = Mutex::new(None);
}

/// Install the process-wide pool every syscall-facade caller reaches for
/// via [`global_pool`]. Embedders call this once, right after
/// [`WorkerPool::boot`] succeeds.
pub fn install_global(pool: Arc<WorkerPool>) {
    *GLOBAL_POOL.lock().unwrap() = Some(pool);
}

/// Fetch the installed pool, or [`AuxError::PoolNotInitialized`] if
/// [`install_global`] has not run yet.
pub fn global_pool() -> Result<Arc<WorkerPool>, AuxError> {
    GLOBAL_POOL
        .lock()
        .unwrap()
        .clone()
        .ok_or(AuxError::PoolNotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{BootRecordBuilder, StaticPhysIdResolver};
    use crate::codes;
    use crate::console::RecordingConsole;
    use crate::dal::sim::sim_pair;

    fn default_config() -> AuxConfig {
        let mut cfg = AuxConfig::default();
        cfg.max_migrations = 4;
        cfg
    }

    #[test]
    fn boot_sorts_workers_ascending_by_phys_id() {
        let (host_a, guest_a) = sim_pair();
        let (host_b, guest_b) = sim_pair();

        // Device A reports speId 0 -> phys id 5; device B reports speId 1
        // -> phys id 3, so the pool must land device B first.
        let ta = std::thread::spawn(move || {
            guest_a.send_intr(&[0, 0]);
            let phys = guest_a.recv_inbox(1)[0];
            guest_a.send_intr(&[codes::JAVA_VM_STARTED, phys]);
        });
        let tb = std::thread::spawn(move || {
            guest_b.send_intr(&[0, 1]);
            let phys = guest_b.recv_inbox(1)[0];
            guest_b.send_intr(&[codes::JAVA_VM_STARTED, phys]);
        });

        let devices: Vec<Arc<dyn WorkerDevice>> = vec![Arc::new(host_a), Arc::new(host_b)];
        let resolver: Arc<dyn PhysIdResolver> = Arc::new(StaticPhysIdResolver::new(vec![5, 3]));
        let boot_record = Arc::new(BootRecordBuilder::new(0, 0).build());
        let console: Arc<dyn Console> = Arc::new(RecordingConsole::new());

        let pool = WorkerPool::boot(
            &default_config(),
            devices,
            &[],
            boot_record,
            resolver,
            1,
            100,
            console,
        )
        .unwrap();

        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.workers[0].phys_id, 3);
        assert_eq!(pool.workers[1].phys_id, 5);
        assert!(pool.boot_record.is_boot_complete());
        assert_eq!(pool.boot_record.no_sub_arch_procs(), 2);

        ta.join().unwrap();
        tb.join().unwrap();
        pool.shutdown();
    }

    #[test]
    fn bind_processor_rejects_out_of_range_worker_index() {
        let (host, guest) = sim_pair();
        let t = std::thread::spawn(move || {
            guest.send_intr(&[0, 0]);
            let phys = guest.recv_inbox(1)[0];
            guest.send_intr(&[codes::JAVA_VM_STARTED, phys]);
        });

        let devices: Vec<Arc<dyn WorkerDevice>> = vec![Arc::new(host)];
        let resolver: Arc<dyn PhysIdResolver> = Arc::new(StaticPhysIdResolver::new(vec![1]));
        let boot_record = Arc::new(BootRecordBuilder::new(0, 0).build());
        let console: Arc<dyn Console> = Arc::new(RecordingConsole::new());
        let pool = WorkerPool::boot(
            &default_config(),
            devices,
            &[],
            boot_record,
            resolver,
            1,
            100,
            console,
        )
        .unwrap();
        t.join().unwrap();

        let err = pool.bind_processor(5, 0xAB).unwrap_err();
        assert!(matches!(err, AuxError::InvalidWorker(5)));
        pool.shutdown();
    }

    #[test]
    fn migrate_runs_end_to_end_and_shutdown_drains_support_threads() {
        let (host, guest) = sim_pair();
        let boot_thread = std::thread::spawn(move || {
            guest.send_intr(&[0, 0]);
            let phys = guest.recv_inbox(1)[0];
            guest.send_intr(&[codes::JAVA_VM_STARTED, phys]);
            guest
        });

        let devices: Vec<Arc<dyn WorkerDevice>> = vec![Arc::new(host)];
        let resolver: Arc<dyn PhysIdResolver> = Arc::new(StaticPhysIdResolver::new(vec![1]));
        let boot_record = Arc::new(BootRecordBuilder::new(0, 0).build());
        let console: Arc<dyn Console> = Arc::new(RecordingConsole::new());
        let pool = WorkerPool::boot(
            &default_config(),
            devices,
            &[],
            boot_record,
            resolver,
            1,
            100,
            console,
        )
        .unwrap();
        let guest = boot_thread.join().unwrap();

        let slot = pool
            .migrate_to_sub_arch(RetKind::Void, -1, 0x10, 0x20, 0, vec![])
            .unwrap();

        let migration_thread = std::thread::spawn(move || {
            guest.recv_inbox(3);
            guest.send_intr(&[codes::ACK]);
            guest.recv_inbox(1);
            guest.send_intr(&[codes::ACK]);
            guest.send_intr(&[codes::RETURN_VALUE_V]);
        });
        migration_thread.join().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(30));
        let mut status = [slot as i32];
        pool.check_status(&mut status);
        assert_eq!(status[0], slot as i32 | crate::codes::SUBARCH_READY_BIT);

        pool.shutdown();
        assert!(!pool.is_running());
    }
}
