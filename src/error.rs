//! Error taxonomy for the auxiliary-processor control core.
//!
//! Every fallible entry point returns `Result<T, AuxError>`. Variants carry
//! enough context (worker index, mailbox code) to reproduce the original
//! tool's diagnostic text; only the demonstration binary decides what to do
//! with a fatal error (log + exit 1), never the library itself.

use thiserror::Error;

use crate::slot::RetKind;

pub type AuxResult<T> = Result<T, AuxError>;

/// Resource/DMA/mailbox failures reported by the device abstraction layer.
#[derive(Debug, Error)]
pub enum DalError {
    #[error("failed creating gang context")]
    GangCreate,
    #[error("failed creating context for worker {worker}")]
    ContextCreate { worker: usize },
    #[error("failed loading bootloader image onto worker {worker}")]
    ProgramLoad { worker: usize },
    #[error("failed creating event handler for worker {worker}")]
    EventHandlerCreate { worker: usize },
    #[error("failed spawning thread for worker {worker}: {reason}")]
    ThreadSpawn { worker: usize, reason: String },
    #[error("mailbox write failed for worker {worker}")]
    MailboxWrite { worker: usize },
    #[error("mailbox read failed for worker {worker}")]
    MailboxRead { worker: usize },
    #[error("dma get failed for worker {worker} at local store address {ls_addr:#x}, length {length}")]
    DmaGet {
        worker: usize,
        ls_addr: u32,
        length: usize,
    },
    #[error("dma transfer misaligned: ls_addr {ls_addr:#x} host_addr {host_addr:#x} length {length}")]
    DmaAlignment {
        ls_addr: u32,
        host_addr: u64,
        length: usize,
    },
    #[error("dma wait failed for worker {worker}")]
    DmaWait { worker: usize },
}

/// Failures during the boot bring-up sequence (original spec §4.2).
#[derive(Debug, Error)]
pub enum BootError {
    #[error("no usable auxiliary processors available")]
    NoUsableWorkers,
    #[error(transparent)]
    Dal(#[from] DalError),
    #[error("worker {worker} reported physical id -1 (unreadable phys-id file)")]
    PhysIdUnavailable { worker: usize },
    #[error("runtime out-of-line code for worker {worker} is too long: would end at {end:#x}, must stay below CODE_ENTRYPOINT ({limit:#x})")]
    RuntimeCodeTooLong {
        worker: usize,
        end: u32,
        limit: u32,
    },
    #[error("runtime entry method for worker {worker} is too long: would end at {end:#x}, must stay below CODE_ENTRYPOINT_END ({limit:#x})")]
    RuntimeEntryTooLong {
        worker: usize,
        end: u32,
        limit: u32,
    },
    #[error("worker {worker} did not transition to the guest runtime: expected (JAVA_VM_STARTED, {expected_phys_id}), got ({got_0:#x}, {got_1:#x})")]
    VmStartMismatch {
        worker: usize,
        expected_phys_id: i32,
        got_0: u32,
        got_1: u32,
    },
}

/// Failures in the per-migration mailbox state machine (original spec §4.5).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Dal(#[from] DalError),
    #[error("worker {worker} did not ACK {during}, replied with error code {code:#x}")]
    Nacked {
        worker: usize,
        during: &'static str,
        code: u32,
    },
    #[error("worker {worker} trapped with value {value:#x}")]
    Trap { worker: usize, value: u32 },
    #[error("worker {worker} sent unknown signal {signal:#x}, error code {code:#x}")]
    UnknownSignal {
        worker: usize,
        signal: u32,
        code: u32,
    },
    #[error("no free migration slot (table size exhausted)")]
    NoFreeSlot,
    #[error("slot {slot} return value harvested before completion")]
    NotComplete { slot: usize },
    #[error("slot {slot} return kind mismatch: stored {stored:?}, requested {requested:?}")]
    RetKindMismatch { slot: usize, stored: RetKind, requested: RetKind },
}

/// Top-level error type returned from every public entry point of this crate.
#[derive(Debug, Error)]
pub enum AuxError {
    #[error(transparent)]
    Boot(#[from] BootError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Dal(#[from] DalError),
    #[error("worker pool not initialized; boot() must succeed before this call")]
    PoolNotInitialized,
    #[error("worker index {0} out of range")]
    InvalidWorker(usize),
}

impl AuxError {
    /// The process exit code the original tool's error-propagation policy
    /// assigns to this error: every variant is fatal and maps to `1`.
    pub fn exit_code(&self) -> i32 {
        1
    }
}
