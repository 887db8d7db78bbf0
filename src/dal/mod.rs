//! Device Abstraction Layer (DAL).
//!
//! Uniform, per-worker access to mailboxes and the DMA engine. The only
//! policy decision made at this layer is that every error is fatal and
//! reported upward as a [`DalError`] — retry/backoff belongs to no
//! component of this core.
//!
//! [`WorkerDevice`] is the trait a production embedder implements against
//! real co-processor bindings (out of scope for this core, see the crate's
//! top-level documentation). [`sim::SimWorker`] is the in-process software
//! model every test in this crate runs against.

pub mod sim;

use bitflags::bitflags;

use crate::error::DalError;
use crate::memory_layout::PROXY_TAG_GROUP;

bitflags! {
    /// Context creation flags, mirroring the original's
    /// `CTX_FLAGS = SPE_MAP_PS | SPE_EVENTS_ENABLE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextFlags: u32 {
        /// Map the problem-state area into host address space.
        const MAP_PS = 1 << 0;
        /// Enable interrupt-mailbox events for this context.
        const EVENTS_ENABLE = 1 << 1;
    }
}

/// Write-mode for the inbound mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxMode {
    /// Block until every word has been written.
    AllBlocking,
    /// Write what fits without blocking.
    AnyNonBlocking,
}

/// A contiguous run of bytes to DMA into a worker's local store, addressed
/// by whatever the embedder uses to name host memory (a raw pointer in the
/// original; an index into a shared buffer in the simulator).
#[derive(Debug, Clone, Copy)]
pub struct DmaSpan {
    pub host_addr: u64,
    pub length: usize,
}

/// Per-worker hardware primitives. One instance per [`crate::worker::WorkerDescriptor`].
///
/// Alignment rules (enforced by implementations, not callers): `length <=
/// 16 KiB`; `ls_addr` must be 16-byte aligned whenever `length >= 16`;
/// smaller transfers must be naturally aligned (4 or 8 bytes) at both ends.
pub trait WorkerDevice: Send + Sync {
    /// Create the context with the given flags, joining `gang`.
    fn context_create(&self, flags: ContextFlags) -> Result<(), DalError>;

    /// Load a bootloader/program image into the context prior to running it.
    fn program_load(&self, image: &[u8]) -> Result<(), DalError>;

    /// Run the context to completion at `entry`. Blocks for the lifetime of
    /// the worker; callers run this on a dedicated boot thread.
    fn context_run(&self, entry: u32) -> Result<(), DalError>;

    fn event_handler_create(&self) -> Result<(), DalError>;
    fn event_handler_destroy(&self);
    fn context_destroy(&self);

    /// Write `words` to the inbound mailbox.
    fn inbox_write(&self, words: &[u32], mode: InboxMode) -> Result<(), DalError>;

    /// Non-blocking read from the ordinary outbound mailbox. Returns the
    /// number of words actually read into `buf`.
    fn outbox_read(&self, buf: &mut [u32]) -> Result<usize, DalError>;

    /// Blocking read of exactly `buf.len()` words from the interrupt
    /// outbound mailbox.
    fn intr_outbox_read(&self, buf: &mut [u32]) -> Result<(), DalError>;

    /// Queue a DMA of `host_bytes` (logically sourced from `host_addr`)
    /// into the local store at `ls_addr` under `tag`. Does not block;
    /// completion is observed via [`Self::dma_wait`].
    fn dma_get(
        &self,
        ls_addr: u32,
        host_addr: u64,
        host_bytes: &[u8],
        tag: u32,
    ) -> Result<(), DalError>;

    /// Block until every outstanding DMA under the tag group completes.
    fn dma_wait(&self, tag_group: u32) -> Result<(), DalError>;

    /// Snapshot of the local-store bytes at `[addr, addr+len)`, used by
    /// tests to assert what actually landed after a DMA batch.
    fn peek_local_store(&self, addr: u32, len: usize) -> Vec<u8>;
}

/// Validate the alignment rules from the original spec's DAL description
/// before issuing a DMA. Shared by every [`WorkerDevice`] implementation so
/// the rule is enforced uniformly rather than per-backend.
pub fn check_dma_alignment(ls_addr: u32, host_addr: u64, length: usize) -> Result<(), DalError> {
    const MAX_DMA: usize = 16 * 1024;
    if length > MAX_DMA {
        return Err(DalError::DmaAlignment {
            ls_addr,
            host_addr,
            length,
        });
    }
    let aligned = |addr: u64, boundary: u64| addr & (boundary - 1) == 0;
    let ok = if length >= 16 {
        aligned(ls_addr as u64, 16) && aligned(host_addr, 16)
    } else if length == 8 {
        aligned(ls_addr as u64, 8) && aligned(host_addr, 8)
    } else {
        aligned(ls_addr as u64, 4) && aligned(host_addr, 4)
    };
    if ok {
        Ok(())
    } else {
        Err(DalError::DmaAlignment {
            ls_addr,
            host_addr,
            length,
        })
    }
}

/// Default tag group every caller in this crate uses.
pub const DEFAULT_TAG_GROUP: u32 = PROXY_TAG_GROUP;
