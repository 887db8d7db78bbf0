//! auxrt - Host-side control core for offloading method invocations to
//! auxiliary co-processors.
//!
//! A small set of workers, each with a private local store reachable
//! only through DMA and three bounded mailboxes, execute methods on
//! behalf of a host program one migration at a time. This crate owns
//! bring-up, the GOT/TOC coherency engine that keeps each worker's
//! mirror of the host's global offset table current, the mailbox
//! protocol that drives a single migration to completion, and the
//! scheduler that fans migrations out across however many workers came
//! up. Nothing here runs guest code; the embedding VM supplies the
//! runtime image and decides what gets migrated.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          embedding VM                              │
//! └───────────────────────────────────────────────────────────────────┘
//!                                 │ syscall (bind/migrate/status/get*)
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                       worker::WorkerPool                           │
//! │  ┌─────────┐  ┌──────────┐  ┌───────────┐  ┌─────────────────┐    │
//! │  │ boot::* │  │ got::*   │  │ protocol::*│  │ workqueue::*    │    │
//! │  │ bring-up│  │ GOT/TOC  │  │ migration │  │ LIFO scheduler  │    │
//! │  │ handshake│  │ mirror  │  │ state     │  │ + affinity      │    │
//! │  └─────────┘  └──────────┘  └───────────┘  └─────────────────┘    │
//! └───────────────────────────────────────────────────────────────────┘
//!                                 │ mailboxes + DMA (dal::WorkerDevice)
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │         auxiliary processor (real hardware / dal::sim::SimWorker)  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every fatal condition becomes an [`error::AuxError`]; nothing in this
//! crate panics outside test code. Logging goes through the `log` facade
//! ([`env_logger`] is wired up by the demonstration binary, not this
//! library) so an embedder can route it anywhere.

pub mod boot;
pub mod codes;
pub mod config;
pub mod console;
pub mod dal;
pub mod error;
pub mod got;
pub mod memory_layout;
pub mod protocol;
pub mod slot;
pub mod syscall;
pub mod worker;
pub mod workqueue;

pub use config::AuxConfig;
pub use error::{AuxError, AuxResult};
pub use slot::RetKind;
pub use worker::WorkerPool;
