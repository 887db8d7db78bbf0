//! Tunable configuration for the control core.
//!
//! Mirrors the original tool's compile-time constants (`MAX_SPU_THREADS`,
//! `MAX_JAVA_SPU_THREADS`, `PROXY_TAG_GROUP`) as runtime-overridable fields,
//! so embedders can size the worker and slot tables without touching core
//! logic. There is no external config-file format: nothing downstream of
//! this struct needs one.

use crate::memory_layout::PROXY_TAG_GROUP;

/// Upper bound on the number of auxiliary processors this core will
/// attempt to bring up, mirroring the original's `MAX_SPU_THREADS`.
pub const DEFAULT_MAX_WORKERS: usize = 16;

/// Upper bound on the number of concurrently outstanding migrations,
/// mirroring the original's `MAX_JAVA_SPU_THREADS`.
pub const DEFAULT_MAX_MIGRATIONS: usize = 64;

#[derive(Debug, Clone)]
pub struct AuxConfig {
    /// Size of the fixed migration-slot table.
    pub max_migrations: usize,
    /// Hard cap on the number of workers ever created, regardless of how
    /// many the platform reports as usable.
    pub max_workers: usize,
    /// How many workers to actually bring up. `None` means "use every
    /// usable worker up to `max_workers`", matching the original's
    /// `spu_threads < 0` sentinel.
    pub requested_workers: Option<usize>,
    /// DMA tag group used for every transfer.
    pub tag_group: u32,
}

impl Default for AuxConfig {
    fn default() -> Self {
        Self {
            max_migrations: DEFAULT_MAX_MIGRATIONS,
            max_workers: DEFAULT_MAX_WORKERS,
            requested_workers: None,
            tag_group: PROXY_TAG_GROUP,
        }
    }
}

impl AuxConfig {
    /// Resolve the number of workers to bring up given how many the
    /// platform reports as usable, clipping to `[1, max_workers]` the same
    /// way the original clips `spu_threads` against `no_spus`.
    pub fn resolve_worker_count(&self, usable: usize) -> usize {
        let usable = usable.min(self.max_workers).max(1);
        match self.requested_workers {
            Some(requested) => requested.min(usable).max(1),
            None => usable,
        }
    }
}
