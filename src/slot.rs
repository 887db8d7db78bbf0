//! Migration slot table.
//!
//! Mirrors the original's fixed `SpuJavaThreadData[MAX_JAVA_SPU_THREADS]`
//! array: every migration request is assigned a slot by index, which
//! doubles as the caller-visible thread id. `in_use` and `complete` are
//! tracked as independent bits so a slot can be reserved well before its
//! return value is harvested, matching `chooseThreadID`/`checkIdComplete`
//! in the original tool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::ProtocolError;

/// Shape of the value a migrated method returns, selecting which half of
/// `retVal` is meaningful and how to reinterpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetKind {
    Void,
    Int,
    Long,
    Float,
    Double,
    Ref,
}

#[derive(Debug, Default)]
struct SlotData {
    ret_type: Option<RetKind>,
    proc_affinity: i32,
    method_class_toc_offset: i32,
    method_sub_arch_offset: i32,
    params_start: u64,
    params: Vec<u32>,
    ret_val: [u32; 2],
}

/// One entry in the fixed-size migration slot table.
pub struct MigrationSlot {
    in_use: AtomicBool,
    complete: AtomicBool,
    data: Mutex<SlotData>,
}

impl MigrationSlot {
    fn new() -> Self {
        Self {
            in_use: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            data: Mutex::new(SlotData::default()),
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }
}

/// Descriptor fields needed to drive a single migration through the
/// protocol engine, copied out of a slot once reserved. `params_start`
/// is kept only as the original pointer-style diagnostic tag; the words
/// actually shipped to the worker are `params`.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub slot: usize,
    pub ret_type: RetKind,
    pub proc_affinity: i32,
    pub method_class_toc_offset: i32,
    pub method_sub_arch_offset: i32,
    pub params_start: u64,
    pub params: Vec<u32>,
}

/// The fixed table of migration slots, sized by [`crate::config::AuxConfig::max_migrations`].
pub struct SlotTable {
    slots: Vec<MigrationSlot>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, MigrationSlot::new);
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reserve the first free slot and fill it out, mirroring
    /// `chooseThreadID` followed by the field assignments in
    /// `migrateToSubArch`. Returns [`ProtocolError::NoFreeSlot`] if the
    /// table is exhausted.
    pub fn reserve(
        &self,
        ret_type: RetKind,
        proc_affinity: i32,
        method_class_toc_offset: i32,
        method_sub_arch_offset: i32,
        params_start: u64,
        params: Vec<u32>,
    ) -> Result<MigrationRequest, ProtocolError> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.complete.store(false, Ordering::Release);
                let mut data = slot.data.lock().unwrap();
                data.ret_type = Some(ret_type);
                data.proc_affinity = proc_affinity;
                data.method_class_toc_offset = method_class_toc_offset;
                data.method_sub_arch_offset = method_sub_arch_offset;
                data.params_start = params_start;
                data.params = params.clone();
                data.ret_val = [0, 0];
                return Ok(MigrationRequest {
                    slot: idx,
                    ret_type,
                    proc_affinity,
                    method_class_toc_offset,
                    method_sub_arch_offset,
                    params_start,
                    params,
                });
            }
        }
        Err(ProtocolError::NoFreeSlot)
    }

    /// Store the first return word, mirroring the `RETURN_VALUE_R` /
    /// `_UPPER` mailbox cases in `supportSPU`.
    pub fn set_ret_word0(&self, slot: usize, word: u32) {
        self.slots[slot].data.lock().unwrap().ret_val[0] = word;
    }

    /// Store the second return word, mirroring the `_LOWER` cases.
    pub fn set_ret_word1(&self, slot: usize, word: u32) {
        self.slots[slot].data.lock().unwrap().ret_val[1] = word;
    }

    pub fn mark_complete(&self, slot: usize) {
        self.slots[slot].mark_complete();
    }

    pub fn release(&self, slot: usize) {
        self.slots[slot].release();
    }

    pub fn is_complete(&self, slot: usize) -> bool {
        self.slots[slot].is_complete()
    }

    /// Harvest a slot's return value as `kind`, clearing `in_use` the way
    /// `subArchGetIntReturn` et al. do after reading. Fails if the slot
    /// has not completed, or if `kind` doesn't match what the migration
    /// was declared to return.
    pub fn take_return(&self, slot: usize, kind: RetKind) -> Result<[u32; 2], ProtocolError> {
        if !self.slots[slot].is_complete() {
            return Err(ProtocolError::NotComplete { slot });
        }
        let data = self.slots[slot].data.lock().unwrap();
        let stored = data.ret_type.unwrap_or(RetKind::Void);
        if stored != kind {
            return Err(ProtocolError::RetKindMismatch {
                slot,
                stored,
                requested: kind,
            });
        }
        let ret = data.ret_val;
        drop(data);
        self.slots[slot].release();
        Ok(ret)
    }

    pub fn request(&self, slot: usize) -> MigrationRequest {
        let data = self.slots[slot].data.lock().unwrap();
        MigrationRequest {
            slot,
            ret_type: data.ret_type.unwrap_or(RetKind::Void),
            proc_affinity: data.proc_affinity,
            method_class_toc_offset: data.method_class_toc_offset,
            method_sub_arch_offset: data.method_sub_arch_offset,
            params_start: data.params_start,
            params: data.params.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_fills_table_then_errors() {
        let table = SlotTable::new(2);
        let a = table.reserve(RetKind::Int, -1, 0, 0, 0, vec![]).unwrap();
        let b = table.reserve(RetKind::Void, -1, 0, 0, 0, vec![]).unwrap();
        assert_ne!(a.slot, b.slot);
        assert!(table.reserve(RetKind::Void, -1, 0, 0, 0, vec![]).is_err());
    }

    #[test]
    fn release_frees_slot_for_reuse() {
        let table = SlotTable::new(1);
        let req = table.reserve(RetKind::Int, -1, 0, 0, 0, vec![]).unwrap();
        table.set_ret_word0(req.slot, 42);
        table.mark_complete(req.slot);
        let got = table.take_return(req.slot, RetKind::Int).unwrap();
        assert_eq!(got[0], 42);
        assert!(!table.slots[req.slot].is_in_use());

        let req2 = table.reserve(RetKind::Void, -1, 0, 0, 0, vec![]).unwrap();
        assert_eq!(req2.slot, req.slot);
    }

    #[test]
    fn take_return_before_complete_errors() {
        let table = SlotTable::new(1);
        let req = table.reserve(RetKind::Long, -1, 0, 0, 0, vec![]).unwrap();
        assert!(matches!(
            table.take_return(req.slot, RetKind::Long),
            Err(ProtocolError::NotComplete { slot }) if slot == req.slot
        ));
    }

    #[test]
    fn take_return_kind_mismatch_errors() {
        let table = SlotTable::new(1);
        let req = table.reserve(RetKind::Double, -1, 0, 0, 0, vec![]).unwrap();
        table.mark_complete(req.slot);
        assert!(matches!(
            table.take_return(req.slot, RetKind::Int),
            Err(ProtocolError::RetKindMismatch { .. })
        ));
    }
}
