//! Syscall Facade.
//!
//! The narrow surface the embedding VM actually calls: bind a processor
//! register, submit a migration, poll completion, and harvest typed
//! return values. Everything here is a thin, typed wrapper over
//! [`crate::slot::SlotTable`] plus one inbound mailbox write, grounded on
//! `bindProcessor`/`migrateToSubArch`/`subArchCheckStatus`/`subArchGet*Return`.

use crate::codes::{self, mask_id, SUBARCH_READY_BIT};
use crate::dal::{InboxMode, WorkerDevice};
use crate::error::ProtocolError;
use crate::slot::{RetKind, SlotTable};
use crate::workqueue::{self, WorkQueue};

/// Bind a worker's processor register to `proc_obj`, required before any
/// migration can target it.
pub fn bind_processor(
    device: &dyn WorkerDevice,
    proc_obj: u32,
) -> Result<(), ProtocolError> {
    device
        .inbox_write(&[codes::SET_PROCESSOR_REG, proc_obj], InboxMode::AllBlocking)
        .map_err(ProtocolError::Dal)?;
    let mut ack = [0u32; 1];
    device.intr_outbox_read(&mut ack).map_err(ProtocolError::Dal)?;
    if ack[0] != codes::ACK {
        return Err(ProtocolError::Nacked {
            worker: 0,
            during: "bind processor",
            code: ack[0],
        });
    }
    Ok(())
}

/// Submit a migration for the first available support thread to pick up.
/// The returned id is what the caller later passes to
/// `check_status`/`get*_return`. Identical to §4.4's submission
/// procedure: reserve a slot, then push it onto the work queue.
#[allow(clippy::too_many_arguments)]
pub fn migrate_to_sub_arch(
    slots: &SlotTable,
    queue: &WorkQueue,
    ret_type: RetKind,
    proc_affinity: i32,
    method_class_toc_offset: i32,
    method_sub_arch_offset: i32,
    params_start: u64,
    params: Vec<u32>,
) -> Result<usize, ProtocolError> {
    workqueue::submit_migration(
        slots,
        queue,
        ret_type,
        proc_affinity,
        method_class_toc_offset,
        method_sub_arch_offset,
        params_start,
        params,
    )
}

/// Update each entry of `status` in place: low bits become the slot id
/// (per [`mask_id`]), with [`SUBARCH_READY_BIT`] OR'd in once that slot
/// has completed.
pub fn check_status(slots: &SlotTable, status: &mut [i32]) {
    for entry in status.iter_mut() {
        let slot = mask_id(*entry);
        if slot < slots.len() && slots.is_complete(slot) {
            *entry |= SUBARCH_READY_BIT;
        }
    }
}

pub fn get_int_return(slots: &SlotTable, slot: usize) -> Result<i32, ProtocolError> {
    let ret = slots.take_return(slot, RetKind::Int)?;
    Ok(ret[0] as i32)
}

pub fn get_float_return(slots: &SlotTable, slot: usize) -> Result<f32, ProtocolError> {
    let ret = slots.take_return(slot, RetKind::Float)?;
    Ok(f32::from_bits(ret[0]))
}

pub fn get_long_return(slots: &SlotTable, slot: usize) -> Result<i64, ProtocolError> {
    let ret = slots.take_return(slot, RetKind::Long)?;
    Ok(((ret[0] as i64) << 32) | ret[1] as i64)
}

pub fn get_double_return(slots: &SlotTable, slot: usize) -> Result<f64, ProtocolError> {
    let ret = slots.take_return(slot, RetKind::Double)?;
    let bits = ((ret[0] as u64) << 32) | ret[1] as u64;
    Ok(f64::from_bits(bits))
}

pub fn get_ref_return(slots: &SlotTable, slot: usize) -> Result<u32, ProtocolError> {
    let ret = slots.take_return(slot, RetKind::Ref)?;
    Ok(ret[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::sim::sim_pair;

    #[test]
    fn bind_processor_succeeds_on_ack() {
        let (host, guest) = sim_pair();
        let t = std::thread::spawn(move || {
            guest.recv_inbox(2);
            guest.send_intr(&[codes::ACK]);
        });
        bind_processor(&host, 0xAB).unwrap();
        t.join().unwrap();
    }

    #[test]
    fn bind_processor_fails_on_nack() {
        let (host, guest) = sim_pair();
        let t = std::thread::spawn(move || {
            guest.recv_inbox(2);
            guest.send_intr(&[codes::NACK]);
        });
        let err = bind_processor(&host, 0xAB).unwrap_err();
        assert!(matches!(err, ProtocolError::Nacked { during: "bind processor", .. }));
        t.join().unwrap();
    }

    #[test]
    fn check_status_marks_ready_bit_only_for_complete_slots() {
        let slots = SlotTable::new(4);
        let queue = WorkQueue::new();
        let a = migrate_to_sub_arch(&slots, &queue, RetKind::Int, -1, 0, 0, 0, vec![]).unwrap();
        let b = migrate_to_sub_arch(&slots, &queue, RetKind::Int, -1, 0, 0, 0, vec![]).unwrap();
        slots.mark_complete(a);

        let mut status = [a as i32, b as i32];
        check_status(&slots, &mut status);

        assert_eq!(status[0], a as i32 | SUBARCH_READY_BIT);
        assert_eq!(status[1], b as i32);
    }

    #[test]
    fn check_status_is_idempotent_absent_completion_change() {
        let slots = SlotTable::new(2);
        let queue = WorkQueue::new();
        let a = migrate_to_sub_arch(&slots, &queue, RetKind::Void, -1, 0, 0, 0, vec![]).unwrap();
        let mut first = [a as i32];
        check_status(&slots, &mut first);
        let mut second = [a as i32];
        check_status(&slots, &mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn get_long_return_reassembles_upper_and_lower_words() {
        let slots = SlotTable::new(1);
        let queue = WorkQueue::new();
        let slot = migrate_to_sub_arch(&slots, &queue, RetKind::Long, -1, 0, 0, 0, vec![]).unwrap();
        slots.set_ret_word0(slot, 0x1111_2222);
        slots.set_ret_word1(slot, 0x3333_4444);
        slots.mark_complete(slot);
        assert_eq!(get_long_return(&slots, slot).unwrap(), 0x1111_2222_3333_4444u64 as i64);
    }

    #[test]
    fn get_double_return_reinterprets_bits() {
        let slots = SlotTable::new(1);
        let queue = WorkQueue::new();
        let slot = migrate_to_sub_arch(&slots, &queue, RetKind::Double, -1, 0, 0, 0, vec![]).unwrap();
        let bits = std::f64::consts::PI.to_bits();
        slots.set_ret_word0(slot, (bits >> 32) as u32);
        slots.set_ret_word1(slot, bits as u32);
        slots.mark_complete(slot);
        assert_eq!(get_double_return(&slots, slot).unwrap(), std::f64::consts::PI);
    }
}
