//! Migration Protocol Engine.
//!
//! Drives one migration to completion on its assigned worker: prepare
//! (GOT/TOC refresh), method selection, reverse-order parameter upload,
//! run, then the service loop that answers the worker's trap/console
//! calls until a `RETURN_VALUE_*` terminates it. Grounded on
//! `prepareMigration`/`runMigratedMethod`/`supportSPU` in the original
//! tool.

use std::sync::atomic::AtomicBool;

use parking_lot::Mutex as FastMutex;

use crate::boot::BootRecord;
use crate::codes::{self, run_signal};
use crate::console::{Console, ConsoleMessage};
use crate::dal::{InboxMode, WorkerDevice};
use crate::error::ProtocolError;
use crate::got::{self, GotState};
use crate::memory_layout::PROXY_TAG_GROUP;
use crate::slot::{MigrationRequest, RetKind, SlotTable};

fn send_method_word(
    device: &dyn WorkerDevice,
    worker_idx: usize,
    words: &[u32],
    during: &'static str,
) -> Result<(), ProtocolError> {
    device
        .inbox_write(words, InboxMode::AllBlocking)
        .map_err(ProtocolError::Dal)?;
    let mut ack = [0u32; 1];
    device.intr_outbox_read(&mut ack).map_err(ProtocolError::Dal)?;
    if ack[0] != codes::ACK {
        let mut code = [0u32; 1];
        device.outbox_read(&mut code).map_err(ProtocolError::Dal)?;
        return Err(ProtocolError::Nacked {
            worker: worker_idx,
            during,
            code: code[0],
        });
    }
    Ok(())
}

/// Prepare: bring this worker's GOT/TOC mirrors up to date, then fence.
pub fn prepare(
    device: &dyn WorkerDevice,
    boot_record: &BootRecord,
    all_dirty: &[AtomicBool],
    worker_idx: usize,
    got: &GotState,
) -> Result<(), ProtocolError> {
    got::reload_got(device, boot_record, all_dirty, worker_idx, got).map_err(ProtocolError::Dal)?;
    got::load_toc_tables(device, boot_record).map_err(ProtocolError::Dal)?;
    device.dma_wait(PROXY_TAG_GROUP).map_err(ProtocolError::Dal)?;
    Ok(())
}

fn select_method(
    device: &dyn WorkerDevice,
    worker_idx: usize,
    request: &MigrationRequest,
) -> Result<(), ProtocolError> {
    send_method_word(
        device,
        worker_idx,
        &[
            codes::LOAD_STATIC_METHOD,
            request.method_class_toc_offset as u32,
            request.method_sub_arch_offset as u32,
        ],
        "method selection",
    )
}

fn upload_params(
    device: &dyn WorkerDevice,
    worker_idx: usize,
    request: &MigrationRequest,
) -> Result<(), ProtocolError> {
    for param in request.params.iter().rev() {
        send_method_word(
            device,
            worker_idx,
            &[codes::LOAD_WORD_PARAM, *param],
            "parameter upload",
        )?;
    }
    Ok(())
}

fn run(
    device: &dyn WorkerDevice,
    worker_idx: usize,
    request: &MigrationRequest,
) -> Result<(), ProtocolError> {
    send_method_word(device, worker_idx, &[run_signal(request.ret_type)], "run")
}

/// Service loop: answer trap/console calls until a `RETURN_VALUE_*`
/// terminates the migration, storing whatever return words arrive into
/// the slot table.
fn service_loop(
    device: &dyn WorkerDevice,
    worker_idx: usize,
    slots: &SlotTable,
    request: &MigrationRequest,
    console: &dyn Console,
    fake_trap_lock: &FastMutex<()>,
) -> Result<(), ProtocolError> {
    loop {
        let mut signal = [0u32; 1];
        device
            .intr_outbox_read(&mut signal)
            .map_err(ProtocolError::Dal)?;

        match signal[0] {
            codes::TRAP_MESSAGE => {
                let mut value = [0u32; 1];
                device.outbox_read(&mut value).map_err(ProtocolError::Dal)?;
                return Err(ProtocolError::Trap {
                    worker: worker_idx,
                    value: value[0],
                });
            }
            codes::FAKE_TRAP_MESSAGE => {
                let _guard = fake_trap_lock.lock();
                log::info!("[worker {worker_idx}] fake trap");
            }
            codes::FAKE_TRAP_MESSAGE_STR => {
                let mut idx = [0u32; 1];
                device.outbox_read(&mut idx).map_err(ProtocolError::Dal)?;
                let _guard = fake_trap_lock.lock();
                log::info!("FT[{worker_idx}]:> {}", idx[0]);
                reply_ack(device, worker_idx)?;
            }
            codes::FAKE_TRAP_MESSAGE_INT => {
                let mut value = [0u32; 1];
                device.outbox_read(&mut value).map_err(ProtocolError::Dal)?;
                let _guard = fake_trap_lock.lock();
                log::info!("FT[{worker_idx}]:> {:#x}", value[0]);
                reply_ack(device, worker_idx)?;
            }
            codes::CONSOLE_WRITE_CHAR => {
                let mut value = [0u32; 1];
                device.outbox_read(&mut value).map_err(ProtocolError::Dal)?;
                console.write(worker_idx, ConsoleMessage::Char(value[0] as u8));
                reply_ack(device, worker_idx)?;
            }
            codes::CONSOLE_WRITE_INT | codes::CONSOLE_WRITE_INT_BOTH => {
                let mut value = [0u32; 1];
                device.outbox_read(&mut value).map_err(ProtocolError::Dal)?;
                console.write(worker_idx, ConsoleMessage::Int(value[0] as i32));
                reply_ack(device, worker_idx)?;
            }
            codes::CONSOLE_WRITE_INT_HEX => {
                let mut value = [0u32; 1];
                device.outbox_read(&mut value).map_err(ProtocolError::Dal)?;
                console.write(worker_idx, ConsoleMessage::IntHex(value[0]));
                reply_ack(device, worker_idx)?;
            }
            codes::CONSOLE_WRITE_LONG | codes::CONSOLE_WRITE_LONG_BOTH => {
                let mut words = [0u32; 2];
                device.outbox_read(&mut words).map_err(ProtocolError::Dal)?;
                let value = ((words[0] as i64) << 32) | words[1] as i64;
                console.write(worker_idx, ConsoleMessage::Long(value));
                reply_ack(device, worker_idx)?;
            }
            codes::CONSOLE_WRITE_LONG_HEX => {
                let mut words = [0u32; 2];
                device.outbox_read(&mut words).map_err(ProtocolError::Dal)?;
                let value = ((words[0] as u64) << 32) | words[1] as u64;
                console.write(worker_idx, ConsoleMessage::LongHex(value));
                reply_ack(device, worker_idx)?;
            }
            codes::CONSOLE_WRITE_DOUBLE => {
                let mut words = [0u32; 3];
                device.outbox_read(&mut words).map_err(ProtocolError::Dal)?;
                let bits = ((words[0] as u64) << 32) | words[1] as u64;
                console.write(worker_idx, ConsoleMessage::Double(f64::from_bits(bits)));
                reply_ack(device, worker_idx)?;
            }
            codes::RETURN_VALUE_V => {
                slots.mark_complete(request.slot);
                return Ok(());
            }
            codes::RETURN_VALUE_I | codes::RETURN_VALUE_F | codes::RETURN_VALUE_R => {
                let mut value = [0u32; 1];
                device.outbox_read(&mut value).map_err(ProtocolError::Dal)?;
                slots.set_ret_word0(request.slot, value[0]);
                slots.mark_complete(request.slot);
                return Ok(());
            }
            codes::RETURN_VALUE_L_UPPER | codes::RETURN_VALUE_D_UPPER => {
                let mut value = [0u32; 1];
                device.outbox_read(&mut value).map_err(ProtocolError::Dal)?;
                slots.set_ret_word0(request.slot, value[0]);
            }
            codes::RETURN_VALUE_L_LOWER | codes::RETURN_VALUE_D_LOWER => {
                let mut value = [0u32; 1];
                device.outbox_read(&mut value).map_err(ProtocolError::Dal)?;
                slots.set_ret_word1(request.slot, value[0]);
                slots.mark_complete(request.slot);
                return Ok(());
            }
            other => {
                let mut code = [0u32; 1];
                device.outbox_read(&mut code).map_err(ProtocolError::Dal)?;
                return Err(ProtocolError::UnknownSignal {
                    worker: worker_idx,
                    signal: other,
                    code: code[0],
                });
            }
        }
    }
}

fn reply_ack(device: &dyn WorkerDevice, worker_idx: usize) -> Result<(), ProtocolError> {
    device
        .inbox_write(&[codes::ACK], InboxMode::AnyNonBlocking)
        .map_err(ProtocolError::Dal)?;
    let _ = worker_idx;
    Ok(())
}

/// Run one migration end to end on `worker_idx`, leaving its slot
/// `complete = 1` on success (never clearing `in_use`; the syscall
/// facade's `get*Return` does that on harvest).
#[allow(clippy::too_many_arguments)]
pub fn run_migration(
    device: &dyn WorkerDevice,
    boot_record: &BootRecord,
    all_dirty: &[AtomicBool],
    worker_idx: usize,
    got: &GotState,
    slots: &SlotTable,
    request: &MigrationRequest,
    console: &dyn Console,
    fake_trap_lock: &FastMutex<()>,
) -> Result<(), ProtocolError> {
    prepare(device, boot_record, all_dirty, worker_idx, got)?;
    select_method(device, worker_idx, request)?;
    upload_params(device, worker_idx, request)?;
    run(device, worker_idx, request)?;
    service_loop(device, worker_idx, slots, request, console, fake_trap_lock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::BootRecordBuilder;
    use crate::console::RecordingConsole;
    use crate::dal::sim::sim_pair;
    use crate::got::GotWindow;

    fn fresh_got() -> GotState {
        GotState::new(GotWindow { start: 0, end: 0 })
    }

    #[test]
    fn scenario_a_void_call_with_no_params() {
        let (host, guest) = sim_pair();
        let boot_record = BootRecordBuilder::new(0, 0).build();
        let got = fresh_got();
        let all_dirty = vec![AtomicBool::new(false)];
        let slots = SlotTable::new(4);
        let request = slots
            .reserve(RetKind::Void, -1, 0x40, 0x80, 0, vec![])
            .unwrap();
        let console = RecordingConsole::new();
        let lock = FastMutex::new(());

        let t = std::thread::spawn(move || {
            let words = guest.recv_inbox(3);
            assert_eq!(words, vec![codes::LOAD_STATIC_METHOD, 0x40, 0x80]);
            guest.send_intr(&[codes::ACK]);
            let run_word = guest.recv_inbox(1);
            assert_eq!(run_word, vec![codes::RUN_METHOD_RETURNING_VOID]);
            guest.send_intr(&[codes::ACK]);
            guest.send_intr(&[codes::RETURN_VALUE_V]);
        });

        run_migration(
            &host,
            &boot_record,
            &all_dirty,
            0,
            &got,
            &slots,
            &request,
            &console,
            &lock,
        )
        .unwrap();
        t.join().unwrap();

        assert!(slots.is_complete(request.slot));
    }

    #[test]
    fn scenario_b_int_call_with_one_param() {
        let (host, guest) = sim_pair();
        let boot_record = BootRecordBuilder::new(0, 0).build();
        let got = fresh_got();
        let all_dirty = vec![AtomicBool::new(false)];
        let slots = SlotTable::new(4);
        let request = slots
            .reserve(RetKind::Int, 1, 0x10, 0x20, 0, vec![0xDEADBEEF])
            .unwrap();
        let console = RecordingConsole::new();
        let lock = FastMutex::new(());

        let t = std::thread::spawn(move || {
            assert_eq!(guest.recv_inbox(3), vec![codes::LOAD_STATIC_METHOD, 0x10, 0x20]);
            guest.send_intr(&[codes::ACK]);
            assert_eq!(guest.recv_inbox(2), vec![codes::LOAD_WORD_PARAM, 0xDEADBEEF]);
            guest.send_intr(&[codes::ACK]);
            assert_eq!(guest.recv_inbox(1), vec![codes::RUN_METHOD_RETURNING_INT]);
            guest.send_intr(&[codes::ACK]);
            guest.send_outbox(0x42);
            guest.send_intr(&[codes::RETURN_VALUE_I]);
        });

        run_migration(
            &host,
            &boot_record,
            &all_dirty,
            0,
            &got,
            &slots,
            &request,
            &console,
            &lock,
        )
        .unwrap();
        t.join().unwrap();

        let ret = slots.take_return(request.slot, RetKind::Int).unwrap();
        assert_eq!(ret[0], 0x42);
    }

    #[test]
    fn scenario_c_params_sent_in_reverse_order() {
        let (host, guest) = sim_pair();
        let boot_record = BootRecordBuilder::new(0, 0).build();
        let got = fresh_got();
        let all_dirty = vec![AtomicBool::new(false)];
        let slots = SlotTable::new(4);
        let request = slots
            .reserve(RetKind::Long, -1, 0, 0, 0, vec![0xAAAA, 0xBBBB])
            .unwrap();
        let console = RecordingConsole::new();
        let lock = FastMutex::new(());

        let t = std::thread::spawn(move || {
            guest.recv_inbox(3);
            guest.send_intr(&[codes::ACK]);
            assert_eq!(guest.recv_inbox(2), vec![codes::LOAD_WORD_PARAM, 0xBBBB]);
            guest.send_intr(&[codes::ACK]);
            assert_eq!(guest.recv_inbox(2), vec![codes::LOAD_WORD_PARAM, 0xAAAA]);
            guest.send_intr(&[codes::ACK]);
            guest.recv_inbox(1);
            guest.send_intr(&[codes::ACK]);
            guest.send_outbox(0x11112222);
            guest.send_intr(&[codes::RETURN_VALUE_L_UPPER]);
            guest.send_outbox(0x33334444);
            guest.send_intr(&[codes::RETURN_VALUE_L_LOWER]);
        });

        run_migration(
            &host,
            &boot_record,
            &all_dirty,
            0,
            &got,
            &slots,
            &request,
            &console,
            &lock,
        )
        .unwrap();
        t.join().unwrap();

        let ret = slots.take_return(request.slot, RetKind::Long).unwrap();
        let long = ((ret[0] as u64) << 32) | ret[1] as u64;
        assert_eq!(long, 0x1111222233334444);
    }

    #[test]
    fn scenario_d_console_write_during_call() {
        let (host, guest) = sim_pair();
        let boot_record = BootRecordBuilder::new(0, 0).build();
        let got = fresh_got();
        let all_dirty = vec![AtomicBool::new(false)];
        let slots = SlotTable::new(4);
        let request = slots
            .reserve(RetKind::Void, -1, 0, 0, 0, vec![])
            .unwrap();
        let console = std::sync::Arc::new(RecordingConsole::new());
        let console_clone = console.clone();
        let lock = FastMutex::new(());

        let t = std::thread::spawn(move || {
            guest.recv_inbox(3);
            guest.send_intr(&[codes::ACK]);
            guest.recv_inbox(1);
            guest.send_intr(&[codes::ACK]);
            guest.send_outbox(b'X' as u32);
            guest.send_intr(&[codes::CONSOLE_WRITE_CHAR]);
            let ack = guest.recv_inbox(1);
            assert_eq!(ack, vec![codes::ACK]);
            guest.send_intr(&[codes::RETURN_VALUE_V]);
        });

        run_migration(
            &host,
            &boot_record,
            &all_dirty,
            0,
            &got,
            &slots,
            &request,
            console_clone.as_ref(),
            &lock,
        )
        .unwrap();
        t.join().unwrap();

        assert_eq!(
            console.recorded(),
            vec![(0, ConsoleMessage::Char(b'X'))]
        );
    }

    #[test]
    fn scenario_f_unexpected_signal_is_fatal() {
        let (host, guest) = sim_pair();
        let boot_record = BootRecordBuilder::new(0, 0).build();
        let got = fresh_got();
        let all_dirty = vec![AtomicBool::new(false)];
        let slots = SlotTable::new(4);
        let request = slots
            .reserve(RetKind::Void, -1, 0, 0, 0, vec![])
            .unwrap();
        let console = RecordingConsole::new();
        let lock = FastMutex::new(());

        let t = std::thread::spawn(move || {
            guest.recv_inbox(3);
            guest.send_intr(&[codes::ACK]);
            guest.recv_inbox(1);
            guest.send_intr(&[codes::ACK]);
            guest.send_outbox(0xDEAD0001);
            guest.send_intr(&[0xCAFEBABE]);
        });

        let err = run_migration(
            &host,
            &boot_record,
            &all_dirty,
            0,
            &got,
            &slots,
            &request,
            &console,
            &lock,
        )
        .unwrap_err();
        t.join().unwrap();

        assert!(matches!(
            err,
            ProtocolError::UnknownSignal { signal: 0xCAFEBABE, code: 0xDEAD0001, .. }
        ));
    }

    #[test]
    fn nacked_method_selection_aborts_with_error_code() {
        let (host, guest) = sim_pair();
        let boot_record = BootRecordBuilder::new(0, 0).build();
        let got = fresh_got();
        let all_dirty = vec![AtomicBool::new(false)];
        let slots = SlotTable::new(4);
        let request = slots
            .reserve(RetKind::Void, -1, 0, 0, 0, vec![])
            .unwrap();
        let console = RecordingConsole::new();
        let lock = FastMutex::new(());

        let t = std::thread::spawn(move || {
            guest.recv_inbox(3);
            guest.send_outbox(codes::ERR_METHOD_NOT_LOADED);
            guest.send_intr(&[codes::NACK]);
        });

        let err = run_migration(
            &host,
            &boot_record,
            &all_dirty,
            0,
            &got,
            &slots,
            &request,
            &console,
            &lock,
        )
        .unwrap_err();
        t.join().unwrap();

        assert!(matches!(
            err,
            ProtocolError::Nacked { during: "method selection", code, .. }
                if code == codes::ERR_METHOD_NOT_LOADED
        ));
    }
}
