//! auxrtd - reference host process wiring the auxiliary-processor control
//! core to a software-simulated worker fleet.
//!
//! No physical co-processor is available in this environment, so this
//! binary plays both ends of the wire: it boots a `WorkerPool` against
//! `dal::sim::SimWorker` handles, and for each one spawns a thread that
//! plays the auxiliary processor's bootloader and runtime, answering the
//! exact mailbox handshakes a real firmware image would.

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use auxrt::boot::{BootRecordBuilder, PhysIdResolver, StaticPhysIdResolver};
use auxrt::codes;
use auxrt::console::LoggingConsole;
use auxrt::dal::sim::{sim_pair, SimGuest};
use auxrt::dal::WorkerDevice;
use auxrt::{AuxConfig, AuxError, RetKind, WorkerPool};

const WORKER_COUNT: usize = 4;

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run() -> Result<(), AuxError> {
    let config = parse_args();

    let mut devices: Vec<Arc<dyn WorkerDevice>> = Vec::with_capacity(WORKER_COUNT);
    for spe_id in 0..WORKER_COUNT as u64 {
        let (host, guest) = sim_pair();
        devices.push(Arc::new(host));
        thread::spawn(move || simulated_firmware(spe_id, guest));
    }

    // Hand out physical ids in reverse so the pool's phys-id reorder
    // actually has something to do.
    let ids: Vec<i32> = (0..WORKER_COUNT as i32).rev().collect();
    let resolver: Arc<dyn PhysIdResolver> = Arc::new(StaticPhysIdResolver::new(ids));
    let boot_record = Arc::new(BootRecordBuilder::new(0, 0).build());
    let console = Arc::new(LoggingConsole);

    let pool = WorkerPool::boot(
        &config,
        devices,
        &[],
        boot_record,
        resolver,
        1,
        std::process::id(),
        console,
    )?;
    log::info!("booted {} auxiliary processors", pool.worker_count());

    let slot = pool.migrate_to_sub_arch(RetKind::Int, -1, 0x100, 0x200, 0, vec![21, 21])?;
    let result = wait_for_result(&pool, slot)?;
    log::info!("migrated method returned {result}");

    pool.shutdown();
    Ok(())
}

fn wait_for_result(pool: &WorkerPool, slot: usize) -> Result<i32, AuxError> {
    for _ in 0..200 {
        let mut status = [slot as i32];
        pool.check_status(&mut status);
        if status[0] & codes::SUBARCH_READY_BIT != 0 {
            return pool.get_int_return(slot);
        }
        thread::sleep(Duration::from_millis(5));
    }
    pool.get_int_return(slot)
}

fn parse_args() -> AuxConfig {
    let mut config = AuxConfig::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--workers" => {
                i += 1;
                if let Some(value) = args.get(i).and_then(|v| v.parse().ok()) {
                    config.requested_workers = Some(value);
                }
            }
            "--max-migrations" => {
                i += 1;
                if let Some(value) = args.get(i).and_then(|v| v.parse().ok()) {
                    config.max_migrations = value;
                }
            }
            other => {
                eprintln!("unknown option: {other}");
            }
        }
        i += 1;
    }
    config
}

fn print_usage() {
    println!("auxrtd [--workers N] [--max-migrations N]");
}

/// Stand-in for a real runtime image: completes bring-up, then answers
/// exactly one Int-returning, two-parameter migration by summing its
/// word parameters. A real firmware image services an arbitrary
/// interleaving of these messages instead of one fixed shape.
fn simulated_firmware(spe_id: u64, guest: SimGuest) {
    guest.send_intr(&[(spe_id >> 32) as u32, spe_id as u32]);
    let phys_id = guest.recv_inbox(1)[0];
    guest.send_intr(&[codes::JAVA_VM_STARTED, phys_id]);

    let header = guest.recv_inbox(3);
    if header.is_empty() {
        return;
    }
    guest.send_intr(&[codes::ACK]);

    let mut sum: i64 = 0;
    for _ in 0..2 {
        let param = guest.recv_inbox(2);
        sum += param[1] as i64;
        guest.send_intr(&[codes::ACK]);
    }

    guest.recv_inbox(1);
    guest.send_intr(&[codes::ACK]);

    guest.send_outbox(sum as u32);
    guest.send_intr(&[codes::RETURN_VALUE_I]);
}
