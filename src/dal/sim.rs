//! In-process software simulation of a worker's local store and mailboxes.
//!
//! No physical co-processor is available to this core, so every test in
//! this crate exercises its invariants against [`SimWorker`]: a software
//! model of local-store memory plus three mailbox FIFOs, guarded by the
//! same `Mutex` + `Condvar` shape used for mock IPC primitives elsewhere in
//! this codebase. [`SimGuest`] is the other end of the same channels — a
//! test drives it from a dedicated thread to play the part of the
//! auxiliary processor's bootloader and runtime, exactly as the real
//! firmware would respond to the host's mailbox protocol.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use super::{check_dma_alignment, ContextFlags, DalError, InboxMode, WorkerDevice};

struct SimInner {
    local_store: Vec<u8>,
    inbox: VecDeque<u32>,
    outbox: VecDeque<u32>,
    intr_outbox: VecDeque<u32>,
    dma_pending: u32,
    context_created: bool,
}

struct Shared {
    inner: Mutex<SimInner>,
    inbox_ready: Condvar,
    outbox_ready: Condvar,
    intr_ready: Condvar,
}

/// Host-side handle implementing [`WorkerDevice`] against the simulator.
#[derive(Clone)]
pub struct SimWorker {
    shared: Arc<Shared>,
}

/// Guest-side handle a test uses to play the auxiliary processor: read
/// what the host wrote to the inbound mailbox, write replies to the
/// ordinary/interrupt outbound mailboxes.
#[derive(Clone)]
pub struct SimGuest {
    shared: Arc<Shared>,
}

/// Default local-store size: covers every region in the fixed memory
/// layout, stack included.
pub const LOCAL_STORE_SIZE: usize = 0x40000;

/// Construct a connected host/guest pair sharing one simulated local store.
pub fn sim_pair() -> (SimWorker, SimGuest) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(SimInner {
            local_store: vec![0u8; LOCAL_STORE_SIZE],
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            intr_outbox: VecDeque::new(),
            dma_pending: 0,
            context_created: false,
        }),
        inbox_ready: Condvar::new(),
        outbox_ready: Condvar::new(),
        intr_ready: Condvar::new(),
    });
    (
        SimWorker {
            shared: shared.clone(),
        },
        SimGuest { shared },
    )
}

impl WorkerDevice for SimWorker {
    fn context_create(&self, _flags: ContextFlags) -> Result<(), DalError> {
        self.shared.inner.lock().unwrap().context_created = true;
        Ok(())
    }

    fn program_load(&self, _image: &[u8]) -> Result<(), DalError> {
        Ok(())
    }

    fn context_run(&self, _entry: u32) -> Result<(), DalError> {
        // The real DAL blocks here for the worker's entire lifetime; the
        // simulator has no instruction-level execution to run, so the
        // "boot thread" using this is expected to simply park until
        // shutdown (see `boot::BootCoordinator`).
        Ok(())
    }

    fn event_handler_create(&self) -> Result<(), DalError> {
        Ok(())
    }

    fn event_handler_destroy(&self) {}

    fn context_destroy(&self) {}

    fn inbox_write(&self, words: &[u32], _mode: InboxMode) -> Result<(), DalError> {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.inbox.extend(words.iter().copied());
        self.shared.inbox_ready.notify_all();
        Ok(())
    }

    fn outbox_read(&self, buf: &mut [u32]) -> Result<usize, DalError> {
        let mut inner = self.shared.inner.lock().unwrap();
        let n = buf.len().min(inner.outbox.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inner.outbox.pop_front().unwrap();
        }
        Ok(n)
    }

    fn intr_outbox_read(&self, buf: &mut [u32]) -> Result<(), DalError> {
        let mut inner = self.shared.inner.lock().unwrap();
        while inner.intr_outbox.len() < buf.len() {
            inner = self.shared.intr_ready.wait(inner).unwrap();
        }
        for slot in buf.iter_mut() {
            *slot = inner.intr_outbox.pop_front().unwrap();
        }
        Ok(())
    }

    fn dma_get(
        &self,
        ls_addr: u32,
        host_addr: u64,
        host_bytes: &[u8],
        _tag: u32,
    ) -> Result<(), DalError> {
        check_dma_alignment(ls_addr, host_addr, host_bytes.len())?;
        let mut inner = self.shared.inner.lock().unwrap();
        let start = ls_addr as usize;
        let end = start + host_bytes.len();
        if end > inner.local_store.len() {
            return Err(DalError::DmaGet {
                worker: 0,
                ls_addr,
                length: host_bytes.len(),
            });
        }
        inner.local_store[start..end].copy_from_slice(host_bytes);
        inner.dma_pending += 1;
        Ok(())
    }

    fn dma_wait(&self, _tag_group: u32) -> Result<(), DalError> {
        // The simulator performs every DMA synchronously in `dma_get`;
        // waiting just clears the completion counter tests may inspect.
        self.shared.inner.lock().unwrap().dma_pending = 0;
        Ok(())
    }

    fn peek_local_store(&self, addr: u32, len: usize) -> Vec<u8> {
        let inner = self.shared.inner.lock().unwrap();
        let start = addr as usize;
        inner.local_store[start..start + len].to_vec()
    }
}

impl SimGuest {
    /// Block until `n` words have been written to the inbound mailbox by
    /// the host, then drain and return them.
    pub fn recv_inbox(&self, n: usize) -> Vec<u32> {
        let mut inner = self.shared.inner.lock().unwrap();
        while inner.inbox.len() < n {
            inner = self.shared.inbox_ready.wait(inner).unwrap();
        }
        inner.inbox.drain(..n).collect()
    }

    /// Send a single word over the interrupt-mailbox path (handshakes and
    /// ACK/NACK replies all go this way in the original protocol).
    pub fn send_intr(&self, words: &[u32]) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.intr_outbox.extend(words.iter().copied());
        self.shared.intr_ready.notify_all();
    }

    /// Append a payload word to the ordinary outbound mailbox (read via
    /// `outbox_read` on the host side after an interrupt announces it).
    pub fn send_outbox(&self, word: u32) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.outbox.push_back(word);
        self.shared.outbox_ready.notify_all();
    }

    pub fn local_store_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        let inner = self.shared.inner.lock().unwrap();
        let start = addr as usize;
        inner.local_store[start..start + len].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::InboxMode;

    #[test]
    fn inbox_write_wakes_blocked_guest_read() {
        let (host, guest) = sim_pair();
        let t = std::thread::spawn(move || guest.recv_inbox(3));
        std::thread::sleep(std::time::Duration::from_millis(20));
        host.inbox_write(&[0x20, 0x40, 0x80], InboxMode::AnyNonBlocking)
            .unwrap();
        assert_eq!(t.join().unwrap(), vec![0x20, 0x40, 0x80]);
    }

    #[test]
    fn intr_outbox_read_blocks_until_guest_sends() {
        let (host, guest) = sim_pair();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            guest.send_intr(&[0x11, 0x3]);
        });
        let mut buf = [0u32; 2];
        host.intr_outbox_read(&mut buf).unwrap();
        assert_eq!(buf, [0x11, 0x3]);
        t.join().unwrap();
    }

    #[test]
    fn dma_get_rejects_misaligned_small_transfer() {
        let (host, _guest) = sim_pair();
        let bytes = [0u8; 4];
        // ls_addr 0x1001 is not 4-aligned.
        assert!(host.dma_get(0x1001, 0x2000, &bytes, 15).is_err());
    }

    #[test]
    fn dma_get_then_peek_round_trips() {
        let (host, _guest) = sim_pair();
        let bytes = [0xAAu8, 0xBB, 0xCC, 0xDD];
        host.dma_get(0x1000, 0x2000, &bytes, 15).unwrap();
        host.dma_wait(15).unwrap();
        assert_eq!(host.peek_local_store(0x1000, 4), bytes);
    }
}
