//! Asynchronous page writer behind the WAL.
//!
//! A dedicated I/O thread drains a queue of positional writes and fsyncs
//! so the append path never blocks on disk. Staging buffers circulate
//! through a fixed pool: acquiring a buffer when all are in flight blocks
//! the producer, which is the WAL's backpressure.
//!
//! I/O errors are latched and surfaced at the next drain; by then the
//! caller is at an explicit durability point and can fail loudly.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use tracing::{error, trace};

use super::{WAL_BLKSZ, WalError};

/// Queue entries processed by the ring thread.
enum RingOp {
    /// Positional write of `buf[..len]` at `off`.
    Write {
        file: Arc<File>,
        off: u64,
        buf: Box<[u8]>,
        len: usize,
    },
    /// Data sync on `file`.
    Fsync { file: Arc<File> },
    /// Completion fence: acknowledged once everything before it is done.
    Barrier { done: Sender<()> },
}

/// The async write ring: an op queue, a buffer pool, and the I/O thread.
#[derive(Debug)]
pub(crate) struct WriteRing {
    ops: Sender<RingOp>,
    pool: Receiver<Box<[u8]>>,
    worker: Option<JoinHandle<()>>,
    last_error: Arc<Mutex<Option<io::Error>>>,
}

impl WriteRing {
    /// Spawns the ring thread with `depth` staging buffers of
    /// [`WAL_BLKSZ`] bytes.
    pub(crate) fn new(depth: usize) -> Self {
        let (ops_tx, ops_rx) = unbounded::<RingOp>();
        let (pool_tx, pool_rx) = bounded::<Box<[u8]>>(depth);
        for _ in 0..depth {
            pool_tx
                .send(vec![0u8; WAL_BLKSZ].into_boxed_slice())
                .unwrap_or_else(|_| unreachable!("pool channel sized for depth"));
        }

        let last_error = Arc::new(Mutex::new(None));
        let thread_error = Arc::clone(&last_error);
        let worker = std::thread::Builder::new()
            .name("wal-ring".into())
            .spawn(move || ring_worker(ops_rx, pool_tx, thread_error))
            .unwrap_or_else(|e| panic!("spawning wal ring thread: {e}"));

        Self {
            ops: ops_tx,
            pool: pool_rx,
            worker: Some(worker),
            last_error,
        }
    }

    /// Takes a free staging buffer, blocking while all are in flight.
    pub(crate) fn acquire(&self) -> Box<[u8]> {
        self.pool
            .recv()
            .unwrap_or_else(|_| panic!("wal ring thread gone"))
    }

    /// Queues a positional write; the buffer returns to the pool once
    /// written.
    pub(crate) fn submit_write(&self, file: Arc<File>, off: u64, buf: Box<[u8]>, len: usize) {
        debug_assert!(len <= buf.len());
        self.ops
            .send(RingOp::Write {
                file,
                off,
                buf,
                len,
            })
            .unwrap_or_else(|_| panic!("wal ring thread gone"));
    }

    /// Queues a data sync.
    pub(crate) fn submit_fsync(&self, file: Arc<File>) {
        self.ops
            .send(RingOp::Fsync { file })
            .unwrap_or_else(|_| panic!("wal ring thread gone"));
    }

    /// Waits for every queued operation to complete, then reports any
    /// latched I/O error.
    pub(crate) fn drain(&self) -> Result<(), WalError> {
        let (done_tx, done_rx) = bounded(1);
        self.ops
            .send(RingOp::Barrier { done: done_tx })
            .unwrap_or_else(|_| panic!("wal ring thread gone"));
        done_rx
            .recv()
            .unwrap_or_else(|_| panic!("wal ring thread gone"));

        let mut latched = self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match latched.take() {
            Some(e) => Err(WalError::Io(e)),
            None => Ok(()),
        }
    }
}

impl Drop for WriteRing {
    fn drop(&mut self) {
        // Closing the op channel stops the worker after the queue drains.
        let (closed_tx, _) = unbounded();
        drop(std::mem::replace(&mut self.ops, closed_tx));
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("wal ring thread panicked");
        }
    }
}

fn ring_worker(
    ops: Receiver<RingOp>,
    pool: Sender<Box<[u8]>>,
    last_error: Arc<Mutex<Option<io::Error>>>,
) {
    let latch = |err: io::Error| {
        error!(error = %err, "wal ring i/o failure");
        let mut slot = last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.get_or_insert(err);
    };

    while let Ok(op) = ops.recv() {
        match op {
            RingOp::Write {
                file,
                off,
                buf,
                len,
            } => {
                trace!(off, len, "wal ring write");
                if let Err(e) = file.write_all_at(&buf[..len], off) {
                    latch(e);
                }
                // Buffer returns to the pool even after a failed write;
                // the producer learns of the failure at its next drain.
                let _ = pool.send(buf);
            }
            RingOp::Fsync { file } => {
                trace!("wal ring fsync");
                if let Err(e) = file.sync_data() {
                    latch(e);
                }
            }
            RingOp::Barrier { done } => {
                let _ = done.send(());
            }
        }
    }
}
