//! Request dispatch worker pool
//!
//! Remapped requests are queued on a bounded channel and executed against
//! their device by a fixed set of worker threads. Each request is completed
//! by the worker that ran it. A full queue fails the request immediately
//! rather than blocking the submitter.

use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, info, warn};

use crate::SECTOR_SHIFT;
use crate::bio::{Bio, BioOp, BioResult};
use crate::remap::BioSubmitter;

/// Executes remapped requests on worker threads
pub struct IoDispatcher {
    tx: Option<Sender<Bio>>,
    workers: Vec<JoinHandle<()>>,
}

impl IoDispatcher {
    /// Start `workers` threads sharing a queue of `queue_depth` requests
    pub fn new(workers: usize, queue_depth: usize) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<Bio>(queue_depth.max(1));
        let workers = (0..workers.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("dmp-io-{i}"))
                    .spawn(move || worker_loop(&rx))
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        info!(workers = workers.len(), queue_depth, "I/O dispatcher started");
        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }
}

impl BioSubmitter for IoDispatcher {
    fn submit(&self, bio: Bio) {
        let Some(tx) = &self.tx else {
            bio.complete(Err(std::io::Error::other("dispatcher stopped")));
            return;
        };
        match tx.try_send(bio) {
            Ok(()) => {}
            Err(TrySendError::Full(bio)) => {
                warn!(sector = bio.sector(), "dispatch queue full, failing request");
                bio.complete(Err(std::io::Error::from(std::io::ErrorKind::WouldBlock)));
            }
            Err(TrySendError::Disconnected(bio)) => {
                bio.complete(Err(std::io::Error::other("dispatcher stopped")));
            }
        }
    }
}

impl Drop for IoDispatcher {
    fn drop(&mut self) {
        // Closing the channel lets workers drain what is queued and exit.
        self.tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("I/O worker panicked");
            }
        }
        debug!("I/O dispatcher stopped");
    }
}

fn worker_loop(rx: &Receiver<Bio>) {
    while let Ok(bio) = rx.recv() {
        let result = execute(&bio);
        if let Err(e) = &result {
            warn!(
                op = bio.op().as_str(),
                sector = bio.sector(),
                size = bio.size(),
                error = %e,
                "request failed"
            );
        }
        bio.complete(result);
    }
}

fn execute(bio: &Bio) -> BioResult {
    let device = bio
        .device()
        .ok_or_else(|| std::io::Error::other("request was not remapped"))?;
    let offset = bio
        .sector()
        .checked_mul(1 << SECTOR_SHIFT)
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    match bio.op() {
        BioOp::Read => {
            let mut buf = vec![0u8; bio.size() as usize];
            device.read_at(offset, &mut buf)?;
            Ok(Bytes::from(buf))
        }
        BioOp::Write => {
            device.write_at(offset, bio.payload())?;
            Ok(Bytes::new())
        }
        BioOp::Flush => {
            device.sync()?;
            Ok(Bytes::new())
        }
        BioOp::Discard | BioOp::WriteZeroes => {
            device.zero_range(offset, u64::from(bio.size()))?;
            Ok(Bytes::new())
        }
    }
}
