//! Outstanding requests of one transport, keyed by sequence number.
//!
//! A slot is inserted before the envelope is sent and removed when the
//! matching reply arrives. A reply with no slot is a protocol violation and
//! is reported as [`TransportError::UnexpectedResponse`]; the owner then
//! [poisons](PendingCalls::poison) the table and no further request is
//! accepted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::worker::protocol::{Reply, WorkerTag};

pub struct PendingCalls {
    worker: WorkerTag,
    slots: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    poisoned: AtomicBool,
}

impl PendingCalls {
    pub fn new(worker: WorkerTag) -> Self {
        Self {
            worker,
            slots: Mutex::new(HashMap::new()),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Register `seq` and return the receiver its reply will arrive on.
    pub fn insert(&self, seq: u64) -> Result<oneshot::Receiver<Reply>, TransportError> {
        let mut slots = self.lock();
        if self.is_poisoned() {
            return Err(TransportError::Poisoned {
                worker: self.worker.to_string(),
            });
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(seq, tx);
        Ok(rx)
    }

    /// Drop the slot for a request that never left the host.
    pub fn remove(&self, seq: u64) {
        self.lock().remove(&seq);
    }

    /// Hand `reply` to its waiting caller.
    pub fn complete(&self, reply: Reply) -> Result<(), TransportError> {
        let slot = self.lock().remove(&reply.seq);
        match slot {
            Some(tx) => {
                // The caller may have gone away; nothing to do then.
                let _ = tx.send(reply);
                Ok(())
            }
            None => Err(TransportError::UnexpectedResponse {
                worker: self.worker.to_string(),
                seq: reply.seq,
            }),
        }
    }

    /// Drop every slot. Waiting callers observe a disconnect.
    pub fn fail_all(&self) -> usize {
        let mut slots = self.lock();
        let count = slots.len();
        slots.clear();
        count
    }

    /// Refuse every later request and disconnect the waiting ones.
    pub fn poison(&self) -> usize {
        let mut slots = self.lock();
        self.poisoned.store(true, Ordering::SeqCst);
        let count = slots.len();
        slots.clear();
        count
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        // A poisoned map still holds valid senders.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
