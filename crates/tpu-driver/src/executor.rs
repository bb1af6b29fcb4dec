//! Single-consumer callback executor
//!
//! Timer threads never run user code. They post jobs here and one
//! dedicated thread runs them in order, with no watchdog lock held.

use crate::error::{Result, TpuError};
use crossbeam_channel::{unbounded, Sender};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Dedicated thread draining a FIFO of callbacks
#[derive(Debug)]
pub(crate) struct CallbackExecutor {
    name: String,
    sender: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl CallbackExecutor {
    /// Spawn the executor thread
    pub(crate) fn spawn(name: &str) -> Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .map_err(|e| TpuError::unknown(format!("failed to spawn {name}: {e}")))?;
        let thread_id = handle.thread().id();
        Ok(Self {
            name: name.to_owned(),
            sender: Some(sender),
            handle: Some(handle),
            thread_id,
        })
    }

    /// A sender other threads can post jobs through
    pub(crate) fn sender(&self) -> Option<Sender<Job>> {
        self.sender.clone()
    }

    /// Queue `job` behind everything already posted
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            if sender.send(Box::new(job)).is_err() {
                debug!("{}: executor gone, dropping callback", self.name);
            }
        }
    }
}

impl Drop for CallbackExecutor {
    fn drop(&mut self) {
        // Closing the channel ends the consumer loop once the backlog drains.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if thread::current().id() == self.thread_id {
                // Last owner released from inside one of our own callbacks.
                debug!("{}: detaching executor from its own thread", self.name);
                return;
            }
            let _ = handle.join();
        }
    }
}
