//! Ordered execution stream.
//!
//! A [`Stream`] owns a submission thread that runs launched kernels one after
//! another on its [`Device`]. Launching never blocks the caller; the host only
//! waits at [`Stream::synchronize`] and at device-to-host copies
//! ([`Stream::read_scalar`], [`Stream::copy_to_host`]).
//!
//! A kernel that panics is treated as a failed device assertion: the fault
//! is recorded, every later kernel on the stream is skipped, and each
//! subsequent synchronization reports the same
//! [`KernelError::DeviceAssertion`]. A faulted stream cannot be recovered;
//! build a new one.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crossent_common::{KernelError, Result};

use crate::buffer::DeviceBuffer;
use crate::device::Device;

type Job = Box<dyn FnOnce(&Device) + Send + 'static>;

enum Command {
    Launch { kernel: &'static str, job: Job },
    Fence(Sender<()>),
}

/// Counters describing stream activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub kernels_launched: u64,
    pub kernels_completed: u64,
    pub kernels_skipped: u64,
    /// Host waits caused by device-to-host copies.
    pub host_syncs: u64,
}

#[derive(Default)]
struct Shared {
    fault: Mutex<Option<KernelError>>,
    launched: AtomicU64,
    completed: AtomicU64,
    skipped: AtomicU64,
    host_syncs: AtomicU64,
}

impl Shared {
    fn fault(&self) -> Option<KernelError> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record_fault(&self, err: KernelError) {
        let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

pub struct Stream {
    device: Arc<Device>,
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.device)
            .field("stats", &self.stats())
            .field("fault", &self.shared.fault())
            .finish()
    }
}

impl Stream {
    /// Create a stream bound to `device`.
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(Shared::default());
        let name = format!("{}-stream", device.config().thread_name_prefix);

        let worker = std::thread::Builder::new()
            .name(name)
            .spawn({
                let device = Arc::clone(&device);
                let shared = Arc::clone(&shared);
                move || run(&device, &shared, receiver)
            })
            .map_err(|e| KernelError::WorkerPool { reason: e.to_string() })?;

        Ok(Self { device, sender: Some(sender), worker: Some(worker), shared })
    }

    /// Enqueue `job` behind every previously launched kernel.
    pub fn launch<F>(&self, kernel: &'static str, job: F) -> Result<()>
    where
        F: FnOnce(&Device) + Send + 'static,
    {
        self.send(Command::Launch { kernel, job: Box::new(job) })?;
        self.shared.launched.fetch_add(1, Ordering::Relaxed);
        log::trace!("launched `{kernel}`");
        Ok(())
    }

    /// Block until all launched kernels have finished.
    pub fn synchronize(&self) -> Result<()> {
        let (ack, done) = mpsc::channel();
        self.send(Command::Fence(ack))?;
        done.recv().map_err(|_| KernelError::StreamClosed {
            reason: "stream worker exited before the fence".to_string(),
        })?;
        match self.shared.fault() {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    /// Copy element 0 of `buffer` to the host. Waits for the stream.
    pub fn read_scalar(&self, buffer: &DeviceBuffer<f32>) -> Result<f32> {
        if buffer.is_empty() {
            return Err(KernelError::InvalidArguments {
                reason: "cannot read a scalar from an empty buffer".to_string(),
            }
            .into());
        }
        self.synchronize()?;
        self.shared.host_syncs.fetch_add(1, Ordering::Relaxed);
        Ok(buffer.read()[0])
    }

    /// Copy the whole of `buffer` to the host. Waits for the stream.
    pub fn copy_to_host<T: Clone>(&self, buffer: &DeviceBuffer<T>) -> Result<Vec<T>> {
        self.synchronize()?;
        self.shared.host_syncs.fetch_add(1, Ordering::Relaxed);
        Ok(buffer.read().clone())
    }

    /// The sticky fault, if any kernel has failed.
    pub fn fault(&self) -> Option<KernelError> {
        self.shared.fault()
    }

    pub fn is_faulted(&self) -> bool {
        self.fault().is_some()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            kernels_launched: self.shared.launched.load(Ordering::Relaxed),
            kernels_completed: self.shared.completed.load(Ordering::Relaxed),
            kernels_skipped: self.shared.skipped.load(Ordering::Relaxed),
            host_syncs: self.shared.host_syncs.load(Ordering::Relaxed),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        let sender = self.sender.as_ref().ok_or_else(|| KernelError::StreamClosed {
            reason: "stream is shutting down".to_string(),
        })?;
        sender.send(command).map_err(|_| {
            KernelError::StreamClosed { reason: "stream worker is gone".to_string() }.into()
        })
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("stream worker panicked outside a kernel");
            }
        }
    }
}

fn run(device: &Device, shared: &Shared, receiver: Receiver<Command>) {
    for command in receiver {
        match command {
            Command::Launch { kernel, job } => {
                if shared.fault().is_some() {
                    shared.skipped.fetch_add(1, Ordering::Relaxed);
                    log::trace!("skipping `{kernel}` on faulted stream");
                    continue;
                }
                match panic::catch_unwind(AssertUnwindSafe(|| job(device))) {
                    Ok(()) => {
                        shared.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        log::warn!("device assertion in `{kernel}`: {message}");
                        shared.record_fault(KernelError::DeviceAssertion { kernel, message });
                    }
                }
            }
            Command::Fence(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "kernel panicked".to_string()
    }
}
