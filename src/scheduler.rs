//! Threaded driver for a [Kernel].
//!
//! [spawn_engine] starts four named worker threads sharing the kernel behind a mutex:
//!
//! | Thread              | Work per cycle                                             |
//! |---------------------|------------------------------------------------------------|
//! | `cfdp-inbound-read` | moves PDUs from the [PduReceiver] into the inbound queue   |
//! | `cfdp-inbound`      | routes all queued inbound PDUs to their machines           |
//! | `cfdp-outbound`     | hands all queued outbound PDUs to the [PduTransmitter]     |
//! | `cfdp-tick`         | calls [Kernel::tick]                                       |
//!
//! Every machine step happens while the kernel lock is held, so one transaction is never
//! driven by two threads at once. Errors are logged and the loops continue.
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    filestore::VirtualFilestore,
    kernel::Kernel,
    transport::{PduReceiver, PduTransmitter, TransportError},
    user::CfdpUser,
    UserFaultHook,
};

pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(20);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Sleep of the queue loops after a cycle without work.
    pub idle_sleep: Duration,
    /// Sleep between two transaction ticks.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_sleep: DEFAULT_IDLE_SLEEP,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

pub type SharedKernel<Vfs, User, Hook> = Arc<Mutex<Kernel<Vfs, User, Hook>>>;

fn lock<Vfs, User, Hook>(
    kernel: &Mutex<Kernel<Vfs, User, Hook>>,
) -> MutexGuard<'_, Kernel<Vfs, User, Hook>>
where
    Vfs: VirtualFilestore,
    User: CfdpUser,
    Hook: UserFaultHook,
{
    // Poisoned locks are recovered, the kernel state stays usable.
    kernel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct EngineHandle<Vfs: VirtualFilestore, User: CfdpUser, Hook: UserFaultHook> {
    kernel: SharedKernel<Vfs, User, Hook>,
    stop_signal: Arc<AtomicBool>,
    join_handles: Vec<JoinHandle<()>>,
}

impl<Vfs, User, Hook> EngineHandle<Vfs, User, Hook>
where
    Vfs: VirtualFilestore,
    User: CfdpUser,
    Hook: UserFaultHook,
{
    pub fn kernel(&self) -> SharedKernel<Vfs, User, Hook> {
        self.kernel.clone()
    }

    /// Runs the closure with the kernel locked, for requests and inspection.
    pub fn with_kernel<R>(&self, f: impl FnOnce(&mut Kernel<Vfs, User, Hook>) -> R) -> R {
        f(&mut lock(&self.kernel))
    }

    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_signal.load(Ordering::Relaxed)
    }

    /// Stops all threads and waits for them.
    pub fn join(mut self) {
        self.stop();
        for join_handle in self.join_handles.drain(..) {
            let name = join_handle.thread().name().map(str::to_string);
            if join_handle.join().is_err() {
                log::error!("engine thread {name:?} panicked");
            }
        }
    }
}

pub fn spawn_engine<Vfs, User, Hook, Receiver, Transmitter>(
    kernel: Kernel<Vfs, User, Hook>,
    mut receiver: Receiver,
    mut transmitter: Transmitter,
    cfg: SchedulerConfig,
) -> Result<EngineHandle<Vfs, User, Hook>, io::Error>
where
    Vfs: VirtualFilestore + Send + 'static,
    User: CfdpUser + Send + 'static,
    Hook: UserFaultHook + Send + 'static,
    Receiver: PduReceiver + Send + 'static,
    Transmitter: PduTransmitter + Send + 'static,
{
    let inbound_tx = kernel.inbound_sender();
    let kernel = Arc::new(Mutex::new(kernel));
    let stop_signal = Arc::new(AtomicBool::new(false));
    let mut join_handles = Vec::new();

    let stop = stop_signal.clone();
    join_handles.push(
        thread::Builder::new()
            .name("cfdp-inbound-read".to_string())
            .spawn(move || {
                let mut disconnected = false;
                while !stop.load(Ordering::Relaxed) {
                    match receiver.receive() {
                        Ok(Some(raw_pdu)) => {
                            if inbound_tx.send(raw_pdu).is_err() {
                                log::error!("inbound queue closed");
                                break;
                            }
                            continue;
                        }
                        Ok(None) => (),
                        Err(TransportError::Disconnected) => {
                            if !disconnected {
                                log::warn!("transport receiver disconnected");
                                disconnected = true;
                            }
                        }
                        Err(e) => log::error!("transport receive error: {e}"),
                    }
                    thread::sleep(cfg.idle_sleep);
                }
            })?,
    );

    let stop = stop_signal.clone();
    let inbound_kernel = kernel.clone();
    join_handles.push(
        thread::Builder::new()
            .name("cfdp-inbound".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let mut handled = 0;
                    while let Some(outcome) = lock(&inbound_kernel).dispatch_inbound() {
                        log::trace!("inbound PDU: {outcome:?}");
                        handled += 1;
                    }
                    if handled == 0 {
                        thread::sleep(cfg.idle_sleep);
                    }
                }
            })?,
    );

    let stop = stop_signal.clone();
    let outbound_kernel = kernel.clone();
    join_handles.push(
        thread::Builder::new()
            .name("cfdp-outbound".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let mut sent = 0;
                    loop {
                        // The lock is released before the transport call.
                        let next = lock(&outbound_kernel).next_outbound();
                        let pdu = match next {
                            Some(pdu) => pdu,
                            None => break,
                        };
                        if let Err(e) = transmitter.transmit(&pdu) {
                            log::error!("transport transmit error: {e}");
                        }
                        sent += 1;
                    }
                    if sent == 0 {
                        thread::sleep(cfg.idle_sleep);
                    }
                }
            })?,
    );

    let stop = stop_signal.clone();
    let tick_kernel = kernel.clone();
    join_handles.push(
        thread::Builder::new()
            .name("cfdp-tick".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    lock(&tick_kernel).tick();
                    thread::sleep(cfg.tick_interval);
                }
            })?,
    );

    Ok(EngineHandle {
        kernel,
        stop_signal,
        join_handles,
    })
}
