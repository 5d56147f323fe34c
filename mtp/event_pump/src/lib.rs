//! The event pump: a background task polling the interrupt-in endpoint and
//! surfacing device events as a lazy, cancellable sequence.
//!
//! Each interrupt transfer carries one event container (response-shaped:
//! code plus up to three u32 parameters). Recognized codes decode to
//! [`MtpEvent`]; unknown codes are ignored. Consumers observe at-most-once
//! delivery per container; when the consumer falls far behind, the oldest
//! undelivered events are dropped rather than stalling the poll loop.
//!
//! The pump terminates when it is stopped, when the interrupt source dies
//! (link closed), or never starts at all when the policy says
//! `disable_event_pump`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, trace, warn};
use ptp_wire::{evt, Container};
use usb_transport::{InterruptPipe, TransportError};


/// Capacity of the pump-to-consumer buffer; beyond it the oldest events
/// are shed.
const QUEUE_CAP: usize = 256;

/// How often the iterator re-checks its cancel token while idle.
const IDLE_RECHECK: Duration = Duration::from_millis(100);

/// A device-originated event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MtpEvent {
    ObjectAdded(u32),
    ObjectRemoved(u32),
    ObjectInfoChanged(u32),
    StoreAdded(u32),
    StoreRemoved(u32),
    StorageInfoChanged(u32),
    DevicePropChanged(u16),
    DeviceInfoChanged,
    RequestObjectTransfer(u32),
    CancelTransaction { transaction_id: u32 },
}

/// Decodes a recognized event container; `None` for codes this runtime
/// does not track.
pub fn decode_event(container: &Container) -> Option<MtpEvent> {
    let p0 = container.param(0);
    match container.code {
        evt::OBJECT_ADDED => Some(MtpEvent::ObjectAdded(p0?)),
        evt::OBJECT_REMOVED => Some(MtpEvent::ObjectRemoved(p0?)),
        evt::OBJECT_INFO_CHANGED => Some(MtpEvent::ObjectInfoChanged(p0?)),
        evt::STORE_ADDED => Some(MtpEvent::StoreAdded(p0?)),
        evt::STORE_REMOVED => Some(MtpEvent::StoreRemoved(p0?)),
        evt::STORAGE_INFO_CHANGED => Some(MtpEvent::StorageInfoChanged(p0?)),
        evt::DEVICE_PROP_CHANGED => Some(MtpEvent::DevicePropChanged(p0? as u16)),
        evt::DEVICE_INFO_CHANGED => Some(MtpEvent::DeviceInfoChanged),
        evt::REQUEST_OBJECT_TRANSFER => Some(MtpEvent::RequestObjectTransfer(p0?)),
        evt::CANCEL_TRANSACTION => Some(MtpEvent::CancelTransaction {
            transaction_id: container.transaction_id,
        }),
        _ => None,
    }
}

/// Where interrupt transfers come from. The USB transport's
/// [`InterruptPipe`] is the real source; tests substitute the virtual
/// device.
pub trait InterruptSource: Send + 'static {
    /// One poll. `Ok(None)` is an empty poll (timeout with no event).
    fn read_event(&self, buf: &mut [u8], timeout: Duration)
        -> Result<Option<usize>, TransportError>;
}

impl InterruptSource for InterruptPipe {
    fn read_event(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>, TransportError> {
        self.read(buf, timeout)
    }
}

impl InterruptSource for Box<dyn InterruptSource> {
    fn read_event(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>, TransportError> {
        (**self).read_event(buf, timeout)
    }
}

/// The running pump. Dropping it (or calling [`EventPump::stop`]) cancels
/// the poll task; a pending interrupt read unblocks at its next poll
/// timeout.
pub struct EventPump {
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl EventPump {
    /// Starts polling `source` every `poll_interval`, yielding the event
    /// sequence alongside the pump handle.
    pub fn start<S: InterruptSource>(source: S, poll_interval: Duration) -> (EventPump, Events) {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(QUEUE_CAP);
        let worker = {
            let cancel = Arc::clone(&cancel);
            // The poll loop keeps its own receiver handle so it can evict
            // the oldest undelivered event when the buffer fills.
            let evict = rx.clone();
            thread::Builder::new()
                .name("mtp-event-pump".into())
                .spawn(move || poll_loop(source, poll_interval, tx, evict, cancel))
                .ok()
        };
        if worker.is_none() {
            warn!("could not spawn the event pump thread");
        }
        (
            EventPump {
                cancel: Arc::clone(&cancel),
                worker,
            },
            Events { rx, cancel },
        )
    }

    /// Stops the pump and waits for the poll task to exit.
    pub fn stop(mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn poll_loop<S: InterruptSource>(
    source: S,
    poll_interval: Duration,
    tx: Sender<MtpEvent>,
    evict: Receiver<MtpEvent>,
    cancel: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 64];
    debug!("event pump started (poll every {poll_interval:?})");
    while !cancel.load(Ordering::Relaxed) {
        match source.read_event(&mut buf, poll_interval) {
            Ok(None) => continue,
            Ok(Some(n)) => {
                let container = match Container::decode(&buf[..n]) {
                    Ok(c) => c,
                    Err(e) => {
                        trace!("undecodable interrupt transfer ({n} bytes): {e}");
                        continue;
                    }
                };
                let Some(event) = decode_event(&container) else {
                    trace!(
                        "ignoring unrecognized event {:#06x} ({})",
                        container.code,
                        ptp_wire::evt::name(container.code)
                    );
                    continue;
                };
                trace!("event: {event:?}");
                match tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        // Shed the oldest undelivered event to make room
                        // for the new one.
                        if let Ok(shed) = evict.try_recv() {
                            warn!("event queue full; dropped oldest undelivered {shed:?}");
                        }
                        match tx.try_send(event) {
                            Ok(()) => {}
                            Err(TrySendError::Full(event)) => {
                                warn!("event queue still full; dropping {event:?}")
                            }
                            Err(TrySendError::Disconnected(_)) => break,
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Err(e) => {
                debug!("event pump stopping: {e}");
                break;
            }
        }
    }
    debug!("event pump stopped");
}

/// The lazy event sequence. Iteration blocks until an event arrives, the
/// pump is cancelled, or the source dies; the cancel token is observed
/// between yields.
pub struct Events {
    rx: Receiver<MtpEvent>,
    cancel: Arc<AtomicBool>,
}

impl Iterator for Events {
    type Item = MtpEvent;

    fn next(&mut self) -> Option<MtpEvent> {
        loop {
            match self.rx.recv_timeout(IDLE_RECHECK) {
                Ok(event) => return Some(event),
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel.load(Ordering::Relaxed) && self.rx.is_empty() {
                        return None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}
