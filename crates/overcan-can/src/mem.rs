//! An in-process virtual bus
//!
//! Every [MemoryCan] endpoint attached to a [MemoryBus] sees every frame the other endpoints
//! transmit, like controllers in normal mode on a shared pair (a controller does not receive its
//! own frames). Alerts never fire on their own; tests inject them with [MemoryCan::raise_alert].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::{BusAlert, CanDriver, CanError, CanFrame};

#[derive(Default)]
struct BusInner {
    taps: Mutex<Vec<(usize, Sender<CanFrame>)>>,
    next_id: AtomicUsize,
}

/// Hub connecting [MemoryCan] endpoints
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint to the bus
    ///
    /// The endpoint comes up started, the way a freshly installed controller does after its
    /// driver calls start.
    pub fn endpoint(&self) -> MemoryCan {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.inner.taps.lock().push((id, tx));
        let (alert_tx, alert_rx) = unbounded();
        MemoryCan {
            id,
            bus: Arc::clone(&self.inner),
            rx,
            alert_tx,
            alert_rx,
            alert_mask: Mutex::new(BusAlert::empty()),
            started: AtomicBool::new(true),
            recovery_initiated: AtomicBool::new(false),
        }
    }
}

/// One endpoint of a [MemoryBus]
pub struct MemoryCan {
    id: usize,
    bus: Arc<BusInner>,
    rx: Receiver<CanFrame>,
    alert_tx: Sender<BusAlert>,
    alert_rx: Receiver<BusAlert>,
    alert_mask: Mutex<BusAlert>,
    started: AtomicBool,
    recovery_initiated: AtomicBool,
}

impl MemoryCan {
    /// Stop the endpoint, as a controller does when it goes bus-off
    pub fn stop(&self) {
        tracing::debug!("endpoint {} stopped", self.id);
        self.started.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn recovery_initiated(&self) -> bool {
        self.recovery_initiated.load(Ordering::SeqCst)
    }

    /// Inject alert conditions, filtered through the endpoint's configured alert mask
    pub fn raise_alert(&self, alerts: BusAlert) {
        let subscribed = alerts & *self.alert_mask.lock();
        if !subscribed.is_empty() {
            let _ = self.alert_tx.send(subscribed);
        }
    }
}

impl CanDriver for MemoryCan {
    fn transmit(&self, frame: &CanFrame, _timeout: Duration) -> Result<(), CanError> {
        if !self.is_started() {
            return Err(CanError::NotRunning);
        }
        let taps = self.bus.taps.lock();
        for (id, tap) in taps.iter() {
            if *id == self.id {
                continue;
            }
            // A dropped endpoint just stops listening
            let _ = tap.send(*frame);
        }
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<CanFrame, CanError> {
        if !self.is_started() {
            return Err(CanError::NotRunning);
        }
        self.rx.recv_timeout(timeout).map_err(|_| CanError::Timeout)
    }

    fn reconfigure_alerts(&self, alerts: BusAlert) {
        *self.alert_mask.lock() = alerts;
    }

    fn read_alerts(&self, timeout: Duration) -> Result<BusAlert, CanError> {
        self.alert_rx
            .recv_timeout(timeout)
            .map_err(|_| CanError::Timeout)
    }

    fn initiate_recovery(&self) {
        tracing::debug!("recovery initiated on endpoint {}", self.id);
        self.recovery_initiated.store(true, Ordering::SeqCst);
        // An otherwise idle in-process bus observes its 128 bus-free sequences immediately
        self.raise_alert(BusAlert::BUS_RECOVERED);
    }

    fn start(&self) -> Result<(), CanError> {
        self.started.store(true, Ordering::SeqCst);
        self.recovery_initiated.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MemoryCan {
    fn drop(&mut self) {
        self.bus.taps.lock().retain(|(id, _)| *id != self.id);
    }
}
