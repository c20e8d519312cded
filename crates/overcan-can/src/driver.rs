use std::time::Duration;

use crate::{BusAlert, CanFrame};

/// Errors surfaced by a [CanDriver]
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CanError {
    /// The deadline elapsed before a frame or alert was available
    #[error("timed out waiting on the controller")]
    Timeout,
    /// The controller is installed but not started
    #[error("controller is not running")]
    NotRunning,
    /// The controller is gone (driver uninstalled, bus torn down)
    #[error("controller is detached from the bus")]
    Detached,
}

/// The raw CAN controller seam
///
/// This is everything the transport needs from a controller: blocking frame I/O, an alert
/// subscription, and the bus-off recovery entry points. One instance is shared between the
/// transport daemon and the bus watchdog, so every operation takes `&self`.
///
/// Timeouts may be arbitrarily large ([Duration::MAX] means "block forever"); implementations
/// must saturate rather than panic on deadline arithmetic.
pub trait CanDriver: Send + Sync {
    /// Hand a frame to the controller, blocking until it is accepted for transmission
    fn transmit(&self, frame: &CanFrame, timeout: Duration) -> Result<(), CanError>;

    /// Wait for the next received frame
    fn receive(&self, timeout: Duration) -> Result<CanFrame, CanError>;

    /// Replace the set of alert conditions [read_alerts](Self::read_alerts) reports
    fn reconfigure_alerts(&self, alerts: BusAlert);

    /// Block until at least one subscribed alert condition fires
    fn read_alerts(&self, timeout: Duration) -> Result<BusAlert, CanError>;

    /// Begin bus-off recovery; the controller waits for 128 bus-free sequences
    fn initiate_recovery(&self);

    /// (Re)start the controller after installation or a completed recovery
    fn start(&self) -> Result<(), CanError>;
}
