//! Bus health supervisor
//!
//! A second thread watches the controller's alert stream, logs error-state transitions, and
//! drives bus-off recovery. The daemon never hears about any of this directly; it observes
//! failures through its own transmit and receive errors.

use std::sync::Arc;
use std::time::Duration;

use overcan_can::{BusAlert, CanDriver, CanError};

use crate::sync::Stop;

/// The alert set a healthy controller is subscribed to
const SUPERVISED_ALERTS: BusAlert = BusAlert::ABOVE_ERR_WARN
    .union(BusAlert::BELOW_ERR_WARN)
    .union(BusAlert::ERR_PASSIVE)
    .union(BusAlert::ERR_ACTIVE)
    .union(BusAlert::BUS_OFF);

/// Slice alert reads so a stop request is noticed promptly
const READ_SLICE: Duration = Duration::from_millis(500);

pub(crate) fn run(driver: Arc<dyn CanDriver>, stop: Arc<Stop>) {
    tracing::info!("bus watchdog started");
    driver.reconfigure_alerts(SUPERVISED_ALERTS);

    while !stop.requested() {
        let alerts = match driver.read_alerts(READ_SLICE) {
            Ok(alerts) => alerts,
            Err(CanError::Timeout) => continue,
            Err(err) => {
                tracing::error!("failed to read controller alerts: {err}");
                stop.sleep(Duration::from_secs(1));
                continue;
            }
        };

        if alerts.contains(BusAlert::ABOVE_ERR_WARN) {
            tracing::info!("error counters above warning level");
        }
        if alerts.contains(BusAlert::ERR_PASSIVE) {
            tracing::info!("entered error-passive state");
        }
        if alerts.contains(BusAlert::ERR_ACTIVE) {
            tracing::info!("returned to error-active state");
        }
        if alerts.contains(BusAlert::BELOW_ERR_WARN) {
            tracing::info!("error counters below warning level");
        }
        if alerts.contains(BusAlert::BUS_OFF) {
            tracing::info!("bus-off, initiating recovery");
            // Nothing else matters until the 128 bus-free sequences show up
            driver.reconfigure_alerts(BusAlert::BUS_RECOVERED);
            driver.initiate_recovery();
        }
        if alerts.contains(BusAlert::BUS_RECOVERED) {
            tracing::info!("bus recovered");
            if let Err(err) = driver.start() {
                tracing::error!("failed to restart controller after recovery: {err}");
            }
            driver.reconfigure_alerts(SUPERVISED_ALERTS);
        }
    }
    tracing::info!("bus watchdog stopped");
}
