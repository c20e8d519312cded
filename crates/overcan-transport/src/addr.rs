//! The node side of the address-assignment handshake
//!
//! A node broadcasts `ADDRESS_REQUEST` frames carrying its chip id and waits for the master's
//! matching `ADDRESS_RESPONSE`. There is no give-up path: the loop runs, with backoff, until an
//! address arrives or the transport is torn down.

use std::time::{Duration, Instant};

use overcan_can::{CanDriver, CanError, CanFrame};
use rand::Rng;

use crate::TransportConfig;
use crate::sync::Stop;
use crate::wire::{self, AddressResponse, BROADCAST, MASTER, MsgType};

/// Loop until the master assigns this node an address
///
/// Returns `None` only when `stop` is requested.
pub(crate) fn obtain_address(
    driver: &dyn CanDriver,
    config: &TransportConfig,
    stop: &Stop,
) -> Option<u8> {
    let request = CanFrame::extended(
        wire::encode_id(MsgType::AddressRequest, BROADCAST, MASTER),
        &config.chip_id,
    );
    tracing::info!(
        "obtaining address for chip {}",
        hex::encode_upper(config.chip_id)
    );

    loop {
        // Desynchronize from other nodes answering the same re-address broadcast
        let jitter_ms = rand::rng().random_range(0..config.request_jitter.as_millis().max(1));
        if stop.sleep(Duration::from_millis(jitter_ms as u64)) {
            return None;
        }

        if let Err(err) = driver.transmit(&request, Duration::MAX) {
            tracing::error!("failed to transmit address request: {err}; backing off");
            if stop.sleep(config.transmit_backoff) {
                return None;
            }
            continue;
        }
        tracing::debug!("address request sent");

        let window_start = Instant::now();
        while window_start.elapsed() < config.response_window {
            if stop.requested() {
                return None;
            }
            let frame = match driver.receive(config.response_slice) {
                Ok(frame) => frame,
                Err(CanError::Timeout) => continue,
                Err(err) => {
                    tracing::warn!("failed to receive address response: {err}");
                    continue;
                }
            };
            match check_response(&frame, &config.chip_id) {
                ResponseCheck::NotOurs => continue,
                ResponseCheck::Rejected(status) => {
                    tracing::error!(
                        "address request rejected with status {status}; backing off"
                    );
                    if stop.sleep(config.rejection_backoff) {
                        return None;
                    }
                    // Start over with a fresh request
                    break;
                }
                ResponseCheck::Assigned(address) => {
                    tracing::info!("address assigned: {address:#04X}");
                    return Some(address);
                }
            }
        }
        // Window elapsed without a verdict: retransmit
    }
}

enum ResponseCheck {
    NotOurs,
    Rejected(u8),
    Assigned(u8),
}

fn check_response(frame: &CanFrame, chip_id: &[u8; 6]) -> ResponseCheck {
    if !frame.is_extended() || frame.is_rtr() {
        tracing::warn!(
            "undesired frame during address handshake: extended {}, rtr {}",
            frame.is_extended(),
            frame.is_rtr()
        );
        return ResponseCheck::NotOurs;
    }
    let id = frame.id();
    if wire::msg_type(id) != Some(MsgType::AddressResponse)
        || wire::src(id) != MASTER
        || wire::dst(id) != BROADCAST
    {
        return ResponseCheck::NotOurs;
    }
    let Some(response) = AddressResponse::from_payload(frame.data()) else {
        return ResponseCheck::NotOurs;
    };
    if &response.chip_id != chip_id {
        // Another node's assignment
        return ResponseCheck::NotOurs;
    }
    if response.status != 0 {
        ResponseCheck::Rejected(response.status)
    } else {
        ResponseCheck::Assigned(response.address)
    }
}
