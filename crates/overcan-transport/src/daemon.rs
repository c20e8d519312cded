//! The transport daemon event loop
//!
//! One thread owns the ISO-TP link: it runs the address handshake, dispatches inbound frames,
//! paces the link, hands completed transfers to the inbound queue, and retires outbound
//! requests one at a time.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use overcan_can::{CanDriver, CanError, CanFrame};
use overcan_isotp::{FrameSink, IsoTpLink, ReceiveStatus, SendStatus, SinkError};
use rand::Rng;

use crate::addr::obtain_address;
use crate::packet::{Packet, PacketQueue};
use crate::sync::{CompletionSlot, DaemonState, StateCell, Stop};
use crate::wire::{self, BROADCAST, MASTER, MsgType};
use crate::{TransportConfig, TransportError};

/// One queued `send` call: the payload and the caller's wake-up
pub(crate) struct OutboundRequest {
    pub(crate) payload: Vec<u8>,
    pub(crate) completion: Arc<CompletionSlot>,
}

/// State shared between the daemon thread, the watchdog thread, and the public surface
pub(crate) struct Shared {
    pub(crate) driver: Arc<dyn CanDriver>,
    pub(crate) config: TransportConfig,
    pub(crate) state: StateCell,
    pub(crate) inbound: PacketQueue,
    pub(crate) stop: Arc<Stop>,
}

/// Stamps fresh randomness into the seed bits and blocks until the controller takes the frame
struct SeededSink<'a> {
    driver: &'a dyn CanDriver,
}

impl FrameSink for SeededSink<'_> {
    fn send_frame(&mut self, id: u32, data: &[u8]) -> Result<(), SinkError> {
        let id = wire::seeded(id, rand::rng().random());
        let frame = CanFrame::extended(id, data);
        self.driver.transmit(&frame, Duration::MAX).map_err(|err| {
            tracing::error!("failed to transmit frame: {err}");
            SinkError
        })
    }
}

pub(crate) struct Daemon {
    shared: Arc<Shared>,
    outbound: Receiver<OutboundRequest>,
    link: IsoTpLink,
    address: u8,
    in_flight: Option<OutboundRequest>,
    last_send_status: SendStatus,
}

enum Dispatch {
    Handled,
    /// The master demanded re-acquisition
    Readdress,
}

impl Daemon {
    pub(crate) fn new(shared: Arc<Shared>, outbound: Receiver<OutboundRequest>) -> Self {
        Self {
            shared,
            outbound,
            link: IsoTpLink::new(0x000),
            address: BROADCAST,
            in_flight: None,
            last_send_status: SendStatus::Idle,
        }
    }

    pub(crate) fn run(mut self) {
        tracing::info!("transport daemon started");
        while !self.shared.stop.requested() {
            if self.shared.state.get() == DaemonState::ObtainingAddress {
                // Whatever was in flight died with the old address
                self.finish_in_flight(Err(TransportError::Fail));
                self.link.reset(0x000);
                self.last_send_status = SendStatus::Idle;

                let Some(address) =
                    obtain_address(&*self.shared.driver, &self.shared.config, &self.shared.stop)
                else {
                    break;
                };
                self.address = address;
                self.link
                    .set_tx_id(wire::encode_id(MsgType::IsoTp, address, MASTER));
                self.shared.state.set(DaemonState::Serving);
                continue;
            }
            self.serve();
        }

        // Nothing will ever complete these; fail them so no caller hangs
        self.finish_in_flight(Err(TransportError::Fail));
        while let Ok(request) = self.outbound.try_recv() {
            request.completion.complete(Err(TransportError::Fail));
        }
        tracing::info!("transport daemon stopped");
    }

    /// One serving iteration: receive, dispatch, pace the link, retire completions
    fn serve(&mut self) {
        let config = &self.shared.config;
        // Spin faster while a segmented send wants flow control serviced promptly
        let recv_timeout = if self.link.send_status() == SendStatus::InProgress {
            config.busy_recv_timeout
        } else {
            config.idle_recv_timeout
        };

        match self.shared.driver.receive(recv_timeout) {
            Ok(frame) => {
                if let Dispatch::Readdress = self.dispatch(frame) {
                    self.shared.state.set(DaemonState::ObtainingAddress);
                    self.finish_in_flight(Err(TransportError::Fail));
                    return;
                }
            }
            Err(CanError::Timeout) => {}
            Err(err) => {
                // Back off without skipping the link poll below; protocol timers keep
                // running while the controller is faulting
                tracing::error!("controller receive fault: {err}");
                self.shared.stop.sleep(self.shared.config.fault_backoff);
            }
        }

        let mut sink = SeededSink {
            driver: &*self.shared.driver,
        };
        self.link.poll(&mut sink);

        if let Some(payload) = self.link.receive() {
            if let Err(err) = self.deliver_inbound(payload) {
                tracing::error!("dropping inbound packet: {err}");
            }
        }

        if self.last_send_status == SendStatus::InProgress
            && self.link.send_status() != SendStatus::InProgress
        {
            let result = match self.link.send_status() {
                SendStatus::Idle => Ok(()),
                _ => {
                    tracing::error!("segmented send failed: {:?}", self.link.last_error());
                    Err(TransportError::Fail)
                }
            };
            self.finish_in_flight(result);
        }
        self.last_send_status = self.link.send_status();

        if self.link.send_status() != SendStatus::InProgress
            && self.link.receive_status() != ReceiveStatus::InProgress
            && let Ok(request) = self.outbound.try_recv()
        {
            let mut sink = SeededSink {
                driver: &*self.shared.driver,
            };
            match self.link.send(&request.payload, &mut sink) {
                Err(err) => {
                    tracing::error!("link rejected send of {} bytes: {err}", request.payload.len());
                    request.completion.complete(Err(TransportError::Fail));
                }
                Ok(()) if self.link.send_status() != SendStatus::InProgress => {
                    // Single frame, already on the wire
                    tracing::debug!("packet sent: {} bytes", request.payload.len());
                    request.completion.complete(Ok(()));
                }
                Ok(()) => {
                    self.in_flight = Some(request);
                    self.last_send_status = SendStatus::InProgress;
                }
            }
        }
    }

    /// Filter one received frame down to the ISO-TP link
    fn dispatch(&mut self, frame: CanFrame) -> Dispatch {
        if !frame.is_extended() || frame.is_rtr() {
            return Dispatch::Handled;
        }
        let id = frame.id();
        if wire::src(id) != MASTER {
            // Only the master talks to us
            return Dispatch::Handled;
        }
        let dst = wire::dst(id);
        if dst != self.address && dst != BROADCAST {
            return Dispatch::Handled;
        }
        match wire::msg_type(id) {
            Some(MsgType::AddressRequest) => {
                tracing::info!("master demanded re-addressing");
                Dispatch::Readdress
            }
            _ if dst == BROADCAST => {
                tracing::warn!("unexpected broadcast that is not an address request");
                Dispatch::Handled
            }
            _ => {
                let mut sink = SeededSink {
                    driver: &*self.shared.driver,
                };
                if let Err(err) = self.link.on_frame(frame.data(), &mut sink) {
                    tracing::debug!("link refused frame: {err}");
                }
                Dispatch::Handled
            }
        }
    }

    /// Copy a completed transfer into an owned packet and offer it to the inbound queue
    fn deliver_inbound(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut packet = Packet::alloc(payload.len());
        if !packet.append(&payload) {
            return Err(TransportError::OutOfMemory);
        }
        tracing::debug!("packet received: {} bytes", packet.size());
        self.shared
            .inbound
            .push(packet)
            .map_err(|_| TransportError::OutOfMemory)
    }

    fn finish_in_flight(&mut self, result: Result<(), TransportError>) {
        if let Some(request) = self.in_flight.take() {
            match result {
                Ok(()) => tracing::debug!("packet sent: {} bytes", request.payload.len()),
                Err(err) => {
                    tracing::error!("send of {} bytes failed: {err}", request.payload.len())
                }
            }
            request.completion.complete(result);
        }
    }
}
