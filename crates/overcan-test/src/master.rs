//! A scripted master node for exercising the node-side wire contract
//!
//! The real master lives on different hardware entirely; this one answers address requests
//! according to a [MasterScript], reassembles node transfers, and can echo them back or demand
//! re-addressing mid-stream.

use std::collections::{HashMap, VecDeque};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use overcan_can::{CanDriver, CanFrame, MemoryBus, MemoryCan};
use overcan_isotp::{FrameSink, IsoTpLink, SendStatus, SinkError};
use overcan_transport::wire::{
    self, AddressRequest, AddressResponse, BROADCAST, MASTER, MsgType,
};

/// How the master answers the bus
#[derive(Clone, Copy, Debug)]
pub struct MasterScript {
    /// Address handed to the first node; later assignments count up from here
    pub first_address: u8,
    /// Status byte in every address response; non-zero refuses the request
    pub status: u8,
    /// Echo completed transfers back to their sender
    pub echo: bool,
    /// Participate in ISO-TP at all; when false node frames are ignored (no flow control)
    pub accept_transfers: bool,
}

impl Default for MasterScript {
    fn default() -> Self {
        Self {
            first_address: 0x07,
            status: 0,
            echo: true,
            accept_transfers: true,
        }
    }
}

enum Command {
    Readdress,
    Stop,
}

/// Handle to a master thread attached to a [MemoryBus]
pub struct ScriptedMaster {
    commands: Sender<Command>,
    transfers: Receiver<Vec<u8>>,
    handle: Option<JoinHandle<()>>,
}

impl ScriptedMaster {
    pub fn spawn(bus: &MemoryBus, script: MasterScript) -> Self {
        let endpoint = bus.endpoint();
        let (command_tx, command_rx) = unbounded();
        let (transfer_tx, transfer_rx) = unbounded();
        let handle = std::thread::spawn(move || {
            MasterLoop {
                endpoint,
                script,
                commands: command_rx,
                transfers: transfer_tx,
                links: HashMap::new(),
                next_address: script.first_address,
            }
            .run()
        });
        Self {
            commands: command_tx,
            transfers: transfer_rx,
            handle: Some(handle),
        }
    }

    /// Broadcast an `ADDRESS_REQUEST`, forcing every node back into acquisition
    pub fn readdress(&self) {
        let _ = self.commands.send(Command::Readdress);
    }

    /// Next transfer the master fully reassembled from any node
    pub fn recv_transfer(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.transfers.recv_timeout(timeout).ok()
    }
}

impl Drop for ScriptedMaster {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct NodeLink {
    link: IsoTpLink,
    pending_echo: VecDeque<Vec<u8>>,
}

struct MasterSink<'a> {
    endpoint: &'a MemoryCan,
}

impl FrameSink for MasterSink<'_> {
    fn send_frame(&mut self, id: u32, data: &[u8]) -> Result<(), SinkError> {
        let frame = CanFrame::extended(id, data);
        self.endpoint
            .transmit(&frame, Duration::MAX)
            .map_err(|_| SinkError)
    }
}

struct MasterLoop {
    endpoint: MemoryCan,
    script: MasterScript,
    commands: Receiver<Command>,
    transfers: Sender<Vec<u8>>,
    links: HashMap<u8, NodeLink>,
    next_address: u8,
}

impl MasterLoop {
    fn run(mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return,
                Ok(Command::Readdress) => {
                    let frame = CanFrame::extended(
                        wire::encode_id(MsgType::AddressRequest, MASTER, BROADCAST),
                        &[],
                    );
                    let _ = self.endpoint.transmit(&frame, Duration::MAX);
                }
                Err(TryRecvError::Empty) => {}
            }

            if let Ok(frame) = self.endpoint.receive(Duration::from_millis(10)) {
                self.handle_frame(frame);
            }
            self.pump_links();
        }
    }

    fn handle_frame(&mut self, frame: CanFrame) {
        if !frame.is_extended() || frame.is_rtr() {
            return;
        }
        let id = frame.id();
        if wire::dst(id) != MASTER {
            return;
        }
        match wire::msg_type(id) {
            Some(MsgType::AddressRequest) => self.assign_address(&frame),
            Some(MsgType::IsoTp) if self.script.accept_transfers => {
                let src = wire::src(id);
                let mut sink = MasterSink {
                    endpoint: &self.endpoint,
                };
                if let Some(node) = self.links.get_mut(&src) {
                    let _ = node.link.on_frame(frame.data(), &mut sink);
                } else {
                    tracing::warn!("transfer frame from unassigned node {src:#04X}");
                }
            }
            _ => {}
        }
    }

    fn assign_address(&mut self, frame: &CanFrame) {
        let Some(request) = AddressRequest::from_payload(frame.data()) else {
            return;
        };
        let response = AddressResponse {
            chip_id: request.chip_id,
            status: self.script.status,
            address: self.next_address,
        };
        let frame = CanFrame::extended(
            wire::encode_id(MsgType::AddressResponse, MASTER, BROADCAST),
            &response.to_payload(),
        );
        let _ = self.endpoint.transmit(&frame, Duration::MAX);
        if self.script.status == 0 {
            tracing::info!("assigned {:#04X}", self.next_address);
            self.links.insert(
                self.next_address,
                NodeLink {
                    link: IsoTpLink::new(wire::encode_id(
                        MsgType::IsoTp,
                        MASTER,
                        self.next_address,
                    )),
                    pending_echo: VecDeque::new(),
                },
            );
            self.next_address = self.next_address.wrapping_add(1);
        }
    }

    fn pump_links(&mut self) {
        let mut sink = MasterSink {
            endpoint: &self.endpoint,
        };
        for node in self.links.values_mut() {
            node.link.poll(&mut sink);
            if let Some(payload) = node.link.receive() {
                let _ = self.transfers.send(payload.clone());
                if self.script.echo {
                    node.pending_echo.push_back(payload);
                }
            }
            if node.link.send_status() != SendStatus::InProgress
                && let Some(payload) = node.pending_echo.front()
            {
                match node.link.send(payload, &mut sink) {
                    Ok(()) => {
                        node.pending_echo.pop_front();
                    }
                    Err(err) => {
                        tracing::warn!("echo send failed: {err}");
                        node.pending_echo.pop_front();
                    }
                }
            }
        }
    }
}
