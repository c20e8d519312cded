use crate::{Clock, MonotonicClock};

/// Largest payload a single transfer can carry (12-bit first-frame length field)
pub const MAX_TRANSFER: usize = 4095;

/// Data bytes in a single frame after the one-byte PCI
const SF_MAX_DATA: usize = 7;
/// Data bytes in a first frame after the two-byte PCI
const FF_DATA: usize = 6;
/// Data bytes in a consecutive frame after the one-byte PCI
const CF_DATA: usize = 7;

/// Frames a receiver allows per flow-control burst; 0 would mean "no limit"
const BLOCK_SIZE: u8 = 8;
/// Minimum separation time advertised to senders
const ST_MIN: u8 = 0;

/// How long a sender waits for flow control (N_Bs)
const FLOW_CONTROL_TIMEOUT_US: u64 = 1_000_000;
/// How long a receiver waits between consecutive frames (N_Cr)
const CONSECUTIVE_TIMEOUT_US: u64 = 1_000_000;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

const FC_CONTINUE: u8 = 0x0;
const FC_WAIT: u8 = 0x1;
const FC_OVERFLOW: u8 = 0x2;

/// Where the link writes its frames
///
/// Implementations put up to 8 bytes on the wire under the given arbitration id, blocking until
/// the controller accepts the frame.
pub trait FrameSink {
    fn send_frame(&mut self, id: u32, data: &[u8]) -> Result<(), SinkError>;
}

/// The sink could not hand the frame to the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to hand frame to the CAN controller")]
pub struct SinkError;

/// Errors surfaced by an [IsoTpLink]
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IsoTpError {
    /// The payload exceeds [MAX_TRANSFER]
    #[error("payload of {size} bytes exceeds the {MAX_TRANSFER}-byte transfer bound")]
    Overflow { size: usize },
    /// A send is already in progress
    #[error("a send is already in progress")]
    SendInProgress,
    /// The controller refused a frame
    #[error(transparent)]
    Transmit(#[from] SinkError),
    /// The peer reported receive-buffer overflow in flow control
    #[error("peer flow control reported overflow")]
    FlowOverflow,
    /// A consecutive frame arrived out of order
    #[error("consecutive frame sequence number {got:#X}, expected {expected:#X}")]
    WrongSequence { got: u8, expected: u8 },
    /// No flow control arrived within N_Bs
    #[error("timed out waiting for flow control")]
    FlowControlTimeout,
    /// A frame that does not fit the current transfer state
    #[error("unexpected frame with PCI {pci:#X}")]
    UnexpectedFrame { pci: u8 },
}

/// Outbound transfer state, observable while the link segments a payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// No send in progress; the previous one (if any) completed
    Idle,
    /// A multi-frame send is being paced out
    InProgress,
    /// The previous send failed; cleared by the next send
    Error,
}

/// Inbound transfer state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveStatus {
    Idle,
    /// A multi-frame transfer is being reassembled
    InProgress,
    /// A completed payload is waiting for [IsoTpLink::receive]
    Full,
}

struct TxTransfer {
    payload: Vec<u8>,
    offset: usize,
    sn: u8,
    /// Frames left before the next flow control; `None` means the peer set no limit
    block_remaining: Option<u8>,
    st_min_us: u64,
    next_frame_at: u64,
    /// Set while waiting on the peer's flow control
    fc_deadline: Option<u64>,
}

struct RxTransfer {
    payload: Vec<u8>,
    expected: usize,
    sn: u8,
    since_flow_control: u8,
    deadline: u64,
}

/// One ISO 15765-2 link between this node and a single peer
///
/// The link is driven from the outside: feed inbound frames with [on_frame](Self::on_frame),
/// call [poll](Self::poll) periodically to pace multi-frame sends and expire protocol timers,
/// and drain completed inbound transfers with [receive](Self::receive).
///
/// Sends of at most 7 bytes complete synchronously inside [send](Self::send) and never leave
/// [SendStatus::Idle]. Larger payloads transition to [SendStatus::InProgress] and finish back at
/// `Idle` (success) or [SendStatus::Error] (failure) after some number of polls.
pub struct IsoTpLink {
    tx_id: u32,
    clock: Box<dyn Clock>,
    send_status: SendStatus,
    last_error: Option<IsoTpError>,
    tx: Option<TxTransfer>,
    rx: Option<RxTransfer>,
    /// Completed inbound payload awaiting [Self::receive]
    done: Option<Vec<u8>>,
}

impl IsoTpLink {
    /// Create a link transmitting under the given arbitration id
    pub fn new(tx_id: u32) -> Self {
        Self::with_clock(tx_id, Box::new(MonotonicClock::default()))
    }

    /// Create a link with an explicit [Clock], for driving protocol timers in tests
    pub fn with_clock(tx_id: u32, clock: Box<dyn Clock>) -> Self {
        Self {
            tx_id,
            clock,
            send_status: SendStatus::Idle,
            last_error: None,
            tx: None,
            rx: None,
            done: None,
        }
    }

    /// Abandon both directions and retarget the link
    pub fn reset(&mut self, tx_id: u32) {
        self.tx_id = tx_id;
        self.send_status = SendStatus::Idle;
        self.last_error = None;
        self.tx = None;
        self.rx = None;
        self.done = None;
    }

    #[inline]
    #[must_use]
    pub fn tx_id(&self) -> u32 {
        self.tx_id
    }

    /// Retarget outbound frames without touching transfer state
    pub fn set_tx_id(&mut self, tx_id: u32) {
        self.tx_id = tx_id;
    }

    #[inline]
    #[must_use]
    pub fn send_status(&self) -> SendStatus {
        self.send_status
    }

    #[inline]
    #[must_use]
    pub fn receive_status(&self) -> ReceiveStatus {
        if self.done.is_some() {
            ReceiveStatus::Full
        } else if self.rx.is_some() {
            ReceiveStatus::InProgress
        } else {
            ReceiveStatus::Idle
        }
    }

    /// The failure that terminated the most recent send, if any
    #[inline]
    #[must_use]
    pub fn last_error(&self) -> Option<IsoTpError> {
        self.last_error
    }

    /// Start sending a payload
    ///
    /// Payloads of at most 7 bytes go out as a single frame before this returns. Larger payloads
    /// emit their first frame here and are paced out by subsequent [poll](Self::poll)s.
    pub fn send(&mut self, payload: &[u8], sink: &mut dyn FrameSink) -> Result<(), IsoTpError> {
        if payload.len() > MAX_TRANSFER {
            return Err(IsoTpError::Overflow {
                size: payload.len(),
            });
        }
        if self.send_status == SendStatus::InProgress {
            return Err(IsoTpError::SendInProgress);
        }
        self.send_status = SendStatus::Idle;
        self.last_error = None;

        if payload.len() <= SF_MAX_DATA {
            let mut frame = [0u8; 8];
            frame[0] = (PCI_SINGLE << 4) | payload.len() as u8;
            frame[1..1 + payload.len()].copy_from_slice(payload);
            sink.send_frame(self.tx_id, &frame[..1 + payload.len()])?;
            tracing::trace!("SF sent: {} bytes", payload.len());
            return Ok(());
        }

        let mut frame = [0u8; 8];
        frame[0] = (PCI_FIRST << 4) | ((payload.len() >> 8) & 0xF) as u8;
        frame[1] = payload.len() as u8;
        frame[2..8].copy_from_slice(&payload[..FF_DATA]);
        sink.send_frame(self.tx_id, &frame)?;
        tracing::trace!("FF sent: {} bytes total", payload.len());

        let now = self.clock.now_micros();
        self.tx = Some(TxTransfer {
            payload: payload.to_vec(),
            offset: FF_DATA,
            sn: 1,
            block_remaining: None,
            st_min_us: 0,
            next_frame_at: now,
            fc_deadline: Some(now + FLOW_CONTROL_TIMEOUT_US),
        });
        self.send_status = SendStatus::InProgress;
        Ok(())
    }

    /// Feed one inbound frame's data bytes to the link
    ///
    /// First frames (and exhausted burst allowances) answer with flow control through `sink`.
    /// Errors describe protocol anomalies; the link has already recovered what state it can by
    /// the time one is returned.
    pub fn on_frame(&mut self, data: &[u8], sink: &mut dyn FrameSink) -> Result<(), IsoTpError> {
        let Some(&pci_byte) = data.first() else {
            return Ok(());
        };
        match pci_byte >> 4 {
            PCI_SINGLE => self.handle_single(data),
            PCI_FIRST => self.handle_first(data, sink),
            PCI_CONSECUTIVE => self.handle_consecutive(data, sink),
            PCI_FLOW_CONTROL => self.handle_flow_control(data),
            pci => Err(IsoTpError::UnexpectedFrame { pci }),
        }
    }

    /// Pace multi-frame sends and expire the protocol timers
    pub fn poll(&mut self, sink: &mut dyn FrameSink) {
        let now = self.clock.now_micros();
        self.poll_tx(now, sink);
        self.poll_rx(now);
    }

    /// Take a completed inbound payload, returning the receiver to idle
    pub fn receive(&mut self) -> Option<Vec<u8>> {
        self.done.take()
    }
}

/// Inbound frame handlers
impl IsoTpLink {
    fn handle_single(&mut self, data: &[u8]) -> Result<(), IsoTpError> {
        let len = (data[0] & 0xF) as usize;
        if len == 0 || len > SF_MAX_DATA || data.len() < 1 + len {
            return Err(IsoTpError::UnexpectedFrame { pci: data[0] });
        }
        if self.rx.take().is_some() {
            tracing::warn!("single frame interrupted an in-progress transfer");
        }
        if self.done.is_some() {
            tracing::warn!("unread inbound payload replaced by a new single frame");
        }
        self.done = Some(data[1..1 + len].to_vec());
        tracing::trace!("SF received: {len} bytes");
        Ok(())
    }

    fn handle_first(&mut self, data: &[u8], sink: &mut dyn FrameSink) -> Result<(), IsoTpError> {
        if data.len() < 8 {
            return Err(IsoTpError::UnexpectedFrame { pci: data[0] });
        }
        let expected = (((data[0] & 0xF) as usize) << 8) | data[1] as usize;
        if expected <= SF_MAX_DATA {
            // Would have fit in a single frame
            return Err(IsoTpError::UnexpectedFrame { pci: data[0] });
        }
        if self.rx.is_some() {
            tracing::warn!("first frame restarted an in-progress transfer");
        }
        let mut payload = Vec::with_capacity(expected);
        payload.extend_from_slice(&data[2..8]);
        self.rx = Some(RxTransfer {
            payload,
            expected,
            sn: 1,
            since_flow_control: 0,
            deadline: self.clock.now_micros() + CONSECUTIVE_TIMEOUT_US,
        });
        tracing::trace!("FF received: {expected} bytes expected");
        sink.send_frame(
            self.tx_id,
            &[(PCI_FLOW_CONTROL << 4) | FC_CONTINUE, BLOCK_SIZE, ST_MIN],
        )?;
        Ok(())
    }

    fn handle_consecutive(
        &mut self,
        data: &[u8],
        sink: &mut dyn FrameSink,
    ) -> Result<(), IsoTpError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(IsoTpError::UnexpectedFrame { pci: data[0] });
        };
        let sn = data[0] & 0xF;
        if sn != rx.sn {
            let expected = rx.sn;
            self.rx = None;
            return Err(IsoTpError::WrongSequence { got: sn, expected });
        }
        // Trailing padding past the announced length is not part of the payload
        let remaining = rx.expected - rx.payload.len();
        let take = usize::min(remaining, data.len() - 1);
        rx.payload.extend_from_slice(&data[1..1 + take]);
        rx.sn = (rx.sn + 1) & 0xF;
        rx.since_flow_control += 1;
        rx.deadline = self.clock.now_micros() + CONSECUTIVE_TIMEOUT_US;
        tracing::trace!(
            "CF received: sn {sn:#X}, {}/{} bytes",
            rx.payload.len(),
            rx.expected
        );

        let complete = rx.payload.len() == rx.expected;
        let burst_exhausted = rx.since_flow_control >= BLOCK_SIZE;
        if complete {
            if let Some(rx) = self.rx.take() {
                if self.done.is_some() {
                    tracing::warn!("unread inbound payload replaced by a completed transfer");
                }
                self.done = Some(rx.payload);
            }
        } else if burst_exhausted {
            if let Some(rx) = self.rx.as_mut() {
                rx.since_flow_control = 0;
            }
            sink.send_frame(
                self.tx_id,
                &[(PCI_FLOW_CONTROL << 4) | FC_CONTINUE, BLOCK_SIZE, ST_MIN],
            )?;
            tracing::trace!("FC sent: next block of {BLOCK_SIZE}");
        }
        Ok(())
    }

    fn handle_flow_control(&mut self, data: &[u8]) -> Result<(), IsoTpError> {
        if self.tx.is_none() {
            // Stale flow control from an abandoned transfer
            return Ok(());
        }
        if data.len() < 3 {
            return Err(IsoTpError::UnexpectedFrame { pci: data[0] });
        }
        let now = self.clock.now_micros();
        match data[0] & 0xF {
            FC_CONTINUE => {
                if let Some(tx) = self.tx.as_mut() {
                    tx.block_remaining = match data[1] {
                        0 => None,
                        bs => Some(bs),
                    };
                    tx.st_min_us = decode_st_min_us(data[2]);
                    tx.next_frame_at = now;
                    tx.fc_deadline = None;
                    tracing::trace!("FC received: bs {}, STmin {:#X}", data[1], data[2]);
                }
                Ok(())
            }
            FC_WAIT => {
                if let Some(tx) = self.tx.as_mut() {
                    tx.fc_deadline = Some(now + FLOW_CONTROL_TIMEOUT_US);
                    tracing::trace!("FC received: wait");
                }
                Ok(())
            }
            FC_OVERFLOW => {
                self.fail_send(IsoTpError::FlowOverflow);
                Err(IsoTpError::FlowOverflow)
            }
            _ => {
                let error = IsoTpError::UnexpectedFrame { pci: data[0] };
                self.fail_send(error);
                Err(error)
            }
        }
    }
}

/// Timer-driven progress
impl IsoTpLink {
    fn poll_tx(&mut self, now: u64, sink: &mut dyn FrameSink) {
        let Some(mut tx) = self.tx.take() else {
            return;
        };

        if let Some(deadline) = tx.fc_deadline {
            if now >= deadline {
                self.fail_send(IsoTpError::FlowControlTimeout);
            } else {
                self.tx = Some(tx);
            }
            return;
        }

        while now >= tx.next_frame_at {
            let take = usize::min(CF_DATA, tx.payload.len() - tx.offset);
            let mut frame = [0u8; 8];
            frame[0] = (PCI_CONSECUTIVE << 4) | tx.sn;
            frame[1..1 + take].copy_from_slice(&tx.payload[tx.offset..tx.offset + take]);
            if sink.send_frame(self.tx_id, &frame[..1 + take]).is_err() {
                self.fail_send(IsoTpError::Transmit(SinkError));
                return;
            }
            tx.offset += take;
            tx.sn = (tx.sn + 1) & 0xF;
            tx.next_frame_at = now + tx.st_min_us;

            if tx.offset == tx.payload.len() {
                tracing::trace!("send complete: {} bytes", tx.payload.len());
                self.send_status = SendStatus::Idle;
                return;
            }
            if let Some(remaining) = tx.block_remaining.as_mut() {
                *remaining -= 1;
                if *remaining == 0 {
                    tx.fc_deadline = Some(now + FLOW_CONTROL_TIMEOUT_US);
                    break;
                }
            }
            if tx.st_min_us > 0 {
                // Pick the rest of the burst up on a later poll
                break;
            }
        }
        self.tx = Some(tx);
    }

    fn poll_rx(&mut self, now: u64) {
        if let Some(rx) = self.rx.as_ref()
            && now >= rx.deadline
        {
            tracing::warn!(
                "receive abandoned after {}/{} bytes: no consecutive frame within N_Cr",
                rx.payload.len(),
                rx.expected,
            );
            self.rx = None;
        }
    }

    fn fail_send(&mut self, error: IsoTpError) {
        tracing::warn!("send failed: {error}");
        self.tx = None;
        self.send_status = SendStatus::Error;
        self.last_error = Some(error);
    }
}

/// Decode a flow-control STmin byte into microseconds
///
/// `0x00..=0x7F` are milliseconds, `0xF1..=0xF9` are 100-900 microseconds, everything else is
/// reserved and treated as the maximum.
fn decode_st_min_us(st_min: u8) -> u64 {
    match st_min {
        0x00..=0x7F => st_min as u64 * 1_000,
        0xF1..=0xF9 => (st_min - 0xF0) as u64 * 100,
        _ => 0x7F * 1_000,
    }
}
