//! The public blocking transport surface

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use overcan_can::CanDriver;
use parking_lot::Mutex;

use crate::daemon::{Daemon, OutboundRequest, Shared};
use crate::packet::{Packet, PacketQueue};
use crate::sync::{CompletionSlot, DaemonState, StateCell, Stop};
use crate::{TransportConfig, TransportError, watchdog};

/// Largest payload one `send` may carry
pub const MAX_PACKET_SIZE: usize = 4094;

/// Partially drained inbound packet
struct ReceiveCursor {
    packet: Packet,
    offset: usize,
}

/// One node's transport to the master
///
/// Owns the daemon and watchdog threads. Construct it once per node with
/// [start](Self::start); dropping it tears both threads down.
///
/// The receive cursor assumes a single reader, and the one-deep outbound queue serializes
/// senders; concurrent callers are safe but will take turns.
pub struct CanTransport {
    shared: Arc<Shared>,
    outbound: Sender<OutboundRequest>,
    cursor: Mutex<Option<ReceiveCursor>>,
    daemon: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

impl CanTransport {
    /// Spawn the transport daemon and bus watchdog over a started controller
    ///
    /// The daemon begins acquiring an address immediately; [connect](Self::connect) observes
    /// the result.
    pub fn start(
        driver: Arc<dyn CanDriver>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        tracing::info!("starting CAN transport");
        let inbound = PacketQueue::new(config.inbound_max_packets, config.inbound_max_bytes);
        let stop = Arc::new(Stop::new());
        let shared = Arc::new(Shared {
            driver,
            config,
            state: StateCell::new(),
            inbound,
            stop: Arc::clone(&stop),
        });

        // One slot: at most one send in flight per node
        let (out_tx, out_rx) = crossbeam_channel::bounded(1);

        let daemon = Daemon::new(Arc::clone(&shared), out_rx);
        let daemon = thread::Builder::new()
            .name("overcan-daemon".into())
            .spawn(move || daemon.run())
            .map_err(|_| TransportError::OutOfMemory)?;

        let watchdog = {
            let driver = Arc::clone(&shared.driver);
            thread::Builder::new()
                .name("overcan-watchdog".into())
                .spawn(move || watchdog::run(driver, stop))
                .map_err(|_| TransportError::OutOfMemory)?
        };

        Ok(Self {
            shared,
            outbound: out_tx,
            cursor: Mutex::new(None),
            daemon: Some(daemon),
            watchdog: Some(watchdog),
        })
    }

    /// Force address (re)acquisition and wait until the node is serving
    pub fn connect(&self, timeout: Duration) -> Result<(), TransportError> {
        self.shared.state.set(DaemonState::ObtainingAddress);
        if self.shared.state.wait_for(DaemonState::Serving, timeout) {
            Ok(())
        } else {
            Err(TransportError::Timeout)
        }
    }

    /// Send one packet to the master
    ///
    /// `timeout` bounds only admission to the outbound queue. Once queued, the call blocks
    /// until the daemon delivers a verdict; the only exits are success, a wire failure, or
    /// master-initiated re-addressing.
    pub fn send(&self, payload: &[u8], timeout: Duration) -> Result<(), TransportError> {
        if self.shared.state.get() != DaemonState::Serving {
            return Err(TransportError::InvalidState);
        }
        if payload.len() > MAX_PACKET_SIZE {
            return Err(TransportError::InvalidSize {
                size: payload.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        let completion = Arc::new(CompletionSlot::new());
        let request = OutboundRequest {
            payload: payload.to_vec(),
            completion: Arc::clone(&completion),
        };
        match self.outbound.send_timeout(request, timeout) {
            Ok(()) => {}
            Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => {
                return Err(TransportError::Timeout);
            }
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                return Err(TransportError::Fail);
            }
        }
        completion.wait()
    }

    /// Read from the inbound packet stream
    ///
    /// Pops the next packet when the cursor is empty (waiting up to `timeout`), then drains it
    /// across however many reads it takes. Returns the number of bytes copied into `buf`.
    pub fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut guard = self.cursor.lock();
        let cursor = match guard.take() {
            Some(cursor) => guard.insert(cursor),
            None => {
                let packet = self
                    .shared
                    .inbound
                    .pop(timeout)
                    .ok_or(TransportError::Timeout)?;
                guard.insert(ReceiveCursor { packet, offset: 0 })
            }
        };

        let remaining = cursor.packet.size() - cursor.offset;
        let count = usize::min(remaining, buf.len());
        buf[..count].copy_from_slice(&cursor.packet.data()[cursor.offset..cursor.offset + count]);
        cursor.offset += count;

        if cursor.offset == cursor.packet.size() {
            *guard = None;
        }
        Ok(count)
    }

    /// Wait up to `timeout` for inbound data, without consuming any
    pub fn poll_read(&self, timeout: Duration) -> bool {
        if self.cursor.lock().is_some() {
            return true;
        }
        self.shared.inbound.wait_data_available(timeout)
    }

    /// Wait up to `timeout` for a free outbound slot
    ///
    /// The underlying queue has no wait-for-space primitive, so this polls on a coarse
    /// interval.
    pub fn poll_write(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if !self.outbound.is_full() {
                return true;
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return false,
                _ => thread::sleep(self.shared.config.write_poll_interval),
            }
        }
    }

    /// Largest payload [send](Self::send) accepts
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        MAX_PACKET_SIZE
    }
}

impl Drop for CanTransport {
    fn drop(&mut self) {
        self.shared.stop.request();
        if let Some(daemon) = self.daemon.take() {
            let _ = daemon.join();
        }
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.join();
        }
    }
}
