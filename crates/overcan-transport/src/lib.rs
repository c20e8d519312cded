//! Stream transport to a master node over a shared CAN bus
//!
//! Nodes broadcast an address request, receive an 8-bit address from the master, and from then
//! on exchange arbitrary-length packets with it over ISO 15765-2 segmentation. A background
//! daemon owns the segmentation link and the controller; applications see a blocking
//! connect/send/recv surface on [CanTransport].

mod addr;
mod config;
mod daemon;
mod error;
mod packet;
mod sync;
mod transport;
mod watchdog;
pub mod wire;

pub use config::TransportConfig;
pub use error::TransportError;
pub use packet::{Packet, PacketQueue};
pub use transport::{CanTransport, MAX_PACKET_SIZE};

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
