use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use overcan_can::{CanDriver, CanFrame, MemoryBus, MemoryCan};
use overcan_isotp::{FrameSink, IsoTpLink, SendStatus, SinkError};
use overcan_transport::wire::{self, AddressRequest, AddressResponse, BROADCAST, MASTER, MsgType};
use overcan_transport::{CanTransport, TransportConfig};
use rand::Rng;

/// Soak-test the CAN transport against an in-process echo master
///
/// Brings up a virtual bus with one master and one node, connects the node transport, and
/// streams randomized payloads through send/recv, verifying every echo.
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(short, long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// Number of packets to push through the transport
    #[clap(short, long, default_value_t = 16)]
    count: usize,

    /// Payload size in bytes
    #[clap(short, long, default_value_t = 512)]
    size: usize,
}

fn main() -> eyre::Result<()> {
    let use_color = std::io::stderr().is_terminal();
    if use_color {
        color_eyre::install()?;
    }

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(args.log_level.into())
        .with_env_var("OVERCAN_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .init();

    let bus = MemoryBus::new();
    let master = bus.endpoint();
    std::thread::spawn(move || echo_master(master));

    let mut config = TransportConfig::for_chip(rand::rng().random());
    // The in-process master answers immediately; don't wait out the full windows
    config.request_jitter = Duration::from_millis(10);
    config.response_window = Duration::from_millis(500);
    config.response_slice = Duration::from_millis(50);

    let transport = CanTransport::start(Arc::new(bus.endpoint()), config)?;
    transport.connect(Duration::from_secs(10))?;
    tracing::info!("connected");

    let start = Instant::now();
    let mut received = vec![0u8; args.size];
    for i in 0..args.count {
        let mut payload = vec![0u8; args.size];
        rand::rng().fill(payload.as_mut_slice());
        payload[0] = i as u8;

        transport.send(&payload, Duration::from_secs(10))?;

        let mut have = 0;
        while have < payload.len() {
            have += transport.recv(&mut received[have..], Duration::from_secs(10))?;
        }
        eyre::ensure!(received == payload, "echo mismatch on packet {i}");
        tracing::info!("packet {i}: {} bytes verified", payload.len());
    }

    let elapsed = start.elapsed();
    let bytes = args.count * args.size * 2;
    tracing::info!(
        "moved {bytes} bytes in {elapsed:?} ({:.1} KiB/s)",
        bytes as f64 / 1024.0 / elapsed.as_secs_f64()
    );

    Ok(())
}

/// Minimal master: assigns addresses and echoes every completed transfer
fn echo_master(endpoint: MemoryCan) {
    struct Sink<'a> {
        endpoint: &'a MemoryCan,
    }
    impl FrameSink for Sink<'_> {
        fn send_frame(&mut self, id: u32, data: &[u8]) -> Result<(), SinkError> {
            self.endpoint
                .transmit(&CanFrame::extended(id, data), Duration::MAX)
                .map_err(|_| SinkError)
        }
    }

    let mut links: HashMap<u8, IsoTpLink> = HashMap::new();
    let mut pending: HashMap<u8, Vec<Vec<u8>>> = HashMap::new();
    let mut next_address = 0x01u8;

    loop {
        if let Ok(frame) = endpoint.receive(Duration::from_millis(5)) {
            let id = frame.id();
            if !frame.is_extended() || frame.is_rtr() || wire::dst(id) != MASTER {
                continue;
            }
            match wire::msg_type(id) {
                Some(MsgType::AddressRequest) => {
                    let Some(request) = AddressRequest::from_payload(frame.data()) else {
                        continue;
                    };
                    let response = AddressResponse {
                        chip_id: request.chip_id,
                        status: 0,
                        address: next_address,
                    };
                    let frame = CanFrame::extended(
                        wire::encode_id(MsgType::AddressResponse, MASTER, BROADCAST),
                        &response.to_payload(),
                    );
                    let _ = endpoint.transmit(&frame, Duration::MAX);
                    links.insert(
                        next_address,
                        IsoTpLink::new(wire::encode_id(MsgType::IsoTp, MASTER, next_address)),
                    );
                    tracing::debug!("assigned {next_address:#04X}");
                    next_address = next_address.wrapping_add(1);
                }
                Some(MsgType::IsoTp) => {
                    let mut sink = Sink { endpoint: &endpoint };
                    if let Some(link) = links.get_mut(&wire::src(id)) {
                        let _ = link.on_frame(frame.data(), &mut sink);
                    }
                }
                _ => {}
            }
        }

        let mut sink = Sink { endpoint: &endpoint };
        for (address, link) in links.iter_mut() {
            link.poll(&mut sink);
            if let Some(payload) = link.receive() {
                pending.entry(*address).or_default().push(payload);
            }
            if link.send_status() != SendStatus::InProgress
                && let Some(queue) = pending.get_mut(address)
                && !queue.is_empty()
                && link.send(&queue[0], &mut sink).is_ok()
            {
                queue.remove(0);
            }
        }
    }
}
