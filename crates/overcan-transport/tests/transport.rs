use std::sync::Arc;
use std::time::Duration;

use overcan_can::MemoryBus;
use overcan_test::{MasterScript, ScriptedMaster};
use overcan_transport::{CanTransport, TransportConfig, TransportError};
use pretty_assertions::assert_eq;

fn fast_config(chip_id: [u8; 6]) -> TransportConfig {
    TransportConfig {
        chip_id,
        request_jitter: Duration::from_millis(5),
        response_window: Duration::from_millis(300),
        response_slice: Duration::from_millis(20),
        transmit_backoff: Duration::from_millis(50),
        rejection_backoff: Duration::from_millis(100),
        fault_backoff: Duration::from_millis(100),
        ..TransportConfig::default()
    }
}

fn node(bus: &MemoryBus, chip_id: [u8; 6]) -> CanTransport {
    CanTransport::start(Arc::new(bus.endpoint()), fast_config(chip_id)).unwrap()
}

#[test]
fn test_connect_and_small_send_round_trip() {
    let bus = MemoryBus::new();
    let master = ScriptedMaster::spawn(&bus, MasterScript::default());
    let transport = node(&bus, [1; 6]);

    transport.connect(Duration::from_secs(5)).unwrap();

    // 7 bytes: single-frame, completes synchronously in the daemon
    transport.send(b"hello!!", Duration::from_secs(1)).unwrap();
    assert_eq!(
        master.recv_transfer(Duration::from_secs(2)),
        Some(b"hello!!".to_vec())
    );

    // The echo comes back through recv
    let mut buf = [0u8; 16];
    let count = transport.recv(&mut buf, Duration::from_secs(2)).unwrap();
    assert_eq!(&buf[..count], b"hello!!");
}

#[test]
fn test_multi_frame_round_trip() {
    let bus = MemoryBus::new();
    let master = ScriptedMaster::spawn(&bus, MasterScript::default());
    let transport = node(&bus, [2; 6]);

    transport.connect(Duration::from_secs(5)).unwrap();

    let payload: Vec<u8> = (0..512u32).map(|b| (b * 7) as u8).collect();
    transport.send(&payload, Duration::from_secs(5)).unwrap();
    assert_eq!(
        master.recv_transfer(Duration::from_secs(5)),
        Some(payload.clone())
    );

    // Drain the echo through a cursor smaller than the packet
    let mut received = Vec::new();
    let mut buf = [0u8; 100];
    while received.len() < payload.len() {
        let count = transport.recv(&mut buf, Duration::from_secs(5)).unwrap();
        received.extend_from_slice(&buf[..count]);
    }
    assert_eq!(received, payload);
}

#[test]
fn test_send_without_master_is_invalid_state() {
    let bus = MemoryBus::new();
    // Nobody will ever answer the address request
    let transport = node(&bus, [3; 6]);

    assert_eq!(
        transport.send(b"hi", Duration::from_millis(10)),
        Err(TransportError::InvalidState)
    );
    assert_eq!(
        transport.connect(Duration::from_millis(200)),
        Err(TransportError::Timeout)
    );
}

#[test]
fn test_oversized_send_rejected() {
    let bus = MemoryBus::new();
    let _master = ScriptedMaster::spawn(&bus, MasterScript::default());
    let transport = node(&bus, [4; 6]);

    transport.connect(Duration::from_secs(5)).unwrap();
    assert_eq!(transport.max_packet_size(), 4094);

    let payload = vec![0u8; 4095];
    assert_eq!(
        transport.send(&payload, Duration::from_secs(1)),
        Err(TransportError::InvalidSize { size: 4095, max: 4094 })
    );
}

#[test]
fn test_recv_times_out_when_idle() {
    let bus = MemoryBus::new();
    let _master = ScriptedMaster::spawn(&bus, MasterScript::default());
    let transport = node(&bus, [5; 6]);

    transport.connect(Duration::from_secs(5)).unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(
        transport.recv(&mut buf, Duration::from_millis(50)),
        Err(TransportError::Timeout)
    );
}

#[test]
fn test_rejected_address_keeps_node_unserved() {
    let bus = MemoryBus::new();
    let _master = ScriptedMaster::spawn(
        &bus,
        MasterScript {
            status: 1,
            ..MasterScript::default()
        },
    );
    let transport = node(&bus, [6; 6]);

    // The master refuses every request; the node sits in its rejection backoff
    assert_eq!(
        transport.connect(Duration::from_millis(400)),
        Err(TransportError::Timeout)
    );
}

#[test]
fn test_readdress_aborts_in_flight_send() {
    let bus = MemoryBus::new();
    // No flow control, no echo: a multi-frame send stays in flight until something kills it
    let master = ScriptedMaster::spawn(
        &bus,
        MasterScript {
            echo: false,
            accept_transfers: false,
            ..MasterScript::default()
        },
    );
    let transport = Arc::new(node(&bus, [7; 6]));

    transport.connect(Duration::from_secs(5)).unwrap();

    let sender = {
        let transport = Arc::clone(&transport);
        std::thread::spawn(move || transport.send(&[0xA5u8; 512], Duration::from_secs(1)))
    };
    // Let the first frame go out, then yank the address from under the transfer
    std::thread::sleep(Duration::from_millis(100));
    master.readdress();

    assert_eq!(sender.join().unwrap(), Err(TransportError::Fail));

    // The node re-acquires and serves again
    transport.connect(Duration::from_secs(5)).unwrap();
    transport.send(b"back", Duration::from_secs(1)).unwrap();
    assert_eq!(
        master.recv_transfer(Duration::from_secs(2)),
        Some(b"back".to_vec())
    );
}

#[test]
fn test_receive_fault_still_services_in_flight_send() {
    use overcan_can::CanDriver;

    let bus = MemoryBus::new();
    // No flow control: the send stays in flight on its N_Bs timer alone
    let _master = ScriptedMaster::spawn(
        &bus,
        MasterScript {
            echo: false,
            accept_transfers: false,
            ..MasterScript::default()
        },
    );
    let endpoint = Arc::new(bus.endpoint());
    let transport = Arc::new(
        CanTransport::start(Arc::clone(&endpoint) as Arc<dyn CanDriver>, fast_config([11; 6]))
            .unwrap(),
    );

    transport.connect(Duration::from_secs(5)).unwrap();

    let sender = {
        let transport = Arc::clone(&transport);
        std::thread::spawn(move || transport.send(&[0xC3u8; 512], Duration::from_secs(1)))
    };
    // Let the first frame go out, then drop the controller away; the daemon backs off on
    // each receive fault but keeps polling the link, so the flow-control timer still
    // expires and fails the send
    std::thread::sleep(Duration::from_millis(100));
    endpoint.stop();

    assert_eq!(sender.join().unwrap(), Err(TransportError::Fail));

    // Controller comes back; single-frame traffic flows again
    endpoint.start().unwrap();
    transport.send(b"alive", Duration::from_secs(2)).unwrap();
}

#[test]
fn test_non_extended_and_rtr_frames_ignored() {
    use overcan_can::{CanDriver, CanFrame};
    use overcan_transport::wire::{self, MASTER, MsgType};

    let bus = MemoryBus::new();
    let master = ScriptedMaster::spawn(&bus, MasterScript::default());
    let transport = node(&bus, [10; 6]);

    transport.connect(Duration::from_secs(5)).unwrap();

    // Junk that must not disturb the link: a standard-id frame and a remote frame, both shaped
    // like master traffic
    let noise = bus.endpoint();
    let standard = CanFrame::standard(0x123, &[0x01, 0xFF]);
    noise.transmit(&standard, Duration::MAX).unwrap();
    let remote = CanFrame::remote(wire::encode_id(MsgType::IsoTp, MASTER, 0xFF), 8);
    noise.transmit(&remote, Duration::MAX).unwrap();

    transport.send(b"still ok", Duration::from_secs(1)).unwrap();
    assert_eq!(
        master.recv_transfer(Duration::from_secs(2)),
        Some(b"still ok".to_vec())
    );
}

#[test]
fn test_poll_read_and_poll_write() {
    let bus = MemoryBus::new();
    let master = ScriptedMaster::spawn(&bus, MasterScript::default());
    let transport = node(&bus, [8; 6]);

    transport.connect(Duration::from_secs(5)).unwrap();

    // Idle: outbound slot free, nothing inbound
    assert!(transport.poll_write(Duration::ZERO));
    assert!(!transport.poll_read(Duration::from_millis(20)));

    transport.send(b"ping", Duration::from_secs(1)).unwrap();
    assert_eq!(
        master.recv_transfer(Duration::from_secs(2)),
        Some(b"ping".to_vec())
    );
    assert!(transport.poll_read(Duration::from_secs(2)));

    // poll_read is non-destructive
    let mut buf = [0u8; 8];
    let count = transport.recv(&mut buf, Duration::from_secs(1)).unwrap();
    assert_eq!(&buf[..count], b"ping");
}

#[test]
fn test_poll_write_reports_full_outbound_slot() {
    let bus = MemoryBus::new();
    // A stalled master keeps the first multi-frame send in flight for its full timeout
    let _master = ScriptedMaster::spawn(
        &bus,
        MasterScript {
            echo: false,
            accept_transfers: false,
            ..MasterScript::default()
        },
    );
    let transport = Arc::new(node(&bus, [9; 6]));

    transport.connect(Duration::from_secs(5)).unwrap();

    let mut senders = Vec::new();
    for _ in 0..2 {
        let transport = Arc::clone(&transport);
        senders.push(std::thread::spawn(move || {
            transport.send(&[0x5Au8; 512], Duration::from_secs(2))
        }));
    }
    // One send is in flight and the other occupies the slot
    std::thread::sleep(Duration::from_millis(200));
    assert!(!transport.poll_write(Duration::from_millis(50)));

    // Both die on the unanswered flow control
    for sender in senders {
        assert_eq!(sender.join().unwrap(), Err(TransportError::Fail));
    }
}
