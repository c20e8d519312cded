//! Owned packet buffers and the dual-bounded inbound queue

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// An owned, append-only byte buffer with a fixed capacity
///
/// Packets are filled by a producer, handed into a [PacketQueue] by value, and drained by the
/// final consumer. Once enqueued a packet is never mutated again.
#[derive(Debug)]
pub struct Packet {
    data: Vec<u8>,
    capacity: usize,
}

impl Packet {
    /// Allocate an empty packet that can hold `capacity` bytes
    pub fn alloc(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Copy `bytes` onto the tail
    ///
    /// Returns false, without mutating, when the bytes do not fit.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if self.data.len() + bytes.len() > self.capacity {
            return false;
        }
        self.data.extend_from_slice(bytes);
        true
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    packets: VecDeque<Packet>,
    current_bytes: usize,
}

/// A FIFO of owned [Packet]s bounded by count and by aggregate payload bytes
///
/// Admission is atomic: a push that would break either bound fails without side effects and
/// hands the packet back to the caller. At every quiescent point the tracked byte total equals
/// the sum of the enqueued packets' sizes.
#[derive(Debug)]
pub struct PacketQueue {
    max_packets: usize,
    max_bytes: usize,
    inner: Mutex<QueueInner>,
    data_available: Condvar,
}

impl PacketQueue {
    pub fn new(max_packets: usize, max_bytes: usize) -> Self {
        Self {
            max_packets,
            max_bytes,
            inner: Mutex::new(QueueInner::default()),
            data_available: Condvar::new(),
        }
    }

    /// Take ownership of `packet` if both bounds allow it
    ///
    /// On rejection the packet comes back to the caller unchanged.
    pub fn push(&self, packet: Packet) -> Result<(), Packet> {
        let mut inner = self.inner.lock();
        if inner.packets.len() >= self.max_packets
            || inner.current_bytes + packet.size() > self.max_bytes
        {
            return Err(packet);
        }
        inner.current_bytes += packet.size();
        inner.packets.push_back(packet);
        drop(inner);
        self.data_available.notify_all();
        Ok(())
    }

    /// Wait up to `timeout` for a packet and take ownership of it
    pub fn pop(&self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.inner.lock();
        loop {
            if let Some(packet) = inner.packets.pop_front() {
                inner.current_bytes -= packet.size();
                return Some(packet);
            }
            let Some(deadline) = deadline else {
                // Effectively unbounded
                self.data_available.wait(&mut inner);
                continue;
            };
            if Instant::now() >= deadline {
                return None;
            }
            self.data_available.wait_until(&mut inner, deadline);
        }
    }

    /// Wait up to `timeout` for at least one packet without consuming it
    ///
    /// A zero timeout reports current occupancy without sleeping.
    pub fn wait_data_available(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.inner.lock();
        loop {
            if !inner.packets.is_empty() {
                return true;
            }
            let Some(deadline) = deadline else {
                self.data_available.wait(&mut inner);
                continue;
            };
            if Instant::now() >= deadline {
                return false;
            }
            self.data_available.wait_until(&mut inner, deadline);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate size of the enqueued packets
    #[must_use]
    pub fn current_bytes(&self) -> usize {
        self.inner.lock().current_bytes
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_packet_append_bound() {
        let mut packet = Packet::alloc(10);
        assert_eq!(packet.capacity(), 10);
        assert_eq!(packet.size(), 0);

        assert!(packet.append(b"hello"));
        assert_eq!(packet.size(), 5);

        // Rejected appends leave the packet untouched
        assert!(!packet.append(b"banana"));
        assert_eq!(packet.size(), 5);
        assert_eq!(packet.data(), b"hello");
    }

    fn filled(bytes: &[u8]) -> Packet {
        let mut packet = Packet::alloc(bytes.len());
        assert!(packet.append(bytes));
        packet
    }

    #[test]
    fn test_push_pop_round_trip() {
        let queue = PacketQueue::new(10, 100);
        queue.push(filled(b"hello")).unwrap();

        let popped = queue.pop(Duration::from_millis(100)).unwrap();
        assert_eq!(popped.data(), b"hello");
        assert_eq!(queue.current_bytes(), 0);
    }

    #[test]
    fn test_pop_empty_times_out() {
        let queue = PacketQueue::new(10, 100);
        assert!(queue.pop(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_byte_bound_rejects_push() {
        let queue = PacketQueue::new(10, 10);
        queue.push(filled(b"hello123")).unwrap();

        // 8 + 5 > 10: the caller keeps the packet
        let rejected = queue.push(filled(b"world")).unwrap_err();
        assert_eq!(rejected.data(), b"world");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.current_bytes(), 8);
    }

    #[test]
    fn test_count_bound_rejects_push() {
        let queue = PacketQueue::new(2, 100);
        queue.push(filled(b"world")).unwrap();
        queue.push(filled(b"world")).unwrap();

        let rejected = queue.push(filled(b"world")).unwrap_err();
        assert_eq!(rejected.data(), b"world");
        // A failed push must not leak its byte reservation
        assert_eq!(queue.current_bytes(), 10);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_wait_data_available_is_non_destructive() {
        let queue = PacketQueue::new(2, 100);
        assert!(!queue.wait_data_available(Duration::from_millis(10)));

        queue.push(filled(b"world")).unwrap();
        assert!(queue.wait_data_available(Duration::from_millis(10)));
        assert!(queue.wait_data_available(Duration::ZERO));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_byte_accounting_invariant_under_contention() {
        use std::sync::Arc;

        let queue = Arc::new(PacketQueue::new(8, 256));
        let mut producers = Vec::new();
        for seed in 1..=2u8 {
            let queue = Arc::clone(&queue);
            producers.push(std::thread::spawn(move || {
                use rand::Rng;
                let mut rng = rand::rng();
                let mut rejected = 0usize;
                for _ in 0..500 {
                    let size = rng.random_range(1..=64);
                    let packet = filled(&vec![seed; size]);
                    if queue.push(packet).is_err() {
                        rejected += 1;
                    }
                }
                rejected
            }));
        }
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let mut drained = 0usize;
                while drained < 600 {
                    if queue.pop(Duration::from_millis(1)).is_some() {
                        drained += 1;
                    } else {
                        // Producers may already be done
                        if queue.is_empty() {
                            break;
                        }
                    }
                }
            })
        };
        for producer in producers {
            producer.join().unwrap();
        }
        consumer.join().unwrap();

        // Quiescent: tracked bytes equal the sum over whatever is still enqueued
        assert!(queue.len() <= 8);
        assert!(queue.current_bytes() <= 256);
        let tracked = queue.current_bytes();
        let mut total = 0;
        while let Some(packet) = queue.pop(Duration::ZERO) {
            total += packet.size();
        }
        assert_eq!(tracked, total);
        assert_eq!(queue.current_bytes(), 0);
    }
}
