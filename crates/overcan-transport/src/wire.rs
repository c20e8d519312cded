//! The 29-bit arbitration id layout and the address-handshake payloads
//!
//! ```text
//! | 28..21 (8)  | 20..19 (2) | 18..16 (3) | 15..8 (8)   | 7..0 (8)    |
//! | random seed | reserved   | msg type   | src address | dst address |
//! ```
//!
//! The seed bits carry fresh randomness on outbound ISO-TP frames and are ignored on receive.
//! All traffic uses extended identifiers with RTR clear.

/// The address-assignment authority
pub const MASTER: u8 = 0x00;
/// Destination address naming every node
pub const BROADCAST: u8 = 0xFF;

const SEED_MASK: u32 = 0x1FE0_0000;

/// The three message types carried in identifier bits 18..16
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    /// An ISO-TP payload frame
    IsoTp = 0,
    /// A node asking the master for an address (or the master demanding re-acquisition)
    AddressRequest = 5,
    /// The master announcing an assignment result
    AddressResponse = 6,
}

/// Build an identifier with zeroed seed bits
#[inline]
#[must_use]
pub fn encode_id(msg_type: MsgType, src: u8, dst: u8) -> u32 {
    ((msg_type as u32) << 16) | ((src as u32) << 8) | dst as u32
}

/// Stamp fresh randomness into the seed bits
#[inline]
#[must_use]
pub fn seeded(id: u32, seed: u8) -> u32 {
    (id & !SEED_MASK) | ((seed as u32) << 21)
}

#[inline]
#[must_use]
pub fn msg_type(id: u32) -> Option<MsgType> {
    match (id >> 16) & 7 {
        0 => Some(MsgType::IsoTp),
        5 => Some(MsgType::AddressRequest),
        6 => Some(MsgType::AddressResponse),
        _ => None,
    }
}

#[inline]
#[must_use]
pub fn src(id: u32) -> u8 {
    (id >> 8) as u8
}

#[inline]
#[must_use]
pub fn dst(id: u32) -> u8 {
    id as u8
}

/// `ADDRESS_REQUEST` payload: the requesting node's factory identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRequest {
    pub chip_id: [u8; 6],
}

impl AddressRequest {
    pub fn to_payload(self) -> [u8; 6] {
        self.chip_id
    }

    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        let chip_id = payload.try_into().ok()?;
        Some(Self { chip_id })
    }
}

/// `ADDRESS_RESPONSE` payload: identifier, status byte, assigned address
///
/// A zero status is success; anything else means the master refused the request and the address
/// byte is meaningless.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressResponse {
    pub chip_id: [u8; 6],
    pub status: u8,
    pub address: u8,
}

impl AddressResponse {
    pub fn to_payload(self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        payload[..6].copy_from_slice(&self.chip_id);
        payload[6] = self.status;
        payload[7] = self.address;
        payload
    }

    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        let payload: &[u8; 8] = payload.try_into().ok()?;
        let mut chip_id = [0u8; 6];
        chip_id.copy_from_slice(&payload[..6]);
        Some(Self {
            chip_id,
            status: payload[6],
            address: payload[7],
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::Rng;

    use super::*;

    #[test]
    fn test_id_layout() {
        // The §8 handshake identifiers
        assert_eq!(encode_id(MsgType::AddressRequest, BROADCAST, MASTER), 0x05FF00);
        assert_eq!(encode_id(MsgType::AddressResponse, MASTER, BROADCAST), 0x0600FF);
        assert_eq!(encode_id(MsgType::IsoTp, 0x07, MASTER), 0x000700);
    }

    #[test]
    fn test_id_round_trip_ignores_seed() {
        let mut rng = rand::rng();
        for msg in [MsgType::IsoTp, MsgType::AddressRequest, MsgType::AddressResponse] {
            for _ in 0..100 {
                let src_addr: u8 = rng.random();
                let dst_addr: u8 = rng.random();
                let id = seeded(encode_id(msg, src_addr, dst_addr), rng.random());

                assert_eq!(msg_type(id), Some(msg));
                assert_eq!(src(id), src_addr);
                assert_eq!(dst(id), dst_addr);
            }
        }
    }

    #[test]
    fn test_seeded_fits_29_bits() {
        let id = seeded(encode_id(MsgType::IsoTp, 0xFF, 0xFF), 0xFF);
        assert_eq!(id & !0x1FFF_FFFF, 0);
        // Re-seeding replaces the old seed instead of accumulating bits
        assert_eq!(seeded(id, 0x00), encode_id(MsgType::IsoTp, 0xFF, 0xFF));
    }

    #[test]
    fn test_reserved_msg_types_rejected() {
        for reserved in [1u32, 2, 3, 4, 7] {
            assert_eq!(msg_type(reserved << 16), None);
        }
    }

    #[test]
    fn test_address_response_payload_round_trip() {
        let response = AddressResponse {
            chip_id: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
            status: 0,
            address: 0x07,
        };
        let payload = response.to_payload();
        assert_eq!(payload, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x07]);
        assert_eq!(AddressResponse::from_payload(&payload), Some(response));

        assert_eq!(AddressResponse::from_payload(&payload[..7]), None);
    }

    #[test]
    fn test_address_request_payload_round_trip() {
        let request = AddressRequest {
            chip_id: [1, 2, 3, 4, 5, 6],
        };
        assert_eq!(
            AddressRequest::from_payload(&request.to_payload()),
            Some(request)
        );
        assert_eq!(AddressRequest::from_payload(b"short"), None);
    }
}
