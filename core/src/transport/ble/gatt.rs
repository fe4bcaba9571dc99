/// GATT protocol constants for the printer data service
///
/// The printer exposes one well-known service with a pair of characteristics:
/// one for data flowing to the printer (written by us) and one for data flowing
/// back (delivered as indications once the CCCD descriptor is written).

use uuid::Uuid;

/// Printer parser-data service
pub const PARSER_DATA_SERVICE_UUID: Uuid = Uuid::from_u128(0x38eb4a80_c570_11e3_9507_0002a5d5c51b);

/// Characteristic carrying data from the printer (indications)
pub const DATA_FROM_PRINTER_UUID: Uuid = Uuid::from_u128(0x38eb4a81_c570_11e3_9507_0002a5d5c51b);

/// Characteristic carrying data to the printer (writes)
pub const DATA_TO_PRINTER_UUID: Uuid = Uuid::from_u128(0x38eb4a82_c570_11e3_9507_0002a5d5c51b);

/// Client Characteristic Configuration Descriptor
pub const CLIENT_CONFIG_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// ATT header overhead subtracted from a negotiated MTU
pub const MTU_OFFSET: usize = 3;

/// MTU assumed before negotiation
pub const DEFAULT_MTU_SIZE: usize = 20;

/// Largest MTU ever requested; payloads never exceed `MAX_MTU_SIZE - MTU_OFFSET`
pub const MAX_MTU_SIZE: usize = 515;

/// GATT characteristic roles used by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattCharacteristic {
    /// Write characteristic for sending data
    DataToPrinter,
    /// Indicate characteristic for receiving data
    DataFromPrinter,
}

impl GattCharacteristic {
    /// Both characteristics the printer data service must expose
    pub const ALL: [GattCharacteristic; 2] = [
        GattCharacteristic::DataToPrinter,
        GattCharacteristic::DataFromPrinter,
    ];

    /// Get characteristic UUID
    pub fn uuid(&self) -> Uuid {
        match self {
            GattCharacteristic::DataToPrinter => DATA_TO_PRINTER_UUID,
            GattCharacteristic::DataFromPrinter => DATA_FROM_PRINTER_UUID,
        }
    }
}

/// Status code reported alongside GATT events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// Radio busy; the operation may succeed once the stack settles
    pub const BUSY: GattStatus = GattStatus(132);
    pub const FAILURE: GattStatus = GattStatus(257);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl std::fmt::Display for GattStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::SUCCESS => write!(f, "success"),
            Self::BUSY => write!(f, "busy (132)"),
            GattStatus(code) => write!(f, "status {}", code),
        }
    }
}

/// Payload size for a negotiated MTU, capped at the protocol maximum.
pub fn payload_size_for_mtu(mtu: usize) -> usize {
    mtu.min(MAX_MTU_SIZE).saturating_sub(MTU_OFFSET).max(1)
}

/// Split a payload into consecutive chunks of at most `chunk_size` bytes.
///
/// An empty payload yields no chunks. A `chunk_size` of zero is treated as one.
pub fn chunk_payload(data: &[u8], chunk_size: usize) -> impl Iterator<Item = &[u8]> {
    data.chunks(chunk_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(
            GattCharacteristic::DataToPrinter.uuid().to_string(),
            "38eb4a82-c570-11e3-9507-0002a5d5c51b"
        );
        assert_eq!(
            GattCharacteristic::DataFromPrinter.uuid().to_string(),
            "38eb4a81-c570-11e3-9507-0002a5d5c51b"
        );
        assert_ne!(
            GattCharacteristic::ALL[0].uuid(),
            GattCharacteristic::ALL[1].uuid()
        );
        assert_eq!(
            CLIENT_CONFIG_DESCRIPTOR_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_payload_size_for_mtu() {
        assert_eq!(payload_size_for_mtu(DEFAULT_MTU_SIZE), 17);
        assert_eq!(payload_size_for_mtu(185), 182);
        assert_eq!(payload_size_for_mtu(MAX_MTU_SIZE), 512);
        assert_eq!(payload_size_for_mtu(1024), 512);
        assert_eq!(payload_size_for_mtu(2), 1);
    }

    #[test]
    fn test_chunk_default_mtu() {
        let data = vec![0xAAu8; 40];
        let chunks: Vec<_> = chunk_payload(&data, 17).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 17);
        assert_eq!(chunks[1].len(), 17);
        assert_eq!(chunks[2].len(), 6);
    }

    #[test]
    fn test_chunk_empty_payload() {
        assert_eq!(chunk_payload(&[], 17).count(), 0);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(GattStatus::BUSY.to_string(), "busy (132)");
        assert_eq!(GattStatus(5).to_string(), "status 5");
        assert!(GattStatus::SUCCESS.is_success());
        assert!(!GattStatus::BUSY.is_success());
    }

    proptest! {
        #[test]
        fn prop_chunks_bounded_and_lossless(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            size in 1usize..600,
        ) {
            let chunks: Vec<&[u8]> = chunk_payload(&data, size).collect();
            prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= size));
            prop_assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), data.len());
            prop_assert_eq!(chunks.concat(), data);
        }
    }
}
