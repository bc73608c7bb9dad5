//! LSS (CiA 305) identifiers, frames, and codec
//!
//! Every LSS frame carries exactly 8 data bytes on one of two fixed 11-bit
//! identifiers. Byte 0 is the command specifier; 32-bit fields and the
//! 16-bit activation delay are big-endian on the wire.

use snafu::Snafu;

/// Errors raised when decoding LSS frames
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    /// The payload is shorter than the 8 bytes every LSS service uses
    MessageTooShort,
    /// An invalid LSS command specifier was found in the frame
    #[snafu(display("Unexpected LSS command: {value}"))]
    UnexpectedLssCommand {
        /// The offending command specifier byte
        value: u8,
    },
    /// A field in the frame holds a value outside its valid range
    InvalidField,
}

/// An 11-bit CAN identifier carrying LSS traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LssCanId(u16);

impl LssCanId {
    /// Create an identifier, rejecting values above the 11-bit range
    pub fn new(raw: u16) -> Result<Self, MessageError> {
        if raw <= 0x7FF {
            Ok(Self(raw))
        } else {
            Err(MessageError::InvalidField)
        }
    }

    /// The identifier bits
    pub fn raw(&self) -> u16 {
        self.0
    }
}

/// The default identifier for LSS request frames (master to slaves)
pub const LSS_REQ_ID: LssCanId = LssCanId(0x7E5);
/// The default identifier for LSS response frames (slaves to master)
pub const LSS_RESP_ID: LssCanId = LssCanId(0x7E4);

/// One LSS frame, ready for the CAN driver
///
/// LSS services always use the full 8 data bytes; unused trailing bytes are
/// zero on the wire, so there is no length to track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LssFrame {
    /// Identifier the frame travels on
    pub id: LssCanId,
    /// The 8 data bytes
    pub data: [u8; 8],
}

/// Command specifier values used in LSS messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LssCommandSpecifier {
    /// Switch all slaves to a given mode
    SwitchModeGlobal = 0x04,
    /// Set the node id of the selected slave
    ConfigureNodeId = 0x11,
    /// Set the bit timing of the selected slave
    ConfigureBitTiming = 0x13,
    /// Activate the previously configured bit timing on all slaves
    ActivateBitTiming = 0x15,
    /// Persist the selected slave's configuration
    StoreConfiguration = 0x17,
    /// Selective switch, vendor id component
    SwitchStateVendor = 0x40,
    /// Selective switch, product code component
    SwitchStateProduct = 0x41,
    /// Selective switch, revision number component
    SwitchStateRev = 0x42,
    /// Selective switch, serial number component
    SwitchStateSerial = 0x43,
    /// Confirmation that one slave matched a selective switch
    SwitchStateResponse = 0x44,
    /// Fastscan acknowledgment from an unconfigured slave
    IdentifySlave = 0x4F,
    /// Fastscan request
    FastScan = 0x51,
    /// Inquire the selected slave's vendor id
    InquireVendor = 0x5A,
    /// Inquire the selected slave's product code
    InquireProduct = 0x5B,
    /// Inquire the selected slave's revision number
    InquireRev = 0x5C,
    /// Inquire the selected slave's serial number
    InquireSerial = 0x5D,
    /// Inquire the selected slave's node id
    InquireNodeId = 0x5E,
}

impl LssCommandSpecifier {
    /// Decode a command specifier byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0x04 => Ok(Self::SwitchModeGlobal),
            0x11 => Ok(Self::ConfigureNodeId),
            0x13 => Ok(Self::ConfigureBitTiming),
            0x15 => Ok(Self::ActivateBitTiming),
            0x17 => Ok(Self::StoreConfiguration),
            0x40 => Ok(Self::SwitchStateVendor),
            0x41 => Ok(Self::SwitchStateProduct),
            0x42 => Ok(Self::SwitchStateRev),
            0x43 => Ok(Self::SwitchStateSerial),
            0x44 => Ok(Self::SwitchStateResponse),
            0x4F => Ok(Self::IdentifySlave),
            0x51 => Ok(Self::FastScan),
            0x5A => Ok(Self::InquireVendor),
            0x5B => Ok(Self::InquireProduct),
            0x5C => Ok(Self::InquireRev),
            0x5D => Ok(Self::InquireSerial),
            0x5E => Ok(Self::InquireNodeId),
            _ => Err(MessageError::UnexpectedLssCommand { value: b }),
        }
    }
}

/// Special value for the fastscan bit_check field, requesting a presence
/// confirmation from all unconfigured slaves
pub const LSS_FASTSCAN_CONFIRM: u8 = 0x80;

/// Fastscan sub-field index of the vendor id
pub const LSS_SUB_VENDOR: usize = 0;
/// Fastscan sub-field index of the product code
pub const LSS_SUB_PRODUCT: usize = 1;
/// Fastscan sub-field index of the revision number
pub const LSS_SUB_REVISION: usize = 2;
/// Fastscan sub-field index of the serial number
pub const LSS_SUB_SERIAL: usize = 3;

/// Mode byte carried by the switch-mode-global service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LssMode {
    /// Slaves respond only to switch and identification services
    Waiting = 0,
    /// Slaves accept configuration services
    Configuring = 1,
}

impl LssMode {
    /// Decode a mode byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0 => Ok(Self::Waiting),
            1 => Ok(Self::Configuring),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// The 128-bit identity by which a slave is addressed when it has no node id
///
/// Mirrors the four entries of the CANopen identity object (0x1018).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LssIdentity {
    /// Vendor id
    pub vendor_id: u32,
    /// Product code
    pub product_code: u32,
    /// Revision number
    pub revision: u32,
    /// Serial number
    pub serial: u32,
}

impl LssIdentity {
    /// Create a new identity
    pub fn new(vendor_id: u32, product_code: u32, revision: u32, serial: u32) -> Self {
        Self {
            vendor_id,
            product_code,
            revision,
            serial,
        }
    }

    /// Access an identity component by its fastscan sub-field index
    pub fn by_sub(&self, sub: u8) -> u32 {
        match sub as usize {
            LSS_SUB_VENDOR => self.vendor_id,
            LSS_SUB_PRODUCT => self.product_code,
            LSS_SUB_REVISION => self.revision,
            LSS_SUB_SERIAL => self.serial,
            _ => panic!("Invalid LSS identity sub index"),
        }
    }
}

/// Identity component targeted by an inquire service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InquireCs {
    /// Vendor id (0x5A)
    VendorId,
    /// Product code (0x5B)
    ProductCode,
    /// Revision number (0x5C)
    RevisionNumber,
    /// Serial number (0x5D)
    SerialNumber,
    /// Active node id (0x5E)
    NodeId,
}

impl InquireCs {
    /// The command specifier requesting this component
    pub fn cs(self) -> LssCommandSpecifier {
        match self {
            InquireCs::VendorId => LssCommandSpecifier::InquireVendor,
            InquireCs::ProductCode => LssCommandSpecifier::InquireProduct,
            InquireCs::RevisionNumber => LssCommandSpecifier::InquireRev,
            InquireCs::SerialNumber => LssCommandSpecifier::InquireSerial,
            InquireCs::NodeId => LssCommandSpecifier::InquireNodeId,
        }
    }
}

/// Bit rates assignable through the configure-bit-timing service, as indices
/// into the standard timing table
///
/// Index 5 is unassigned by the standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BitTiming {
    /// 1 Mbit/s
    Mbit1 = 0,
    /// 800 kbit/s
    Kbit800 = 1,
    /// 500 kbit/s
    Kbit500 = 2,
    /// 250 kbit/s
    Kbit250 = 3,
    /// 125 kbit/s
    Kbit125 = 4,
    /// 50 kbit/s
    Kbit50 = 6,
    /// 20 kbit/s
    Kbit20 = 7,
    /// 10 kbit/s
    Kbit10 = 8,
    /// Automatic bit rate detection
    Auto = 9,
}

impl BitTiming {
    /// Look up the table entry for a rate in kbit/s; 0 selects automatic
    /// detection
    pub fn from_kbit(kbit: u16) -> Option<Self> {
        match kbit {
            1000 => Some(Self::Mbit1),
            800 => Some(Self::Kbit800),
            500 => Some(Self::Kbit500),
            250 => Some(Self::Kbit250),
            125 => Some(Self::Kbit125),
            50 => Some(Self::Kbit50),
            20 => Some(Self::Kbit20),
            10 => Some(Self::Kbit10),
            0 => Some(Self::Auto),
            _ => None,
        }
    }

    /// The wire value: an index into the standard timing table
    pub fn table_index(self) -> u8 {
        self as u8
    }
}

/// An LSS request message, sent by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LssRequest {
    /// Switch all slaves to the given mode. Non-confirmed.
    SwitchModeGlobal {
        /// Target mode for all slaves
        mode: LssMode,
    },
    /// Selective switch, vendor id component
    SwitchStateVendor {
        /// Vendor id to match
        vendor_id: u32,
    },
    /// Selective switch, product code component
    SwitchStateProduct {
        /// Product code to match
        product_code: u32,
    },
    /// Selective switch, revision number component
    SwitchStateRevision {
        /// Revision number to match
        revision: u32,
    },
    /// Selective switch, serial number component. A fully matched slave
    /// confirms this frame and enters configuration mode.
    SwitchStateSerial {
        /// Serial number to match
        serial: u32,
    },
    /// Assign a node id to the selected slave
    ConfigureNodeId {
        /// The new node id; 255 resets the slave to unconfigured
        node_id: u8,
    },
    /// Select a bit timing on the selected slave
    ConfigureBitTiming {
        /// Timing table selector; 0 is the standard table
        table: u8,
        /// Index into the selected table
        index: u8,
    },
    /// Activate the configured bit timing on all slaves
    ActivateBitTiming {
        /// Per-slave delay before and after the switch, in milliseconds
        delay_ms: u16,
    },
    /// Persist the selected slave's pending configuration
    StoreConfiguration,
    /// Request an identity component from the selected slave
    Inquire(InquireCs),
    /// One step of the fastscan identification procedure
    FastScan {
        /// Candidate value for the targeted identity component
        id: u32,
        /// Index of the lowest bit of `id` that slaves must compare, or
        /// [`LSS_FASTSCAN_CONFIRM`] to solicit a presence confirmation
        bit_check: u8,
        /// Identity component being scanned (0..=3)
        sub: u8,
        /// Component the slave should expect in the next request
        next: u8,
    },
}

impl LssRequest {
    /// Encode into the 8 data bytes of a request frame
    pub fn to_bytes(self) -> [u8; 8] {
        use LssCommandSpecifier as Cs;
        let mut data = [0u8; 8];
        match self {
            LssRequest::SwitchModeGlobal { mode } => {
                data[0] = Cs::SwitchModeGlobal as u8;
                data[1] = mode as u8;
            }
            LssRequest::SwitchStateVendor { vendor_id } => {
                data[0] = Cs::SwitchStateVendor as u8;
                data[1..5].copy_from_slice(&vendor_id.to_be_bytes());
            }
            LssRequest::SwitchStateProduct { product_code } => {
                data[0] = Cs::SwitchStateProduct as u8;
                data[1..5].copy_from_slice(&product_code.to_be_bytes());
            }
            LssRequest::SwitchStateRevision { revision } => {
                data[0] = Cs::SwitchStateRev as u8;
                data[1..5].copy_from_slice(&revision.to_be_bytes());
            }
            LssRequest::SwitchStateSerial { serial } => {
                data[0] = Cs::SwitchStateSerial as u8;
                data[1..5].copy_from_slice(&serial.to_be_bytes());
            }
            LssRequest::ConfigureNodeId { node_id } => {
                data[0] = Cs::ConfigureNodeId as u8;
                data[1] = node_id;
            }
            LssRequest::ConfigureBitTiming { table, index } => {
                data[0] = Cs::ConfigureBitTiming as u8;
                data[1] = table;
                data[2] = index;
            }
            LssRequest::ActivateBitTiming { delay_ms } => {
                data[0] = Cs::ActivateBitTiming as u8;
                data[1..3].copy_from_slice(&delay_ms.to_be_bytes());
            }
            LssRequest::StoreConfiguration => {
                data[0] = Cs::StoreConfiguration as u8;
            }
            LssRequest::Inquire(what) => {
                data[0] = what.cs() as u8;
            }
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            } => {
                data[0] = Cs::FastScan as u8;
                data[1..5].copy_from_slice(&id.to_be_bytes());
                data[5] = bit_check;
                data[6] = sub;
                data[7] = next;
            }
        }
        data
    }
}

impl TryFrom<&[u8]> for LssRequest {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(MessageError::MessageTooShort);
        }
        let cs = LssCommandSpecifier::from_byte(value[0])?;
        let field = u32::from_be_bytes([value[1], value[2], value[3], value[4]]);
        match cs {
            LssCommandSpecifier::SwitchModeGlobal => Ok(Self::SwitchModeGlobal {
                mode: LssMode::from_byte(value[1])?,
            }),
            LssCommandSpecifier::SwitchStateVendor => {
                Ok(Self::SwitchStateVendor { vendor_id: field })
            }
            LssCommandSpecifier::SwitchStateProduct => {
                Ok(Self::SwitchStateProduct { product_code: field })
            }
            LssCommandSpecifier::SwitchStateRev => {
                Ok(Self::SwitchStateRevision { revision: field })
            }
            LssCommandSpecifier::SwitchStateSerial => {
                Ok(Self::SwitchStateSerial { serial: field })
            }
            LssCommandSpecifier::ConfigureNodeId => {
                Ok(Self::ConfigureNodeId { node_id: value[1] })
            }
            LssCommandSpecifier::ConfigureBitTiming => Ok(Self::ConfigureBitTiming {
                table: value[1],
                index: value[2],
            }),
            LssCommandSpecifier::ActivateBitTiming => Ok(Self::ActivateBitTiming {
                delay_ms: u16::from_be_bytes([value[1], value[2]]),
            }),
            LssCommandSpecifier::StoreConfiguration => Ok(Self::StoreConfiguration),
            LssCommandSpecifier::InquireVendor => Ok(Self::Inquire(InquireCs::VendorId)),
            LssCommandSpecifier::InquireProduct => Ok(Self::Inquire(InquireCs::ProductCode)),
            LssCommandSpecifier::InquireRev => Ok(Self::Inquire(InquireCs::RevisionNumber)),
            LssCommandSpecifier::InquireSerial => Ok(Self::Inquire(InquireCs::SerialNumber)),
            LssCommandSpecifier::InquireNodeId => Ok(Self::Inquire(InquireCs::NodeId)),
            LssCommandSpecifier::FastScan => Ok(Self::FastScan {
                id: field,
                bit_check: value[5],
                sub: value[6],
                next: value[7],
            }),
            LssCommandSpecifier::SwitchStateResponse | LssCommandSpecifier::IdentifySlave => {
                Err(MessageError::UnexpectedLssCommand { value: value[0] })
            }
        }
    }
}

/// An LSS response message, sent by a slave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LssResponse {
    /// One slave matched all four components of a selective switch
    SwitchStateAck,
    /// Confirmation of a configure-node-id request
    ConfigureNodeIdAck {
        /// 0 on success, 0xFF for a manufacturer error, other nonzero values
        /// are standardized rejections
        error: u8,
        /// Manufacturer specific code, valid when `error` is 0xFF
        spec_error: u8,
    },
    /// Confirmation of a configure-bit-timing request
    ConfigureBitTimingAck {
        /// 0 on success, 0xFF for a manufacturer error, other nonzero values
        /// are standardized rejections
        error: u8,
        /// Manufacturer specific code, valid when `error` is 0xFF
        spec_error: u8,
    },
    /// Confirmation of a store-configuration request
    StoreConfigurationAck {
        /// 0 on success, 0xFF for a manufacturer error, other nonzero values
        /// are standardized rejections
        error: u8,
        /// Manufacturer specific code, valid when `error` is 0xFF
        spec_error: u8,
    },
    /// Reply to an inquire-vendor request
    InquireVendorReply(u32),
    /// Reply to an inquire-product request
    InquireProductReply(u32),
    /// Reply to an inquire-revision request
    InquireRevisionReply(u32),
    /// Reply to an inquire-serial request
    InquireSerialReply(u32),
    /// Reply to an inquire-node-id request
    InquireNodeIdReply(u8),
    /// Fastscan acknowledgment ("slave is here")
    IdentifySlave,
}

impl LssResponse {
    /// Encode into the 8 data bytes of a response frame
    pub fn to_bytes(self) -> [u8; 8] {
        use LssCommandSpecifier as Cs;
        let mut data = [0u8; 8];
        match self {
            LssResponse::SwitchStateAck => data[0] = Cs::SwitchStateResponse as u8,
            LssResponse::ConfigureNodeIdAck { error, spec_error } => {
                data[0] = Cs::ConfigureNodeId as u8;
                data[1] = error;
                data[2] = spec_error;
            }
            LssResponse::ConfigureBitTimingAck { error, spec_error } => {
                data[0] = Cs::ConfigureBitTiming as u8;
                data[1] = error;
                data[2] = spec_error;
            }
            LssResponse::StoreConfigurationAck { error, spec_error } => {
                data[0] = Cs::StoreConfiguration as u8;
                data[1] = error;
                data[2] = spec_error;
            }
            LssResponse::InquireVendorReply(v) => {
                data[0] = Cs::InquireVendor as u8;
                data[1..5].copy_from_slice(&v.to_be_bytes());
            }
            LssResponse::InquireProductReply(v) => {
                data[0] = Cs::InquireProduct as u8;
                data[1..5].copy_from_slice(&v.to_be_bytes());
            }
            LssResponse::InquireRevisionReply(v) => {
                data[0] = Cs::InquireRev as u8;
                data[1..5].copy_from_slice(&v.to_be_bytes());
            }
            LssResponse::InquireSerialReply(v) => {
                data[0] = Cs::InquireSerial as u8;
                data[1..5].copy_from_slice(&v.to_be_bytes());
            }
            LssResponse::InquireNodeIdReply(id) => {
                data[0] = Cs::InquireNodeId as u8;
                data[1] = id;
            }
            LssResponse::IdentifySlave => data[0] = Cs::IdentifySlave as u8,
        }
        data
    }
}

impl TryFrom<&[u8]> for LssResponse {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(MessageError::MessageTooShort);
        }
        let cs = LssCommandSpecifier::from_byte(value[0])?;
        let field = u32::from_be_bytes([value[1], value[2], value[3], value[4]]);
        match cs {
            LssCommandSpecifier::SwitchStateResponse => Ok(Self::SwitchStateAck),
            LssCommandSpecifier::ConfigureNodeId => Ok(Self::ConfigureNodeIdAck {
                error: value[1],
                spec_error: value[2],
            }),
            LssCommandSpecifier::ConfigureBitTiming => Ok(Self::ConfigureBitTimingAck {
                error: value[1],
                spec_error: value[2],
            }),
            LssCommandSpecifier::StoreConfiguration => Ok(Self::StoreConfigurationAck {
                error: value[1],
                spec_error: value[2],
            }),
            LssCommandSpecifier::InquireVendor => Ok(Self::InquireVendorReply(field)),
            LssCommandSpecifier::InquireProduct => Ok(Self::InquireProductReply(field)),
            LssCommandSpecifier::InquireRev => Ok(Self::InquireRevisionReply(field)),
            LssCommandSpecifier::InquireSerial => Ok(Self::InquireSerialReply(field)),
            LssCommandSpecifier::InquireNodeId => Ok(Self::InquireNodeIdReply(value[1])),
            LssCommandSpecifier::IdentifySlave => Ok(Self::IdentifySlave),
            _ => Err(MessageError::UnexpectedLssCommand { value: value[0] }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_selective_is_big_endian() {
        let data = LssRequest::SwitchStateVendor {
            vendor_id: 0x11223344,
        }
        .to_bytes();
        assert_eq!(data, [0x40, 0x11, 0x22, 0x33, 0x44, 0, 0, 0]);
    }

    #[test]
    fn activate_delay_is_big_endian() {
        let data = LssRequest::ActivateBitTiming { delay_ms: 0x1234 }.to_bytes();
        assert_eq!(data, [0x15, 0x12, 0x34, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn fastscan_layout() {
        let data = LssRequest::FastScan {
            id: 0xA0B0C0D1,
            bit_check: 31,
            sub: 1,
            next: 2,
        }
        .to_bytes();
        assert_eq!(data, [0x51, 0xA0, 0xB0, 0xC0, 0xD1, 31, 1, 2]);
    }

    #[test]
    fn request_round_trip() {
        let reqs = [
            LssRequest::SwitchModeGlobal {
                mode: LssMode::Configuring,
            },
            LssRequest::SwitchStateSerial { serial: 42 },
            LssRequest::ConfigureNodeId { node_id: 0x10 },
            LssRequest::ConfigureBitTiming { table: 0, index: 2 },
            LssRequest::StoreConfiguration,
            LssRequest::Inquire(InquireCs::NodeId),
        ];
        for req in reqs {
            let data = req.to_bytes();
            assert_eq!(req, LssRequest::try_from(&data[..]).unwrap());
        }
    }

    #[test]
    fn inquire_reply_decodes_value() {
        let data = LssResponse::InquireProductReply(0xCAFEBABE).to_bytes();
        assert_eq!(data[0], 0x5B);
        assert_eq!(
            LssResponse::try_from(&data[..]).unwrap(),
            LssResponse::InquireProductReply(0xCAFEBABE)
        );
    }

    #[test]
    fn unknown_cs_is_rejected() {
        let data = [0x99u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            LssResponse::try_from(&data[..]),
            Err(MessageError::UnexpectedLssCommand { value: 0x99 })
        );
    }

    #[test]
    fn can_id_is_limited_to_11_bits() {
        assert_eq!(LssCanId::new(0x7E5).unwrap().raw(), 0x7E5);
        assert_eq!(LssCanId::new(0x800), Err(MessageError::InvalidField));
        assert_eq!(LSS_REQ_ID.raw(), 0x7E5);
        assert_eq!(LSS_RESP_ID.raw(), 0x7E4);
    }

    #[test]
    fn bit_timing_table() {
        assert_eq!(BitTiming::from_kbit(1000), Some(BitTiming::Mbit1));
        assert_eq!(BitTiming::from_kbit(500).unwrap().table_index(), 2);
        assert_eq!(BitTiming::from_kbit(50).unwrap().table_index(), 6);
        assert_eq!(BitTiming::from_kbit(0), Some(BitTiming::Auto));
        // 100 kbit/s is not in the standard table, nor is index 5 assigned
        assert_eq!(BitTiming::from_kbit(100), None);
    }
}
