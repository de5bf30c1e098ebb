//! UFS Protocol Information Units.
//!
//! Every frame is an explicit byte layout. Multi-byte fields are big-endian
//! on the wire, so they are stored as [`zerocopy`] big-endian integers and
//! converted only when a value enters or leaves a frame.

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::constants::{query, transaction, upiu_flags};

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_be = zerocopy::U16<zerocopy::BigEndian>;
    pub type u32_be = zerocopy::U32<zerocopy::BigEndian>;
}

pub use packed_nums::*;

/// Largest CDB a COMMAND UPIU can carry.
pub const MAX_CDB_LEN: usize = 16;

/// Number of sense bytes a RESPONSE UPIU can carry.
pub const SENSE_DATA_LEN: usize = 18;

/// The 12 byte header shared by all UPIUs.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UpiuHeader {
    pub transaction_type: u8,
    pub flags: u8,
    pub lun: u8,
    pub task_tag: u8,
    /// Command set type in the low nibble.
    pub command_set: u8,
    pub function: u8,
    pub response: u8,
    pub status: u8,
    pub ehs_length: u8,
    pub device_info: u8,
    pub data_segment_length: u16_be,
}

/// COMMAND UPIU.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CommandUpiu {
    pub header: UpiuHeader,
    pub expected_data_transfer_length: u32_be,
    pub cdb: [u8; MAX_CDB_LEN],
}

/// RESPONSE UPIU.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ResponseUpiu {
    pub header: UpiuHeader,
    pub residual_transfer_count: u32_be,
    pub reserved: [u8; 16],
    pub sense_data_length: u16_be,
    pub sense_data: [u8; SENSE_DATA_LEN],
}

impl ResponseUpiu {
    /// The device moved fewer bytes than the command expected.
    #[must_use]
    pub const fn underflow(&self) -> bool {
        self.header.flags & upiu_flags::UNDERFLOW != 0
    }
}

/// Transaction specific fields of QUERY REQUEST and QUERY RESPONSE UPIUs.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct QueryTsf {
    pub opcode: u8,
    pub idn: u8,
    pub index: u8,
    pub selector: u8,
    pub reserved: [u8; 2],
    pub length: u16_be,
    pub value: u32_be,
    pub reserved2: [u8; 4],
}

/// QUERY REQUEST and QUERY RESPONSE UPIU. A descriptor payload follows the
/// frame directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct QueryUpiu {
    pub header: UpiuHeader,
    pub tsf: QueryTsf,
    pub reserved: [u8; 4],
}

impl QueryUpiu {
    /// Offset of the byte flag opcodes return, the last byte of the value field.
    pub const FLAG_VALUE_OFFSET: usize = 23;
}

/// NOP OUT and NOP IN UPIU.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NopUpiu {
    pub header: UpiuHeader,
    pub reserved: [u8; 20],
}

/// Direction of the data phase, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDirection {
    #[default]
    None,
    /// Device to host.
    Read,
    /// Host to device.
    Write,
}

impl DataDirection {
    const fn command_flags(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Read => upiu_flags::READ,
            Self::Write => upiu_flags::WRITE,
        }
    }
}

/// Query request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryOpcode {
    Nop = 0,
    ReadDescriptor = 1,
    WriteDescriptor = 2,
    ReadAttribute = 3,
    WriteAttribute = 4,
    ReadFlag = 5,
    SetFlag = 6,
    ClearFlag = 7,
    ToggleFlag = 8,
}

impl QueryOpcode {
    /// Decode an opcode byte as found in a query response.
    #[must_use]
    pub const fn from_u8(opcode: u8) -> Option<Self> {
        Some(match opcode {
            0 => Self::Nop,
            1 => Self::ReadDescriptor,
            2 => Self::WriteDescriptor,
            3 => Self::ReadAttribute,
            4 => Self::WriteAttribute,
            5 => Self::ReadFlag,
            6 => Self::SetFlag,
            7 => Self::ClearFlag,
            8 => Self::ToggleFlag,
            _ => return None,
        })
    }

    /// Opcodes that only read device state use the standard read function.
    #[must_use]
    pub const fn function(self) -> u8 {
        match self {
            Self::Nop | Self::ReadDescriptor | Self::ReadAttribute | Self::ReadFlag => {
                query::FUNC_STD_READ
            }
            Self::WriteDescriptor
            | Self::WriteAttribute
            | Self::SetFlag
            | Self::ClearFlag
            | Self::ToggleFlag => query::FUNC_STD_WRITE,
        }
    }

    #[must_use]
    pub const fn is_flag(self) -> bool {
        matches!(
            self,
            Self::ReadFlag | Self::SetFlag | Self::ClearFlag | Self::ToggleFlag
        )
    }
}

/// Parameters of one query request.
#[derive(Debug, Clone, Copy)]
pub struct QueryRequest<'a> {
    pub opcode: QueryOpcode,
    pub idn: u8,
    pub index: u8,
    pub selector: u8,
    /// Descriptor length to read; ignored for other opcodes.
    pub length: u16,
    /// Attribute value to write; ignored for other opcodes.
    pub value: u32,
    /// Descriptor bytes to write; ignored for other opcodes.
    pub payload: &'a [u8],
}

impl<'a> QueryRequest<'a> {
    #[must_use]
    pub const fn new(opcode: QueryOpcode, idn: u8, index: u8, selector: u8) -> Self {
        Self {
            opcode,
            idn,
            index,
            selector,
            length: 0,
            value: 0,
            payload: &[],
        }
    }

    #[must_use]
    pub const fn with_length(mut self, length: u16) -> Self {
        self.length = length;
        self
    }

    #[must_use]
    pub const fn with_value(mut self, value: u32) -> Self {
        self.value = value;
        self
    }

    #[must_use]
    pub const fn with_payload(mut self, payload: &'a [u8]) -> Self {
        self.payload = payload;
        self
    }

    /// Bytes appended after the QUERY REQUEST UPIU.
    #[must_use]
    pub fn data_out(&self) -> &'a [u8] {
        match self.opcode {
            QueryOpcode::WriteDescriptor => self.payload,
            _ => &[],
        }
    }

    /// Bytes expected after the QUERY RESPONSE UPIU.
    #[must_use]
    pub const fn data_in_len(&self) -> usize {
        match self.opcode {
            QueryOpcode::ReadDescriptor => self.length as usize,
            _ => 0,
        }
    }
}

/// Build a COMMAND UPIU.
///
/// CDBs longer than [`MAX_CDB_LEN`] are cut off; callers validate the length
/// before building.
#[must_use]
pub fn build_command_upiu(
    lun: u8,
    task_tag: u8,
    direction: DataDirection,
    expected_length: u32,
    cdb: &[u8],
) -> CommandUpiu {
    let mut upiu = CommandUpiu {
        header: UpiuHeader {
            transaction_type: transaction::COMMAND,
            flags: direction.command_flags(),
            lun,
            task_tag,
            ..FromZeros::new_zeroed()
        },
        expected_data_transfer_length: expected_length.into(),
        ..FromZeros::new_zeroed()
    };
    let len = cdb.len().min(MAX_CDB_LEN);
    upiu.cdb[..len].copy_from_slice(&cdb[..len]);
    upiu
}

/// Build a QUERY REQUEST UPIU. For descriptor writes the payload itself is
/// placed behind the frame by the descriptor builder; the header announces
/// its length.
#[must_use]
pub fn build_query_request_upiu(task_tag: u8, request: &QueryRequest<'_>) -> QueryUpiu {
    let mut upiu = QueryUpiu {
        header: UpiuHeader {
            transaction_type: transaction::QUERY_REQUEST,
            task_tag,
            function: request.opcode.function(),
            ..FromZeros::new_zeroed()
        },
        tsf: QueryTsf {
            opcode: request.opcode as u8,
            idn: request.idn,
            index: request.index,
            selector: request.selector,
            ..FromZeros::new_zeroed()
        },
        ..FromZeros::new_zeroed()
    };

    match request.opcode {
        QueryOpcode::ReadDescriptor => upiu.tsf.length = request.length.into(),
        QueryOpcode::WriteDescriptor => {
            let len = u16::try_from(request.payload.len()).unwrap_or(u16::MAX);
            upiu.tsf.length = len.into();
            upiu.header.data_segment_length = len.into();
        }
        QueryOpcode::WriteAttribute => upiu.tsf.value = request.value.into(),
        _ => {}
    }
    upiu
}

/// Build a NOP OUT UPIU.
#[must_use]
pub fn build_nop_upiu(task_tag: u8) -> NopUpiu {
    NopUpiu {
        header: UpiuHeader {
            transaction_type: transaction::NOP_OUT,
            task_tag,
            ..FromZeros::new_zeroed()
        },
        ..FromZeros::new_zeroed()
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn frame_sizes_match_the_wire_format() {
        assert_eq!(size_of::<UpiuHeader>(), 12);
        assert_eq!(size_of::<CommandUpiu>(), 32);
        assert_eq!(size_of::<ResponseUpiu>(), 52);
        assert_eq!(size_of::<QueryTsf>(), 16);
        assert_eq!(size_of::<QueryUpiu>(), 32);
        assert_eq!(size_of::<NopUpiu>(), 32);
    }

    #[test]
    fn command_upiu_layout() {
        let cdb = [0x28, 0, 0, 0, 0x10, 0, 0, 0, 1, 0];
        let upiu = build_command_upiu(3, 7, DataDirection::Read, 4096, &cdb);
        let bytes = upiu.as_bytes();

        assert_eq!(bytes[0], transaction::COMMAND);
        assert_eq!(bytes[1], upiu_flags::READ);
        assert_eq!(bytes[2], 3);
        assert_eq!(bytes[3], 7);
        assert_eq!(bytes[4], 0);
        assert_eq!(&bytes[12..16], &[0, 0, 0x10, 0]);
        assert_eq!(&bytes[16..26], &cdb);
        assert!(bytes[26..].iter().all(|&b| b == 0));
    }

    #[test]
    fn command_flags_follow_direction() {
        let flags = |direction| build_command_upiu(0, 0, direction, 0, &[0]).header.flags;
        assert_eq!(flags(DataDirection::None), 0);
        assert_eq!(flags(DataDirection::Read), 0x40);
        assert_eq!(flags(DataDirection::Write), 0x20);
    }

    #[test]
    fn oversized_cdb_is_truncated() {
        let cdb = [0xaa; 20];
        let upiu = build_command_upiu(0, 0, DataDirection::None, 0, &cdb);
        assert_eq!(upiu.cdb, [0xaa; MAX_CDB_LEN]);
    }

    #[test]
    fn read_descriptor_request_encodes_length() {
        let request = QueryRequest::new(QueryOpcode::ReadDescriptor, 1, 2, 3).with_length(0x1234);
        let bytes = build_query_request_upiu(9, &request).as_bytes().to_vec();

        assert_eq!(bytes[0], transaction::QUERY_REQUEST);
        assert_eq!(bytes[3], 9);
        assert_eq!(bytes[5], query::FUNC_STD_READ);
        assert_eq!(&bytes[10..12], &[0, 0]);
        assert_eq!(&bytes[12..16], &[1, 1, 2, 3]);
        assert_eq!(&bytes[18..20], &[0x12, 0x34]);
        assert_eq!(&bytes[20..24], &[0, 0, 0, 0]);
    }

    #[test]
    fn write_descriptor_request_announces_payload() {
        let payload = [0u8; 0x90];
        let request = QueryRequest::new(QueryOpcode::WriteDescriptor, 1, 0, 0).with_payload(&payload);
        let upiu = build_query_request_upiu(0, &request);

        assert_eq!(upiu.header.function, query::FUNC_STD_WRITE);
        assert_eq!(upiu.header.data_segment_length.get(), 0x90);
        assert_eq!(upiu.tsf.length.get(), 0x90);
        assert_eq!(request.data_out().len(), 0x90);
        assert_eq!(request.data_in_len(), 0);
    }

    #[test]
    fn write_attribute_request_encodes_value() {
        let request =
            QueryRequest::new(QueryOpcode::WriteAttribute, 3, 0, 0).with_value(0xa1b2_c3d4);
        let bytes = build_query_request_upiu(0, &request).as_bytes().to_vec();
        assert_eq!(&bytes[20..24], &[0xa1, 0xb2, 0xc3, 0xd4]);
        assert_eq!(&bytes[18..20], &[0, 0]);
    }

    #[test]
    fn flag_opcodes_pick_functions() {
        assert_eq!(QueryOpcode::ReadFlag.function(), query::FUNC_STD_READ);
        assert_eq!(QueryOpcode::SetFlag.function(), query::FUNC_STD_WRITE);
        assert_eq!(QueryOpcode::ToggleFlag.function(), query::FUNC_STD_WRITE);
        assert!(QueryOpcode::ClearFlag.is_flag());
        assert!(!QueryOpcode::ReadAttribute.is_flag());
        assert_eq!(QueryOpcode::from_u8(8), Some(QueryOpcode::ToggleFlag));
        assert_eq!(QueryOpcode::from_u8(9), None);
    }

    #[test]
    fn nop_carries_only_the_task_tag() {
        let bytes = build_nop_upiu(0x42).as_bytes().to_vec();
        assert_eq!(bytes[0], transaction::NOP_OUT);
        assert_eq!(bytes[3], 0x42);
        assert_eq!(bytes.iter().filter(|&&b| b != 0).count(), 1);
    }

    proptest! {
        #[test]
        fn wire_integers_round_trip(short: u16, long: u32) {
            let header = UpiuHeader {
                data_segment_length: short.into(),
                ..FromZeros::new_zeroed()
            };
            let decoded = UpiuHeader::read_from_bytes(header.as_bytes()).unwrap();
            prop_assert_eq!(decoded.data_segment_length.get(), short);
            prop_assert_eq!(&header.as_bytes()[10..12], &short.to_be_bytes());

            let upiu = build_command_upiu(0, 0, DataDirection::None, long, &[]);
            let decoded = CommandUpiu::read_from_bytes(upiu.as_bytes()).unwrap();
            prop_assert_eq!(decoded.expected_data_transfer_length.get(), long);
            prop_assert_eq!(&upiu.as_bytes()[12..16], &long.to_be_bytes());
        }
    }
}
