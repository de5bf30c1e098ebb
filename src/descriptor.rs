//! UTP transfer request descriptors, PRDTs and the command descriptors they
//! point to.
//!
//! A command descriptor holds, back to back and 8-byte aligned, the request
//! UPIU, the response UPIU and, for data transfers, the PRDT. The TRD locates
//! the response and the PRDT through dword offsets, which [`DescriptorLayout`]
//! computes for each kind of request.

use std::mem::size_of;

use tracing::warn;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::{
    constants::trd,
    upiu::{CommandUpiu, DataDirection, NopUpiu, QueryRequest, QueryUpiu, ResponseUpiu},
};

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_le = zerocopy::U16<zerocopy::LittleEndian>;
    pub type u32_le = zerocopy::U32<zerocopy::LittleEndian>;
}

use packed_nums::*;

const INTERRUPT: u32 = 1 << 24;
const DATA_DIRECTION_SHIFT: u32 = 25;
const COMMAND_TYPE_SHIFT: u32 = 28;
const PRDT_BYTE_COUNT_MASK: u32 = 0x3_ffff;

const fn round_up_8(len: usize) -> usize {
    (len + 7) & !7
}

const fn dwords(len: usize) -> u16 {
    (len / size_of::<u32>()) as u16
}

/// UTP transfer request descriptor, one per transfer slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UtpTrd {
    /// Command type, data direction and interrupt flag.
    pub header: u32_le,
    pub data_unit_number_low: u32_le,
    /// Overall command status in the low byte.
    pub status: u32_le,
    pub data_unit_number_high: u32_le,
    pub ucd_base_low: u32_le,
    pub ucd_base_high: u32_le,
    pub response_upiu_length: u16_le,
    pub response_upiu_offset: u16_le,
    pub prdt_length: u16_le,
    pub prdt_offset: u16_le,
}

impl UtpTrd {
    /// Describe the command descriptor at `ucd_address`.
    #[must_use]
    pub fn new(direction: DataDirection, ucd_address: u64, layout: &DescriptorLayout) -> Self {
        let dd: u32 = match direction {
            DataDirection::None => 0,
            DataDirection::Write => 1,
            DataDirection::Read => 2,
        };
        Self {
            header: (trd::CT_UFS_STORAGE << COMMAND_TYPE_SHIFT
                | dd << DATA_DIRECTION_SHIFT
                | INTERRUPT)
                .into(),
            status: u32::from(trd::OCS_INIT).into(),
            ucd_base_low: ((ucd_address as u32) & !(trd::UCD_ALIGN as u32 - 1)).into(),
            ucd_base_high: ((ucd_address >> 32) as u32).into(),
            response_upiu_length: dwords(layout.response_len).into(),
            response_upiu_offset: dwords(layout.response_offset).into(),
            prdt_length: (layout.prdt_entries as u16).into(),
            prdt_offset: if layout.prdt_entries == 0 {
                0u16.into()
            } else {
                dwords(layout.prdt_offset).into()
            },
            ..FromZeros::new_zeroed()
        }
    }

    /// The overall command status. Only meaningful once the doorbell bit of
    /// the slot has cleared.
    #[must_use]
    pub fn ocs(&self) -> u8 {
        (self.status.get() & 0xff) as u8
    }

    #[must_use]
    pub fn data_direction(&self) -> u32 {
        (self.header.get() >> DATA_DIRECTION_SHIFT) & 0x3
    }

    #[must_use]
    pub fn ucd_address(&self) -> u64 {
        u64::from(self.ucd_base_high.get()) << 32 | u64::from(self.ucd_base_low.get())
    }
}

/// One entry of a physical region description table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PrdtEntry {
    pub address_low: u32_le,
    pub address_high: u32_le,
    pub reserved: u32_le,
    /// Byte count minus one.
    pub byte_count: u32_le,
}

impl PrdtEntry {
    #[must_use]
    pub fn address(&self) -> u64 {
        u64::from(self.address_high.get()) << 32 | u64::from(self.address_low.get())
    }

    /// Number of bytes this entry describes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        (self.byte_count.get() & PRDT_BYTE_COUNT_MASK) as usize + 1
    }
}

/// Describe `length` bytes at `address` as a PRDT.
///
/// Each entry covers at most `max_per_entry` bytes, which is clamped to the
/// range a single entry can express. Lengths that are not a multiple of four
/// lose their low two bits.
#[must_use]
pub fn build_prdt(address: u64, length: usize, max_per_entry: usize) -> Vec<PrdtEntry> {
    let max_per_entry = max_per_entry.clamp(4, trd::MAX_DATA_LEN_PER_PRD) & !3;
    let mut length = length;
    if length % 4 != 0 {
        warn!("PRDT length {length:#x} is not dword aligned, truncating");
        length &= !3;
    }

    let mut entries = Vec::with_capacity(length.div_ceil(max_per_entry));
    let mut offset = 0;
    while offset < length {
        let chunk = (length - offset).min(max_per_entry);
        let chunk_address = address + offset as u64;
        entries.push(PrdtEntry {
            address_low: ((chunk_address as u32) & !3).into(),
            address_high: ((chunk_address >> 32) as u32).into(),
            reserved: 0u32.into(),
            byte_count: ((chunk - 1) as u32 & PRDT_BYTE_COUNT_MASK).into(),
        });
        offset += chunk;
    }
    entries
}

/// Where the parts of a command descriptor live, in bytes from its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorLayout {
    pub request_len: usize,
    pub response_offset: usize,
    pub response_len: usize,
    pub prdt_offset: usize,
    pub prdt_entries: usize,
}

impl DescriptorLayout {
    const fn new(request_len: usize, response_len: usize, prdt_entries: usize) -> Self {
        let request_len = round_up_8(request_len);
        let response_len = round_up_8(response_len);
        Self {
            request_len,
            response_offset: request_len,
            response_len,
            prdt_offset: request_len + response_len,
            prdt_entries,
        }
    }

    /// Size of the whole command descriptor.
    #[must_use]
    pub const fn total_len(&self) -> usize {
        self.prdt_offset + self.prdt_entries * size_of::<PrdtEntry>()
    }
}

/// A command descriptor image ready to be copied into DMA memory, together
/// with what its TRD needs to know about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub direction: DataDirection,
    pub layout: DescriptorLayout,
    pub image: Vec<u8>,
}

impl CommandFrame {
    fn new(direction: DataDirection, layout: DescriptorLayout) -> Self {
        Self {
            direction,
            layout,
            image: vec![0; layout.total_len()],
        }
    }

    /// The TRD for this frame once placed at `ucd_address`.
    #[must_use]
    pub fn trd(&self, ucd_address: u64) -> UtpTrd {
        UtpTrd::new(self.direction, ucd_address, &self.layout)
    }

    /// The response region of a completed descriptor image of this layout.
    #[must_use]
    pub fn response_range(&self) -> std::ops::Range<usize> {
        self.layout.response_offset..self.layout.response_offset + self.layout.response_len
    }
}

/// Command descriptor for a SCSI command. `data` is the device address and
/// length of the mapped data buffer, if any.
#[must_use]
pub fn build_scsi_descriptor(
    upiu: &CommandUpiu,
    direction: DataDirection,
    data: Option<(u64, usize)>,
) -> CommandFrame {
    let prdt = data.map_or_else(Vec::new, |(address, len)| {
        build_prdt(address, len, trd::MAX_DATA_LEN_PER_PRD)
    });
    let layout = DescriptorLayout::new(
        size_of::<CommandUpiu>(),
        size_of::<ResponseUpiu>(),
        prdt.len(),
    );
    let mut frame = CommandFrame::new(direction, layout);
    frame.image[..size_of::<CommandUpiu>()].copy_from_slice(upiu.as_bytes());
    for (i, entry) in prdt.iter().enumerate() {
        let at = layout.prdt_offset + i * size_of::<PrdtEntry>();
        frame.image[at..at + size_of::<PrdtEntry>()].copy_from_slice(entry.as_bytes());
    }
    frame
}

/// Layout of the command descriptor for `request`, sized for the payload the
/// request carries and the one its response is expected to carry.
#[must_use]
pub fn query_descriptor_layout(request: &QueryRequest<'_>) -> DescriptorLayout {
    DescriptorLayout::new(
        size_of::<QueryUpiu>() + request.data_out().len(),
        size_of::<QueryUpiu>() + request.data_in_len(),
        0,
    )
}

/// Command descriptor for a query request.
#[must_use]
pub fn build_query_descriptor(upiu: &QueryUpiu, request: &QueryRequest<'_>) -> CommandFrame {
    let payload = request.data_out();
    let layout = query_descriptor_layout(request);
    let mut frame = CommandFrame::new(DataDirection::None, layout);
    let header = size_of::<QueryUpiu>();
    frame.image[..header].copy_from_slice(upiu.as_bytes());
    frame.image[header..header + payload.len()].copy_from_slice(payload);
    frame
}

/// Command descriptor for a NOP OUT.
#[must_use]
pub fn build_nop_descriptor(upiu: &NopUpiu) -> CommandFrame {
    let layout = DescriptorLayout::new(size_of::<NopUpiu>(), size_of::<NopUpiu>(), 0);
    let mut frame = CommandFrame::new(DataDirection::None, layout);
    frame.image[..size_of::<NopUpiu>()].copy_from_slice(upiu.as_bytes());
    frame
}
