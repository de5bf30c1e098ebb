//! The UFS device behind the emulated controller: a handful of logical units
//! answering SCSI commands, and the descriptor, attribute and flag tables
//! served through query requests.

use std::collections::BTreeMap;

use tracing::{debug, trace};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::{
    constants::{idn, query, transaction, upiu_flags},
    descriptor::PrdtEntry,
    dma::DmaBus,
    upiu::{CommandUpiu, NopUpiu, QueryOpcode, QueryUpiu, ResponseUpiu, UpiuHeader, SENSE_DATA_LEN},
};

/// Logical block size of every emulated logical unit.
pub const BLOCK_SIZE: usize = 4096;

/// OCS reported for frames the device cannot parse.
const OCS_INVALID_COMMAND_TABLE_ATTRIBUTES: u8 = 0x01;

const GOOD: u8 = 0x00;
const CHECK_CONDITION: u8 = 0x02;

mod scsi_op {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2a;
}

const SENSE_ILLEGAL_REQUEST: u8 = 0x05;
const ASC_INVALID_OPCODE: u8 = 0x20;
const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
const ASC_LUN_NOT_SUPPORTED: u8 = 0x25;

/// Device side fault injection.
#[derive(Debug, Default)]
pub(super) struct DeviceFaults {
    pub scsi_response: Option<(u8, u8)>,
    pub residual: Option<u32>,
    pub query_failure: Option<(u8, u32)>,
    pub descriptor_length: Option<u16>,
}

impl DeviceFaults {
    fn take_query_failure(&mut self) -> Option<u8> {
        match self.query_failure {
            Some((code, remaining)) if remaining > 0 => {
                self.query_failure = (remaining > 1).then_some((code, remaining - 1));
                Some(code)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(super) struct UfsDevice {
    luns: Vec<Vec<u8>>,
    descriptors: BTreeMap<(u8, u8), Vec<u8>>,
    attributes: BTreeMap<u8, u32>,
    flags: BTreeMap<u8, bool>,
    device_init_reads: u32,
    init_reads_left: u32,
    sense: [u8; SENSE_DATA_LEN],
    pub faults: DeviceFaults,
}

fn fixed_sense(key: u8, asc: u8) -> [u8; SENSE_DATA_LEN] {
    let mut sense = [0; SENSE_DATA_LEN];
    sense[0] = 0x70;
    sense[2] = key;
    sense[7] = (SENSE_DATA_LEN - 8) as u8;
    sense[12] = asc;
    sense
}

fn scatter(memory: &dyn DmaBus, prdt: &[PrdtEntry], data: &[u8]) -> usize {
    let mut done = 0;
    for entry in prdt {
        if done == data.len() {
            break;
        }
        let len = entry.byte_len().min(data.len() - done);
        memory.write_bulk(entry.address(), &data[done..done + len]);
        done += len;
    }
    done
}

fn gather(memory: &dyn DmaBus, prdt: &[PrdtEntry], len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    for entry in prdt {
        if data.len() == len {
            break;
        }
        let start = data.len();
        let chunk = entry.byte_len().min(len - start);
        data.resize(start + chunk, 0);
        memory.read_bulk(entry.address(), &mut data[start..]);
    }
    data
}

fn device_descriptor(luns: usize) -> Vec<u8> {
    let mut desc = vec![0; 0x59];
    desc[0x00] = 0x59;
    desc[0x01] = idn::DESC_DEVICE;
    desc[0x06] = luns as u8;
    desc[0x07] = 4;
    desc[0x08] = 1;
    desc[0x0a] = 1;
    desc[0x10..0x12].copy_from_slice(&0x0310u16.to_be_bytes());
    desc[0x12..0x14].copy_from_slice(&0x0924u16.to_be_bytes());
    desc[0x14] = 1;
    desc[0x15] = 2;
    desc[0x16] = 3;
    desc[0x17] = 4;
    desc[0x18..0x1a].copy_from_slice(&0x0198u16.to_be_bytes());
    desc
}

/// UFS 3.x configuration descriptor: 22 byte header, eight 26 byte units.
fn configuration_descriptor(luns: usize) -> Vec<u8> {
    const HEADER: usize = 22;
    const UNIT: usize = 26;
    let mut desc = vec![0; HEADER + 8 * UNIT];
    desc[0] = desc.len() as u8;
    desc[1] = idn::DESC_CONFIGURATION;
    for lun in 0..luns.min(8) {
        desc[HEADER + lun * UNIT] = 1;
    }
    desc
}

impl UfsDevice {
    /// A device with one logical unit per entry of `lun_blocks`.
    pub fn new(lun_blocks: &[u32], device_init_reads: u32) -> Self {
        let luns: Vec<Vec<u8>> = lun_blocks
            .iter()
            .enumerate()
            .map(|(lun, &blocks)| {
                (0..blocks as usize * BLOCK_SIZE)
                    .map(|i| (i / BLOCK_SIZE) as u8 ^ (i % 251) as u8 ^ lun as u8)
                    .collect()
            })
            .collect();

        let descriptors = BTreeMap::from([
            ((idn::DESC_DEVICE, 0), device_descriptor(luns.len())),
            ((idn::DESC_CONFIGURATION, 0), configuration_descriptor(luns.len())),
        ]);
        let attributes = BTreeMap::from([
            (idn::ATTR_BOOT_LUN_EN, 1),
            (idn::ATTR_CURRENT_POWER_MODE, 0x11),
            (idn::ATTR_ACTIVE_ICC_LEVEL, 0),
        ]);
        let flags = BTreeMap::from([(idn::FLAG_DEVICE_INIT, false), (0x02, false), (0x04, true)]);

        Self {
            luns,
            descriptors,
            attributes,
            flags,
            device_init_reads,
            init_reads_left: 0,
            sense: [0; SENSE_DATA_LEN],
            faults: DeviceFaults::default(),
        }
    }

    pub fn lun(&self, lun: u8) -> Option<&[u8]> {
        self.luns.get(usize::from(lun)).map(Vec::as_slice)
    }

    pub fn set_descriptor(&mut self, idn: u8, index: u8, bytes: Vec<u8>) {
        self.descriptors.insert((idn, index), bytes);
    }

    pub fn descriptor(&self, idn: u8, index: u8) -> Option<&[u8]> {
        self.descriptors.get(&(idn, index)).map(Vec::as_slice)
    }

    pub fn flag(&self, idn: u8) -> Option<bool> {
        self.flags.get(&idn).copied()
    }

    /// Execute the request UPIU and return the OCS and the response UPIU.
    pub fn handle(
        &mut self,
        memory: &dyn DmaBus,
        request: &[u8],
        prdt: &[PrdtEntry],
        response_len: usize,
    ) -> (u8, Vec<u8>) {
        let Some(&transaction_type) = request.first() else {
            return (OCS_INVALID_COMMAND_TABLE_ATTRIBUTES, vec![]);
        };
        trace!("device: transaction {transaction_type:#04x}");

        match transaction_type {
            transaction::NOP_OUT => match NopUpiu::read_from_prefix(request) {
                Ok((nop, _)) => (0, Self::nop_in(&nop).as_bytes().to_vec()),
                Err(_) => (OCS_INVALID_COMMAND_TABLE_ATTRIBUTES, vec![]),
            },
            transaction::COMMAND => match CommandUpiu::read_from_prefix(request) {
                Ok((command, _)) => (0, self.scsi(memory, &command, prdt).as_bytes().to_vec()),
                Err(_) => (OCS_INVALID_COMMAND_TABLE_ATTRIBUTES, vec![]),
            },
            transaction::QUERY_REQUEST => match QueryUpiu::read_from_prefix(request) {
                Ok((upiu, payload)) => (0, self.query(&upiu, payload, response_len)),
                Err(_) => (OCS_INVALID_COMMAND_TABLE_ATTRIBUTES, vec![]),
            },
            _ => {
                debug!("device: unsupported transaction {transaction_type:#04x}");
                (OCS_INVALID_COMMAND_TABLE_ATTRIBUTES, vec![])
            }
        }
    }

    fn nop_in(nop: &NopUpiu) -> NopUpiu {
        NopUpiu {
            header: UpiuHeader {
                transaction_type: transaction::NOP_IN,
                task_tag: nop.header.task_tag,
                ..FromZeros::new_zeroed()
            },
            ..FromZeros::new_zeroed()
        }
    }

    fn scsi(&mut self, memory: &dyn DmaBus, command: &CommandUpiu, prdt: &[PrdtEntry]) -> ResponseUpiu {
        let header = &command.header;
        let expected = command.expected_data_transfer_length.get() as usize;
        let mut response = ResponseUpiu {
            header: UpiuHeader {
                transaction_type: transaction::RESPONSE,
                lun: header.lun,
                task_tag: header.task_tag,
                ..FromZeros::new_zeroed()
            },
            ..FromZeros::new_zeroed()
        };

        let data_out = if header.flags & upiu_flags::WRITE != 0 {
            gather(memory, prdt, expected)
        } else {
            vec![]
        };

        let moved = match self.execute_cdb(header.lun, &command.cdb, &data_out) {
            Ok(Some(data_in)) => {
                let len = data_in.len().min(expected);
                if data_in.len() > expected {
                    response.header.flags |= upiu_flags::OVERFLOW;
                    response.residual_transfer_count = ((data_in.len() - expected) as u32).into();
                }
                scatter(memory, prdt, &data_in[..len])
            }
            Ok(None) => data_out.len(),
            Err(sense) => {
                debug!("device: CHECK CONDITION, sense key {:#x} asc {:#x}", sense[2], sense[12]);
                response.header.status = CHECK_CONDITION;
                response.header.data_segment_length = ((SENSE_DATA_LEN + 2) as u16).into();
                response.sense_data_length = (SENSE_DATA_LEN as u16).into();
                response.sense_data = sense;
                self.sense = sense;
                0
            }
        };

        if moved < expected && response.header.status == GOOD {
            response.header.flags |= upiu_flags::UNDERFLOW;
            response.residual_transfer_count = ((expected - moved) as u32).into();
        }
        if let Some((code, status)) = self.faults.scsi_response.take() {
            response.header.response = code;
            response.header.status = status;
        }
        if let Some(residual) = self.faults.residual.take() {
            response.header.flags |= upiu_flags::UNDERFLOW;
            response.residual_transfer_count = residual.into();
        }
        response
    }

    /// Run a CDB. Returns the data-in bytes, or the sense data on failure.
    fn execute_cdb(
        &mut self,
        lun: u8,
        cdb: &[u8; 16],
        data_out: &[u8],
    ) -> Result<Option<Vec<u8>>, [u8; SENSE_DATA_LEN]> {
        let Some(unit) = self.luns.get_mut(usize::from(lun)) else {
            return Err(fixed_sense(SENSE_ILLEGAL_REQUEST, ASC_LUN_NOT_SUPPORTED));
        };
        let blocks = unit.len() / BLOCK_SIZE;
        let block_range = || -> Result<std::ops::Range<usize>, [u8; SENSE_DATA_LEN]> {
            let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as usize;
            let count = usize::from(u16::from_be_bytes([cdb[7], cdb[8]]));
            if lba + count > blocks {
                return Err(fixed_sense(SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE));
            }
            Ok(lba * BLOCK_SIZE..(lba + count) * BLOCK_SIZE)
        };

        match cdb[0] {
            scsi_op::TEST_UNIT_READY => Ok(None),
            scsi_op::REQUEST_SENSE => {
                let len = usize::from(cdb[4]).min(SENSE_DATA_LEN);
                let sense = std::mem::take(&mut self.sense);
                Ok(Some(sense[..len].to_vec()))
            }
            scsi_op::INQUIRY => {
                let mut data = vec![0u8; 36];
                data[2] = 0x06;
                data[3] = 0x02;
                data[4] = 31;
                data[8..16].copy_from_slice(b"UFSSIM  ");
                data[16..32].copy_from_slice(b"EMULATED UFS    ");
                data[32..36].copy_from_slice(b"0001");
                let len = usize::from(u16::from_be_bytes([cdb[3], cdb[4]]));
                data.truncate(len);
                Ok(Some(data))
            }
            scsi_op::READ_CAPACITY_10 => {
                let mut data = Vec::with_capacity(8);
                data.extend_from_slice(&(blocks.saturating_sub(1) as u32).to_be_bytes());
                data.extend_from_slice(&(BLOCK_SIZE as u32).to_be_bytes());
                Ok(Some(data))
            }
            scsi_op::READ_10 => {
                let range = block_range()?;
                Ok(Some(unit[range].to_vec()))
            }
            scsi_op::WRITE_10 => {
                let range = block_range()?;
                let len = data_out.len().min(range.len());
                unit[range.start..range.start + len].copy_from_slice(&data_out[..len]);
                Ok(None)
            }
            _ => Err(fixed_sense(SENSE_ILLEGAL_REQUEST, ASC_INVALID_OPCODE)),
        }
    }

    fn query(&mut self, request: &QueryUpiu, payload: &[u8], response_len: usize) -> Vec<u8> {
        let mut reply = QueryUpiu {
            header: UpiuHeader {
                transaction_type: transaction::QUERY_RESPONSE,
                task_tag: request.header.task_tag,
                function: request.header.function,
                ..FromZeros::new_zeroed()
            },
            tsf: request.tsf,
            ..FromZeros::new_zeroed()
        };
        let capacity = response_len.saturating_sub(std::mem::size_of::<QueryUpiu>());

        let result = match self.faults.take_query_failure() {
            Some(code) => Err(code),
            None => self.run_query(request, payload, &mut reply),
        };
        let mut data = match result {
            Ok(data) => data,
            Err(code) => {
                debug!("device: query {:#04x} failed with {code:#04x}", request.tsf.opcode);
                reply.header.response = code;
                vec![]
            }
        };
        data.truncate(capacity);
        reply.header.data_segment_length = (data.len() as u16).into();

        let mut bytes = reply.as_bytes().to_vec();
        bytes.extend_from_slice(&data);
        bytes
    }

    fn run_query(
        &mut self,
        request: &QueryUpiu,
        payload: &[u8],
        reply: &mut QueryUpiu,
    ) -> Result<Vec<u8>, u8> {
        let tsf = &request.tsf;
        let opcode = QueryOpcode::from_u8(tsf.opcode).ok_or(query::RESP_INVALID_OPCODE)?;

        match opcode {
            QueryOpcode::Nop => Ok(vec![]),
            QueryOpcode::ReadDescriptor => {
                let desc = self.lookup_descriptor(tsf.idn, tsf.index, tsf.selector)?;
                let len = usize::from(tsf.length.get()).min(desc.len());
                let mut data = desc[..len].to_vec();
                let reported = match self.faults.descriptor_length {
                    Some(reported) => {
                        data.resize(usize::from(reported), 0);
                        reported
                    }
                    None => len as u16,
                };
                reply.tsf.length = reported.into();
                Ok(data)
            }
            QueryOpcode::WriteDescriptor => {
                self.lookup_descriptor(tsf.idn, tsf.index, tsf.selector)?;
                if tsf.idn != idn::DESC_CONFIGURATION {
                    return Err(query::RESP_NOT_WRITEABLE);
                }
                let len = usize::from(request.header.data_segment_length.get()).min(payload.len());
                self.descriptors
                    .insert((tsf.idn, tsf.index), payload[..len].to_vec());
                reply.tsf.length = (len as u16).into();
                Ok(vec![])
            }
            QueryOpcode::ReadAttribute => {
                let value = *self
                    .attributes
                    .get(&tsf.idn)
                    .ok_or(query::RESP_INVALID_IDN)?;
                reply.tsf.value = value.into();
                Ok(vec![])
            }
            QueryOpcode::WriteAttribute => {
                let value = self
                    .attributes
                    .get_mut(&tsf.idn)
                    .ok_or(query::RESP_INVALID_IDN)?;
                *value = tsf.value.get();
                Ok(vec![])
            }
            QueryOpcode::ReadFlag
            | QueryOpcode::SetFlag
            | QueryOpcode::ClearFlag
            | QueryOpcode::ToggleFlag => {
                let value = self.flag_operation(opcode, tsf.idn)?;
                reply.tsf.value = u32::from(value).into();
                Ok(vec![])
            }
        }
    }

    fn lookup_descriptor(&self, idn: u8, index: u8, selector: u8) -> Result<&[u8], u8> {
        if !self.descriptors.keys().any(|&(known, _)| known == idn) {
            return Err(query::RESP_INVALID_IDN);
        }
        if selector != 0 {
            return Err(query::RESP_INVALID_SELECTOR);
        }
        self.descriptor(idn, index).ok_or(query::RESP_INVALID_INDEX)
    }

    fn flag_operation(&mut self, opcode: QueryOpcode, idn: u8) -> Result<bool, u8> {
        let flag = self.flags.get_mut(&idn).ok_or(query::RESP_INVALID_IDN)?;
        match opcode {
            QueryOpcode::SetFlag => {
                *flag = true;
                if idn == idn::FLAG_DEVICE_INIT {
                    self.init_reads_left = self.device_init_reads;
                }
            }
            QueryOpcode::ClearFlag => *flag = false,
            QueryOpcode::ToggleFlag => *flag = !*flag,
            _ => {
                // fDeviceInit clears itself once initialization finished
                if idn == idn::FLAG_DEVICE_INIT && *flag {
                    if self.init_reads_left == 0 {
                        *flag = false;
                    } else {
                        self.init_reads_left -= 1;
                    }
                }
            }
        }
        Ok(*flag)
    }
}
