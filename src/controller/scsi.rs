//! SCSI pass-through.

use std::time::Duration;

use tracing::{debug, warn};
use zerocopy::FromBytes;

use super::{submit::Completion, UfsHostController};
use crate::{
    descriptor::build_scsi_descriptor,
    dma::MapOperation,
    error::{DeviceFault, Result, UfsError},
    upiu::{build_command_upiu, DataDirection, ResponseUpiu, MAX_CDB_LEN, SENSE_DATA_LEN},
};

/// The data phase of a SCSI command.
#[derive(Debug)]
pub enum ScsiData<'a> {
    None,
    /// Device to host.
    In(&'a mut [u8]),
    /// Host to device.
    Out(&'a [u8]),
}

/// One SCSI command and, after execution, its outcome.
#[derive(Debug)]
pub struct ScsiRequestPacket<'a> {
    pub cdb: &'a [u8],
    pub data: ScsiData<'a>,
    /// Bytes to read; after completion the bytes actually read.
    pub in_transfer_length: u32,
    /// Bytes to write; after completion the bytes actually written.
    pub out_transfer_length: u32,
    pub sense_data: &'a mut [u8],
    /// Valid bytes in `sense_data` after completion.
    pub sense_data_length: u8,
    /// SCSI status reported by the target.
    pub target_status: u8,
    /// Overrides the configured command timeout.
    pub timeout: Option<Duration>,
}

impl<'a> ScsiRequestPacket<'a> {
    /// A packet transferring all of `data`.
    #[must_use]
    pub fn new(cdb: &'a [u8], data: ScsiData<'a>, sense_data: &'a mut [u8]) -> Self {
        let clamp = |len: usize| u32::try_from(len).unwrap_or(u32::MAX);
        let (in_transfer_length, out_transfer_length) = match &data {
            ScsiData::None => (0, 0),
            ScsiData::In(buf) => (clamp(buf.len()), 0),
            ScsiData::Out(buf) => (0, clamp(buf.len())),
        };
        Self {
            cdb,
            data,
            in_transfer_length,
            out_transfer_length,
            sense_data,
            sense_data_length: 0,
            target_status: 0,
            timeout: None,
        }
    }

    /// Direction and length of the data phase.
    fn data_phase(&self) -> (DataDirection, usize) {
        let (direction, requested, available) = match &self.data {
            ScsiData::None => return (DataDirection::None, 0),
            ScsiData::In(buf) => (DataDirection::Read, self.in_transfer_length, buf.len()),
            ScsiData::Out(buf) => (DataDirection::Write, self.out_transfer_length, buf.len()),
        };
        match (requested as usize).min(available) {
            0 => (DataDirection::None, 0),
            len => (direction, len),
        }
    }
}

impl UfsHostController {
    /// Execute a SCSI command on `lun`.
    ///
    /// The data buffer is mapped for the duration of the command only. On
    /// success the transfer lengths of `packet` report the bytes actually
    /// moved; the target status and sense data are filled in whenever the
    /// device answered.
    pub fn exec_scsi(&mut self, lun: u8, packet: &mut ScsiRequestPacket<'_>) -> Result<()> {
        if packet.cdb.is_empty() || packet.cdb.len() > MAX_CDB_LEN {
            return Err(UfsError::InvalidParameter("CDB length"));
        }
        let (direction, len) = packet.data_phase();

        let mapping = match &packet.data {
            ScsiData::In(buf) if direction == DataDirection::Read => {
                Some(self.iommu.map(MapOperation::BusMasterWrite, &buf[..len])?)
            }
            ScsiData::Out(buf) if direction == DataDirection::Write => {
                Some(self.iommu.map(MapOperation::BusMasterRead, &buf[..len])?)
            }
            _ => None,
        };
        match direction {
            DataDirection::Read => packet.in_transfer_length = len as u32,
            DataDirection::Write => packet.out_transfer_length = len as u32,
            DataDirection::None => {}
        }

        let task_tag = self.next_task_tag();
        let upiu = build_command_upiu(lun, task_tag, direction, len as u32, packet.cdb);
        let frame = build_scsi_descriptor(
            &upiu,
            direction,
            mapping.map(|mapping| (mapping.device_address, mapping.len)),
        );
        debug!(
            "LUN {lun}: SCSI opcode {:#04x}, {len} bytes {direction:?}",
            packet.cdb[0]
        );

        let timeout = packet.timeout.unwrap_or(self.config.command_timeout);
        let result = self
            .submit(&frame, timeout)
            .and_then(|completion| complete_scsi(&completion, packet));

        if let Some(mapping) = mapping {
            let data = match &mut packet.data {
                ScsiData::In(buf) => Some(&mut buf[..len]),
                _ => None,
            };
            self.iommu.unmap(mapping, data);
        }
        result
    }
}

fn complete_scsi(completion: &Completion, packet: &mut ScsiRequestPacket<'_>) -> Result<()> {
    let (response, _) = ResponseUpiu::read_from_prefix(&completion.response)
        .map_err(|_| UfsError::DeviceError(DeviceFault::Ocs(completion.ocs)))?;

    let sense_len = usize::from(response.sense_data_length.get());
    if sense_len <= packet.sense_data.len() && sense_len <= SENSE_DATA_LEN {
        packet.sense_data[..sense_len].copy_from_slice(&response.sense_data[..sense_len]);
        packet.sense_data_length = sense_len as u8;
    } else {
        warn!(
            "dropping {sense_len} bytes of sense data for a {} byte buffer",
            packet.sense_data.len()
        );
        packet.sense_data_length = 0;
    }
    packet.target_status = response.header.status;

    if response.header.response != 0 {
        return Err(DeviceFault::Response {
            response: response.header.response,
            status: response.header.status,
        }
        .into());
    }
    if completion.ocs != 0 {
        return Err(DeviceFault::Ocs(completion.ocs).into());
    }

    if response.underflow() {
        let residual = response.residual_transfer_count.get();
        match packet.data {
            ScsiData::In(_) => {
                packet.in_transfer_length = packet.in_transfer_length.saturating_sub(residual);
            }
            ScsiData::Out(_) => {
                packet.out_transfer_length = packet.out_transfer_length.saturating_sub(residual);
            }
            ScsiData::None => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        controller::tests::start,
        sim::{SimConfig, SimController, BLOCK_SIZE},
    };

    const CHECK_CONDITION: u8 = 0x02;

    fn read10(lba: u32, blocks: u16) -> [u8; 10] {
        let lba = lba.to_be_bytes();
        let blocks = blocks.to_be_bytes();
        [0x28, 0, lba[0], lba[1], lba[2], lba[3], 0, blocks[0], blocks[1], 0]
    }

    fn write10(lba: u32, blocks: u16) -> [u8; 10] {
        let mut cdb = read10(lba, blocks);
        cdb[0] = 0x2a;
        cdb
    }

    #[test]
    fn read_returns_lun_contents() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let mut data = vec![0u8; 2 * BLOCK_SIZE];
        let mut sense = [0u8; SENSE_DATA_LEN];
        let cdb = read10(3, 2);

        let mut packet = ScsiRequestPacket::new(&cdb, ScsiData::In(&mut data), &mut sense);
        controller.exec_scsi(1, &mut packet).unwrap();
        assert_eq!(packet.in_transfer_length, 2 * BLOCK_SIZE as u32);
        assert_eq!(packet.target_status, 0);
        assert_eq!(packet.sense_data_length, 0);

        let lun = sim.lun_data(1).unwrap();
        assert_eq!(data, lun[3 * BLOCK_SIZE..5 * BLOCK_SIZE]);
    }

    #[test]
    fn write_then_read_back() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let pattern: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i * 7) as u8).collect();
        let mut sense = [0u8; SENSE_DATA_LEN];

        let cdb = write10(9, 1);
        let mut packet = ScsiRequestPacket::new(&cdb, ScsiData::Out(&pattern), &mut sense);
        controller.exec_scsi(0, &mut packet).unwrap();
        assert_eq!(packet.out_transfer_length, BLOCK_SIZE as u32);
        assert_eq!(
            sim.lun_data(0).unwrap()[9 * BLOCK_SIZE..10 * BLOCK_SIZE],
            pattern[..]
        );

        let mut data = vec![0u8; BLOCK_SIZE];
        let cdb = read10(9, 1);
        let mut packet = ScsiRequestPacket::new(&cdb, ScsiData::In(&mut data), &mut sense);
        controller.exec_scsi(0, &mut packet).unwrap();
        assert_eq!(data, pattern);
    }

    #[test]
    fn residual_is_subtracted_from_the_read_length() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let mut data = vec![0u8; 4096];
        let mut sense = [0u8; SENSE_DATA_LEN];
        let cdb = read10(0, 1);
        sim.force_residual(512);

        let mut packet = ScsiRequestPacket::new(&cdb, ScsiData::In(&mut data), &mut sense);
        controller.exec_scsi(0, &mut packet).unwrap();
        assert_eq!(packet.in_transfer_length, 3584);
    }

    #[test]
    fn short_device_answer_reports_an_underflow() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let mut data = [0u8; 64];
        let mut sense = [0u8; SENSE_DATA_LEN];
        // INQUIRY with an allocation length of 64; the device has 36 bytes
        let cdb = [0x12, 0, 0, 0, 64, 0];

        let mut packet = ScsiRequestPacket::new(&cdb, ScsiData::In(&mut data), &mut sense);
        controller.exec_scsi(0, &mut packet).unwrap();
        assert_eq!(packet.in_transfer_length, 36);
        assert_eq!(&data[8..14], b"UFSSIM");
    }

    #[test]
    fn check_condition_returns_sense_data() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let mut sense = [0u8; 32];
        let cdb = [0xff, 0, 0, 0, 0, 0];

        let mut packet = ScsiRequestPacket::new(&cdb, ScsiData::None, &mut sense);
        controller.exec_scsi(0, &mut packet).unwrap();
        assert_eq!(packet.target_status, CHECK_CONDITION);
        assert_eq!(usize::from(packet.sense_data_length), SENSE_DATA_LEN);
        assert_eq!(sense[0], 0x70);
        // ILLEGAL REQUEST
        assert_eq!(sense[2] & 0x0f, 0x05);
    }

    #[test]
    fn sense_data_larger_than_the_buffer_is_dropped() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let mut sense = [0u8; 8];
        let cdb = [0xff, 0, 0, 0, 0, 0];

        let mut packet = ScsiRequestPacket::new(&cdb, ScsiData::None, &mut sense);
        controller.exec_scsi(0, &mut packet).unwrap();
        assert_eq!(packet.target_status, CHECK_CONDITION);
        assert_eq!(packet.sense_data_length, 0);
        assert_eq!(sense, [0; 8]);
    }

    #[test]
    fn target_failure_is_a_device_error_with_status() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let mut sense = [0u8; SENSE_DATA_LEN];
        let cdb = [0u8; 6];
        sim.force_scsi_response(0x01, 0x08);

        let mut packet = ScsiRequestPacket::new(&cdb, ScsiData::None, &mut sense);
        assert_eq!(
            controller.exec_scsi(0, &mut packet),
            Err(UfsError::DeviceError(DeviceFault::Response {
                response: 0x01,
                status: 0x08,
            }))
        );
        assert_eq!(packet.target_status, 0x08);
    }

    #[test]
    fn ocs_failure_skips_the_residual() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let mut data = vec![0u8; 4096];
        let mut sense = [0u8; SENSE_DATA_LEN];
        let cdb = read10(0, 1);
        sim.force_residual(512);
        sim.force_ocs(0x02);

        let mut packet = ScsiRequestPacket::new(&cdb, ScsiData::In(&mut data), &mut sense);
        assert_eq!(
            controller.exec_scsi(0, &mut packet),
            Err(UfsError::DeviceError(DeviceFault::Ocs(0x02)))
        );
        assert_eq!(packet.in_transfer_length, 4096);
    }

    #[test]
    fn cdb_length_is_validated() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let mut sense = [0u8; SENSE_DATA_LEN];
        let completed = sim.completed_commands();

        for cdb in [&[][..], &[0u8; 17][..]] {
            let mut packet = ScsiRequestPacket::new(cdb, ScsiData::None, &mut sense);
            assert_eq!(
                controller.exec_scsi(0, &mut packet),
                Err(UfsError::InvalidParameter("CDB length"))
            );
        }
        assert_eq!(sim.completed_commands(), completed);
    }

    #[test]
    fn unmapped_after_every_command() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let bounce = sim.bounce_available();
        let mut data = vec![0u8; BLOCK_SIZE];
        let mut sense = [0u8; SENSE_DATA_LEN];

        // out of range LBA
        let cdb = read10(1 << 20, 1);
        let mut packet = ScsiRequestPacket::new(&cdb, ScsiData::In(&mut data), &mut sense);
        controller.exec_scsi(0, &mut packet).unwrap();
        assert_eq!(packet.target_status, CHECK_CONDITION);
        assert_eq!(sim.bounce_available(), bounce);

        sim.hang_next_commands(1);
        let cdb = read10(0, 1);
        let mut packet = ScsiRequestPacket::new(&cdb, ScsiData::In(&mut data), &mut sense);
        assert!(controller.exec_scsi(0, &mut packet).is_err());
        assert_eq!(sim.bounce_available(), bounce);
    }

    #[test]
    fn transfer_length_is_bounded_by_the_buffer() {
        let mut data = [0u8; 16];
        let mut sense = [0u8; 0];
        let cdb = [0x28];
        let mut packet = ScsiRequestPacket::new(&cdb, ScsiData::In(&mut data), &mut sense);
        packet.in_transfer_length = 4096;
        assert_eq!(packet.data_phase(), (DataDirection::Read, 16));

        packet.in_transfer_length = 0;
        assert_eq!(packet.data_phase(), (DataDirection::None, 0));
    }
}
