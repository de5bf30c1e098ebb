//! Device management: descriptors, attributes and flags over query requests,
//! plus the NOP OUT probe.

use tracing::{debug, trace};
use zerocopy::FromBytes;

use super::{submit::Completion, UfsHostController};
use crate::{
    constants::query::{self, DESCRIPTOR_MAX_LEN},
    descriptor::{build_nop_descriptor, build_query_descriptor, query_descriptor_layout},
    error::{DeviceFault, Result, UfsError},
    upiu::{build_nop_upiu, build_query_request_upiu, NopUpiu, QueryOpcode, QueryRequest, QueryUpiu},
};

/// Whether a query reads or changes device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// What a successful query returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryReply {
    /// Descriptor bytes copied to the caller (read) or accepted by the
    /// device (write).
    Descriptor(usize),
    Flag(bool),
    Attribute(u32),
}

/// Map a failed query to the error taxonomy. Addressing mistakes are the
/// caller's, everything else is the device's.
fn query_error(ocs: u8, response: u8) -> UfsError {
    match response {
        query::RESP_INVALID_SELECTOR | query::RESP_INVALID_INDEX | query::RESP_INVALID_IDN => {
            UfsError::InvalidParameter("query selector, index or IDN")
        }
        _ => DeviceFault::Query { ocs, response }.into(),
    }
}

/// Pull the result of `opcode` out of a QUERY RESPONSE UPIU and the data
/// segment behind it.
///
/// Descriptor reads land in `data`; a device reporting more bytes than `data`
/// holds is a [`DeviceFault::DescriptorOverrun`].
pub fn get_return_data_from_query_response(
    opcode: QueryOpcode,
    response: &[u8],
    data: &mut [u8],
) -> Result<QueryReply> {
    let (upiu, segment) = QueryUpiu::read_from_prefix(response)
        .map_err(|_| UfsError::InvalidParameter("query response too short"))?;

    match opcode {
        QueryOpcode::ReadDescriptor => {
            let reported = usize::from(upiu.tsf.length.get());
            let overrun = DeviceFault::DescriptorOverrun {
                reported,
                capacity: data.len(),
            };
            if reported > data.len() {
                return Err(overrun.into());
            }
            let bytes = segment.get(..reported).ok_or(overrun)?;
            data[..reported].copy_from_slice(bytes);
            Ok(QueryReply::Descriptor(reported))
        }
        QueryOpcode::WriteDescriptor => {
            Ok(QueryReply::Descriptor(usize::from(upiu.tsf.length.get())))
        }
        QueryOpcode::ReadAttribute | QueryOpcode::WriteAttribute => {
            Ok(QueryReply::Attribute(upiu.tsf.value.get()))
        }
        QueryOpcode::ReadFlag
        | QueryOpcode::SetFlag
        | QueryOpcode::ClearFlag
        | QueryOpcode::ToggleFlag => Ok(QueryReply::Flag(
            response[QueryUpiu::FLAG_VALUE_OFFSET] != 0,
        )),
        QueryOpcode::Nop => Err(UfsError::InvalidParameter("query opcode")),
    }
}

impl UfsHostController {
    /// One attempt at a query request.
    fn send_dm_request_retry(
        &mut self,
        request: &QueryRequest<'_>,
        data: &mut [u8],
    ) -> Result<QueryReply> {
        let task_tag = self.next_task_tag();
        let upiu = build_query_request_upiu(task_tag, request);
        let frame = build_query_descriptor(&upiu, request);
        let Completion { ocs, response } = self.submit(&frame, self.config.command_timeout)?;

        let code = QueryUpiu::read_from_prefix(&response)
            .map_or(query::RESP_GENERAL_FAILURE, |(upiu, _)| upiu.header.response);
        if code != query::RESP_SUCCESS || ocs != 0 {
            debug!(
                "query {:?} idn {:#04x} failed: OCS {ocs:#04x}, response {code:#04x}",
                request.opcode, request.idn
            );
            return Err(query_error(ocs, code));
        }
        get_return_data_from_query_response(request.opcode, &response, data)
    }

    /// Run a query request, retrying failed attempts. The error of the last
    /// attempt is returned when all of them fail.
    fn send_dm_request(
        &mut self,
        request: &QueryRequest<'_>,
        data: &mut [u8],
    ) -> Result<QueryReply> {
        let needed = query_descriptor_layout(request).total_len();
        let capacity = self.descriptor_capacity()?;
        if needed > capacity {
            debug!("query needs a {needed} byte command descriptor, blocks hold {capacity}");
            return Err(UfsError::InvalidParameter("query data exceeds a command descriptor"));
        }

        let attempts = self.config.dm_request_attempts.max(1);
        let mut last = UfsError::NotFound("query attempt");
        for attempt in 1..=attempts {
            match self.send_dm_request_retry(request, data) {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    trace!("query attempt {attempt}/{attempts}: {err}");
                    last = err;
                }
            }
        }
        Err(last)
    }

    /// Read a descriptor into `data` or write `data` as a descriptor. Returns
    /// the number of bytes transferred.
    ///
    /// Reads ask for at most [`DESCRIPTOR_MAX_LEN`] bytes whatever the size of
    /// `data`.
    pub fn rw_device_descriptor(
        &mut self,
        access: Access,
        idn: u8,
        index: u8,
        selector: u8,
        data: &mut [u8],
    ) -> Result<usize> {
        let length = match u16::try_from(data.len()) {
            Ok(0) | Err(_) => return Err(UfsError::InvalidParameter("descriptor buffer length")),
            Ok(length) => length,
        };

        let reply = match access {
            Access::Read => {
                let request = QueryRequest::new(QueryOpcode::ReadDescriptor, idn, index, selector)
                    .with_length(length.min(DESCRIPTOR_MAX_LEN as u16));
                self.send_dm_request(&request, data)?
            }
            Access::Write => {
                let payload: &[u8] = data;
                let request = QueryRequest::new(QueryOpcode::WriteDescriptor, idn, index, selector)
                    .with_payload(payload);
                self.send_dm_request(&request, &mut [])?
            }
        };
        match reply {
            QueryReply::Descriptor(len) => Ok(len),
            _ => Err(UfsError::InvalidParameter("descriptor reply")),
        }
    }

    /// Read an attribute, or write `value` to it. Returns the attribute
    /// value reported by the device.
    pub fn rw_attribute(
        &mut self,
        access: Access,
        idn: u8,
        index: u8,
        selector: u8,
        value: u32,
    ) -> Result<u32> {
        let request = match access {
            Access::Read => QueryRequest::new(QueryOpcode::ReadAttribute, idn, index, selector),
            Access::Write => QueryRequest::new(QueryOpcode::WriteAttribute, idn, index, selector)
                .with_value(value),
        };
        match self.send_dm_request(&request, &mut [])? {
            QueryReply::Attribute(value) => Ok(value),
            _ => Err(UfsError::InvalidParameter("attribute reply")),
        }
    }

    /// Read a flag, or set it (`value == true`) or clear it. Returns the
    /// flag as reported by the device.
    pub fn rw_flag(&mut self, access: Access, idn: u8, value: bool) -> Result<bool> {
        let opcode = match (access, value) {
            (Access::Read, _) => QueryOpcode::ReadFlag,
            (Access::Write, true) => QueryOpcode::SetFlag,
            (Access::Write, false) => QueryOpcode::ClearFlag,
        };
        self.flag_request(opcode, idn)
    }

    pub fn toggle_flag(&mut self, idn: u8) -> Result<bool> {
        self.flag_request(QueryOpcode::ToggleFlag, idn)
    }

    fn flag_request(&mut self, opcode: QueryOpcode, idn: u8) -> Result<bool> {
        let request = QueryRequest::new(opcode, idn, 0, 0);
        match self.send_dm_request(&request, &mut [])? {
            QueryReply::Flag(value) => Ok(value),
            _ => Err(UfsError::InvalidParameter("flag reply")),
        }
    }

    pub fn read_flag(&mut self, idn: u8) -> Result<bool> {
        self.rw_flag(Access::Read, idn, false)
    }

    pub fn set_flag(&mut self, idn: u8) -> Result<()> {
        self.rw_flag(Access::Write, idn, true).map(drop)
    }

    pub fn clear_flag(&mut self, idn: u8) -> Result<()> {
        self.rw_flag(Access::Write, idn, false).map(drop)
    }

    pub fn read_attribute(&mut self, idn: u8, index: u8, selector: u8) -> Result<u32> {
        self.rw_attribute(Access::Read, idn, index, selector, 0)
    }

    pub fn write_attribute(&mut self, idn: u8, index: u8, selector: u8, value: u32) -> Result<()> {
        self.rw_attribute(Access::Write, idn, index, selector, value)
            .map(drop)
    }

    /// Read descriptor `idn`/`index` into `data`; returns its length.
    pub fn read_descriptor(&mut self, idn: u8, index: u8, data: &mut [u8]) -> Result<usize> {
        self.rw_device_descriptor(Access::Read, idn, index, 0, data)
    }

    pub fn write_descriptor(&mut self, idn: u8, index: u8, data: &[u8]) -> Result<usize> {
        if data.is_empty() || data.len() > usize::from(u16::MAX) {
            return Err(UfsError::InvalidParameter("descriptor buffer length"));
        }
        let request =
            QueryRequest::new(QueryOpcode::WriteDescriptor, idn, index, 0).with_payload(data);
        match self.send_dm_request(&request, &mut [])? {
            QueryReply::Descriptor(len) => Ok(len),
            _ => Err(UfsError::InvalidParameter("descriptor reply")),
        }
    }

    /// Probe the device with a NOP OUT.
    pub fn exec_nop(&mut self) -> Result<()> {
        let task_tag = self.next_task_tag();
        let frame = build_nop_descriptor(&build_nop_upiu(task_tag));
        let Completion { ocs, response } = self.submit(&frame, self.config.command_timeout)?;

        let nop = NopUpiu::read_from_prefix(&response)
            .map(|(nop, _)| nop.header.response)
            .unwrap_or(query::RESP_GENERAL_FAILURE);
        if ocs != 0 || nop != 0 {
            return Err(DeviceFault::Nop { ocs, response: nop }.into());
        }
        trace!("NOP IN received");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::{FromZeros, IntoBytes};

    use super::*;
    use crate::{
        constants::{idn, transaction},
        controller::{
            tests::{quick_config, start},
            UfsConfig,
        },
        sim::{SimConfig, SimController},
        upiu::{QueryTsf, UpiuHeader},
    };

    const SCRATCH_FLAG: u8 = 0x02;

    fn query_response(tsf_length: u16, value: u32, segment: &[u8]) -> Vec<u8> {
        let upiu = QueryUpiu {
            header: UpiuHeader {
                transaction_type: transaction::QUERY_RESPONSE,
                ..FromZeros::new_zeroed()
            },
            tsf: QueryTsf {
                length: tsf_length.into(),
                value: value.into(),
                ..FromZeros::new_zeroed()
            },
            ..FromZeros::new_zeroed()
        };
        let mut bytes = upiu.as_bytes().to_vec();
        bytes.extend_from_slice(segment);
        bytes
    }

    #[test]
    fn return_data_by_opcode_class() {
        let response = query_response(4, 0x0102_0304, &[9, 8, 7, 6, 0, 0, 0, 0]);
        let mut buf = [0u8; 16];

        assert_eq!(
            get_return_data_from_query_response(QueryOpcode::ReadDescriptor, &response, &mut buf),
            Ok(QueryReply::Descriptor(4))
        );
        assert_eq!(buf[..5], [9, 8, 7, 6, 0]);
        assert_eq!(
            get_return_data_from_query_response(QueryOpcode::ReadAttribute, &response, &mut []),
            Ok(QueryReply::Attribute(0x0102_0304))
        );
        // flags live in the last byte of the big-endian value field
        assert_eq!(
            get_return_data_from_query_response(QueryOpcode::ReadFlag, &response, &mut []),
            Ok(QueryReply::Flag(true))
        );
        let cleared = query_response(0, 0x0102_0300, &[]);
        assert_eq!(
            get_return_data_from_query_response(QueryOpcode::SetFlag, &cleared, &mut []),
            Ok(QueryReply::Flag(false))
        );
        assert_eq!(
            get_return_data_from_query_response(QueryOpcode::Nop, &response, &mut []),
            Err(UfsError::InvalidParameter("query opcode"))
        );
    }

    #[test]
    fn reported_length_beyond_the_buffer_is_an_overrun() {
        let response = query_response(300, 0, &[0; 256]);
        let mut buf = [0u8; 256];
        assert_eq!(
            get_return_data_from_query_response(QueryOpcode::ReadDescriptor, &response, &mut buf),
            Err(UfsError::DeviceError(DeviceFault::DescriptorOverrun {
                reported: 300,
                capacity: 256,
            }))
        );

        // the segment itself must hold the reported bytes too
        let truncated = query_response(8, 0, &[1, 2]);
        assert!(matches!(
            get_return_data_from_query_response(QueryOpcode::ReadDescriptor, &truncated, &mut buf),
            Err(UfsError::DeviceError(DeviceFault::DescriptorOverrun { .. }))
        ));
    }

    #[test]
    fn oversized_descriptor_from_the_device_is_a_device_error() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        sim.override_descriptor_length(Some(300));

        let mut buf = [0u8; 256];
        assert_eq!(
            controller.rw_device_descriptor(Access::Read, idn::DESC_DEVICE, 0, 0, &mut buf),
            Err(UfsError::DeviceError(DeviceFault::DescriptorOverrun {
                reported: 300,
                capacity: 256,
            }))
        );
        assert_eq!(controller.descriptors_in_use(), 0);
    }

    #[test]
    fn device_descriptor_read() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let mut buf = [0u8; 255];

        let len = controller
            .read_descriptor(idn::DESC_DEVICE, 0, &mut buf)
            .unwrap();
        assert_eq!(len, 0x59);
        assert_eq!(buf[..len], sim.descriptor(idn::DESC_DEVICE, 0).unwrap()[..]);
    }

    #[test]
    fn page_sized_buffer_reads_a_descriptor() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let before = sim.completed_commands();
        let mut buf = vec![0u8; 4096];

        let len = controller
            .read_descriptor(idn::DESC_DEVICE, 0, &mut buf)
            .unwrap();
        assert_eq!(len, 0x59);
        assert_eq!(buf[..len], sim.descriptor(idn::DESC_DEVICE, 0).unwrap()[..]);
        assert_eq!(sim.completed_commands() - before, 1);
        assert_eq!(controller.descriptors_in_use(), 0);
    }

    #[test]
    fn write_larger_than_a_command_descriptor_is_refused_up_front() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let before = sim.completed_commands();
        let payload = vec![0x5a; 4090];

        assert_eq!(
            controller.write_descriptor(idn::DESC_CONFIGURATION, 0, &payload),
            Err(UfsError::InvalidParameter("query data exceeds a command descriptor"))
        );
        assert_eq!(sim.completed_commands(), before);
        assert_eq!(controller.descriptors_in_use(), 0);
    }

    #[test]
    fn configuration_descriptor_write() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let mut config = sim.descriptor(idn::DESC_CONFIGURATION, 0).unwrap();
        config[3] = 0x01;

        let written = controller
            .rw_device_descriptor(Access::Write, idn::DESC_CONFIGURATION, 0, 0, &mut config)
            .unwrap();
        assert_eq!(written, config.len());
        assert_eq!(sim.descriptor(idn::DESC_CONFIGURATION, 0), Some(config));

        // the device descriptor is read-only
        let mut device = [0u8; 16];
        assert_eq!(
            controller.write_descriptor(idn::DESC_DEVICE, 0, &device),
            Err(UfsError::DeviceError(DeviceFault::Query {
                ocs: 0,
                response: query::RESP_NOT_WRITEABLE,
            }))
        );
        assert_eq!(
            controller.rw_device_descriptor(Access::Read, idn::DESC_DEVICE, 0, 0, &mut device[..0]),
            Err(UfsError::InvalidParameter("descriptor buffer length"))
        );
    }

    #[test]
    fn addressing_failures_are_invalid_parameters() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let mut buf = [0u8; 64];

        for (idn, index, selector) in [(0x7f, 0, 0), (idn::DESC_DEVICE, 5, 0), (idn::DESC_DEVICE, 0, 1)] {
            assert_eq!(
                controller.rw_device_descriptor(Access::Read, idn, index, selector, &mut buf),
                Err(UfsError::InvalidParameter("query selector, index or IDN"))
            );
        }
        assert_eq!(
            controller.read_attribute(0x7f, 0, 0),
            Err(UfsError::InvalidParameter("query selector, index or IDN"))
        );
    }

    #[test]
    fn queries_are_retried_up_to_the_configured_attempts() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let before = sim.completed_commands();

        sim.fail_queries(query::RESP_GENERAL_FAILURE, 4);
        assert_eq!(controller.read_attribute(idn::ATTR_CURRENT_POWER_MODE, 0, 0), Ok(0x11));
        assert_eq!(sim.completed_commands() - before, 5);

        sim.fail_queries(query::RESP_GENERAL_FAILURE, 5);
        assert_eq!(
            controller.read_attribute(idn::ATTR_CURRENT_POWER_MODE, 0, 0),
            Err(UfsError::DeviceError(DeviceFault::Query {
                ocs: 0,
                response: query::RESP_GENERAL_FAILURE,
            }))
        );
        assert_eq!(sim.completed_commands() - before, 10);
    }

    #[test]
    fn single_attempt_configuration() {
        let sim = SimController::new(SimConfig::default());
        let config = UfsConfig {
            dm_request_attempts: 1,
            ..quick_config()
        };
        let mut controller = UfsHostController::start(sim.resources(), config).unwrap();

        sim.fail_queries(query::RESP_GENERAL_FAILURE, 1);
        assert!(controller.read_attribute(idn::ATTR_BOOT_LUN_EN, 0, 0).is_err());
        assert_eq!(controller.read_attribute(idn::ATTR_BOOT_LUN_EN, 0, 0), Ok(1));
    }

    #[test]
    fn attributes_round_trip() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();

        controller
            .write_attribute(idn::ATTR_ACTIVE_ICC_LEVEL, 0, 0, 0x0f)
            .unwrap();
        assert_eq!(
            controller.rw_attribute(Access::Read, idn::ATTR_ACTIVE_ICC_LEVEL, 0, 0, 0),
            Ok(0x0f)
        );
    }

    #[test]
    fn flag_opcodes() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();

        assert_eq!(controller.read_flag(SCRATCH_FLAG), Ok(false));
        controller.set_flag(SCRATCH_FLAG).unwrap();
        assert_eq!(sim.flag(SCRATCH_FLAG), Some(true));
        assert_eq!(controller.toggle_flag(SCRATCH_FLAG), Ok(false));
        assert_eq!(controller.rw_flag(Access::Write, SCRATCH_FLAG, true), Ok(true));
        controller.clear_flag(SCRATCH_FLAG).unwrap();
        assert_eq!(controller.rw_flag(Access::Read, SCRATCH_FLAG, true), Ok(false));
    }

    #[test]
    fn nop_failure_is_a_device_error() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        sim.force_ocs(0x08);
        assert_eq!(
            controller.exec_nop(),
            Err(UfsError::DeviceError(DeviceFault::Nop {
                ocs: 0x08,
                response: 0,
            }))
        );
    }
}
