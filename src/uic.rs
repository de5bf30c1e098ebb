//! UIC command executor.
//!
//! UIC commands configure the UniPro link below the transport layer. Each
//! command latches its three arguments, waits for the controller to accept
//! commands, writes the opcode and then waits for completion. The executor
//! performs no retries of its own.

use std::time::Duration;

use tracing::{debug, trace};

use crate::{
    constants::{hcs, is, offset, uic},
    error::{DeviceFault, Result, UfsError},
    registers::Registers,
};

/// A UIC command and, after execution, its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UicCommand {
    pub opcode: u8,
    pub attribute: u16,
    pub selector: u16,
    /// Attribute set type on input, result code on output.
    pub arg2: u32,
    /// Value to set on input, value read on output.
    pub arg3: u32,
}

impl UicCommand {
    #[must_use]
    pub const fn new(opcode: u8) -> Self {
        Self {
            opcode,
            attribute: 0,
            selector: 0,
            arg2: 0,
            arg3: 0,
        }
    }

    #[must_use]
    pub const fn attribute(mut self, attribute: u16, selector: u16) -> Self {
        self.attribute = attribute;
        self.selector = selector;
        self
    }

    #[must_use]
    pub const fn value(mut self, value: u32) -> Self {
        self.arg3 = value;
        self
    }

    const fn arg1(&self) -> u32 {
        (self.attribute as u32) << 16 | self.selector as u32
    }
}

/// Issues UIC commands on one controller.
#[derive(Debug, Clone, Copy)]
pub struct Uic<'a> {
    regs: &'a Registers,
    timeout: Duration,
}

impl<'a> Uic<'a> {
    #[must_use]
    pub const fn new(regs: &'a Registers, timeout: Duration) -> Self {
        Self { regs, timeout }
    }

    #[must_use]
    pub const fn registers(&self) -> &'a Registers {
        self.regs
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `command` and return it with the result registers filled in.
    pub fn exec(&self, mut command: UicCommand) -> Result<UicCommand> {
        let regs = self.regs;
        trace!(
            "UIC {:#04x} attr {:#06x} sel {} arg3 {:#x}",
            command.opcode,
            command.attribute,
            command.selector,
            command.arg3
        );

        if regs.read(offset::IS) & is::UCCS != 0 {
            regs.write(offset::IS, is::UCCS);
        }

        regs.write(offset::UCMDARG1, command.arg1());
        regs.write(offset::UCMDARG2, command.arg2);
        regs.write(offset::UCMDARG3, command.arg3);

        regs.wait_for(offset::HCS, hcs::UCRDY, hcs::UCRDY, self.timeout, "UIC command ready")?;
        regs.write(offset::UICCMD, u32::from(command.opcode));
        regs.wait_for(offset::IS, is::UCCS, is::UCCS, self.timeout, "UIC command completion")?;
        regs.write(offset::IS, is::UCCS);

        if command.opcode != uic::DME_RESET {
            command.arg2 = regs.read(offset::UCMDARG2);
            if command.arg2 & uic::RESULT_MASK != uic::RESULT_SUCCESS {
                debug!(
                    "UIC command {:#04x} failed with result {:#x}",
                    command.opcode,
                    command.arg2 & uic::RESULT_MASK
                );
                return Err(DeviceFault::Uic {
                    opcode: command.opcode,
                    arg2: command.arg2,
                }
                .into());
            }
            command.arg3 = regs.read(offset::UCMDARG3);
        }
        Ok(command)
    }

    /// Read a local MIB attribute.
    pub fn dme_get(&self, attribute: u16) -> Result<u32> {
        self.exec(UicCommand::new(uic::DME_GET).attribute(attribute, 0))
            .map(|command| command.arg3)
    }

    /// Write a local MIB attribute.
    pub fn dme_set(&self, attribute: u16, value: u32) -> Result<()> {
        self.exec(UicCommand::new(uic::DME_SET).attribute(attribute, 0).value(value))
            .map(drop)
    }

    /// Read a MIB attribute of the peer device.
    pub fn dme_peer_get(&self, attribute: u16) -> Result<u32> {
        self.exec(UicCommand::new(uic::DME_PEER_GET).attribute(attribute, 0))
            .map(|command| command.arg3)
    }

    /// Write a MIB attribute of the peer device.
    pub fn dme_peer_set(&self, attribute: u16, value: u32) -> Result<()> {
        self.exec(UicCommand::new(uic::DME_PEER_SET).attribute(attribute, 0).value(value))
            .map(drop)
    }

    /// Start the link.
    ///
    /// When the command completes but no device is present, link startup
    /// status is awaited and the attempt reported as [`UfsError::NotFound`]
    /// so the caller may try again.
    pub fn link_startup(&self) -> Result<()> {
        self.exec(UicCommand::new(uic::DME_LINKSTARTUP))?;

        if self.regs.read(offset::HCS) & hcs::DP == 0 {
            self.regs
                .wait_for(offset::IS, is::ULSS, is::ULSS, self.timeout, "link startup status")
                .map_err(|_| UfsError::DeviceError(DeviceFault::LinkStartup))?;
            self.regs.write(offset::IS, is::ULSS);
            debug!("link started but no device is present");
            return Err(UfsError::NotFound("UFS device"));
        }
        Ok(())
    }
}
