//! Command submission: one request on one slot, from descriptor to response.

use std::{
    sync::atomic::{fence, Ordering},
    time::Duration,
};

use tracing::{debug, trace};
use zerocopy::{FromZeros, IntoBytes};

use super::UfsHostController;
use crate::{
    constants::{is, offset},
    descriptor::{CommandFrame, UtpTrd},
    error::{Result, UfsError},
    pool::{CommandDescriptorPool, PoolBlock},
};

/// What a finished transfer request left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Completion {
    pub ocs: u8,
    /// The response region of the command descriptor.
    pub response: Vec<u8>,
}

impl UfsHostController {
    fn pool_mut(&mut self) -> Result<&mut CommandDescriptorPool> {
        self.pool
            .as_mut()
            .ok_or(UfsError::NotFound("running host controller"))
    }

    /// Largest command descriptor a single request can use.
    pub(super) fn descriptor_capacity(&self) -> Result<usize> {
        self.pool
            .as_ref()
            .map(CommandDescriptorPool::block_size)
            .ok_or(UfsError::NotFound("running host controller"))
    }

    /// Execute `frame` on a free slot and wait up to `timeout` for it.
    ///
    /// Whatever the outcome, the slot's doorbell is cleared and the command
    /// descriptor goes back to the pool before this returns.
    pub(super) fn submit(&mut self, frame: &CommandFrame, timeout: Duration) -> Result<Completion> {
        let slot = self.slots.find_free_slot(&self.regs)?;
        let block = self.pool_mut()?.acquire(frame.image.len())?;

        let result = self.run_on_slot(slot, &block, frame, timeout);

        self.slots.stop(&self.regs, slot);
        self.pool_mut()?.release(block);
        result
    }

    fn run_on_slot(
        &self,
        slot: u8,
        block: &PoolBlock,
        frame: &CommandFrame,
        timeout: Duration,
    ) -> Result<Completion> {
        let ucd = block.address();
        let trd_address = self.slots.trd_address(slot);
        debug!(
            "slot {slot}: {} byte command descriptor at {ucd:#x}",
            frame.image.len()
        );

        self.bus.write_bulk(ucd, &frame.image);
        self.bus.write_bulk(trd_address, frame.trd(ucd).as_bytes());
        fence(Ordering::SeqCst);

        self.slots.start(&self.regs, slot);
        self.slots
            .wait_for_completion(&self.regs, slot, timeout)?;
        fence(Ordering::SeqCst);

        let mut trd = UtpTrd::new_zeroed();
        self.bus.read_bulk(trd_address, trd.as_mut_bytes());
        let mut response = vec![0; frame.layout.response_len];
        self.bus
            .read_bulk(ucd + frame.layout.response_offset as u64, &mut response);
        self.regs.write(offset::IS, is::UTRCS);

        trace!("slot {slot}: completed with OCS {:#04x}", trd.ocs());
        Ok(Completion {
            ocs: trd.ocs(),
            response,
        })
    }
}
