//! Transfer request slot management.
//!
//! The doorbell register is the only record of which slots are busy. The
//! driver never caches slot state; a slot is free exactly when its doorbell
//! bit reads zero.

use std::time::Duration;

use tracing::{debug, trace};

use crate::{
    constants::{offset, rsr, trd},
    dma::DmaRegion,
    error::{Result, UfsError},
    registers::Registers,
};

/// The UTP transfer request list and its `count` slots.
#[derive(Debug, Clone, Copy)]
pub struct TransferSlots {
    list: DmaRegion,
    count: u8,
}

impl TransferSlots {
    /// `count` must be between 1 and 32, as reported by `CAP.NUTRS`.
    #[must_use]
    pub fn new(list: DmaRegion, count: u8) -> Self {
        debug_assert!((1..=32).contains(&count));
        Self { list, count }
    }

    #[must_use]
    pub const fn count(&self) -> u8 {
        self.count
    }

    #[must_use]
    pub const fn list(&self) -> DmaRegion {
        self.list
    }

    /// Device address of the TRD belonging to `slot`.
    #[must_use]
    pub const fn trd_address(&self, slot: u8) -> u64 {
        self.list.address + (slot as usize * trd::SIZE) as u64
    }

    const fn mask(&self) -> u32 {
        if self.count >= 32 {
            u32::MAX
        } else {
            (1 << self.count) - 1
        }
    }

    /// The lowest slot whose doorbell bit is clear.
    pub fn find_free_slot(&self, regs: &Registers) -> Result<u8> {
        let busy = regs.read(offset::UTRLDBR) | !self.mask();
        if busy == u32::MAX {
            debug!("all {} transfer slots are busy", self.count);
            return Err(UfsError::NotFound("free transfer slot"));
        }
        Ok(busy.trailing_ones() as u8)
    }

    /// Ring the doorbell of `slot`, setting the run-stop bit first if the
    /// list is not running yet.
    pub fn start(&self, regs: &Registers, slot: u8) {
        if regs.read(offset::UTRLRSR) & rsr::RUN == 0 {
            trace!("setting transfer list run-stop");
            regs.write(offset::UTRLRSR, rsr::RUN);
        }
        regs.write(offset::UTRLDBR, 1 << slot);
    }

    /// Whether the hardware still owns `slot`.
    #[must_use]
    pub fn is_pending(&self, regs: &Registers, slot: u8) -> bool {
        regs.read(offset::UTRLDBR) & (1 << slot) != 0
    }

    /// Take `slot` back from the hardware if it still owns it. Clearing is
    /// done by writing zero to the slot's bit in the list clear register.
    pub fn stop(&self, regs: &Registers, slot: u8) {
        if self.is_pending(regs, slot) {
            debug!("clearing pending transfer slot {slot}");
            regs.write(offset::UTRLCLR, !(1u32 << slot));
        }
    }

    /// Wait until the hardware hands `slot` back.
    pub fn wait_for_completion(&self, regs: &Registers, slot: u8, timeout: Duration) -> Result<()> {
        regs.wait_for(
            offset::UTRLDBR,
            1 << slot,
            0,
            timeout,
            "transfer request completion",
        )
    }
}
