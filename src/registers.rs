//! Access to the memory-mapped host controller registers.

use std::{
    fmt::{self, Debug},
    fs::OpenOptions,
    io,
    path::Path,
    sync::Arc,
    time::Duration,
};

use memmap2::{MmapOptions, MmapRaw};
use tracing::trace;

use crate::{
    constants::offset,
    error::Result,
    poll::{poll_until, Delay},
};

/// Raw 32-bit register access at byte offsets from the controller base.
pub trait RegisterIo: Debug + Send {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// The register space of one controller together with the time source its
/// waits are measured against.
pub struct Registers {
    io: Box<dyn RegisterIo>,
    delay: Arc<dyn Delay>,
    poll_interval: Duration,
}

impl Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("io", &self.io)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Registers {
    #[must_use]
    pub fn new(io: Box<dyn RegisterIo>, delay: Arc<dyn Delay>, poll_interval: Duration) -> Self {
        Self {
            io,
            delay,
            poll_interval,
        }
    }

    #[must_use]
    pub fn read(&self, offset: u32) -> u32 {
        let value = self.io.read32(offset);
        trace!("read  {offset:#04x} -> {value:#010x}");
        value
    }

    pub fn write(&self, offset: u32, value: u32) {
        trace!("write {offset:#04x} <- {value:#010x}");
        self.io.write32(offset, value);
    }

    /// Wait until `(register & mask) == value`.
    ///
    /// # Parameters
    ///
    /// - `offset`: the register to poll
    /// - `mask`: the bits that take part in the comparison
    /// - `value`: the expected content of the masked bits
    /// - `timeout`: upper bound for the wait
    /// - `what`: names the condition in a [`crate::UfsError::Timeout`]
    pub fn wait_for(
        &self,
        offset: u32,
        mask: u32,
        value: u32,
        timeout: Duration,
        what: &'static str,
    ) -> Result<()> {
        poll_until(
            self.delay.as_ref(),
            timeout,
            self.poll_interval,
            what,
            || Ok(self.io.read32(offset) & mask == value),
        )
    }

    /// The delay primitive shared by all waits on this controller.
    #[must_use]
    pub fn delay(&self) -> &dyn Delay {
        self.delay.as_ref()
    }

    /// A shared handle to the delay primitive, for waits that need `&mut`
    /// access to the controller while they poll.
    #[must_use]
    pub fn delay_handle(&self) -> Arc<dyn Delay> {
        Arc::clone(&self.delay)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// [`RegisterIo`] over a memory mapping of the controller's register BAR,
/// for example a UIO resource file.
#[derive(Debug)]
pub struct MmioRegisters {
    map: MmapRaw,
}

impl MmioRegisters {
    /// Map `len` bytes of register space at `offset` within the file at `path`.
    pub fn open(path: impl AsRef<Path>, offset: u64, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = MmapOptions::new().offset(offset).len(len).map_raw(&file)?;
        Self::from_raw(map)
    }

    /// Wrap an existing mapping; it must cover the whole register window.
    pub fn from_raw(map: MmapRaw) -> io::Result<Self> {
        if map.len() < offset::WINDOW_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "register window of {} bytes is smaller than {:#x}",
                    map.len(),
                    offset::WINDOW_SIZE
                ),
            ));
        }
        Ok(Self { map })
    }

    fn register_ptr(&self, offset: u32) -> *mut u32 {
        let offset = offset as usize;
        assert!(
            offset % 4 == 0 && offset + 4 <= self.map.len(),
            "register offset {offset:#x} outside of the mapped window"
        );
        // SAFETY: the assertion above keeps the pointer inside the mapping.
        unsafe { self.map.as_mut_ptr().add(offset).cast::<u32>() }
    }
}

impl RegisterIo for MmioRegisters {
    fn read32(&self, offset: u32) -> u32 {
        // SAFETY: the pointer is in bounds and 4-byte aligned because mappings
        // are page aligned and the offset is a multiple of 4.
        unsafe { self.register_ptr(offset).read_volatile() }
    }

    fn write32(&self, offset: u32, value: u32) {
        // SAFETY: see `read32`.
        unsafe { self.register_ptr(offset).write_volatile(value) }
    }
}
