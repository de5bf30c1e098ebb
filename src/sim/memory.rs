//! Host memory, clock and shared allocators of the emulated platform.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    dma::{BounceIommu, DmaAllocator, DmaBus, DmaMapping, DmaRegion, Iommu, MapOperation, RegionAllocator},
    error::Result,
    poll::Delay,
};

use super::lock;

/// Host memory visible to the emulated controller.
#[derive(Debug)]
pub struct SimMemory {
    base: u64,
    bytes: Mutex<Vec<u8>>,
}

impl SimMemory {
    #[must_use]
    pub fn new(base: u64, len: usize) -> Self {
        Self {
            base,
            bytes: Mutex::new(vec![0; len]),
        }
    }

    #[must_use]
    pub fn region(&self) -> DmaRegion {
        DmaRegion {
            address: self.base,
            len: lock(&self.bytes).len(),
        }
    }

    fn range(&self, addr: u64, len: usize, size: usize) -> std::ops::Range<usize> {
        let start = addr
            .checked_sub(self.base)
            .map(|offset| offset as usize)
            .filter(|start| start + len <= size);
        match start {
            Some(start) => start..start + len,
            None => panic!("DMA access of {len} bytes at {addr:#x} is outside of emulated memory"),
        }
    }
}

impl DmaBus for SimMemory {
    fn read_bulk(&self, addr: u64, data: &mut [u8]) {
        let bytes = lock(&self.bytes);
        let range = self.range(addr, data.len(), bytes.len());
        data.copy_from_slice(&bytes[range]);
    }

    fn write_bulk(&self, addr: u64, data: &[u8]) {
        let mut bytes = lock(&self.bytes);
        let range = self.range(addr, data.len(), bytes.len());
        bytes[range].copy_from_slice(data);
    }
}

/// [`Delay`] that advances a virtual clock instead of sleeping.
#[derive(Debug, Default)]
pub struct SimDelay {
    micros: AtomicU64,
}

impl SimDelay {
    /// Virtual time spent stalling so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::Relaxed))
    }
}

impl Delay for SimDelay {
    fn stall(&self, duration: Duration) -> Duration {
        self.micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        duration
    }
}

/// A [`RegionAllocator`] the test harness can inspect while the driver owns
/// it.
#[derive(Debug, Clone)]
pub struct SharedAllocator(pub Arc<Mutex<RegionAllocator>>);

impl DmaAllocator for SharedAllocator {
    fn allocate(&mut self, len: usize, align: usize) -> Result<DmaRegion> {
        lock(&self.0).allocate(len, align)
    }

    fn free(&mut self, region: DmaRegion) {
        lock(&self.0).free(region);
    }
}

/// A [`BounceIommu`] the test harness can inspect while the driver owns it.
#[derive(Debug, Clone)]
pub struct SharedIommu(pub Arc<Mutex<BounceIommu>>);

impl Iommu for SharedIommu {
    fn map(&mut self, operation: MapOperation, data: &[u8]) -> Result<DmaMapping> {
        lock(&self.0).map(operation, data)
    }

    fn unmap(&mut self, mapping: DmaMapping, data: Option<&mut [u8]>) {
        lock(&self.0).unmap(mapping, data);
    }
}
