//! DMA-visible memory: the bus the controller reads and writes, the
//! allocator that hands out regions of it, and the IOMMU that maps caller
//! buffers for a single transfer.

use std::{
    fmt::Debug,
    fs::OpenOptions,
    io,
    path::Path,
    sync::{
        atomic::{fence, Ordering},
        Arc,
    },
};

use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, warn};

use crate::error::{Result, UfsError};

/// Memory as seen by the controller, addressed by device-physical address.
pub trait DmaBus: Debug + Send + Sync {
    fn read_bulk(&self, addr: u64, data: &mut [u8]);
    fn write_bulk(&self, addr: u64, data: &[u8]);
}

pub type DmaBusRef = Arc<dyn DmaBus>;

/// A contiguous, device-visible memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    pub address: u64,
    pub len: usize,
}

impl DmaRegion {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.address + self.len as u64
    }
}

/// Hands out DMA-visible memory with a guaranteed alignment.
pub trait DmaAllocator: Debug + Send {
    fn allocate(&mut self, len: usize, align: usize) -> Result<DmaRegion>;
    fn free(&mut self, region: DmaRegion);
}

/// First-fit allocator over a single address window. Freed regions are
/// coalesced with their neighbours.
#[derive(Debug, Clone)]
pub struct RegionAllocator {
    /// Free ranges as (start, length), sorted by start and never adjacent.
    free: Vec<(u64, u64)>,
}

impl RegionAllocator {
    #[must_use]
    pub fn new(base: u64, len: u64) -> Self {
        let free = if len == 0 { vec![] } else { vec![(base, len)] };
        Self { free }
    }

    /// Total number of free bytes.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.free.iter().map(|(_, len)| len).sum()
    }
}

impl DmaAllocator for RegionAllocator {
    fn allocate(&mut self, len: usize, align: usize) -> Result<DmaRegion> {
        if len == 0 || !align.is_power_of_two() {
            return Err(UfsError::InvalidParameter("DMA allocation size or alignment"));
        }
        let size = len as u64;
        let align = align as u64;

        for i in 0..self.free.len() {
            let (start, free_len) = self.free[i];
            let aligned = (start + align - 1) & !(align - 1);
            let head = aligned - start;
            if head + size > free_len {
                continue;
            }
            let tail = free_len - head - size;

            self.free.remove(i);
            if tail > 0 {
                self.free.insert(i, (aligned + size, tail));
            }
            if head > 0 {
                self.free.insert(i, (start, head));
            }
            return Ok(DmaRegion {
                address: aligned,
                len,
            });
        }

        debug!("no free range for {len} bytes aligned to {align}");
        Err(UfsError::OutOfResources("DMA memory"))
    }

    fn free(&mut self, region: DmaRegion) {
        let start = region.address;
        let len = region.len as u64;
        let index = self.free.partition_point(|&(s, _)| s < start);
        self.free.insert(index, (start, len));

        // merge with the successor first so `index` stays valid
        if index + 1 < self.free.len() {
            let (next_start, next_len) = self.free[index + 1];
            if start + len == next_start {
                self.free[index].1 += next_len;
                self.free.remove(index + 1);
            }
        }
        if index > 0 {
            let (prev_start, prev_len) = self.free[index - 1];
            if prev_start + prev_len == start {
                self.free[index - 1].1 += self.free[index].1;
                self.free.remove(index);
            }
        }
    }
}

/// Direction of a bus-master transfer, named from the controller's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOperation {
    /// The controller reads host memory (data out to the device).
    BusMasterRead,
    /// The controller writes host memory (data in from the device).
    BusMasterWrite,
}

/// A caller buffer made visible to the controller for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaMapping {
    pub operation: MapOperation,
    pub device_address: u64,
    pub len: usize,
}

/// Maps caller buffers for bus-master access.
pub trait Iommu: Debug + Send {
    /// Make `data` visible to the controller. For bus-master reads the
    /// content of `data` is what the controller will see.
    fn map(&mut self, operation: MapOperation, data: &[u8]) -> Result<DmaMapping>;

    /// Tear a mapping down. For bus-master writes the bytes the controller
    /// produced land in `data`.
    fn unmap(&mut self, mapping: DmaMapping, data: Option<&mut [u8]>);
}

/// [`Iommu`] that stages every transfer through a dedicated bounce window.
#[derive(Debug)]
pub struct BounceIommu {
    bus: DmaBusRef,
    window: RegionAllocator,
}

/// PRDT entries require dword aligned data buffers.
const BOUNCE_ALIGN: usize = 4;

impl BounceIommu {
    #[must_use]
    pub const fn new(bus: DmaBusRef, window: RegionAllocator) -> Self {
        Self { bus, window }
    }

    /// Free bytes left in the bounce window.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.window.available()
    }
}

impl Iommu for BounceIommu {
    fn map(&mut self, operation: MapOperation, data: &[u8]) -> Result<DmaMapping> {
        let region = self.window.allocate(data.len(), BOUNCE_ALIGN)?;
        if operation == MapOperation::BusMasterRead {
            self.bus.write_bulk(region.address, data);
            fence(Ordering::Release);
        }
        Ok(DmaMapping {
            operation,
            device_address: region.address,
            len: region.len,
        })
    }

    fn unmap(&mut self, mapping: DmaMapping, data: Option<&mut [u8]>) {
        if mapping.operation == MapOperation::BusMasterWrite {
            match data {
                Some(data) => {
                    fence(Ordering::Acquire);
                    let len = data.len().min(mapping.len);
                    self.bus
                        .read_bulk(mapping.device_address, &mut data[..len]);
                }
                None => warn!(
                    "dropping {} bytes of device data at {:#x}: no destination buffer",
                    mapping.len, mapping.device_address
                ),
            }
        }
        self.window.free(DmaRegion {
            address: mapping.device_address,
            len: mapping.len,
        });
    }
}

/// [`DmaBus`] over a memory mapping of a physically contiguous carve-out,
/// such as reserved memory exposed through `/dev/mem` or a UIO map.
#[derive(Debug)]
pub struct MappedMemory {
    map: MmapRaw,
    physical_base: u64,
}

impl MappedMemory {
    /// Map `len` bytes of the file at `path`, starting at `physical_base`.
    ///
    /// The file offset equals the physical address, which is how `/dev/mem`
    /// exposes physical memory.
    pub fn open(path: impl AsRef<Path>, physical_base: u64, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = MmapOptions::new()
            .offset(physical_base)
            .len(len)
            .map_raw(&file)?;
        Ok(Self::from_raw(map, physical_base))
    }

    /// Wrap an existing mapping whose first byte sits at `physical_base`.
    #[must_use]
    pub const fn from_raw(map: MmapRaw, physical_base: u64) -> Self {
        Self { map, physical_base }
    }

    /// The region of device addresses this mapping covers.
    #[must_use]
    pub fn region(&self) -> DmaRegion {
        DmaRegion {
            address: self.physical_base,
            len: self.map.len(),
        }
    }

    fn host_ptr(&self, addr: u64, len: usize) -> *mut u8 {
        let offset = addr
            .checked_sub(self.physical_base)
            .map(|offset| offset as usize)
            .filter(|offset| offset.checked_add(len).is_some_and(|end| end <= self.map.len()));
        match offset {
            // SAFETY: the range was checked to lie inside the mapping.
            Some(offset) => unsafe { self.map.as_mut_ptr().add(offset) },
            None => panic!(
                "DMA access of {len} bytes at {addr:#x} outside of {:#x}..{:#x}",
                self.physical_base,
                self.region().end()
            ),
        }
    }
}

impl DmaBus for MappedMemory {
    fn read_bulk(&self, addr: u64, data: &mut [u8]) {
        let src = self.host_ptr(addr, data.len());
        // SAFETY: `src` covers `data.len()` bytes of the mapping and cannot
        // overlap with the caller's buffer.
        unsafe { std::ptr::copy_nonoverlapping(src, data.as_mut_ptr(), data.len()) }
    }

    fn write_bulk(&self, addr: u64, data: &[u8]) {
        let dst = self.host_ptr(addr, data.len());
        // SAFETY: see `read_bulk`.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, process};

    use proptest::prelude::*;

    use super::*;
    use crate::sim::SimMemory;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut alloc = RegionAllocator::new(0x1000_0010, 0x10000);
        let a = alloc.allocate(100, 128).unwrap();
        let b = alloc.allocate(4096, 4096).unwrap();
        let c = alloc.allocate(8, 8).unwrap();

        assert_eq!(a.address % 128, 0);
        assert_eq!(b.address % 4096, 0);
        assert_eq!(c.address % 8, 0);
        for (x, y) in [(a, b), (a, c), (b, c)] {
            assert!(x.end() <= y.address || y.end() <= x.address);
        }
    }

    #[test]
    fn freeing_everything_restores_a_single_range() {
        let mut alloc = RegionAllocator::new(0x4000, 0x4000);
        let mut regions: Vec<_> = (0..6).map(|_| alloc.allocate(0x300, 128).unwrap()).collect();
        for index in [4, 1, 3, 0, 1, 0] {
            alloc.free(regions.remove(index));
        }
        assert_eq!(alloc.available(), 0x4000);
        assert_eq!(
            alloc.allocate(0x4000, 1),
            Ok(DmaRegion {
                address: 0x4000,
                len: 0x4000
            })
        );
    }

    #[test]
    fn exhaustion_is_out_of_resources() {
        let mut alloc = RegionAllocator::new(0, 256);
        alloc.allocate(200, 8).unwrap();
        assert_eq!(
            alloc.allocate(64, 8),
            Err(UfsError::OutOfResources("DMA memory"))
        );
    }

    proptest! {
        #[test]
        fn alloc_free_sequences_never_lose_memory(
            sizes in proptest::collection::vec((1usize..2048, 0u32..8), 1..40)
        ) {
            let mut alloc = RegionAllocator::new(0x10_0000, 0x2_0000);
            let mut live = Vec::new();
            for (size, align_shift) in sizes {
                if let Ok(region) = alloc.allocate(size, 1 << align_shift) {
                    prop_assert_eq!(region.address % (1 << align_shift), 0);
                    for other in &live {
                        let other: &DmaRegion = other;
                        prop_assert!(region.end() <= other.address || other.end() <= region.address);
                    }
                    live.push(region);
                }
                if live.len() > 5 {
                    alloc.free(live.remove(live.len() / 2));
                }
            }
            for region in live {
                alloc.free(region);
            }
            prop_assert_eq!(alloc.available(), 0x2_0000);
            prop_assert_eq!(alloc.allocate(0x2_0000, 1).map(|r| r.address), Ok(0x10_0000));
        }
    }

    #[test]
    fn bounce_iommu_stages_reads_and_copies_back_writes() {
        let memory = Arc::new(SimMemory::new(0x2000_0000, 0x4000));
        let mut iommu = BounceIommu::new(memory.clone(), RegionAllocator::new(0x2000_0000, 0x4000));

        let out = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mapping = iommu.map(MapOperation::BusMasterRead, &out).unwrap();
        let mut seen = [0u8; 8];
        memory.read_bulk(mapping.device_address, &mut seen);
        assert_eq!(seen, out);
        iommu.unmap(mapping, None);

        let mut input = [0u8; 4];
        let mapping = iommu.map(MapOperation::BusMasterWrite, &input).unwrap();
        memory.write_bulk(mapping.device_address, &[9, 8, 7, 6]);
        iommu.unmap(mapping, Some(&mut input));
        assert_eq!(input, [9, 8, 7, 6]);
        assert_eq!(iommu.available(), 0x4000);
    }

    #[test]
    fn mapped_memory_translates_physical_addresses() {
        let path = std::env::temp_dir().join(format!("ufshcd-dma-{}", process::id()));
        fs::File::create(&path).unwrap().set_len(0x2000).unwrap();
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let map = MmapOptions::new().len(0x2000).map_raw(&file).unwrap();
        let memory = MappedMemory::from_raw(map, 0x8000_0000);

        memory.write_bulk(0x8000_1ffc, &[0xaa, 0xbb, 0xcc, 0xdd]);
        let mut back = [0u8; 4];
        memory.read_bulk(0x8000_1ffc, &mut back);
        assert_eq!(back, [0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(
            memory.region(),
            DmaRegion {
                address: 0x8000_0000,
                len: 0x2000
            }
        );
        fs::remove_file(path).unwrap();
    }

    #[test]
    #[should_panic(expected = "outside of")]
    fn mapped_memory_rejects_out_of_window_access() {
        let path = std::env::temp_dir().join(format!("ufshcd-dma-oob-{}", process::id()));
        fs::File::create(&path).unwrap().set_len(0x1000).unwrap();
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let map = MmapOptions::new().len(0x1000).map_raw(&file).unwrap();
        let memory = MappedMemory::from_raw(map, 0x1000);
        let _ = fs::remove_file(path);
        memory.write_bulk(0x1ffe, &[0; 4]);
    }
}
