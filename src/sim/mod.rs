//! Emulation of a UFS host controller and the device attached to it.
//!
//! The register file follows UFSHCI semantics closely enough to run the
//! driver end to end: interrupt status is write-one-to-clear, the transfer
//! list clear register clears the slots written as zero, and UIC commands
//! complete synchronously. Transfer requests are processed the moment their
//! doorbell rings. Faults can be injected at every stage.

mod device;
mod memory;

use std::{
    collections::BTreeMap,
    mem::size_of,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tracing::{debug, trace, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    constants::{cap, hcs, is, mib, offset, rsr, trd, uic},
    controller::HostResources,
    descriptor::{PrdtEntry, UtpTrd},
    dma::{BounceIommu, DmaBus, RegionAllocator},
    link::{DefaultPlatform, PlatformHooks},
    registers::{RegisterIo, Registers},
};

pub use self::{
    device::BLOCK_SIZE,
    memory::{SharedAllocator, SharedIommu, SimDelay, SimMemory},
};
use self::device::UfsDevice;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shape of the emulated controller and device.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Transfer request slots (`CAP.NUTRS`), 1 to 32.
    pub slots: u8,
    /// Task management slots (`CAP.NUTMRS`), 1 to 8.
    pub task_slots: u8,
    /// Connected data lanes per direction. One lane is active after reset.
    pub lanes: u32,
    /// `PA_MaxRxHSGear` of the host receiver.
    pub max_hs_gear: u32,
    /// `PA_MaxRxHSGear` of the device receiver.
    pub peer_max_hs_gear: u32,
    /// `PA_MaxRxPWMGear` of both receivers.
    pub max_pwm_gear: u32,
    /// Link startups that complete without a device before one appears.
    pub link_startups_without_device: u32,
    /// fDeviceInit reads that still report the flag set.
    pub device_init_reads: u32,
    /// Block count of each logical unit.
    pub lun_blocks: Vec<u32>,
    pub memory_base: u64,
    pub memory_size: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            slots: 32,
            task_slots: 8,
            lanes: 2,
            max_hs_gear: 4,
            peer_max_hs_gear: 4,
            max_pwm_gear: 4,
            link_startups_without_device: 0,
            device_init_reads: 2,
            lun_blocks: vec![64, 16],
            memory_base: 0x1_8000_0000,
            memory_size: 4 << 20,
        }
    }
}

/// One UIC command as the controller received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UicRecord {
    pub opcode: u8,
    pub attribute: u16,
    pub selector: u16,
    pub arg2: u32,
    pub arg3: u32,
    /// Result code the controller reported.
    pub result: u32,
}

#[derive(Debug, Default)]
struct ControllerFaults {
    freeze_enable: bool,
    uic_results: BTreeMap<u8, u32>,
    suppress_uic_completion: bool,
    suppress_link_startup_status: bool,
    suppress_power_mode_completion: bool,
    power_mode_status: Option<u8>,
    link_startups_without_device: u32,
    hang_next_commands: u32,
    force_ocs: Option<u8>,
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    hce: bool,
    is: u32,
    ie: u32,
    hcs: u32,
    utrlba: u32,
    utrlbau: u32,
    utrldbr: u32,
    utrlrsr: u32,
    utmrlba: u32,
    utmrlbau: u32,
    utmrldbr: u32,
    utmrlrsr: u32,
    uic_command: u32,
    uic_args: [u32; 3],
    local_mib: BTreeMap<u16, u32>,
    peer_mib: BTreeMap<u16, u32>,
    writes: Vec<(u32, u32)>,
    uic_log: Vec<UicRecord>,
    doorbell_conflicts: u32,
    completed_commands: u32,
    faults: ControllerFaults,
    device: UfsDevice,
}

/// Handle to an emulated controller. Clones share the same hardware.
#[derive(Clone)]
pub struct SimController {
    state: Arc<Mutex<SimState>>,
    memory: Arc<SimMemory>,
    delay: Arc<SimDelay>,
    allocator: SharedAllocator,
    iommu: SharedIommu,
}

impl std::fmt::Debug for SimController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimController")
            .field("memory", &self.memory.region())
            .finish_non_exhaustive()
    }
}

fn mib_table(config: &SimConfig, max_hs_gear: u32) -> BTreeMap<u16, u32> {
    BTreeMap::from([
        (mib::PA_CONNECTED_TX_DATA_LANES, config.lanes),
        (mib::PA_CONNECTED_RX_DATA_LANES, config.lanes),
        (mib::PA_ACTIVE_TX_DATA_LANES, 1),
        (mib::PA_ACTIVE_RX_DATA_LANES, 1),
        (mib::PA_MAX_RX_HS_GEAR, max_hs_gear),
        (mib::PA_MAX_RX_PWM_GEAR, config.max_pwm_gear),
        (mib::PA_TX_GEAR, 1),
        (mib::PA_RX_GEAR, 1),
        (mib::PA_PWR_MODE, 0x55),
    ])
}

impl SimController {
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let memory = Arc::new(SimMemory::new(config.memory_base, config.memory_size));
        let state = SimState {
            hce: false,
            is: 0,
            ie: 0,
            hcs: 0,
            utrlba: 0,
            utrlbau: 0,
            utrldbr: 0,
            utrlrsr: 0,
            utmrlba: 0,
            utmrlbau: 0,
            utmrldbr: 0,
            utmrlrsr: 0,
            uic_command: 0,
            uic_args: [0; 3],
            local_mib: mib_table(&config, config.max_hs_gear),
            peer_mib: mib_table(&config, config.peer_max_hs_gear),
            writes: Vec::new(),
            uic_log: Vec::new(),
            doorbell_conflicts: 0,
            completed_commands: 0,
            faults: ControllerFaults {
                link_startups_without_device: config.link_startups_without_device,
                ..ControllerFaults::default()
            },
            device: UfsDevice::new(&config.lun_blocks, config.device_init_reads),
            config,
        };
        let region = memory.region();
        let half = (region.len / 2) as u64;
        let allocator = SharedAllocator(Arc::new(Mutex::new(RegionAllocator::new(
            region.address,
            half,
        ))));
        let iommu = SharedIommu(Arc::new(Mutex::new(BounceIommu::new(
            memory.clone(),
            RegionAllocator::new(region.address + half, half),
        ))));
        Self {
            state: Arc::new(Mutex::new(state)),
            memory,
            delay: Arc::new(SimDelay::default()),
            allocator,
            iommu,
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    /// Register access bound to the virtual clock.
    #[must_use]
    pub fn registers(&self) -> Registers {
        Registers::new(
            Box::new(self.clone()),
            self.delay.clone(),
            Duration::from_micros(1),
        )
    }

    /// Everything the driver needs to run on this controller. Host memory is
    /// split evenly between general DMA allocations and the bounce window.
    #[must_use]
    pub fn resources(&self) -> HostResources {
        self.resources_with_hooks(Box::new(DefaultPlatform))
    }

    #[must_use]
    pub fn resources_with_hooks(&self, hooks: Box<dyn PlatformHooks>) -> HostResources {
        HostResources {
            registers: Box::new(self.clone()),
            bus: self.memory.clone(),
            allocator: Box::new(self.dma_allocator()),
            iommu: Box::new(self.iommu()),
            delay: self.delay.clone(),
            hooks,
        }
    }

    fn dma_allocator(&self) -> SharedAllocator {
        self.allocator.clone()
    }

    fn iommu(&self) -> SharedIommu {
        self.iommu.clone()
    }

    #[must_use]
    pub fn memory(&self) -> Arc<SimMemory> {
        self.memory.clone()
    }

    #[must_use]
    pub fn delay(&self) -> Arc<SimDelay> {
        self.delay.clone()
    }

    /// Free bytes of general DMA memory.
    #[must_use]
    pub fn dma_available(&self) -> u64 {
        lock(&self.dma_allocator().0).available()
    }

    /// Free bytes of the bounce window.
    #[must_use]
    pub fn bounce_available(&self) -> u64 {
        lock(&self.iommu().0).available()
    }

    // Fault injection

    /// Mark `slot` busy without ever completing it, as if another agent owned it.
    pub fn occupy_slot(&self, slot: u8) {
        self.state().utrldbr |= 1 << slot;
    }

    /// Leave the next `count` rung transfer requests pending forever.
    pub fn hang_next_commands(&self, count: u32) {
        self.state().faults.hang_next_commands = count;
    }

    /// Complete the next transfer request with `ocs`.
    pub fn force_ocs(&self, ocs: u8) {
        self.state().faults.force_ocs = Some(ocs);
    }

    /// Answer the next SCSI command with the given response and status.
    pub fn force_scsi_response(&self, response: u8, status: u8) {
        self.state().device.faults.scsi_response = Some((response, status));
    }

    /// Report an underflow of `residual` bytes for the next SCSI command.
    pub fn force_residual(&self, residual: u32) {
        self.state().device.faults.residual = Some(residual);
    }

    /// Fail the next `count` query requests with the query response `code`.
    pub fn fail_queries(&self, code: u8, count: u32) {
        self.state().device.faults.query_failure = Some((code, count));
    }

    /// Report `length` for every descriptor read instead of the real length.
    pub fn override_descriptor_length(&self, length: Option<u16>) {
        self.state().device.faults.descriptor_length = length;
    }

    /// Complete every UIC command with `opcode` with result `code`.
    pub fn set_uic_result(&self, opcode: u8, code: u32) {
        self.state().faults.uic_results.insert(opcode, code);
    }

    pub fn suppress_uic_completion(&self, suppress: bool) {
        self.state().faults.suppress_uic_completion = suppress;
    }

    pub fn suppress_link_startup_status(&self, suppress: bool) {
        self.state().faults.suppress_link_startup_status = suppress;
    }

    pub fn suppress_power_mode_completion(&self, suppress: bool) {
        self.state().faults.suppress_power_mode_completion = suppress;
    }

    /// Report `status` in `HCS.UPMCRS` after power mode changes.
    pub fn set_power_mode_status(&self, status: u8) {
        self.state().faults.power_mode_status = Some(status);
    }

    /// Ignore writes to `HCE`.
    pub fn freeze_enable(&self, freeze: bool) {
        self.state().faults.freeze_enable = freeze;
    }

    /// Set bits in `IS` as if the hardware had raised them.
    pub fn raise_interrupt_status(&self, bits: u32) {
        self.state().is |= bits;
    }

    pub fn set_local_attribute(&self, attribute: u16, value: u32) {
        self.state().local_mib.insert(attribute, value);
    }

    pub fn set_peer_attribute(&self, attribute: u16, value: u32) {
        self.state().peer_mib.insert(attribute, value);
    }

    pub fn set_descriptor(&self, idn: u8, index: u8, bytes: Vec<u8>) {
        self.state().device.set_descriptor(idn, index, bytes);
    }

    // Inspection

    #[must_use]
    pub fn local_attribute(&self, attribute: u16) -> Option<u32> {
        self.state().local_mib.get(&attribute).copied()
    }

    #[must_use]
    pub fn uic_log(&self) -> Vec<UicRecord> {
        self.state().uic_log.clone()
    }

    /// Number of UIC commands issued with `opcode`.
    #[must_use]
    pub fn uic_count(&self, opcode: u8) -> usize {
        self.state()
            .uic_log
            .iter()
            .filter(|record| record.opcode == opcode)
            .count()
    }

    /// Offsets of all register writes, oldest first.
    #[must_use]
    pub fn write_order(&self) -> Vec<u32> {
        self.state().writes.iter().map(|&(offset, _)| offset).collect()
    }

    /// Values written to the register at `offset`, oldest first.
    #[must_use]
    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        self.state()
            .writes
            .iter()
            .filter(|&&(at, _)| at == offset)
            .map(|&(_, value)| value)
            .collect()
    }

    #[must_use]
    pub fn register_writes(&self, offset: u32) -> usize {
        self.writes_to(offset).len()
    }

    /// Doorbells rung for slots that were still pending.
    #[must_use]
    pub fn doorbell_conflicts(&self) -> u32 {
        self.state().doorbell_conflicts
    }

    #[must_use]
    pub fn completed_commands(&self) -> u32 {
        self.state().completed_commands
    }

    #[must_use]
    pub fn lun_data(&self, lun: u8) -> Option<Vec<u8>> {
        self.state().device.lun(lun).map(<[u8]>::to_vec)
    }

    #[must_use]
    pub fn descriptor(&self, idn: u8, index: u8) -> Option<Vec<u8>> {
        self.state().device.descriptor(idn, index).map(<[u8]>::to_vec)
    }

    #[must_use]
    pub fn flag(&self, idn: u8) -> Option<bool> {
        self.state().device.flag(idn)
    }
}

impl SimState {
    fn slot_mask(&self) -> u32 {
        match self.config.slots {
            32.. => u32::MAX,
            slots => (1u32 << slots) - 1,
        }
    }

    fn capabilities(&self) -> u32 {
        u32::from(self.config.slots.clamp(1, 32) - 1) & cap::NUTRS_MASK
            | (u32::from(self.config.task_slots.clamp(1, 8) - 1) << cap::NUTMRS_SHIFT)
                & cap::NUTMRS_MASK
            | cap::AS64
    }

    fn set_enable(&mut self, enable: bool) {
        if self.faults.freeze_enable {
            return;
        }
        if enable {
            self.hce = true;
            self.hcs |= hcs::UCRDY;
        } else {
            debug!("sim: host controller disabled");
            self.hce = false;
            self.hcs = 0;
            self.is = 0;
            self.utrldbr = 0;
            self.utrlrsr = 0;
            self.utmrldbr = 0;
            self.utmrlrsr = 0;
        }
    }

    fn power_mode_changed(&mut self) {
        if self.faults.suppress_power_mode_completion {
            return;
        }
        let status = self.faults.power_mode_status.unwrap_or(hcs::PWR_LOCAL);
        self.hcs = (self.hcs & !hcs::UPMCRS_MASK)
            | (u32::from(status) << hcs::UPMCRS_SHIFT) & hcs::UPMCRS_MASK;
        self.is |= is::UPMS;
    }

    fn link_startup(&mut self) {
        if self.faults.link_startups_without_device > 0 {
            self.faults.link_startups_without_device -= 1;
            self.hcs &= !hcs::DP;
            if !self.faults.suppress_link_startup_status {
                self.is |= is::ULSS;
            }
            return;
        }
        self.hcs |= hcs::DP | hcs::UTRLRDY | hcs::UTMRLRDY;
        self.is |= is::ULSS;
    }

    fn execute_uic(&mut self, opcode: u8) {
        if self.hcs & hcs::UCRDY == 0 {
            warn!("sim: UIC command {opcode:#04x} while not ready");
            return;
        }
        let [arg1, arg2, arg3] = self.uic_args;
        let attribute = (arg1 >> 16) as u16;
        let mut result = self
            .faults
            .uic_results
            .get(&opcode)
            .copied()
            .unwrap_or(uic::RESULT_SUCCESS);

        if result == uic::RESULT_SUCCESS {
            match opcode {
                uic::DME_GET | uic::DME_PEER_GET => {
                    let table = if opcode == uic::DME_GET {
                        &self.local_mib
                    } else {
                        &self.peer_mib
                    };
                    match table.get(&attribute) {
                        Some(&value) => self.uic_args[2] = value,
                        None => result = uic::RESULT_INVALID_MIB_ATTRIBUTE,
                    }
                }
                uic::DME_SET => {
                    self.local_mib.insert(attribute, arg3);
                    if attribute == mib::PA_PWR_MODE {
                        self.power_mode_changed();
                    }
                }
                uic::DME_PEER_SET => {
                    self.peer_mib.insert(attribute, arg3);
                }
                uic::DME_LINKSTARTUP => self.link_startup(),
                _ => {}
            }
        }

        trace!("sim: UIC {opcode:#04x} attr {attribute:#06x} -> {result:#x}");
        self.uic_log.push(UicRecord {
            opcode,
            attribute,
            selector: (arg1 & 0xffff) as u16,
            arg2,
            arg3,
            result,
        });
        self.uic_args[1] = result;
        if !self.faults.suppress_uic_completion {
            self.is |= is::UCCS;
        }
    }

    fn ring_doorbell(&mut self, memory: &dyn DmaBus, value: u32) {
        let rung = value & self.slot_mask();
        for slot in 0..32u8 {
            let bit = 1 << slot;
            if rung & bit == 0 {
                continue;
            }
            if self.utrldbr & bit != 0 {
                warn!("sim: doorbell rung for pending slot {slot}");
                self.doorbell_conflicts += 1;
                continue;
            }
            self.utrldbr |= bit;

            if self.utrlrsr & rsr::RUN == 0 {
                continue;
            }
            if self.faults.hang_next_commands > 0 {
                self.faults.hang_next_commands -= 1;
                debug!("sim: leaving slot {slot} pending");
                continue;
            }
            self.process(memory, slot);
            self.utrldbr &= !bit;
            self.is |= is::UTRCS;
            self.completed_commands += 1;
        }
    }

    fn process(&mut self, memory: &dyn DmaBus, slot: u8) {
        let list = u64::from(self.utrlbau) << 32 | u64::from(self.utrlba);
        let trd_address = list + (usize::from(slot) * trd::SIZE) as u64;
        let mut raw = [0u8; trd::SIZE];
        memory.read_bulk(trd_address, &mut raw);
        let Ok(mut descriptor) = UtpTrd::read_from_bytes(&raw[..]) else {
            return;
        };

        let ucd = descriptor.ucd_address();
        let response_offset = usize::from(descriptor.response_upiu_offset.get()) * 4;
        let response_len = usize::from(descriptor.response_upiu_length.get()) * 4;
        let prdt_offset = usize::from(descriptor.prdt_offset.get()) * 4;
        let prdt_entries = usize::from(descriptor.prdt_length.get());

        let mut request = vec![0u8; response_offset];
        memory.read_bulk(ucd, &mut request);
        let mut prdt_bytes = vec![0u8; prdt_entries * size_of::<PrdtEntry>()];
        memory.read_bulk(ucd + prdt_offset as u64, &mut prdt_bytes);
        let prdt: Vec<PrdtEntry> = prdt_bytes
            .chunks_exact(size_of::<PrdtEntry>())
            .filter_map(|chunk| PrdtEntry::read_from_bytes(chunk).ok())
            .collect();

        let (mut ocs, mut response) = self.device.handle(memory, &request, &prdt, response_len);
        if let Some(forced) = self.faults.force_ocs.take() {
            ocs = forced;
        }
        response.resize(response_len, 0);
        memory.write_bulk(ucd + response_offset as u64, &response);

        descriptor.status = ((descriptor.status.get() & !0xff) | u32::from(ocs)).into();
        memory.write_bulk(trd_address, descriptor.as_bytes());
        trace!("sim: slot {slot} completed with OCS {ocs:#04x}");
    }
}

impl RegisterIo for SimController {
    fn read32(&self, offset: u32) -> u32 {
        let state = self.state();
        match offset {
            offset::CAP => state.capabilities(),
            offset::VER => 0x0000_0300,
            offset::IS => state.is,
            offset::IE => state.ie,
            offset::HCS => state.hcs,
            offset::HCE => u32::from(state.hce),
            offset::UTRLBA => state.utrlba,
            offset::UTRLBAU => state.utrlbau,
            offset::UTRLDBR => state.utrldbr,
            offset::UTRLRSR => state.utrlrsr,
            offset::UTMRLBA => state.utmrlba,
            offset::UTMRLBAU => state.utmrlbau,
            offset::UTMRLDBR => state.utmrldbr,
            offset::UTMRLRSR => state.utmrlrsr,
            offset::UICCMD => state.uic_command,
            offset::UCMDARG1 => state.uic_args[0],
            offset::UCMDARG2 => state.uic_args[1],
            offset::UCMDARG3 => state.uic_args[2],
            _ => 0,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut state = self.state();
        state.writes.push((offset, value));
        match offset {
            offset::IS => state.is &= !value,
            offset::IE => state.ie = value,
            offset::HCE => state.set_enable(value & 1 != 0),
            offset::UTRLBA => state.utrlba = value,
            offset::UTRLBAU => state.utrlbau = value,
            offset::UTRLDBR => state.ring_doorbell(self.memory.as_ref(), value),
            offset::UTRLCLR => state.utrldbr &= value,
            offset::UTRLRSR => state.utrlrsr = value & rsr::RUN,
            offset::UTMRLBA => state.utmrlba = value,
            offset::UTMRLBAU => state.utmrlbau = value,
            offset::UTMRLDBR => state.utmrldbr |= value,
            offset::UTMRLCLR => state.utmrldbr &= value,
            offset::UTMRLRSR => state.utmrlrsr = value & rsr::RUN,
            offset::UICCMD => {
                state.uic_command = value;
                state.execute_uic(value as u8);
            }
            offset::UCMDARG1 => state.uic_args[0] = value,
            offset::UCMDARG2 => state.uic_args[1] = value,
            offset::UCMDARG3 => state.uic_args[2] = value,
            _ => trace!("sim: ignoring write to {offset:#x}"),
        }
    }
}
