//! The host controller driver proper.
//!
//! [`UfsHostController`] owns everything one controller needs while it runs:
//! the register window, the transfer and task management request lists, the
//! command descriptor pool and the task tag counter. Requests are executed one
//! at a time; every call blocks until the controller completed the request or
//! the wait timed out.

mod device;
mod query;
mod scsi;
mod submit;

use std::{fmt, sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    constants::{cap, hce, hcs, offset, rsr, trd},
    dma::{DmaAllocator, DmaBusRef, DmaRegion, Iommu},
    error::{Result, UfsError},
    link::{
        detect_device, enable_host_controller, negotiate_link, HsSeries, LinkInfo, PlatformHooks,
    },
    poll::Delay,
    pool::CommandDescriptorPool,
    registers::{RegisterIo, Registers},
    slots::TransferSlots,
    uic::Uic,
};

pub use self::{
    device::{DeviceDescriptor, LogicalUnit},
    query::{Access, QueryReply},
    scsi::{ScsiData, ScsiRequestPacket},
};

/// Task management request lists are page aligned.
const LIST_ALIGN: usize = 4096;

/// The platform collaborators a controller is driven through.
#[derive(Debug)]
pub struct HostResources {
    pub registers: Box<dyn RegisterIo>,
    /// Device view of host memory.
    pub bus: DmaBusRef,
    /// Source of the request lists and the descriptor pool.
    pub allocator: Box<dyn DmaAllocator>,
    /// Maps caller buffers for SCSI data transfers.
    pub iommu: Box<dyn Iommu>,
    pub delay: Arc<dyn Delay>,
    pub hooks: Box<dyn PlatformHooks>,
}

/// Tunables of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UfsConfig {
    /// Doorbell wait for SCSI, query and NOP requests.
    pub command_timeout: Duration,
    /// Waits for UIC command readiness, completion and link status.
    pub uic_timeout: Duration,
    /// Waits for `HCE` transitions.
    pub enable_timeout: Duration,
    pub poll_interval: Duration,
    pub link_startup_attempts: u32,
    /// Attempts per device management (query) request.
    pub dm_request_attempts: u32,
    /// Highest HS gear the link may be switched to.
    pub max_hs_gear: u32,
    pub hs_series: HsSeries,
    /// Widen lanes, raise gears and switch the power mode during start.
    pub negotiate_power_mode: bool,
    pub descriptor_pool_blocks: usize,
    pub descriptor_block_size: usize,
    /// Bound for the device to clear fDeviceInit.
    pub device_init_timeout: Duration,
}

impl Default for UfsConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(3),
            uic_timeout: Duration::from_secs(3),
            enable_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_micros(1),
            link_startup_attempts: 3,
            dm_request_attempts: 5,
            max_hs_gear: 4,
            hs_series: HsSeries::default(),
            negotiate_power_mode: true,
            descriptor_pool_blocks: 4,
            descriptor_block_size: 4096,
            device_init_timeout: Duration::from_millis(1500),
        }
    }
}

/// What the controller reports in `CAP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Number of transfer request slots.
    pub transfer_slots: u8,
    /// Number of task management request slots.
    pub task_slots: u8,
    pub addressing_64bit: bool,
}

impl Capabilities {
    #[must_use]
    pub const fn from_register(value: u32) -> Self {
        Self {
            transfer_slots: (value & cap::NUTRS_MASK) as u8 + 1,
            task_slots: ((value & cap::NUTMRS_MASK) >> cap::NUTMRS_SHIFT) as u8 + 1,
            addressing_64bit: value & cap::AS64 != 0,
        }
    }
}

/// DMA memory a controller holds while running.
struct Lists {
    transfer: DmaRegion,
    task: DmaRegion,
    pool: CommandDescriptorPool,
}

/// A started UFS host controller.
pub struct UfsHostController {
    regs: Registers,
    bus: DmaBusRef,
    allocator: Box<dyn DmaAllocator>,
    iommu: Box<dyn Iommu>,
    hooks: Box<dyn PlatformHooks>,
    config: UfsConfig,
    capabilities: Capabilities,
    slots: TransferSlots,
    task_list: DmaRegion,
    pool: Option<CommandDescriptorPool>,
    task_tag: u8,
    link: Option<LinkInfo>,
}

impl fmt::Debug for UfsHostController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UfsHostController")
            .field("capabilities", &self.capabilities)
            .field("slots", &self.slots)
            .field("task_list", &self.task_list)
            .field("link", &self.link)
            .field("running", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

impl UfsHostController {
    /// Bring up the controller and the device attached to it.
    ///
    /// Enables the controller, starts the link, sets up the request lists,
    /// optionally negotiates lanes, gears and power mode, probes the device
    /// with a NOP OUT and waits for it to finish initialization. Whatever was
    /// set up is torn down again if a later step fails.
    pub fn start(resources: HostResources, config: UfsConfig) -> Result<Self> {
        let HostResources {
            registers,
            bus,
            mut allocator,
            iommu,
            delay,
            hooks,
        } = resources;
        let regs = Registers::new(registers, delay, config.poll_interval);

        let lists = {
            let uic = Uic::new(&regs, config.uic_timeout);
            enable_host_controller(&uic, config.enable_timeout, hooks.as_ref())
                .and_then(|()| detect_device(&uic, config.link_startup_attempts))
                .and_then(|()| {
                    let capabilities = Capabilities::from_register(regs.read(offset::CAP));
                    allocate_lists(allocator.as_mut(), &capabilities, &config)
                })
        };
        let lists = match lists {
            Ok(lists) => lists,
            Err(err) => {
                regs.write(offset::HCE, 0);
                return Err(err);
            }
        };

        let capabilities = Capabilities::from_register(regs.read(offset::CAP));
        debug!("capabilities: {capabilities:?}");
        let mut controller = Self {
            regs,
            bus,
            allocator,
            iommu,
            hooks,
            config,
            capabilities,
            slots: TransferSlots::new(lists.transfer, capabilities.transfer_slots),
            task_list: lists.task,
            pool: Some(lists.pool),
            task_tag: 0,
            link: None,
        };
        controller.initialize()?;
        info!("UFS host controller running");
        Ok(controller)
    }

    fn initialize(&mut self) -> Result<()> {
        self.program_lists()?;

        if self.config.negotiate_power_mode {
            let link = negotiate_link(
                &self.uic(),
                self.hooks.as_ref(),
                self.config.max_hs_gear,
                self.config.hs_series,
            )?;
            self.link = Some(link);
        }

        self.exec_nop()?;
        self.finish_device_initialization()
    }

    fn program_lists(&self) -> Result<()> {
        let transfer = self.slots.list();
        self.bus.write_bulk(transfer.address, &vec![0; transfer.len]);
        self.bus
            .write_bulk(self.task_list.address, &vec![0; self.task_list.len]);

        self.regs.wait_for(
            offset::HCS,
            hcs::UTRLRDY | hcs::UTMRLRDY,
            hcs::UTRLRDY | hcs::UTMRLRDY,
            self.config.enable_timeout,
            "request lists ready",
        )?;

        self.regs.write(offset::UTRLBA, transfer.address as u32);
        self.regs.write(offset::UTRLBAU, (transfer.address >> 32) as u32);
        self.regs.write(offset::UTMRLBA, self.task_list.address as u32);
        self.regs
            .write(offset::UTMRLBAU, (self.task_list.address >> 32) as u32);
        self.regs.write(offset::UTMRLRSR, rsr::RUN);
        debug!(
            "transfer list at {:#x}, task list at {:#x}",
            transfer.address, self.task_list.address
        );
        Ok(())
    }

    /// Stop the controller and give its memory back.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(pool) = self.pool.take() else {
            return Ok(());
        };
        if pool.in_use() != 0 {
            warn!("stopping with {} command descriptors on loan", pool.in_use());
        }

        self.regs.write(offset::UTRLRSR, 0);
        self.regs.write(offset::UTMRLRSR, 0);
        self.regs.write(offset::HCE, 0);
        let disabled = self.regs.wait_for(
            offset::HCE,
            hce::EN,
            0,
            self.config.enable_timeout,
            "host controller disable",
        );

        pool.destroy(self.allocator.as_mut());
        self.allocator.free(self.slots.list());
        self.allocator.free(self.task_list);
        info!("UFS host controller stopped");
        disabled
    }

    /// UIC access for platform specific link programming.
    #[must_use]
    pub const fn uic(&self) -> Uic<'_> {
        Uic::new(&self.regs, self.config.uic_timeout)
    }

    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    #[must_use]
    pub const fn config(&self) -> &UfsConfig {
        &self.config
    }

    /// The negotiated link, if negotiation ran.
    #[must_use]
    pub const fn link_info(&self) -> Option<LinkInfo> {
        self.link
    }

    /// Command descriptors currently on loan from the pool.
    #[must_use]
    pub fn descriptors_in_use(&self) -> usize {
        self.pool.as_ref().map_or(0, CommandDescriptorPool::in_use)
    }

    fn next_task_tag(&mut self) -> u8 {
        self.task_tag = self.task_tag.wrapping_add(1);
        self.task_tag
    }
}

impl Drop for UfsHostController {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("failed to stop UFS host controller: {err}");
        }
    }
}

/// Allocate the request lists and the descriptor pool. Nothing stays
/// allocated on failure.
fn allocate_lists(
    allocator: &mut dyn DmaAllocator,
    capabilities: &Capabilities,
    config: &UfsConfig,
) -> Result<Lists> {
    let reachable = |region: &DmaRegion| capabilities.addressing_64bit || region.end() <= 1 << 32;

    let transfer = allocator.allocate(
        usize::from(capabilities.transfer_slots) * trd::SIZE,
        LIST_ALIGN,
    )?;
    let task = match allocator.allocate(
        usize::from(capabilities.task_slots) * trd::TMRD_SIZE,
        LIST_ALIGN,
    ) {
        Ok(task) => task,
        Err(err) => {
            allocator.free(transfer);
            return Err(err);
        }
    };
    let pool = match CommandDescriptorPool::new(
        allocator,
        config.descriptor_pool_blocks,
        config.descriptor_block_size,
    ) {
        Ok(pool) => pool,
        Err(err) => {
            allocator.free(task);
            allocator.free(transfer);
            return Err(err);
        }
    };

    if !reachable(&transfer) || !reachable(&task) {
        pool.destroy(allocator);
        allocator.free(task);
        allocator.free(transfer);
        return Err(UfsError::OutOfResources("32-bit addressable DMA memory"));
    }
    Ok(Lists {
        transfer,
        task,
        pool,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::{idn, is, mib, uic},
        error::DeviceFault,
        link::{LccDisablePlatform, PowerMode},
        sim::{SimConfig, SimController},
    };

    /// Short waits keep polls on the virtual clock cheap.
    pub(super) fn quick_config() -> UfsConfig {
        UfsConfig {
            command_timeout: Duration::from_millis(5),
            uic_timeout: Duration::from_millis(5),
            enable_timeout: Duration::from_millis(5),
            device_init_timeout: Duration::from_millis(20),
            ..UfsConfig::default()
        }
    }

    pub(super) fn start(sim: &SimController) -> Result<UfsHostController> {
        UfsHostController::start(sim.resources(), quick_config())
    }

    #[test]
    fn capabilities_decode_slot_counts_and_addressing() {
        let caps = Capabilities::from_register(0x0107_001f);
        assert_eq!(caps.transfer_slots, 32);
        assert_eq!(caps.task_slots, 8);
        assert!(caps.addressing_64bit);

        let caps = Capabilities::from_register(0x0000_0003);
        assert_eq!(caps.transfer_slots, 4);
        assert_eq!(caps.task_slots, 1);
        assert!(!caps.addressing_64bit);
    }

    #[test]
    fn start_brings_up_link_and_device() {
        let sim = SimController::new(SimConfig::default());
        let controller = start(&sim).unwrap();

        let link = controller.link_info().unwrap();
        assert_eq!(link.rx.lanes, 2);
        assert_eq!(link.tx.gear, 4);
        assert_eq!(link.rx.mode, PowerMode::Fast);
        assert_eq!(controller.capabilities().transfer_slots, 32);
        assert_eq!(sim.flag(idn::FLAG_DEVICE_INIT), Some(false));

        let regs = sim.registers();
        assert_eq!(regs.read(offset::UTMRLRSR), rsr::RUN);
        let transfer = controller.slots.list();
        assert_eq!(regs.read(offset::UTRLBA), transfer.address as u32);
        assert_eq!(regs.read(offset::UTRLBAU), (transfer.address >> 32) as u32);
        assert_eq!(transfer.address % LIST_ALIGN as u64, 0);
        assert_eq!(controller.task_list.len, 8 * trd::TMRD_SIZE);
    }

    #[test]
    fn stop_releases_all_memory_and_disables() {
        let sim = SimController::new(SimConfig::default());
        let before = sim.dma_available();

        let controller = start(&sim).unwrap();
        assert!(sim.dma_available() < before);
        controller.stop().unwrap();

        assert_eq!(sim.dma_available(), before);
        let regs = sim.registers();
        assert_eq!(regs.read(offset::HCE), 0);
        assert_eq!(regs.read(offset::UTRLRSR), 0);
        assert_eq!(regs.read(offset::UTMRLRSR), 0);
    }

    #[test]
    fn dropping_a_running_controller_stops_it() {
        let sim = SimController::new(SimConfig::default());
        let before = sim.dma_available();
        drop(start(&sim).unwrap());
        assert_eq!(sim.dma_available(), before);
        assert_eq!(sim.registers().read(offset::HCE), 0);
    }

    #[test]
    fn late_failure_tears_everything_down() {
        let sim = SimController::new(SimConfig::default());
        let before = sim.dma_available();
        sim.suppress_power_mode_completion(true);

        assert!(matches!(
            start(&sim),
            Err(UfsError::DeviceError(DeviceFault::PowerModeChange { .. }))
        ));
        assert_eq!(sim.dma_available(), before);
        assert_eq!(sim.registers().read(offset::HCE), 0);
    }

    #[test]
    fn missing_device_is_not_found_after_three_attempts() {
        let sim = SimController::new(SimConfig {
            link_startups_without_device: 3,
            ..SimConfig::default()
        });
        let before = sim.dma_available();

        assert_eq!(start(&sim).unwrap_err(), UfsError::NotFound("UFS device"));
        assert_eq!(sim.uic_count(uic::DME_LINKSTARTUP), 3);
        assert_eq!(sim.dma_available(), before);
        assert_eq!(sim.registers().read(offset::HCE), 0);
    }

    #[test]
    fn device_answering_on_the_last_attempt_is_used() {
        let sim = SimController::new(SimConfig {
            link_startups_without_device: 2,
            ..SimConfig::default()
        });
        let controller = start(&sim).unwrap();
        assert_eq!(sim.uic_count(uic::DME_LINKSTARTUP), 3);
        assert_ne!(sim.registers().read(offset::HCS) & hcs::DP, 0);
        controller.stop().unwrap();
    }

    #[test]
    fn out_of_memory_is_reported_and_nothing_leaks() {
        let sim = SimController::new(SimConfig::default());
        let before = sim.dma_available();
        let config = UfsConfig {
            descriptor_pool_blocks: 1 << 12,
            ..quick_config()
        };

        assert_eq!(
            UfsHostController::start(sim.resources(), config).unwrap_err(),
            UfsError::OutOfResources("DMA memory")
        );
        assert_eq!(sim.dma_available(), before);
    }

    #[test]
    fn frozen_enable_times_out() {
        let sim = SimController::new(SimConfig::default());
        sim.freeze_enable(true);
        assert_eq!(
            start(&sim).unwrap_err(),
            UfsError::Timeout("host controller enable")
        );
    }

    #[test]
    fn restart_resets_an_enabled_controller() {
        let sim = SimController::new(SimConfig::default());
        sim.registers().write(offset::HCE, 1);

        let controller = start(&sim).unwrap();
        assert_eq!(sim.writes_to(offset::HCE)[..3], [1, 0, 1]);
        controller.stop().unwrap();
    }

    #[test]
    fn skipping_negotiation_leaves_the_link_alone() {
        let sim = SimController::new(SimConfig::default());
        let config = UfsConfig {
            negotiate_power_mode: false,
            ..quick_config()
        };
        let controller = UfsHostController::start(sim.resources(), config).unwrap();

        assert_eq!(controller.link_info(), None);
        assert_eq!(sim.local_attribute(mib::PA_RX_GEAR), Some(1));
        assert_eq!(sim.registers().read(offset::IS) & is::UPMS, 0);
    }

    #[test]
    fn platform_hook_runs_after_enable() {
        let sim = SimController::new(SimConfig::default());
        let resources = sim.resources_with_hooks(Box::new(LccDisablePlatform));
        let controller = UfsHostController::start(resources, quick_config()).unwrap();
        assert_eq!(sim.local_attribute(mib::PA_LOCAL_TX_LCC_ENABLE), Some(0));
        controller.stop().unwrap();
    }

    #[test]
    fn task_tags_increase_per_request() {
        let sim = SimController::new(SimConfig::default());
        let mut controller = start(&sim).unwrap();
        let before = controller.task_tag;
        controller.exec_nop().unwrap();
        controller.exec_nop().unwrap();
        assert_eq!(controller.task_tag, before.wrapping_add(2));
    }
}
