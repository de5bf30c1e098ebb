//! Link bring-up: host controller enable, device detection and the
//! negotiation of lanes, gears and power mode over UIC.
//!
//! Link state lives in the hardware. Every step reads the current values
//! back instead of trusting an earlier observation.

use std::{fmt::Debug, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    constants::{hce, hcs, is, mib, offset},
    error::{DeviceFault, Result, UfsError},
    uic::Uic,
};

/// `PA_PWRMode` values for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PowerMode {
    Fast = 1,
    Slow = 2,
    FastAuto = 4,
    SlowAuto = 5,
}

impl PowerMode {
    #[must_use]
    pub const fn is_high_speed(self) -> bool {
        matches!(self, Self::Fast | Self::FastAuto)
    }

    /// The combined `PA_PWRMode` value setting both directions to `self`.
    #[must_use]
    pub const fn pa_pwr_mode(self) -> u32 {
        let mode = self as u32;
        mode << 4 | mode
    }
}

/// M-PHY high speed rate series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HsSeries {
    A = 1,
    #[default]
    B = 2,
}

/// Board specific programming around link bring-up.
pub trait PlatformHooks: Debug + Send {
    /// Runs once after every successful host controller enable. Failures are
    /// logged and otherwise ignored.
    fn post_enable(&self, _uic: &Uic<'_>) -> Result<()> {
        Ok(())
    }

    /// Attributes programmed before switching to a high speed power mode.
    fn hs_recipe(&self, series: HsSeries) -> Vec<(u16, u32)> {
        standard_hs_recipe(series)
    }
}

/// Terminations, rate series and the UniPro protocol timeouts commonly used
/// for high speed operation.
#[must_use]
pub fn standard_hs_recipe(series: HsSeries) -> Vec<(u16, u32)> {
    vec![
        (mib::PA_TX_TERMINATION, 1),
        (mib::PA_RX_TERMINATION, 1),
        (mib::PA_HS_SERIES, series as u32),
        (mib::PA_PWR_MODE_USER_DATA0, 8191),
        (mib::PA_PWR_MODE_USER_DATA1, 65535),
        (mib::PA_PWR_MODE_USER_DATA2, 32767),
        (mib::DME_FC0_PROTECTION_TIMEOUT, 8191),
        (mib::DME_TC0_REPLAY_TIMEOUT, 65535),
        (mib::DME_AFC0_REQ_TIMEOUT, 32767),
    ]
}

/// Platform without board specific programming.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPlatform;

impl PlatformHooks for DefaultPlatform {}

/// Platform whose PHY needs line configuration checks disabled after every
/// host controller enable.
#[derive(Debug, Default, Clone, Copy)]
pub struct LccDisablePlatform;

impl PlatformHooks for LccDisablePlatform {
    fn post_enable(&self, uic: &Uic<'_>) -> Result<()> {
        uic.dme_set(mib::PA_LOCAL_TX_LCC_ENABLE, 0)
    }
}

/// The negotiated state of one link direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionInfo {
    pub lanes: u32,
    pub gear: u32,
    pub mode: PowerMode,
}

/// The negotiated state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub rx: DirectionInfo,
    pub tx: DirectionInfo,
}

/// Enable the host controller, resetting it first if it is already running.
pub fn enable_host_controller(
    uic: &Uic<'_>,
    timeout: Duration,
    hooks: &dyn PlatformHooks,
) -> Result<()> {
    let regs = uic.registers();

    if regs.read(offset::HCE) & hce::EN != 0 {
        debug!("host controller already enabled, resetting");
        regs.write(offset::HCE, 0);
        regs.wait_for(offset::HCE, hce::EN, 0, timeout, "host controller disable")?;
    }

    regs.write(offset::HCE, hce::EN);
    regs.wait_for(offset::HCE, hce::EN, hce::EN, timeout, "host controller enable")?;

    if let Err(err) = hooks.post_enable(uic) {
        warn!("platform post-enable hook failed: {err}");
    }
    Ok(())
}

/// Start the link, retrying while no device answers.
pub fn detect_device(uic: &Uic<'_>, attempts: u32) -> Result<()> {
    for attempt in 1..=attempts {
        match uic.link_startup() {
            Ok(()) => {
                info!("UFS device detected");
                return Ok(());
            }
            Err(UfsError::NotFound(_)) => {
                debug!("link startup attempt {attempt}/{attempts} found no device");
            }
            Err(err) => return Err(err),
        }
    }
    Err(UfsError::NotFound("UFS device"))
}

/// Widen the active data lanes of both directions to all connected lanes.
/// Returns the active (rx, tx) lane counts.
pub fn activate_lanes(uic: &Uic<'_>) -> Result<(u32, u32)> {
    let widen = |connected_attr: u16, active_attr: u16, direction: &str| -> Result<u32> {
        let connected = uic.dme_get(connected_attr)?;
        let active = uic.dme_get(active_attr)?;
        if active < connected {
            debug!("{direction}: activating {connected} lanes ({active} active)");
            uic.dme_set(active_attr, connected)?;
            return Ok(connected);
        }
        Ok(active)
    };

    let rx = widen(
        mib::PA_CONNECTED_RX_DATA_LANES,
        mib::PA_ACTIVE_RX_DATA_LANES,
        "rx",
    )?;
    let tx = widen(
        mib::PA_CONNECTED_TX_DATA_LANES,
        mib::PA_ACTIVE_TX_DATA_LANES,
        "tx",
    )?;
    Ok((rx, tx))
}

/// Outcome of gear selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GearSelection {
    pub mode: PowerMode,
    pub rx_gear: u32,
    pub tx_gear: u32,
}

/// Pick the power mode and program the fastest gear both ends support.
///
/// The local receiver's limits bound the rx direction, the peer receiver's
/// limits bound tx. High speed is used only when both receivers support it;
/// its gear is capped at `max_hs_gear`. A gear is only ever raised.
pub fn select_gear(uic: &Uic<'_>, max_hs_gear: u32) -> Result<GearSelection> {
    let rx_hs = uic.dme_get(mib::PA_MAX_RX_HS_GEAR)?;
    let tx_hs = uic.dme_peer_get(mib::PA_MAX_RX_HS_GEAR)?;

    let (mode, rx_target, tx_target) =
        if rx_hs == mib::NO_HS || tx_hs == mib::NO_HS || max_hs_gear == 0 {
            let rx_pwm = uic.dme_get(mib::PA_MAX_RX_PWM_GEAR)?;
            let tx_pwm = uic.dme_peer_get(mib::PA_MAX_RX_PWM_GEAR)?;
            (PowerMode::SlowAuto, rx_pwm, tx_pwm)
        } else {
            (
                PowerMode::Fast,
                rx_hs.min(max_hs_gear),
                tx_hs.min(max_hs_gear),
            )
        };
    debug!("gear targets: {mode:?} rx {rx_target} tx {tx_target}");

    let raise = |attribute: u16, target: u32| -> Result<u32> {
        let current = uic.dme_get(attribute)?;
        if current < target {
            uic.dme_set(attribute, target)?;
            return Ok(target);
        }
        Ok(current)
    };

    Ok(GearSelection {
        mode,
        rx_gear: raise(mib::PA_RX_GEAR, rx_target)?,
        tx_gear: raise(mib::PA_TX_GEAR, tx_target)?,
    })
}

/// Switch both link directions to `mode` and wait for the change to finish.
pub fn switch_power_mode(
    uic: &Uic<'_>,
    mode: PowerMode,
    hooks: &dyn PlatformHooks,
    series: HsSeries,
) -> Result<()> {
    let regs = uic.registers();
    let status = || ((regs.read(offset::HCS) & hcs::UPMCRS_MASK) >> hcs::UPMCRS_SHIFT) as u8;

    if mode.is_high_speed() {
        for (attribute, value) in hooks.hs_recipe(series) {
            uic.dme_set(attribute, value)?;
        }
    }

    uic.dme_set(mib::PA_PWR_MODE, mode.pa_pwr_mode())?;
    regs.wait_for(
        offset::IS,
        is::UPMS,
        is::UPMS,
        uic.timeout(),
        "power mode change",
    )
    .map_err(|_| DeviceFault::PowerModeChange { status: status() })?;
    regs.write(offset::IS, is::UPMS);

    let status = status();
    if status != hcs::PWR_LOCAL {
        return Err(DeviceFault::PowerModeChange { status }.into());
    }
    Ok(())
}

/// Lanes, gear and power mode, in that order. The first failure aborts the
/// negotiation.
pub fn negotiate_link(
    uic: &Uic<'_>,
    hooks: &dyn PlatformHooks,
    max_hs_gear: u32,
    series: HsSeries,
) -> Result<LinkInfo> {
    let (rx_lanes, tx_lanes) = activate_lanes(uic)?;
    let gears = select_gear(uic, max_hs_gear)?;
    switch_power_mode(uic, gears.mode, hooks, series)?;

    let link = LinkInfo {
        rx: DirectionInfo {
            lanes: rx_lanes,
            gear: gears.rx_gear,
            mode: gears.mode,
        },
        tx: DirectionInfo {
            lanes: tx_lanes,
            gear: gears.tx_gear,
            mode: gears.mode,
        },
    };
    info!(
        "link up: rx {}x gear {} tx {}x gear {} ({:?})",
        link.rx.lanes, link.rx.gear, link.tx.lanes, link.tx.gear, gears.mode
    );
    Ok(link)
}
