#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::must_use_candidate
)]
// now allow a few rules which are denied by the above's statement
#![allow(clippy::multiple_crate_versions)]
#![deny(missing_debug_implementations)]
#![deny(rustdoc::all)]

//! ufshcd

mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::Cli;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use ufshcd::{
    controller::{LogicalUnit, ScsiData, ScsiRequestPacket},
    sim::{SimConfig, SimController},
    upiu::SENSE_DATA_LEN,
    UfsConfig, UfsHostController,
};

const READ_CAPACITY_10: u8 = 0x25;
const READ_10: u8 = 0x28;

/// Run one data-in SCSI command and fail unless the target reports GOOD.
fn scsi_read(
    controller: &mut UfsHostController,
    lun: u8,
    cdb: &[u8],
    data: &mut [u8],
) -> Result<usize> {
    let mut sense = [0u8; SENSE_DATA_LEN];
    let mut packet = ScsiRequestPacket::new(cdb, ScsiData::In(data), &mut sense);
    controller
        .exec_scsi(lun, &mut packet)
        .with_context(|| format!("SCSI command {:#04x} on LUN {lun} failed", cdb[0]))?;

    if packet.target_status != 0 {
        let sense = &packet.sense_data[..usize::from(packet.sense_data_length)];
        bail!(
            "SCSI command {:#04x} on LUN {lun} returned status {:#04x}, sense {sense:02x?}",
            cdb[0],
            packet.target_status
        );
    }
    Ok(packet.in_transfer_length as usize)
}

/// Last LBA and block size of `lun`.
fn read_capacity(controller: &mut UfsHostController, lun: u8) -> Result<(u32, u32)> {
    let mut data = [0u8; 8];
    let cdb = [READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    let len = scsi_read(controller, lun, &cdb, &mut data)?;
    if len < data.len() {
        bail!("short READ CAPACITY answer of {len} bytes");
    }
    let last_lba = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let block_size = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    Ok((last_lba, block_size))
}

fn dump_block(controller: &mut UfsHostController, lun: u8, lba: u32, block_size: u32) -> Result<()> {
    let mut block = vec![0u8; block_size as usize];
    let lba_bytes = lba.to_be_bytes();
    let cdb = [
        READ_10,
        0,
        lba_bytes[0],
        lba_bytes[1],
        lba_bytes[2],
        lba_bytes[3],
        0,
        0,
        1,
        0,
    ];
    let len = scsi_read(controller, lun, &cdb, &mut block)?;

    println!("LUN {lun} LBA {lba}:");
    for (line, chunk) in block[..len].chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02x}")).collect();
        println!("{:08x}  {}", line * 16, hex.join(" "));
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    // Log messages from the log crate as well.
    tracing_log::LogTracer::init()?;

    let sim = SimController::new(SimConfig {
        slots: args.slots,
        lanes: args.lanes,
        peer_max_hs_gear: args.peer_max_hs_gear,
        ..SimConfig::default()
    });
    let config = UfsConfig {
        max_hs_gear: args.max_hs_gear,
        negotiate_power_mode: !args.no_power_mode,
        ..UfsConfig::default()
    };

    let mut controller = UfsHostController::start(sim.resources(), config)
        .context("Failed to start the UFS host controller")?;
    info!("We're up!");

    match controller.link_info() {
        Some(link) => println!(
            "link: rx {} lane(s) gear {} {:?}, tx {} lane(s) gear {} {:?}",
            link.rx.lanes, link.rx.gear, link.rx.mode, link.tx.lanes, link.tx.gear, link.tx.mode
        ),
        None => println!("link: not negotiated"),
    }

    let device = controller
        .read_device_descriptor()
        .context("Failed to read the device descriptor")?;
    println!(
        "device: UFS {:x}.{:02x}, manufacturer {:#06x}, {} logical unit(s)",
        device.spec_version >> 8,
        device.spec_version & 0xff,
        device.manufacturer_id,
        device.number_lu
    );

    let units = controller
        .discover_luns()
        .context("Failed to discover logical units")?;
    let names: Vec<String> = units
        .iter()
        .map(|unit| match unit {
            LogicalUnit::Normal(lun) => format!("{lun}"),
            LogicalUnit::WellKnown(wlun) => format!("{wlun:#04x}"),
        })
        .collect();
    println!("logical units: {}", names.join(", "));

    let (last_lba, block_size) = read_capacity(&mut controller, args.lun)?;
    println!(
        "LUN {}: {} blocks of {block_size} bytes",
        args.lun,
        u64::from(last_lba) + 1
    );

    if let Some(lba) = args.read_lba {
        dump_block(&mut controller, args.lun, lba, block_size)?;
    }

    controller
        .stop()
        .context("Failed to stop the UFS host controller")?;
    Ok(())
}
