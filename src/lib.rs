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

//! A polling driver for UFS host controllers.
//!
//! [`UfsHostController`] enables a controller, brings up the UniPro link to
//! the attached device and then executes SCSI commands and device management
//! queries through the UTP transfer request list, one request at a time.
//! Everything the driver needs from its platform (register access, DMA
//! memory, an IOMMU and a time source) is passed in as a trait object, so the
//! same code runs on real hardware and on the emulated controller in
//! [`sim`].

pub mod constants;
pub mod controller;
pub mod descriptor;
pub mod dma;
pub mod error;
pub mod link;
pub mod poll;
pub mod pool;
pub mod registers;
pub mod sim;
pub mod slots;
pub mod uic;
pub mod upiu;

pub use controller::{HostResources, UfsConfig, UfsHostController};
pub use error::{DeviceFault, Result, UfsError};
