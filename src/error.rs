//! Error taxonomy of the host controller driver.

use thiserror::Error;

/// Everything that can go wrong while driving the host controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UfsError {
    /// Malformed caller input or an unsupported opcode/index/selector combination.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// No free transfer slot, or no device answered link startup.
    #[error("not found: {0}")]
    NotFound(&'static str),
    /// DMA-visible memory could not be allocated or mapped.
    #[error("out of resources: {0}")]
    OutOfResources(&'static str),
    /// A bounded poll never observed the expected register value.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// The hardware reported a non-zero completion, response or result code.
    #[error("device error: {0}")]
    DeviceError(#[from] DeviceFault),
}

/// The/// The raw hardware evidence behind a [`UfsError::DeviceError`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// The transfer request descriptor completed with a non-zero OCS.
    #[error("overall command status {0:#04x}")]
    Ocs(u8),
    /// A RESPONSE UPIU reported a target failure.
    #[error("target failure (response {response:#04x}, status {status:#04x})")]
    Response { response: u8, status: u8 },
    /// A QUERY RESPONSE UPIU or its descriptor reported a failure.
    #[error("query failed (OCS {ocs:#04x}, query response {response:#04x})")]
    Query { ocs: u8, response: u8 },
    /// A NOP IN UPIU reported a non-zero response.
    #[error("NOP failed (OCS {ocs:#04x}, response {response:#04x})")]
    Nop { ocs: u8, response: u8 },
    /// A UIC command completed with a non-zero result code; `arg2` is the raw
    /// content of UCMDARG2.
    #[error("UIC command {opcode:#04x} failed (ARG2 {arg2:#010x})")]
    Uic { opcode: u8, arg2: u32 },
    /// Link startup did not report completion after the device vanished.
    #[error("link startup did not complete")]
    LinkStartup,
    /// The power mode change never completed or completed with a failure
    /// status (`HCS.UPMCRS`).
    #[error("power mode change failed (UPMCRS {status:#x})")]
    PowerModeChange { status: u8 },
    /// The device returned more descriptor bytes than the caller can take.
    #[error("device reported {reported} descriptor bytes for a {capacity} byte buffer")]
    DescriptorOverrun { reported: usize, capacity: usize },
    /// The configuration descriptor has a layout this driver cannot decode.
    #[error("unknown descriptor layout of {length} bytes")]
    UnknownDescriptorLayout { length: usize },
}

/// Shorthand used throughout the crate.
pub type Result<T, E = UfsError> = std::result::Result<T, E>;
