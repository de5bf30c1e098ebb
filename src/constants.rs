//! Register offsets, bit masks and protocol codes of the UFS host controller
//! interface (UFSHCI) and the UniPro link layer beneath it.

/// Offsets into the host controller register space.
pub mod offset {
    pub const CAP: u32 = 0x00;
    pub const VER: u32 = 0x08;
    pub const IS: u32 = 0x20;
    pub const IE: u32 = 0x24;
    pub const HCS: u32 = 0x30;
    pub const HCE: u32 = 0x34;

    pub const UTRLBA: u32 = 0x50;
    pub const UTRLBAU: u32 = 0x54;
    pub const UTRLDBR: u32 = 0x58;
    pub const UTRLCLR: u32 = 0x5c;
    pub const UTRLRSR: u32 = 0x60;

    pub const UTMRLBA: u32 = 0x70;
    pub const UTMRLBAU: u32 = 0x74;
    pub const UTMRLDBR: u32 = 0x78;
    pub const UTMRLCLR: u32 = 0x7c;
    pub const UTMRLRSR: u32 = 0x80;

    pub const UICCMD: u32 = 0x90;
    pub const UCMDARG1: u32 = 0x94;
    pub const UCMDARG2: u32 = 0x98;
    pub const UCMDARG3: u32 = 0x9c;

    /// Size of the register window covering every register above.
    pub const WINDOW_SIZE: usize = 0x100;
}

/// Controller capabilities (`CAP`).
pub mod cap {
    pub const NUTRS_MASK: u32 = 0x1f;
    pub const NUTMRS_SHIFT: u32 = 16;
    pub const NUTMRS_MASK: u32 = 0x7 << NUTMRS_SHIFT;
    pub const AS64: u32 = 1 << 24;
}

/// Interrupt status (`IS`), write one to clear.
pub mod is {
    pub const UTRCS: u32 = 1 << 0;
    pub const UE: u32 = 1 << 2;
    pub const UPMS: u32 = 1 << 4;
    pub const ULSS: u32 = 1 << 8;
    pub const UCCS: u32 = 1 << 10;
}

/// Host controller status (`HCS`).
pub mod hcs {
    pub const DP: u32 = 1 << 0;
    pub const UTRLRDY: u32 = 1 << 1;
    pub const UTMRLRDY: u32 = 1 << 2;
    pub const UCRDY: u32 = 1 << 3;
    pub const UPMCRS_SHIFT: u32 = 8;
    pub const UPMCRS_MASK: u32 = 0x7 << UPMCRS_SHIFT;

    /// `UPMCRS` value reporting a successful local power mode change.
    pub const PWR_LOCAL: u8 = 0x01;
}

/// Host controller enable (`HCE`).
pub mod hce {
    pub const EN: u32 = 1 << 0;
}

/// Run-stop registers (`UTRLRSR`, `UTMRLRSR`).
pub mod rsr {
    pub const RUN: u32 = 1 << 0;
}

/// Transfer request descriptor encodings.
pub mod trd {
    /// Size of one UTP transfer request descriptor.
    pub const SIZE: usize = 32;
    /// Size of one UTP task management request descriptor.
    pub const TMRD_SIZE: usize = 80;
    /// Command type for UFS storage commands.
    pub const CT_UFS_STORAGE: u32 = 0x1;
    /// OCS value written before submission; hardware overwrites it.
    pub const OCS_INIT: u8 = 0x0f;
    /// Command descriptors must start on this boundary.
    pub const UCD_ALIGN: usize = 128;
    /// Largest region a single PRDT entry may describe.
    pub const MAX_DATA_LEN_PER_PRD: usize = 0x4_0000;
}

/// UPIU transaction codes.
pub mod transaction {
    pub const NOP_OUT: u8 = 0x00;
    pub const COMMAND: u8 = 0x01;
    pub const QUERY_REQUEST: u8 = 0x16;
    pub const NOP_IN: u8 = 0x20;
    pub const RESPONSE: u8 = 0x21;
    pub const QUERY_RESPONSE: u8 = 0x36;
    pub const REJECT: u8 = 0x3f;
}

/// COMMAND and RESPONSE UPIU flag bits.
pub mod upiu_flags {
    pub const WRITE: u8 = 1 << 5;
    pub const READ: u8 = 1 << 6;
    /// Set in a RESPONSE UPIU when fewer bytes than expected were moved.
    pub const UNDERFLOW: u8 = 1 << 5;
    /// Set in a RESPONSE UPIU when more bytes than expected were offered.
    pub const OVERFLOW: u8 = 1 << 6;
}

/// Query request function codes and response codes.
pub mod query {
    pub const FUNC_STD_READ: u8 = 0x01;
    pub const FUNC_STD_WRITE: u8 = 0x81;

    pub const RESP_SUCCESS: u8 = 0x00;
    pub const RESP_NOT_READABLE: u8 = 0xf6;
    pub const RESP_NOT_WRITEABLE: u8 = 0xf7;
    pub const RESP_ALREADY_WRITTEN: u8 = 0xf8;
    pub const RESP_INVALID_LENGTH: u8 = 0xf9;
    pub const RESP_INVALID_VALUE: u8 = 0xfa;
    pub const RESP_INVALID_SELECTOR: u8 = 0xfb;
    pub const RESP_INVALID_INDEX: u8 = 0xfc;
    pub const RESP_INVALID_IDN: u8 = 0xfd;
    pub const RESP_INVALID_OPCODE: u8 = 0xfe;
    pub const RESP_GENERAL_FAILURE: u8 = 0xff;

    /// Largest descriptor a device returns; bLength is a single byte.
    pub const DESCRIPTOR_MAX_LEN: usize = 255;
}

/// Descriptor, flag and attribute identifiers used by the driver.
pub mod idn {
    pub const DESC_DEVICE: u8 = 0x00;
    pub const DESC_CONFIGURATION: u8 = 0x01;
    pub const DESC_UNIT: u8 = 0x02;
    pub const DESC_STRING: u8 = 0x05;

    pub const FLAG_DEVICE_INIT: u8 = 0x01;

    pub const ATTR_BOOT_LUN_EN: u8 = 0x00;
    pub const ATTR_CURRENT_POWER_MODE: u8 = 0x02;
    pub const ATTR_ACTIVE_ICC_LEVEL: u8 = 0x03;
}

/// Well-known logical unit numbers.
pub mod wlun {
    pub const REPORT_LUNS: u8 = 0x81;
    pub const BOOT: u8 = 0xb0;
    pub const RPMB: u8 = 0xc4;
    pub const UFS_DEVICE: u8 = 0xd0;
}

/// UIC command opcodes.
pub mod uic {
    pub const DME_GET: u8 = 0x01;
    pub const DME_SET: u8 = 0x02;
    pub const DME_PEER_GET: u8 = 0x03;
    pub const DME_PEER_SET: u8 = 0x04;
    pub const DME_POWERON: u8 = 0x10;
    pub const DME_POWEROFF: u8 = 0x11;
    pub const DME_ENABLE: u8 = 0x12;
    pub const DME_RESET: u8 = 0x14;
    pub const DME_ENDPOINTRESET: u8 = 0x15;
    pub const DME_LINKSTARTUP: u8 = 0x16;
    pub const DME_HIBER_ENTER: u8 = 0x17;
    pub const DME_HIBER_EXIT: u8 = 0x18;

    /// Low byte of `UCMDARG2` after completion.
    pub const RESULT_MASK: u32 = 0xff;
    pub const RESULT_SUCCESS: u32 = 0x00;
    pub const RESULT_INVALID_MIB_ATTRIBUTE: u32 = 0x01;
    pub const RESULT_BUSY: u32 = 0x09;
    pub const RESULT_DME_FAILURE: u32 = 0x0a;
}

/// UniPro PHY adapter (`PA_*`) and DME attribute identifiers.
pub mod mib {
    pub const PA_LOCAL_TX_LCC_ENABLE: u16 = 0x155e;
    pub const PA_ACTIVE_TX_DATA_LANES: u16 = 0x1560;
    pub const PA_CONNECTED_TX_DATA_LANES: u16 = 0x1561;
    pub const PA_TX_GEAR: u16 = 0x1568;
    pub const PA_TX_TERMINATION: u16 = 0x1569;
    pub const PA_HS_SERIES: u16 = 0x156a;
    pub const PA_PWR_MODE: u16 = 0x1571;
    pub const PA_ACTIVE_RX_DATA_LANES: u16 = 0x1580;
    pub const PA_CONNECTED_RX_DATA_LANES: u16 = 0x1581;
    pub const PA_RX_GEAR: u16 = 0x1583;
    pub const PA_RX_TERMINATION: u16 = 0x1584;
    pub const PA_MAX_RX_PWM_GEAR: u16 = 0x1586;
    pub const PA_MAX_RX_HS_GEAR: u16 = 0x1587;
    pub const PA_PWR_MODE_USER_DATA0: u16 = 0x15b0;
    pub const PA_PWR_MODE_USER_DATA1: u16 = 0x15b1;
    pub const PA_PWR_MODE_USER_DATA2: u16 = 0x15b2;

    pub const DME_FC0_PROTECTION_TIMEOUT: u16 = 0xd041;
    pub const DME_TC0_REPLAY_TIMEOUT: u16 = 0xd042;
    pub const DME_AFC0_REQ_TIMEOUT: u16 = 0xd043;

    /// Reported by `PA_MaxRxHSGear` when the receiver has no HS capability.
    pub const NO_HS: u32 = 0;
}
