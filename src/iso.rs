//! CIG/CIS coordinator boundary.
//!
//! The controller side of the stream (LE Set CIG Parameters, LE Create CIS,
//! LE Setup/Remove ISO Data Path, LE Remove CIG) is owned by an external ISO
//! manager. This module defines the parameter blocks the state machine hands
//! to it and the completion events it feeds back. Every call is
//! fire-and-forget; the matching completion re-enters the state machine
//! through its inbox.

use bitflags::bitflags;
use heapless::Vec;

use crate::{CodecId, CodecError, CODEC_CONFIG_LEN, MAX_GROUP_CISES};

/// HCI status and reason codes the state machine reacts to.
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const UNSUPPORTED_REMOTE_FEATURE: u8 = 0x1A;
    pub const REMOTE_USER_TERMINATED: u8 = 0x13;
    pub const CONNECTION_TERMINATED_BY_LOCAL_HOST: u8 = 0x16;
    pub const COMMAND_DISALLOWED: u8 = 0x0C;
    pub const CONNECTION_FAILED_TO_BE_ESTABLISHED: u8 = 0x3E;
}

/// Setup_ISO_Data_Path direction values.
pub const DATA_PATH_DIRECTION_INPUT: u8 = 0x00;
pub const DATA_PATH_DIRECTION_OUTPUT: u8 = 0x01;

/// Remove_ISO_Data_Path direction mask bits.
pub const REMOVE_DATA_PATH_INPUT: u8 = 0x01;
pub const REMOVE_DATA_PATH_OUTPUT: u8 = 0x02;

/// Data path over HCI.
pub const DATA_PATH_ID_HCI: u8 = 0x00;
/// Vendor default data path (offload).
pub const DATA_PATH_ID_PLATFORM_DEFAULT: u8 = 0x01;

/// Transparent coding format: the controller does not touch the payload.
pub const CODING_FORMAT_TRANSPARENT: u8 = 0x03;

bitflags! {
    /// PHY bitmask as used by ASCS QoS parameters and CIG configuration.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PhyMask: u8 {
        const M1 = 0x01;
        const M2 = 0x02;
        const CODED = 0x04;
    }
}

impl PhyMask {
    pub fn from_raw(raw: u8) -> Result<Self, CodecError> {
        PhyMask::from_bits(raw).ok_or(CodecError::InvalidValue)
    }
}

/// ISOAL framing mode.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Framing {
    #[default]
    Unframed = 0x00,
    Framed = 0x01,
}

/// CIS topology with respect to one group member.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CisType {
    Bidirectional,
    UnidirectionalSink,
    UnidirectionalSource,
}

/// Per-CIS entry of the CIG configuration.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CisParameters {
    pub cis_id: u8,
    pub max_sdu_size_mtos: u16,
    pub max_sdu_size_stom: u16,
    pub phy_mtos: PhyMask,
    pub phy_stom: PhyMask,
    pub rtn_mtos: u8,
    pub rtn_stom: u8,
}

/// LE Set CIG Parameters.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CigParameters {
    pub sdu_interval_mtos_us: u32,
    pub sdu_interval_stom_us: u32,
    pub sca: u8,
    pub packing: u8,
    pub framing: Framing,
    pub max_transport_latency_mtos_ms: u16,
    pub max_transport_latency_stom_ms: u16,
    pub cis: Vec<CisParameters, MAX_GROUP_CISES>,
}

/// One CIS to bring up: the CIS handle the CIG assigned and the ACL it rides.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CisConnection {
    pub cis_conn_handle: u16,
    pub acl_conn_handle: u16,
}

/// LE Setup ISO Data Path.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPathParameters {
    pub direction: u8,
    pub data_path_id: u8,
    pub codec_id: CodecId,
    pub controller_delay_us: u32,
    pub codec_configuration: Vec<u8, CODEC_CONFIG_LEN>,
}
