//! LE Audio unicast stream management for trouble-host.
//!
//! This crate drives a coordinated set of ASCS servers (a unicast group)
//! through the endpoint state machine defined by ASCS 1.0: codec and QoS
//! configuration, CIG/CIS establishment, ISO data-path setup, streaming,
//! suspend and release. The state machine itself is transport-free: GATT
//! control-point writes and ISO primitives leave as [`state_machine::Action`]s,
//! notifications and controller completions come back in as
//! [`state_machine::UnicastEvent`]s, and [`client::UnicastSession`] ties both
//! ends to an embassy executor.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod ascs;
pub mod client;
pub mod generic_audio;
pub mod group;
pub mod iso;
pub mod state_machine;
pub mod transport;
pub mod watchdog;

/// Content control id, assigned by a content control service (e.g. MCS, TBS).
pub type ContentControlId = u8;

/// Devices per unicast group (a coordinated set).
pub const MAX_GROUP_DEVICES: usize = 4;
/// ASEs per group member.
pub const MAX_DEVICE_ASES: usize = 4;
/// CIS descriptors per CIG.
pub const MAX_GROUP_CISES: usize = 8;
/// Groups owned by one state machine.
pub const MAX_GROUPS: usize = 2;
/// Largest control point command the crate composes.
pub const CTP_PDU_LEN: usize = 128;
/// Largest ASE status / control point notification the crate parses.
pub const NOTIFICATION_LEN: usize = 64;
/// Codec specific configuration buffer (LTV encoded). The five LC3 LTVs
/// need 19 bytes; the headroom is for vendor extensions.
pub const CODEC_CONFIG_LEN: usize = 24;
/// Metadata buffer (LTV encoded).
pub const METADATA_LEN: usize = 32;
/// Content control ids carried per direction.
pub const MAX_CCIDS: usize = 4;

/// Direction of an ASE, from the server's point of view: a Sink ASE receives
/// audio from us, a Source ASE transmits audio to us.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Sink = 0x01,
    Source = 0x02,
}

/// Codec identifier: coding format plus vendor extension ids.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecId {
    pub coding_format: u8,
    pub vendor_company_id: u16,
    pub vendor_codec_id: u16,
}

impl CodecId {
    pub const LC3: Self = Self {
        coding_format: 0x06,
        vendor_company_id: 0x0000,
        vendor_codec_id: 0x0000,
    };

    /// Vendor codec id used on the head-tracking (DSA) data path.
    pub const HEADTRACKING: Self = Self {
        coding_format: 0xFF,
        vendor_company_id: 0x00E0,
        vendor_codec_id: 0x0001,
    };
}

impl Default for CodecId {
    fn default() -> Self {
        Self::LC3
    }
}

/// Latency mode requested by the upper audio stack.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyMode {
    Free,
    LowLatency,
    DynamicSpatialAudioSoftware,
    DynamicSpatialAudioHardware,
}

/// Dynamic Spatial Audio transport mode selected for a group.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DsaMode {
    #[default]
    Disabled,
    Acl,
    IsoSw,
    IsoHw,
}

bitflags::bitflags! {
    /// DSA modes a group member advertises support for.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DsaModes: u8 {
        const ACL = 0x01;
        const ISO_SW = 0x02;
        const ISO_HW = 0x04;
    }
}

impl DsaModes {
    pub fn supports(&self, mode: DsaMode) -> bool {
        match mode {
            DsaMode::Disabled => false,
            DsaMode::Acl => self.contains(DsaModes::ACL),
            DsaMode::IsoSw => self.contains(DsaModes::ISO_SW),
            DsaMode::IsoHw => self.contains(DsaModes::ISO_HW),
        }
    }
}

/// Sink/Source pair, indexed by [`Direction`]. Audio configuration is almost
/// always directional; this keeps the two halves together.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BidirectionalPair<T> {
    pub sink: T,
    pub source: T,
}

impl<T> BidirectionalPair<T> {
    pub fn get(&self, direction: Direction) -> &T {
        match direction {
            Direction::Sink => &self.sink,
            Direction::Source => &self.source,
        }
    }

    pub fn get_mut(&mut self, direction: Direction) -> &mut T {
        match direction {
            Direction::Sink => &mut self.sink,
            Direction::Source => &mut self.source,
        }
    }
}

/// Wire encode/decode failures.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// PDU shorter than its fixed layout requires.
    Truncated,
    /// A field carries a value outside its assigned-numbers range.
    InvalidValue,
    /// Encoded output would not fit the destination buffer.
    Overrun,
}
