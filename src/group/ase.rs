use heapless::Vec;

use crate::ascs::{AseState, TargetLatency};
use crate::generic_audio::CodecConfiguration;
use crate::iso::PhyMask;
use crate::{CodecId, Direction, METADATA_LEN};

/// An ASE that has no CIS assigned yet.
pub const INVALID_CIS_ID: u8 = 0xFF;
/// An ASE whose CIS connection handle is not known yet.
pub const INVALID_CIS_HANDLE: u16 = 0x0000;

/// State of the CIS backing an ASE.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CisState {
    #[default]
    Idle,
    /// CIS id and connection handle reserved for this ASE.
    Assigned,
    Connecting,
    Connected,
    Disconnecting,
}

/// State of the ISO data path on an ASE's CIS half.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataPathState {
    #[default]
    Idle,
    Configuring,
    Configured,
    Removing,
}

/// One Audio Stream Endpoint of a group member.
///
/// The record keeps both the ASCS state machine position and the
/// client-side bookkeeping that belongs to it: assigned CIS, data-path
/// state, the codec/QoS parameters in force and the server's advertised
/// QoS preferences.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct Ase {
    /// Identifier assigned by the server; 0x00 until the first status
    /// notification reveals it.
    pub id: u8,
    pub direction: Direction,
    pub state: AseState,
    pub cis_state: CisState,
    pub data_path_state: DataPathState,

    /// Part of the active stream configuration.
    pub active: bool,
    /// Context this ASE was last configured for; survives release when the
    /// server caches the codec configuration.
    pub configured_for_context: Option<crate::generic_audio::ContextType>,

    pub codec_id: CodecId,
    pub codec_configuration: CodecConfiguration,
    pub metadata: Vec<u8, METADATA_LEN>,
    pub target_latency: TargetLatency,

    // QoS in force, seeded from configuration and tightened by the server's
    // Codec Configured preferences.
    pub framing: u8,
    pub preferred_phy: PhyMask,
    pub max_transport_latency_ms: u16,
    pub retransmission_number: u8,
    pub presentation_delay_min_us: u32,
    pub presentation_delay_max_us: u32,
    pub preferred_presentation_delay_min_us: u32,
    pub preferred_presentation_delay_max_us: u32,
    pub max_sdu_size: u16,

    pub cis_id: u8,
    pub cis_conn_handle: u16,

    /// Set while a server initiated reconfiguration is outstanding.
    pub reconfigure: bool,
    /// Target of a peer-autonomous transition; doubles as the armed marker
    /// of the autonomous-operation timer.
    pub autonomous_target_state: Option<AseState>,
}

impl Ase {
    pub fn new(direction: Direction) -> Self {
        Self {
            id: 0x00,
            direction,
            state: AseState::Idle,
            cis_state: CisState::Idle,
            data_path_state: DataPathState::Idle,
            active: false,
            configured_for_context: None,
            codec_id: CodecId::LC3,
            codec_configuration: CodecConfiguration::default(),
            metadata: Vec::new(),
            target_latency: TargetLatency::default(),
            framing: 0,
            preferred_phy: PhyMask::M2,
            max_transport_latency_ms: 0,
            retransmission_number: 0,
            presentation_delay_min_us: 0,
            presentation_delay_max_us: 0,
            preferred_presentation_delay_min_us: 0,
            preferred_presentation_delay_max_us: 0,
            max_sdu_size: 0,
            cis_id: INVALID_CIS_ID,
            cis_conn_handle: INVALID_CIS_HANDLE,
            reconfigure: false,
            autonomous_target_state: None,
        }
    }

    pub fn has_cis(&self) -> bool {
        self.cis_id != INVALID_CIS_ID
    }

    /// Drop the CIS assignment, e.g. before the group is reconfigured.
    pub fn release_cis(&mut self) {
        self.cis_id = INVALID_CIS_ID;
        self.cis_conn_handle = INVALID_CIS_HANDLE;
    }

    /// Forget everything tied to the current stream; identity and cached
    /// configuration context survive.
    pub fn deactivate(&mut self) {
        self.active = false;
        self.state = AseState::Idle;
        self.cis_state = CisState::Idle;
        self.data_path_state = DataPathState::Idle;
        self.metadata.clear();
        self.autonomous_target_state = None;
        self.release_cis();
    }
}
