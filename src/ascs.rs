//! Audio Stream Control Service, client side
//!
//! Wire codec for the ASE Control Point and the ASE status notifications:
//! the operations this crate writes to a server and the notifications it
//! parses back. State handling lives in [`crate::state_machine`]; this
//! module is purely serialization.

use heapless::Vec;

pub use bt_hci::uuid::characteristic::{ASE_CONTROL_POINT, SINK_ASE, SOURCE_ASE};
pub use bt_hci::uuid::service::AUDIO_STREAM_CONTROL;

use crate::iso::{Framing, PhyMask};
use crate::{CodecError, CodecId, CODEC_CONFIG_LEN, CTP_PDU_LEN, MAX_DEVICE_ASES, METADATA_LEN};

/// State of an ASE with respect to the ASE state machine.
///
/// The discriminants are the wire values carried in the ASE status header.
/// The derived ordering follows the setup sequence, which is what group-level
/// comparisons rely on.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum AseState {
    #[default]
    Idle = 0x00,
    CodecConfigured = 0x01,
    QosConfigured = 0x02,
    Enabling = 0x03,
    Streaming = 0x04,
    Disabling = 0x05,
    Releasing = 0x06,
}

impl AseState {
    pub fn from_raw(raw: u8) -> Result<Self, CodecError> {
        Ok(match raw {
            0x00 => AseState::Idle,
            0x01 => AseState::CodecConfigured,
            0x02 => AseState::QosConfigured,
            0x03 => AseState::Enabling,
            0x04 => AseState::Streaming,
            0x05 => AseState::Disabling,
            0x06 => AseState::Releasing,
            _ => return Err(CodecError::InvalidValue),
        })
    }
}

/// ASE Control Point opcodes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtpOpcode {
    ConfigCodec = 0x01,
    ConfigQos = 0x02,
    Enable = 0x03,
    ReceiverStartReady = 0x04,
    Disable = 0x05,
    ReceiverStopReady = 0x06,
    UpdateMetadata = 0x07,
    Release = 0x08,
}

/// Control point response codes.
pub mod response_code {
    pub const SUCCESS: u8 = 0x00;
    pub const UNSUPPORTED_OPCODE: u8 = 0x01;
    pub const INVALID_LENGTH: u8 = 0x02;
    pub const INVALID_ASE_ID: u8 = 0x03;
    pub const INVALID_ASE_STATE_MACHINE_TRANSITION: u8 = 0x04;
    pub const INVALID_ASE_DIRECTION: u8 = 0x05;
    pub const UNSUPPORTED_AUDIO_CAPABILITIES: u8 = 0x06;
    pub const UNSUPPORTED_CONFIGURATION_PARAMETER: u8 = 0x07;
    pub const REJECTED_CONFIGURATION_PARAMETER: u8 = 0x08;
    pub const INVALID_CONFIGURATION_PARAMETER: u8 = 0x09;
    pub const UNSUPPORTED_METADATA: u8 = 0x0A;
    pub const REJECTED_METADATA: u8 = 0x0B;
    pub const INVALID_METADATA: u8 = 0x0C;
    pub const INSUFFICIENT_RESOURCES: u8 = 0x0D;
    pub const UNSPECIFIED_ERROR: u8 = 0x0E;
}

/// Target_Latency values of the Config Codec operation.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TargetLatency {
    Low = 0x01,
    #[default]
    BalancedLatencyReliability = 0x02,
    HighReliability = 0x03,
}

/// Target_PHY values of the Config Codec operation.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TargetPhy {
    M1 = 0x01,
    #[default]
    M2 = 0x02,
    Coded = 0x03,
}

/// A server write larger than ATT_MTU-3 cannot go out as a single
/// Write Without Response and needs the Prepare/Execute long write procedure.
pub fn needs_long_write(pdu_len: usize, mtu: u16) -> bool {
    pdu_len > (mtu as usize).saturating_sub(3)
}

fn put(out: &mut Vec<u8, CTP_PDU_LEN>, bytes: &[u8]) -> Result<(), CodecError> {
    out.extend_from_slice(bytes).map_err(|_| CodecError::Overrun)
}

/// One ASE entry of a Config Codec operation.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct CodecConfigOperation<'a> {
    pub ase_id: u8,
    pub target_latency: TargetLatency,
    pub target_phy: TargetPhy,
    pub codec_id: CodecId,
    /// Codec_Specific_Configuration, already LTV encoded.
    pub codec_configuration: &'a [u8],
}

/// One ASE entry of a Config QoS operation.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct QosConfigOperation {
    pub ase_id: u8,
    pub cig_id: u8,
    pub cis_id: u8,
    pub sdu_interval_us: u32,
    pub framing: Framing,
    pub phy: PhyMask,
    pub max_sdu: u16,
    pub retransmission_number: u8,
    pub max_transport_latency_ms: u16,
    pub presentation_delay_us: u32,
}

/// One ASE entry of an Enable or Update Metadata operation.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct MetadataOperation<'a> {
    pub ase_id: u8,
    /// Metadata, already LTV encoded.
    pub metadata: &'a [u8],
}

fn codec_id_bytes(id: &CodecId) -> [u8; 5] {
    let company = id.vendor_company_id.to_le_bytes();
    let vendor = id.vendor_codec_id.to_le_bytes();
    [
        id.coding_format,
        company[0],
        company[1],
        vendor[0],
        vendor[1],
    ]
}

pub fn config_codec(ops: &[CodecConfigOperation]) -> Result<Vec<u8, CTP_PDU_LEN>, CodecError> {
    let mut out = Vec::new();
    put(&mut out, &[CtpOpcode::ConfigCodec as u8, ops.len() as u8])?;
    for op in ops {
        put(
            &mut out,
            &[
                op.ase_id,
                op.target_latency as u8,
                op.target_phy as u8,
            ],
        )?;
        put(&mut out, &codec_id_bytes(&op.codec_id))?;
        if op.codec_configuration.len() > CODEC_CONFIG_LEN {
            return Err(CodecError::Overrun);
        }
        put(&mut out, &[op.codec_configuration.len() as u8])?;
        put(&mut out, op.codec_configuration)?;
    }
    Ok(out)
}

pub fn config_qos(ops: &[QosConfigOperation]) -> Result<Vec<u8, CTP_PDU_LEN>, CodecError> {
    let mut out = Vec::new();
    put(&mut out, &[CtpOpcode::ConfigQos as u8, ops.len() as u8])?;
    for op in ops {
        let interval = op.sdu_interval_us.to_le_bytes();
        let max_sdu = op.max_sdu.to_le_bytes();
        let latency = op.max_transport_latency_ms.to_le_bytes();
        let delay = op.presentation_delay_us.to_le_bytes();
        put(
            &mut out,
            &[
                op.ase_id,
                op.cig_id,
                op.cis_id,
                interval[0],
                interval[1],
                interval[2],
                op.framing as u8,
                op.phy.bits(),
                max_sdu[0],
                max_sdu[1],
                op.retransmission_number,
                latency[0],
                latency[1],
                delay[0],
                delay[1],
                delay[2],
            ],
        )?;
    }
    Ok(out)
}

fn with_metadata(
    opcode: CtpOpcode,
    ops: &[MetadataOperation],
) -> Result<Vec<u8, CTP_PDU_LEN>, CodecError> {
    let mut out = Vec::new();
    put(&mut out, &[opcode as u8, ops.len() as u8])?;
    for op in ops {
        if op.metadata.len() > METADATA_LEN {
            return Err(CodecError::Overrun);
        }
        put(&mut out, &[op.ase_id, op.metadata.len() as u8])?;
        put(&mut out, op.metadata)?;
    }
    Ok(out)
}

pub fn enable(ops: &[MetadataOperation]) -> Result<Vec<u8, CTP_PDU_LEN>, CodecError> {
    with_metadata(CtpOpcode::Enable, ops)
}

pub fn update_metadata(ops: &[MetadataOperation]) -> Result<Vec<u8, CTP_PDU_LEN>, CodecError> {
    with_metadata(CtpOpcode::UpdateMetadata, ops)
}

fn with_ase_ids(opcode: CtpOpcode, ase_ids: &[u8]) -> Result<Vec<u8, CTP_PDU_LEN>, CodecError> {
    let mut out = Vec::new();
    put(&mut out, &[opcode as u8, ase_ids.len() as u8])?;
    put(&mut out, ase_ids)?;
    Ok(out)
}

pub fn disable(ase_ids: &[u8]) -> Result<Vec<u8, CTP_PDU_LEN>, CodecError> {
    with_ase_ids(CtpOpcode::Disable, ase_ids)
}

pub fn release(ase_ids: &[u8]) -> Result<Vec<u8, CTP_PDU_LEN>, CodecError> {
    with_ase_ids(CtpOpcode::Release, ase_ids)
}

pub fn receiver_start_ready(ase_ids: &[u8]) -> Result<Vec<u8, CTP_PDU_LEN>, CodecError> {
    with_ase_ids(CtpOpcode::ReceiverStartReady, ase_ids)
}

pub fn receiver_stop_ready(ase_ids: &[u8]) -> Result<Vec<u8, CTP_PDU_LEN>, CodecError> {
    with_ase_ids(CtpOpcode::ReceiverStopReady, ase_ids)
}

/// Header of every ASE status notification.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AseStatusHeader {
    pub ase_id: u8,
    pub state: AseState,
}

/// Split an ASE status notification into its header and the state specific
/// payload.
pub fn parse_ase_status(data: &[u8]) -> Result<(AseStatusHeader, &[u8]), CodecError> {
    if data.len() < 2 {
        return Err(CodecError::Truncated);
    }
    let header = AseStatusHeader {
        ase_id: data[0],
        state: AseState::from_raw(data[1])?,
    };
    Ok((header, &data[2..]))
}

fn u24(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])
}

/// Additional parameters of the Codec Configured state: the server's QoS
/// preferences plus the codec configuration it accepted.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfiguredStatus {
    /// Server support for unframed ISOAL PDUs
    pub framing: u8,
    /// Server preferred value for the PHY parameter
    pub preferred_phy: PhyMask,
    /// Server preferred value for the Retransmission_Number parameter
    pub preferred_retransmission_number: u8,
    /// Maximum server supported value for the Max_Transport_Latency parameter (in milliseconds)
    pub max_transport_latency_ms: u16,
    /// Minimum server supported Presentation_Delay (in microseconds)
    pub presentation_delay_min_us: u32,
    /// Maximum server supported Presentation_Delay (in microseconds)
    pub presentation_delay_max_us: u32,
    /// Server preferred minimum Presentation_Delay (in microseconds)
    pub preferred_presentation_delay_min_us: u32,
    /// Server preferred maximum Presentation_Delay (in microseconds)
    pub preferred_presentation_delay_max_us: u32,
    /// Codec ID
    pub codec_id: CodecId,
    /// Codec specific configuration for this ASE
    pub codec_configuration: Vec<u8, CODEC_CONFIG_LEN>,
}

impl CodecConfiguredStatus {
    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < 23 {
            return Err(CodecError::Truncated);
        }
        let conf_len = payload[22] as usize;
        if payload.len() < 23 + conf_len || conf_len > CODEC_CONFIG_LEN {
            return Err(CodecError::Truncated);
        }
        let mut codec_configuration = Vec::new();
        let _ = codec_configuration.extend_from_slice(&payload[23..23 + conf_len]);
        Ok(Self {
            framing: payload[0],
            preferred_phy: PhyMask::from_raw(payload[1])?,
            preferred_retransmission_number: payload[2],
            max_transport_latency_ms: u16::from_le_bytes([payload[3], payload[4]]),
            presentation_delay_min_us: u24(&payload[5..8]),
            presentation_delay_max_us: u24(&payload[8..11]),
            preferred_presentation_delay_min_us: u24(&payload[11..14]),
            preferred_presentation_delay_max_us: u24(&payload[14..17]),
            codec_id: CodecId {
                coding_format: payload[17],
                vendor_company_id: u16::from_le_bytes([payload[18], payload[19]]),
                vendor_codec_id: u16::from_le_bytes([payload[20], payload[21]]),
            },
            codec_configuration,
        })
    }
}

/// Additional parameters of the Enabling, Streaming and Disabling states.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientStatus {
    pub cig_id: u8,
    pub cis_id: u8,
    /// Metadata, LTV encoded as received.
    pub metadata: Vec<u8, METADATA_LEN>,
}

impl TransientStatus {
    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < 3 {
            return Err(CodecError::Truncated);
        }
        let metadata_len = payload[2] as usize;
        if payload.len() < 3 + metadata_len || metadata_len > METADATA_LEN {
            return Err(CodecError::Truncated);
        }
        let mut metadata = Vec::new();
        let _ = metadata.extend_from_slice(&payload[3..3 + metadata_len]);
        Ok(Self {
            cig_id: payload[0],
            cis_id: payload[1],
            metadata,
        })
    }
}

/// One per-ASE entry of a control point notification.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtpEntry {
    pub ase_id: u8,
    pub response_code: u8,
    pub reason: u8,
}

impl CtpEntry {
    pub fn is_success(&self) -> bool {
        self.response_code == response_code::SUCCESS
    }
}

/// A decoded ASE Control Point notification.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtpNotification {
    pub opcode: u8,
    pub entries: Vec<CtpEntry, MAX_DEVICE_ASES>,
}

impl CtpNotification {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 2 {
            return Err(CodecError::Truncated);
        }
        let count = data[1] as usize;
        // Number_of_ASEs 0xFF flags an unsupported opcode or invalid length;
        // the single entry carries the response code.
        let count = if data[1] == 0xFF { 1 } else { count };
        if data.len() < 2 + 3 * count {
            return Err(CodecError::Truncated);
        }
        let mut entries = Vec::new();
        for chunk in data[2..2 + 3 * count].chunks_exact(3) {
            entries
                .push(CtpEntry {
                    ase_id: chunk[0],
                    response_code: chunk[1],
                    reason: chunk[2],
                })
                .map_err(|_| CodecError::Overrun)?;
        }
        Ok(Self {
            opcode: data[0],
            entries,
        })
    }
}
