//! Unicast group records.
//!
//! A group is an ordered set of devices sharing one CIG. The records here
//! carry everything the state machine reconciles against: per-ASE state
//! ([`ase::Ase`]), per-device state ([`device::Device`]), the CIG descriptor
//! and the aggregated stream configuration.

use heapless::Vec;

use crate::ascs::{AseState, TargetLatency, TargetPhy};
use crate::generic_audio::{AudioLocation, CodecConfiguration, ContextType, StreamMetadata};
use crate::iso::{CisType, Framing, PhyMask};
use crate::{
    BidirectionalPair, CodecId, ContentControlId, Direction, DsaMode, MAX_CCIDS, MAX_GROUP_CISES,
    MAX_GROUP_DEVICES, METADATA_LEN,
};

pub mod ase;
pub mod device;

pub use ase::{Ase, CisState, DataPathState, INVALID_CIS_HANDLE, INVALID_CIS_ID};
pub use device::{AsePair, Device, DeviceConnectState};

/// Floor of the Max_Transport_Latency parameter (milliseconds).
pub const MAX_TRANSPORT_LATENCY_MIN_MS: u16 = 0x0005;

/// Context configurations a group can hold.
pub const MAX_CONTEXT_CONFIGS: usize = 4;

/// Controller-side state of the group's CIG.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CigState {
    #[default]
    None,
    Creating,
    Created,
    Removing,
    /// Create failed with Command Disallowed; a forced remove is in flight
    /// before the one retry.
    Recovering,
}

/// One CIS of the group's CIG.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CisDescriptor {
    pub id: u8,
    pub cis_type: CisType,
    pub device_index: u8,
    pub conn_handle: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Default)]
pub struct Cig {
    pub state: CigState,
    pub cises: Vec<CisDescriptor, MAX_GROUP_CISES>,
}

/// Aggregated stream parameters of one direction, built up as data paths
/// come up and torn down as CISes disappear.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Default)]
pub struct StreamParameters {
    pub sample_frequency_hz: u32,
    pub octets_per_codec_frame: u16,
    pub codec_frame_blocks_per_sdu: u8,
    pub frame_duration_us: u32,
    pub audio_channel_allocation: AudioLocation,
    pub num_of_devices: u8,
    pub num_of_channels: u8,
    /// (cis connection handle, allocation) per participating CIS.
    pub stream_locations: Vec<(u16, AudioLocation), MAX_GROUP_CISES>,
}

impl StreamParameters {
    pub fn clear(&mut self) {
        *self = StreamParameters::default();
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Default)]
pub struct StreamConfiguration {
    pub codec_id: CodecId,
    pub params: BidirectionalPair<StreamParameters>,
}

/// Stream settings of one direction of a context configuration.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct DirectionConfig {
    /// Codec parameters applied to every activated ASE; the channel
    /// allocation is overridden per stream from `allocations`.
    pub codec: CodecConfiguration,
    /// Allocation per activated stream, in device order.
    pub allocations: Vec<AudioLocation, MAX_GROUP_CISES>,
    /// ASEs activated per device.
    pub ases_per_device: u8,
    pub target_latency: TargetLatency,
    pub max_transport_latency_ms: u16,
    pub retransmission_number: u8,
}

impl DirectionConfig {
    pub fn new(codec: CodecConfiguration) -> Self {
        Self {
            codec,
            allocations: Vec::new(),
            ases_per_device: 1,
            target_latency: TargetLatency::default(),
            max_transport_latency_ms: 20,
            retransmission_number: 5,
        }
    }
}

/// How a group streams one context: which directions run and with what
/// settings. The upper layer derives these from PACS records; the state
/// machine only consumes them.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub context: ContextType,
    pub sink: Option<DirectionConfig>,
    pub source: Option<DirectionConfig>,
    pub framing: Framing,
}

impl ContextConfig {
    pub fn direction(&self, direction: Direction) -> Option<&DirectionConfig> {
        match direction {
            Direction::Sink => self.sink.as_ref(),
            Direction::Source => self.source.as_ref(),
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct DsaState {
    pub active: bool,
    pub mode: DsaMode,
}

/// An ordered set of devices driven through the stream lifecycle together.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct UnicastGroup {
    pub group_id: u8,
    pub devices: Vec<Device, MAX_GROUP_DEVICES>,

    state: AseState,
    target_state: AseState,

    pub cig: Cig,
    pub stream_conf: StreamConfiguration,

    context_configs: Vec<ContextConfig, MAX_CONTEXT_CONFIGS>,
    pub configuration_context: Option<ContextType>,
    pub metadata_contexts: BidirectionalPair<ContextType>,
    pub ccids: BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    pub target_phy: BidirectionalPair<TargetPhy>,
    pub framing: Framing,

    pub pending_configuration: bool,
    pub pending_available_contexts_change: bool,
    pub notify_streaming_when_cises_are_ready: bool,
    pub asymmetric_phy_for_unidirectional_cis_supported: bool,
    pub dsa: DsaState,
}

impl UnicastGroup {
    pub fn new(group_id: u8) -> Self {
        Self {
            group_id,
            devices: Vec::new(),
            state: AseState::Idle,
            target_state: AseState::Idle,
            cig: Cig::default(),
            stream_conf: StreamConfiguration::default(),
            context_configs: Vec::new(),
            configuration_context: None,
            metadata_contexts: BidirectionalPair::default(),
            ccids: BidirectionalPair::default(),
            target_phy: BidirectionalPair {
                sink: TargetPhy::M2,
                source: TargetPhy::M2,
            },
            framing: Framing::Unframed,
            pending_configuration: false,
            pending_available_contexts_change: false,
            notify_streaming_when_cises_are_ready: false,
            asymmetric_phy_for_unidirectional_cis_supported: true,
            dsa: DsaState::default(),
        }
    }

    pub fn state(&self) -> AseState {
        self.state
    }

    pub fn target_state(&self) -> AseState {
        self.target_state
    }

    pub fn set_state(&mut self, state: AseState) {
        debug!(
            "group {}: state {} -> {}",
            self.group_id, self.state as u8, state as u8
        );
        self.state = state;
    }

    pub fn set_target_state(&mut self, state: AseState) {
        self.target_state = state;
    }

    pub fn is_in_transition(&self) -> bool {
        self.state != self.target_state
    }

    pub fn is_releasing_or_idle(&self) -> bool {
        self.state == AseState::Releasing || self.state == AseState::Idle
    }

    pub fn add_context_config(&mut self, config: ContextConfig) -> Result<(), ()> {
        self.context_configs.push(config).map(|_| ()).map_err(|_| ())
    }

    pub fn context_config(&self, context: ContextType) -> Option<&ContextConfig> {
        self.context_configs.iter().find(|c| c.context == context)
    }

    // --- device queries ---

    pub fn device_index_by_acl(&self, acl_conn_handle: u16) -> Option<usize> {
        self.devices
            .iter()
            .position(|d| d.acl_conn_handle == acl_conn_handle)
    }

    pub fn device_index_by_cis_handle(&self, cis_conn_handle: u16) -> Option<usize> {
        self.devices
            .iter()
            .position(|d| !d.ases_by_cis_handle(cis_conn_handle).is_empty())
    }

    pub fn active_device_indexes(&self) -> impl Iterator<Item = usize> + '_ {
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.has_active_ase())
            .map(|(i, _)| i)
    }

    pub fn has_active_device(&self) -> bool {
        self.devices.iter().any(|d| d.has_active_ase())
    }

    pub fn is_any_device_connected(&self) -> bool {
        self.devices
            .iter()
            .any(|d| d.connection_state == DeviceConnectState::Connected)
    }

    pub fn have_all_active_devices_ases_same_state(&self, state: AseState) -> bool {
        self.has_active_device()
            && self
                .devices
                .iter()
                .filter(|d| d.has_active_ase())
                .all(|d| d.have_all_active_ases_same_state(state))
    }

    pub fn have_any_active_device_unconfigured(&self) -> bool {
        self.devices.iter().any(|d| d.have_any_unconfigured_ases())
    }

    pub fn is_group_ready_to_create_stream(&self) -> bool {
        self.has_active_device()
            && self
                .devices
                .iter()
                .filter(|d| d.has_active_ase())
                .all(|d| d.is_ready_to_create_stream())
    }

    pub fn is_group_ready_to_suspend_stream(&self) -> bool {
        self.devices
            .iter()
            .filter(|d| d.has_active_ase())
            .all(|d| d.is_ready_to_suspend_stream())
    }

    /// No CIS of the group is connected, connecting or half-way down.
    pub fn have_all_cises_disconnected(&self) -> bool {
        !self.devices.iter().any(|d| {
            d.ases.iter().any(|a| {
                matches!(
                    a.cis_state,
                    CisState::Connecting | CisState::Connected | CisState::Disconnecting
                )
            })
        })
    }

    /// Every active ASE has its CIS connected and data path configured.
    pub fn is_group_stream_ready(&self) -> bool {
        self.has_active_device()
            && self
                .devices
                .iter()
                .flat_map(|d| d.active_ases())
                .all(|a| {
                    a.cis_state == CisState::Connected
                        && a.data_path_state == DataPathState::Configured
                })
    }

    // --- configuration ---

    /// The group holds a cached codec configuration for `context` on every
    /// connected device.
    pub fn is_configured_for_context(&self, context: ContextType) -> bool {
        self.configuration_context == Some(context)
            && self
                .devices
                .iter()
                .filter(|d| d.connection_state == DeviceConnectState::Connected)
                .all(|d| {
                    d.ases
                        .iter()
                        .any(|a| a.configured_for_context == Some(context))
                })
            && self.is_any_device_connected()
    }

    /// Pick ASEs on every connected device for `context` and stamp the
    /// configuration into them. Returns false when nothing could be
    /// activated (context not configured or no capable device).
    pub fn configure(
        &mut self,
        context: ContextType,
        metadata_contexts: BidirectionalPair<ContextType>,
        ccids: &BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    ) -> bool {
        let Some(config) = self.context_config(context).cloned() else {
            warn!("group {}: no configuration for context", self.group_id);
            return false;
        };

        self.metadata_contexts = metadata_contexts;
        self.ccids = ccids.clone();
        self.framing = config.framing;

        let mut activated = false;
        for direction in [Direction::Sink, Direction::Source] {
            let Some(dir_config) = config.direction(direction) else {
                continue;
            };
            let mut allocation_index = 0;
            for device in self.devices.iter_mut() {
                if device.connection_state != DeviceConnectState::Connected {
                    continue;
                }
                if !device
                    .available_contexts
                    .get(direction)
                    .contains(context)
                {
                    continue;
                }
                let mut taken: u8 = 0;
                for ase in device.ases.iter_mut() {
                    if ase.direction != direction {
                        continue;
                    }
                    if ase.active {
                        // Already part of the stream (e.g. a member that
                        // never dropped); it holds its allocation slot.
                        taken += 1;
                        allocation_index += 1;
                        continue;
                    }
                    if taken >= dir_config.ases_per_device {
                        continue;
                    }
                    let allocation = dir_config
                        .allocations
                        .get(allocation_index)
                        .copied()
                        .unwrap_or(dir_config.codec.audio_channel_allocation);
                    allocation_index += 1;
                    taken += 1;

                    ase.active = true;
                    // An ASE the server still holds configured gets
                    // reconfigured in place; wait for its new status.
                    ase.reconfigure = ase.state == AseState::CodecConfigured;
                    ase.configured_for_context = Some(context);
                    ase.codec_id = CodecId::LC3;
                    ase.codec_configuration = CodecConfiguration {
                        audio_channel_allocation: allocation,
                        ..dir_config.codec
                    };
                    ase.target_latency = dir_config.target_latency;
                    ase.max_transport_latency_ms = dir_config.max_transport_latency_ms;
                    ase.retransmission_number = dir_config.retransmission_number;
                    ase.max_sdu_size = ase.codec_configuration.max_sdu_size();
                    ase.metadata = build_metadata(
                        device.available_contexts.get(direction),
                        direction,
                        &self.metadata_contexts,
                        &self.ccids,
                    );
                    activated = true;
                }
            }
        }

        if activated {
            self.configuration_context = Some(context);
        }
        activated
    }

    /// Re-activate the ASEs cached for `context` without reconfiguring.
    pub fn activate(
        &mut self,
        context: ContextType,
        metadata_contexts: BidirectionalPair<ContextType>,
        ccids: &BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    ) -> bool {
        if !self.is_configured_for_context(context) {
            return false;
        }
        self.metadata_contexts = metadata_contexts;
        self.ccids = ccids.clone();

        let mut activated = false;
        for device in self.devices.iter_mut() {
            if device.connection_state != DeviceConnectState::Connected {
                continue;
            }
            for ase in device.ases.iter_mut() {
                if ase.configured_for_context == Some(context) {
                    ase.active = true;
                    ase.metadata = build_metadata(
                        device.available_contexts.get(ase.direction),
                        ase.direction,
                        &self.metadata_contexts,
                        &self.ccids,
                    );
                    activated = true;
                }
            }
        }
        activated
    }

    pub fn deactivate(&mut self) {
        for device in self.devices.iter_mut() {
            for ase in device.ases.iter_mut() {
                ase.active = false;
            }
        }
    }

    pub fn invalidate_cached_configurations(&mut self) {
        self.configuration_context = None;
        for device in self.devices.iter_mut() {
            device.invalidate_cached_configurations();
        }
    }

    /// Would this metadata update change any active ASE's metadata?
    pub fn is_metadata_changed(
        &self,
        metadata_contexts: &BidirectionalPair<ContextType>,
        ccids: &BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    ) -> bool {
        self.devices.iter().any(|device| {
            device.active_ases().any(|ase| {
                let new = build_metadata(
                    device.available_contexts.get(ase.direction),
                    ase.direction,
                    metadata_contexts,
                    ccids,
                );
                new != ase.metadata
            })
        })
    }

    // --- CIS management ---

    /// Assign CIS ids to every active ASE of `device_index`, pairing one
    /// sink with one source onto a bidirectional CIS. Existing assignments
    /// are kept (reconnect case).
    pub fn assign_cis_ids(&mut self, device_index: usize) -> bool {
        let next_id = |cises: &Vec<CisDescriptor, MAX_GROUP_CISES>| cises.len() as u8;

        let Some(device) = self.devices.get_mut(device_index) else {
            return false;
        };

        let mut sinks: Vec<usize, { crate::MAX_DEVICE_ASES }> = Vec::new();
        let mut sources: Vec<usize, { crate::MAX_DEVICE_ASES }> = Vec::new();
        for (i, ase) in device.ases.iter().enumerate() {
            if !ase.active || ase.has_cis() {
                continue;
            }
            let _ = match ase.direction {
                Direction::Sink => sinks.push(i),
                Direction::Source => sources.push(i),
            };
        }

        let pairs = sinks.len().min(sources.len());
        for n in 0..sinks.len().max(sources.len()) {
            let cis_type = if n < pairs {
                CisType::Bidirectional
            } else if n < sinks.len() {
                CisType::UnidirectionalSink
            } else {
                CisType::UnidirectionalSource
            };
            let id = next_id(&self.cig.cises);
            if self
                .cig
                .cises
                .push(CisDescriptor {
                    id,
                    cis_type,
                    device_index: device_index as u8,
                    conn_handle: INVALID_CIS_HANDLE,
                })
                .is_err()
            {
                error!("group {}: out of CIS descriptors", self.group_id);
                return false;
            }
            if let Some(&sink) = sinks.get(n) {
                device.ases[sink].cis_id = id;
            }
            if let Some(&source) = sources.get(n) {
                device.ases[source].cis_id = id;
            }
        }
        true
    }

    /// Generate CIS ids for the whole group from the active topology.
    pub fn generate_cis_ids(&mut self) -> bool {
        for index in 0..self.devices.len() {
            if self.devices[index].has_active_ase() && !self.assign_cis_ids(index) {
                return false;
            }
        }
        true
    }

    /// Forget every CIS assignment, e.g. before reconfiguration.
    pub fn release_cis_ids(&mut self) {
        for device in self.devices.iter_mut() {
            for ase in device.ases.iter_mut() {
                ase.release_cis();
            }
        }
        self.cig.cises.clear();
    }

    /// Propagate the connection handles from a CIG Created completion to the
    /// CIS descriptors and the matching ASEs, in declaration order.
    pub fn assign_cis_conn_handles(&mut self, conn_handles: &[u16]) {
        for (descriptor, handle) in self.cig.cises.iter_mut().zip(conn_handles) {
            if *handle == INVALID_CIS_HANDLE {
                continue;
            }
            descriptor.conn_handle = *handle;
            if let Some(device) = self.devices.get_mut(descriptor.device_index as usize) {
                for ase in device.ases.iter_mut() {
                    if ase.active && ase.cis_id == descriptor.id {
                        ase.cis_conn_handle = *handle;
                        // A late joiner may share a CIG with established
                        // streams; never downgrade those.
                        if ase.cis_state == CisState::Idle {
                            ase.cis_state = CisState::Assigned;
                        }
                    }
                }
            }
        }
    }

    // --- CIG parameter aggregation ---

    pub fn sdu_interval_us(&self, direction: Direction) -> u32 {
        self.devices
            .iter()
            .flat_map(|d| d.active_ases())
            .find(|a| a.direction == direction)
            .map(|a| a.codec_configuration.sdu_interval_us())
            .unwrap_or(0)
    }

    pub fn max_transport_latency_ms(&self, direction: Direction) -> u16 {
        self.devices
            .iter()
            .flat_map(|d| d.active_ases())
            .filter(|a| a.direction == direction)
            .map(|a| a.max_transport_latency_ms)
            .max()
            .unwrap_or(MAX_TRANSPORT_LATENCY_MIN_MS)
    }

    /// PHYs every active ASE of the direction accepts. A direction with no
    /// active ASE stays unconstrained.
    pub fn phy_bitmask(&self, direction: Direction) -> PhyMask {
        let mut mask = PhyMask::M1 | PhyMask::M2;
        let mut any = false;
        for ase in self
            .devices
            .iter()
            .flat_map(|d| d.active_ases())
            .filter(|a| a.direction == direction)
        {
            mask &= ase.preferred_phy;
            any = true;
        }
        if any && mask.is_empty() {
            PhyMask::M2
        } else {
            mask
        }
    }

    pub fn max_sdu_size(&self, direction: Direction, cis_id: u8) -> u16 {
        self.devices
            .iter()
            .flat_map(|d| d.active_ases())
            .find(|a| a.direction == direction && a.cis_id == cis_id)
            .map(|a| a.max_sdu_size)
            .unwrap_or(0)
    }

    pub fn retransmission_number(&self, direction: Direction, cis_id: u8) -> u8 {
        self.devices
            .iter()
            .flat_map(|d| d.active_ases())
            .find(|a| a.direction == direction && a.cis_id == cis_id)
            .map(|a| a.retransmission_number)
            .unwrap_or(0)
    }

    /// A presentation delay every active ASE of the direction supports.
    /// `None` when the advertised ranges do not intersect.
    pub fn presentation_delay_us(&self, direction: Direction) -> Option<u32> {
        let mut lo = 0u32;
        let mut hi = u32::MAX;
        let mut preferred = 0u32;
        let mut any = false;
        for ase in self
            .devices
            .iter()
            .flat_map(|d| d.active_ases())
            .filter(|a| a.direction == direction)
        {
            lo = lo.max(ase.presentation_delay_min_us);
            if ase.presentation_delay_max_us > 0 {
                hi = hi.min(ase.presentation_delay_max_us);
            }
            preferred = preferred.max(ase.preferred_presentation_delay_min_us);
            any = true;
        }
        if !any || lo > hi {
            return None;
        }
        if preferred >= lo && preferred <= hi && preferred != 0 {
            Some(preferred)
        } else {
            Some(lo)
        }
    }

    // --- stream configuration aggregation ---

    /// Record a CIS whose data path just came up into the direction's
    /// stream parameters. Parameter mismatches across participating ASEs
    /// indicate a broken configuration upstream.
    pub fn add_cis_to_stream_configuration(&mut self, device_index: usize, ase_index: usize) {
        let ase = &self.devices[device_index].ases[ase_index];
        let conf = &ase.codec_configuration;
        let cis_conn_handle = ase.cis_conn_handle;
        let allocation = conf.audio_channel_allocation;
        let channels = conf.channel_count();
        let frequency = conf.sampling_frequency_hz();
        let octets = conf.octets_per_codec_frame;
        let blocks = conf.codec_frame_blocks_per_sdu;
        let duration = conf.frame_duration_us();
        let direction = ase.direction;
        let codec_id = ase.codec_id;

        self.stream_conf.codec_id = codec_id;
        let params = self.stream_conf.params.get_mut(direction);

        assert!(
            !params
                .stream_locations
                .iter()
                .any(|(handle, _)| *handle == cis_conn_handle),
            "stream already configured"
        );

        params.num_of_devices += 1;
        params.num_of_channels += channels;
        params.audio_channel_allocation |= allocation;
        let _ = params.stream_locations.push((cis_conn_handle, allocation));

        if params.sample_frequency_hz == 0 {
            params.sample_frequency_hz = frequency;
        } else {
            assert_eq!(params.sample_frequency_hz, frequency);
        }
        if params.octets_per_codec_frame == 0 {
            params.octets_per_codec_frame = octets;
        } else {
            assert_eq!(params.octets_per_codec_frame, octets);
        }
        if params.codec_frame_blocks_per_sdu == 0 {
            params.codec_frame_blocks_per_sdu = blocks;
        } else {
            assert_eq!(params.codec_frame_blocks_per_sdu, blocks);
        }
        if params.frame_duration_us == 0 {
            params.frame_duration_us = duration;
        } else {
            assert_eq!(params.frame_duration_us, duration);
        }
    }

    /// Drop a CIS from both directions' stream parameters. Returns the
    /// directions that changed.
    pub fn remove_cis_from_stream_configuration(&mut self, cis_conn_handle: u16) {
        for direction in [Direction::Sink, Direction::Source] {
            let params = self.stream_conf.params.get_mut(direction);
            let Some(position) = params
                .stream_locations
                .iter()
                .position(|(handle, _)| *handle == cis_conn_handle)
            else {
                continue;
            };
            let (_, allocation) = params.stream_locations.remove(position);
            params.num_of_devices -= 1;
            params.num_of_channels -= allocation.channel_count();
            params.audio_channel_allocation = params
                .stream_locations
                .iter()
                .fold(AudioLocation::MONO, |acc, (_, a)| acc | *a);
            if params.stream_locations.is_empty() {
                params.clear();
            }
        }
    }
}

/// Build the LTV metadata for one direction of a device: the requested
/// streaming contexts narrowed to what the device makes available, falling
/// back to Unspecified.
pub fn build_metadata(
    available: &ContextType,
    direction: Direction,
    metadata_contexts: &BidirectionalPair<ContextType>,
    ccids: &BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
) -> Vec<u8, METADATA_LEN> {
    let directional = *metadata_contexts.get(direction) & *available;
    if directional.is_empty() {
        StreamMetadata::new(ContextType::Unspecified, &[]).to_ltv()
    } else {
        StreamMetadata::new(directional, ccids.get(direction)).to_ltv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trouble_host::prelude::BdAddr;

    fn stereo_media_config() -> ContextConfig {
        let codec = CodecConfiguration {
            octets_per_codec_frame: 100,
            ..Default::default()
        };
        let mut sink = DirectionConfig::new(codec);
        sink.allocations
            .extend_from_slice(&[AudioLocation::FrontLeft, AudioLocation::FrontRight])
            .unwrap();
        ContextConfig {
            context: ContextType::Media,
            sink: Some(sink),
            source: None,
            framing: Framing::Unframed,
        }
    }

    fn connected_device(seed: u8, directions: &[Direction]) -> Device {
        let mut device = Device::new(BdAddr::new([0, 0, 0, 0, 0, seed]), 0x0010 + seed as u16, 100);
        device.available_contexts = BidirectionalPair {
            sink: ContextType::Media | ContextType::Conversational,
            source: ContextType::Conversational,
        };
        for direction in directions {
            device.add_ase(*direction).unwrap();
        }
        device
    }

    fn media_group_two_devices() -> UnicastGroup {
        let mut group = UnicastGroup::new(1);
        group.add_context_config(stereo_media_config()).unwrap();
        group
            .devices
            .push(connected_device(1, &[Direction::Sink]))
            .unwrap();
        group
            .devices
            .push(connected_device(2, &[Direction::Sink]))
            .unwrap();
        group
    }

    #[test]
    fn configure_assigns_allocations_in_device_order() {
        let mut group = media_group_two_devices();
        assert!(group.configure(
            ContextType::Media,
            BidirectionalPair {
                sink: ContextType::Media,
                source: ContextType::empty(),
            },
            &BidirectionalPair::default(),
        ));
        assert_eq!(
            group.devices[0].ases[0].codec_configuration.audio_channel_allocation,
            AudioLocation::FrontLeft
        );
        assert_eq!(
            group.devices[1].ases[0].codec_configuration.audio_channel_allocation,
            AudioLocation::FrontRight
        );
        assert!(group.is_configured_for_context(ContextType::Media));
        assert_eq!(group.devices[0].ases[0].max_sdu_size, 100);
    }

    #[test]
    fn configure_rejects_unknown_context() {
        let mut group = media_group_two_devices();
        assert!(!group.configure(
            ContextType::Game,
            BidirectionalPair::default(),
            &BidirectionalPair::default(),
        ));
    }

    #[test]
    fn cis_ids_pair_bidirectional_ases() {
        let mut group = UnicastGroup::new(1);
        let mut config = stereo_media_config();
        config.context = ContextType::Conversational;
        config.source = Some(DirectionConfig::new(CodecConfiguration {
            octets_per_codec_frame: 40,
            ..Default::default()
        }));
        group.add_context_config(config).unwrap();
        group
            .devices
            .push(connected_device(1, &[Direction::Sink, Direction::Source]))
            .unwrap();

        assert!(group.configure(
            ContextType::Conversational,
            BidirectionalPair {
                sink: ContextType::Conversational,
                source: ContextType::Conversational,
            },
            &BidirectionalPair::default(),
        ));
        assert!(group.generate_cis_ids());

        assert_eq!(group.cig.cises.len(), 1);
        assert_eq!(group.cig.cises[0].cis_type, CisType::Bidirectional);
        assert_eq!(group.devices[0].ases[0].cis_id, 0);
        assert_eq!(group.devices[0].ases[1].cis_id, 0);

        group.assign_cis_conn_handles(&[0x0060]);
        assert_eq!(group.devices[0].ases[0].cis_conn_handle, 0x0060);
        assert_eq!(group.devices[0].ases[1].cis_state, CisState::Assigned);
    }

    #[test]
    fn transport_latency_takes_direction_maximum() {
        let mut group = media_group_two_devices();
        group.configure(
            ContextType::Media,
            BidirectionalPair {
                sink: ContextType::Media,
                source: ContextType::empty(),
            },
            &BidirectionalPair::default(),
        );
        group.devices[0].ases[0].max_transport_latency_ms = 10;
        group.devices[1].ases[0].max_transport_latency_ms = 30;
        assert_eq!(group.max_transport_latency_ms(Direction::Sink), 30);
        assert_eq!(
            group.max_transport_latency_ms(Direction::Source),
            MAX_TRANSPORT_LATENCY_MIN_MS
        );
    }

    #[test]
    fn presentation_delay_intersects_ranges() {
        let mut group = media_group_two_devices();
        group.configure(
            ContextType::Media,
            BidirectionalPair {
                sink: ContextType::Media,
                source: ContextType::empty(),
            },
            &BidirectionalPair::default(),
        );
        for (index, (min, max, preferred)) in [(0usize, (10000, 40000, 20000)), (1, (15000, 50000, 0))]
        {
            group.devices[index].ases[0].presentation_delay_min_us = min;
            group.devices[index].ases[0].presentation_delay_max_us = max;
            group.devices[index].ases[0].preferred_presentation_delay_min_us = preferred;
        }
        assert_eq!(group.presentation_delay_us(Direction::Sink), Some(20000));

        // Preferred value below the common floor falls back to the floor.
        group.devices[1].ases[0].presentation_delay_min_us = 25000;
        assert_eq!(group.presentation_delay_us(Direction::Sink), Some(25000));

        // Disjoint ranges cannot be satisfied.
        group.devices[0].ases[0].presentation_delay_max_us = 22000;
        assert_eq!(group.presentation_delay_us(Direction::Sink), None);
    }

    #[test]
    fn stream_configuration_add_remove() {
        let mut group = media_group_two_devices();
        group.configure(
            ContextType::Media,
            BidirectionalPair {
                sink: ContextType::Media,
                source: ContextType::empty(),
            },
            &BidirectionalPair::default(),
        );
        group.generate_cis_ids();
        group.assign_cis_conn_handles(&[0x0060, 0x0061]);

        group.add_cis_to_stream_configuration(0, 0);
        group.add_cis_to_stream_configuration(1, 0);

        let params = group.stream_conf.params.get(Direction::Sink);
        assert_eq!(params.num_of_devices, 2);
        assert_eq!(params.num_of_channels, 2);
        assert_eq!(
            params.audio_channel_allocation,
            AudioLocation::FrontLeft | AudioLocation::FrontRight
        );
        assert_eq!(params.sample_frequency_hz, 48000);

        group.remove_cis_from_stream_configuration(0x0060);
        let params = group.stream_conf.params.get(Direction::Sink);
        assert_eq!(params.num_of_devices, 1);
        assert_eq!(params.audio_channel_allocation, AudioLocation::FrontRight);

        group.remove_cis_from_stream_configuration(0x0061);
        assert_eq!(
            group
                .stream_conf
                .params
                .get(Direction::Sink)
                .sample_frequency_hz,
            0
        );
    }

    #[test]
    fn metadata_falls_back_to_unspecified() {
        let contexts = BidirectionalPair {
            sink: ContextType::Game,
            source: ContextType::empty(),
        };
        let available = ContextType::Media;
        let metadata = build_metadata(
            &available,
            Direction::Sink,
            &contexts,
            &BidirectionalPair::default(),
        );
        let parsed = StreamMetadata::from_ltv(&metadata).unwrap();
        assert_eq!(parsed.streaming_contexts, ContextType::Unspecified);
    }
}
