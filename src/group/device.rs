use heapless::Vec;
use trouble_host::prelude::BdAddr;

use super::ase::{Ase, CisState, DataPathState};
use crate::ascs::AseState;
use crate::generic_audio::ContextType;
use crate::{BidirectionalPair, Direction, DsaModes, MAX_DEVICE_ASES};

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceConnectState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Sink/source ASE indexes sharing one CIS connection handle. For a
/// bidirectional CIS both are set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsePair {
    pub sink: Option<usize>,
    pub source: Option<usize>,
}

impl AsePair {
    pub fn is_empty(&self) -> bool {
        self.sink.is_none() && self.source.is_none()
    }
}

/// One member of a unicast group.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct Device {
    pub address: BdAddr,
    pub acl_conn_handle: u16,
    pub mtu: u16,
    pub connection_state: DeviceConnectState,
    pub ases: Vec<Ase, MAX_DEVICE_ASES>,
    /// Contexts the server currently makes available, per direction.
    pub available_contexts: BidirectionalPair<ContextType>,
    pub dsa_modes: DsaModes,

    /// Consecutive CIS establishment failures; bounded by the configured
    /// retry count.
    pub cis_retry_count: u8,

    // Head-tracking data path riding on this device's CIS.
    pub dsa_data_path_state: DataPathState,
    pub dsa_cis_handle: u16,
}

impl Device {
    pub fn new(address: BdAddr, acl_conn_handle: u16, mtu: u16) -> Self {
        Self {
            address,
            acl_conn_handle,
            mtu,
            connection_state: DeviceConnectState::Connected,
            ases: Vec::new(),
            available_contexts: BidirectionalPair::default(),
            dsa_modes: DsaModes::empty(),
            cis_retry_count: 0,
            dsa_data_path_state: DataPathState::Idle,
            dsa_cis_handle: super::ase::INVALID_CIS_HANDLE,
        }
    }

    pub fn add_ase(&mut self, direction: Direction) -> Result<(), ()> {
        self.ases.push(Ase::new(direction)).map(|_| ()).map_err(|_| ())
    }

    pub fn active_ases(&self) -> impl Iterator<Item = &Ase> {
        self.ases.iter().filter(|a| a.active)
    }

    pub fn has_active_ase(&self) -> bool {
        self.ases.iter().any(|a| a.active)
    }

    /// Indexes of the active ASEs, in discovery order.
    pub fn active_ase_indexes(&self) -> impl Iterator<Item = usize> + '_ {
        self.ases
            .iter()
            .enumerate()
            .filter(|(_, a)| a.active)
            .map(|(i, _)| i)
    }

    pub fn ases_by_cis_handle(&self, cis_conn_handle: u16) -> AsePair {
        let mut pair = AsePair::default();
        for (i, ase) in self.ases.iter().enumerate() {
            if ase.cis_conn_handle == cis_conn_handle
                && cis_conn_handle != super::ase::INVALID_CIS_HANDLE
            {
                match ase.direction {
                    Direction::Sink => pair.sink = Some(i),
                    Direction::Source => pair.source = Some(i),
                }
            }
        }
        pair
    }

    /// The other half of a bidirectional CIS, if this ASE is part of one.
    pub fn bidirectional_partner(&self, ase_index: usize) -> Option<usize> {
        let ase = self.ases.get(ase_index)?;
        if !ase.has_cis() {
            return None;
        }
        self.ases.iter().enumerate().find_map(|(i, other)| {
            (i != ase_index && other.active && other.cis_id == ase.cis_id).then_some(i)
        })
    }

    pub fn have_all_active_ases_same_state(&self, state: AseState) -> bool {
        self.active_ases().all(|a| a.state == state)
    }

    pub fn have_any_unconfigured_ases(&self) -> bool {
        self.active_ases()
            .any(|a| a.state != AseState::CodecConfigured || a.reconfigure)
    }

    pub fn have_all_active_ases_cis_established(&self) -> bool {
        self.active_ases().all(|a| a.cis_state == CisState::Connected)
    }

    /// Every active ASE has reached the state the Enable pipeline needs:
    /// Enabling for a Source ASE, Enabling or already Streaming for a Sink.
    pub fn is_ready_to_create_stream(&self) -> bool {
        self.has_active_ase()
            && self.active_ases().all(|a| match a.direction {
                Direction::Sink => {
                    a.state == AseState::Enabling || a.state == AseState::Streaming
                }
                Direction::Source => a.state == AseState::Enabling,
            })
    }

    /// Every active ASE has left Streaming the way its direction allows:
    /// Sink ASEs fall straight to QoS Configured, Source ASEs pass through
    /// Disabling.
    pub fn is_ready_to_suspend_stream(&self) -> bool {
        self.active_ases().all(|a| match a.direction {
            Direction::Sink => a.state == AseState::QosConfigured,
            Direction::Source => {
                a.state == AseState::QosConfigured || a.state == AseState::Disabling
            }
        })
    }

    /// Mark every ASE unused, e.g. when the ACL drops.
    pub fn deactivate_all_ases(&mut self) {
        for ase in self.ases.iter_mut() {
            ase.deactivate();
        }
        self.cis_retry_count = 0;
        self.dsa_data_path_state = DataPathState::Idle;
        self.dsa_cis_handle = super::ase::INVALID_CIS_HANDLE;
    }

    /// Drop cached codec configurations so the next start reconfigures.
    pub fn invalidate_cached_configurations(&mut self) {
        for ase in self.ases.iter_mut() {
            ase.configured_for_context = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_with_bidirectional_cis() -> Device {
        let mut device = Device::new(BdAddr::new([0, 0, 0, 0, 0, 1]), 0x0010, 100);
        device.add_ase(Direction::Sink).unwrap();
        device.add_ase(Direction::Source).unwrap();
        for ase in device.ases.iter_mut() {
            ase.active = true;
            ase.cis_id = 0;
            ase.cis_conn_handle = 0x0060;
        }
        device
    }

    #[test]
    fn pair_lookup_by_cis_handle() {
        let device = device_with_bidirectional_cis();
        let pair = device.ases_by_cis_handle(0x0060);
        assert_eq!(pair.sink, Some(0));
        assert_eq!(pair.source, Some(1));
        assert!(device.ases_by_cis_handle(0x0061).is_empty());
    }

    #[test]
    fn bidirectional_partner_is_symmetric() {
        let device = device_with_bidirectional_cis();
        assert_eq!(device.bidirectional_partner(0), Some(1));
        assert_eq!(device.bidirectional_partner(1), Some(0));
    }

    #[test]
    fn ready_to_create_stream_per_direction() {
        let mut device = device_with_bidirectional_cis();
        device.ases[0].state = AseState::Streaming; // sink may already stream
        device.ases[1].state = AseState::Enabling;
        assert!(device.is_ready_to_create_stream());

        // A source stuck in QoS Configured is not ready.
        device.ases[1].state = AseState::QosConfigured;
        assert!(!device.is_ready_to_create_stream());
    }

    #[test]
    fn suspend_readiness_skips_disabling_for_sink() {
        let mut device = device_with_bidirectional_cis();
        device.ases[0].state = AseState::QosConfigured;
        device.ases[1].state = AseState::Disabling;
        assert!(device.is_ready_to_suspend_stream());

        device.ases[0].state = AseState::Streaming;
        assert!(!device.is_ready_to_suspend_stream());
    }
}
