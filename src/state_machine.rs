//! Unicast group state machine
//!
//! Drives a group of ASEs from one state to another according to the ASCS
//! state machine, keeping the involved externals in step: CIG, CISes, ISO
//! data paths and the audio path to the upper layer.
//!
//! Every handler is a pure state transformer: it updates the group records
//! and pushes the resulting GATT writes, ISO primitives, timer operations
//! and status reports into a bounded action queue that the caller drains.
//! Nothing here blocks; all wait semantics are encoded as states that the
//! next inbound event advances.
//!
//! Per-ASE transitions driven from here:
//!
//! | Current state    | Operation            | Next state                    |
//! |------------------|----------------------|-------------------------------|
//! | Idle             | Config Codec         | Codec Configured              |
//! | Codec Configured | Config QoS           | QoS Configured                |
//! | Codec Configured | Release              | Releasing                     |
//! | QoS Configured   | Enable               | Enabling                      |
//! | QoS Configured   | Release              | Releasing                     |
//! | Enabling         | Receiver Start Ready | Streaming (Source)            |
//! | Enabling         | (CIS established)    | Streaming (Sink, autonomous)  |
//! | Enabling         | Release              | Releasing                     |
//! | Streaming        | Disable              | Disabling (Source) / QoS (Sink) |
//! | Streaming        | Release              | Releasing                     |
//! | Disabling        | Receiver Stop Ready  | QoS Configured                |
//! | Disabling        | Release              | Releasing                     |
//! | Releasing        | Released             | Idle (no caching) / Codec Configured (caching) |

use heapless::Vec;

use crate::ascs::{self, AseState, CodecConfiguredStatus, CtpNotification, TransientStatus};
use crate::generic_audio::ContextType;
use crate::group::{
    AsePair, CigState, CisState, DataPathState, DeviceConnectState, UnicastGroup,
    MAX_TRANSPORT_LATENCY_MIN_MS,
};
use crate::iso::{
    self, status, CigParameters, CisConnection, CisParameters, CisType, DataPathParameters,
    PhyMask,
};
use crate::{
    BidirectionalPair, CodecId, ContentControlId, Direction, DsaMode, CTP_PDU_LEN, MAX_CCIDS,
    MAX_DEVICE_ASES, MAX_GROUPS, MAX_GROUP_CISES, NOTIFICATION_LEN,
};

/// Actions one event can fan out to.
pub const MAX_ACTIONS: usize = 16;

/// Tunables of the state machine. The DSA overrides are vendor defaults for
/// head-tracking capable peers.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct UnicastConfig {
    /// Watchdog guarding every group transition.
    pub transition_timeout_ms: u32,
    /// Timer catching a stuck half of an autonomous bidirectional disable.
    pub autonomous_timeout_ms: u32,
    /// Retries after a CIS establishment failure with
    /// Connection Failed to be Established.
    pub cis_establish_retries: u8,
    /// Periodically read ISO link quality on established CISes.
    pub link_quality_watch: bool,
    pub link_quality_interval_ms: u32,
    /// DSA QoS overrides for the controller-to-host direction.
    pub dsa_sdu_interval_stom_us: u32,
    pub dsa_max_transport_latency_stom_ms: u16,
    pub dsa_max_sdu_size_stom: u16,
    pub dsa_retransmission_number_stom: u8,
}

impl Default for UnicastConfig {
    fn default() -> Self {
        Self {
            transition_timeout_ms: 3500,
            autonomous_timeout_ms: 5000,
            cis_establish_retries: 2,
            link_quality_watch: false,
            link_quality_interval_ms: 4000,
            dsa_sdu_interval_stom_us: 20000,
            dsa_max_transport_latency_stom_ms: 20,
            dsa_max_sdu_size_stom: 15,
            dsa_retransmission_number_stom: 2,
        }
    }
}

/// Stream status reported to the upper layer.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStreamStatus {
    Idle,
    ConfiguredByUser,
    ConfiguredAutonomous,
    Suspending,
    Suspended,
    Streaming,
    Releasing,
}

/// Why a command was rejected before any side effect.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    UnknownGroup,
    InvalidGroupState,
    NoActiveDevice,
    ContextUnavailable,
    ConfigurationFailed,
}

/// Counters surfaced to the embedder's health monitoring.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthStats {
    /// Peer rejected a control point operation while a stream was being
    /// established.
    pub stream_create_signaling_failed: u32,
    /// A start was requested for a context no group member provides.
    pub stream_context_not_available: u32,
}

/// Outbound primitive produced by a handler. The driver executes these in
/// order; completions re-enter as [`UnicastEvent`]s.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    WriteControlPoint {
        group_id: u8,
        device: u8,
        value: Vec<u8, CTP_PDU_LEN>,
        long_write: bool,
    },
    CreateCig {
        group_id: u8,
        params: CigParameters,
    },
    RemoveCig {
        group_id: u8,
        force: bool,
    },
    EstablishCis {
        group_id: u8,
        connections: Vec<CisConnection, MAX_GROUP_CISES>,
    },
    DisconnectCis {
        group_id: u8,
        cis_conn_handle: u16,
        reason: u8,
    },
    SetupDataPath {
        group_id: u8,
        cis_conn_handle: u16,
        params: DataPathParameters,
    },
    RemoveDataPath {
        group_id: u8,
        cis_conn_handle: u16,
        direction_mask: u8,
    },
    ArmTransitionTimer {
        group_id: u8,
        timeout_ms: u32,
    },
    CancelTransitionTimer {
        group_id: u8,
    },
    ArmAutonomousTimer {
        group_id: u8,
        device: u8,
        ase: u8,
        timeout_ms: u32,
    },
    CancelAutonomousTimer {
        group_id: u8,
        device: u8,
        ase: u8,
    },
    StartLinkQualityWatch {
        group_id: u8,
        cis_conn_handle: u16,
        interval_ms: u32,
    },
    StopLinkQualityWatch {
        group_id: u8,
        cis_conn_handle: u16,
    },
    Report {
        group_id: u8,
        status: GroupStreamStatus,
    },
    ReportTransitionTimeout {
        group_id: u8,
    },
    ReportAutonomousTimeout {
        group_id: u8,
        device: u8,
    },
    UpdatedCisConfiguration {
        group_id: u8,
        direction: Direction,
    },
}

/// Commands from the audio transport boundary.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub enum StreamCommand {
    Start {
        group_id: u8,
        context: ContextType,
        metadata_contexts: BidirectionalPair<ContextType>,
        ccids: BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    },
    Configure {
        group_id: u8,
        context: ContextType,
        metadata_contexts: BidirectionalPair<ContextType>,
        ccids: BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    },
    Attach {
        group_id: u8,
        device: u8,
        ccids: BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    },
    Suspend {
        group_id: u8,
    },
    Stop {
        group_id: u8,
    },
    SetDsaMode {
        group_id: u8,
        mode: DsaMode,
    },
}

/// Everything that can enter the state machine's inbox: commands, GATT
/// notifications, ISO completions and timer expiries, serialized onto one
/// loop.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub enum UnicastEvent {
    Command(StreamCommand),
    AseStatus {
        group_id: u8,
        device: u8,
        ase: u8,
        value: Vec<u8, NOTIFICATION_LEN>,
    },
    CtpNotification {
        group_id: u8,
        device: u8,
        value: Vec<u8, NOTIFICATION_LEN>,
    },
    CigCreated {
        group_id: u8,
        status: u8,
        conn_handles: Vec<u16, MAX_GROUP_CISES>,
    },
    CigRemoved {
        group_id: u8,
        status: u8,
    },
    CisEstablished {
        group_id: u8,
        cis_conn_handle: u16,
        status: u8,
    },
    CisDisconnected {
        group_id: u8,
        cis_conn_handle: u16,
        reason: u8,
    },
    DataPathSetup {
        group_id: u8,
        cis_conn_handle: u16,
        status: u8,
    },
    DataPathRemoved {
        group_id: u8,
        cis_conn_handle: u16,
        status: u8,
    },
    AclDisconnected {
        group_id: u8,
        device: u8,
    },
    LinkQuality {
        group_id: u8,
        cis_conn_handle: u16,
        tx_unacked_packets: u32,
        tx_flushed_packets: u32,
        tx_last_subevent_packets: u32,
        retransmitted_packets: u32,
        crc_error_packets: u32,
        rx_unreceived_packets: u32,
        duplicate_packets: u32,
    },
    TransitionTimeout {
        group_id: u8,
    },
    AutonomousTimeout {
        group_id: u8,
        device: u8,
    },
}

type ActionQueue = Vec<Action, MAX_ACTIONS>;

fn push_action(actions: &mut ActionQueue, action: Action) {
    if actions.push(action).is_err() {
        error!("action queue overflow, primitive dropped");
    }
}

/// Owner of all group, device and ASE records. External collaborators hold
/// only ids; everything re-enters through [`UnicastStateMachine::handle`].
pub struct UnicastStateMachine {
    config: UnicastConfig,
    groups: Vec<UnicastGroup, MAX_GROUPS>,
    stats: HealthStats,
    actions: ActionQueue,
}

impl UnicastStateMachine {
    pub fn new(config: UnicastConfig) -> Self {
        Self {
            config,
            groups: Vec::new(),
            stats: HealthStats::default(),
            actions: Vec::new(),
        }
    }

    pub fn create_group(&mut self, group_id: u8) -> Result<&mut UnicastGroup, RequestError> {
        if self.groups.iter().any(|g| g.group_id == group_id) {
            return Err(RequestError::InvalidGroupState);
        }
        self.groups
            .push(UnicastGroup::new(group_id))
            .map_err(|_| RequestError::ConfigurationFailed)?;
        Ok(self.groups.last_mut().unwrap())
    }

    /// Drop an empty or torn down group. The CIG must be gone first.
    pub fn destroy_group(&mut self, group_id: u8) -> Result<(), RequestError> {
        let index = self
            .groups
            .iter()
            .position(|g| g.group_id == group_id)
            .ok_or(RequestError::UnknownGroup)?;
        if self.groups[index].cig.state != CigState::None {
            warn!("group {}: destroying with CIG still present", group_id);
        }
        self.groups.remove(index);
        Ok(())
    }

    pub fn group(&self, group_id: u8) -> Option<&UnicastGroup> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }

    pub fn group_mut(&mut self, group_id: u8) -> Option<&mut UnicastGroup> {
        self.groups.iter_mut().find(|g| g.group_id == group_id)
    }

    pub fn stats(&self) -> &HealthStats {
        &self.stats
    }

    /// Drain the primitives produced since the last call, in emission order.
    pub fn take_actions(&mut self) -> ActionQueue {
        core::mem::take(&mut self.actions)
    }

    fn core(&mut self, group_id: u8) -> Result<Core<'_>, RequestError> {
        let Self {
            config,
            groups,
            stats,
            actions,
        } = self;
        let group = groups
            .iter_mut()
            .find(|g| g.group_id == group_id)
            .ok_or(RequestError::UnknownGroup)?;
        Ok(Core {
            config,
            stats,
            actions,
            group,
        })
    }

    /// Single entry point for the event loop.
    pub fn handle(&mut self, event: UnicastEvent) {
        match event {
            UnicastEvent::Command(command) => self.handle_command(command),
            UnicastEvent::AseStatus {
                group_id,
                device,
                ase,
                value,
            } => self.on_ase_status(group_id, device as usize, ase as usize, &value),
            UnicastEvent::CtpNotification {
                group_id, value, ..
            } => self.on_ctp_notification(group_id, &value),
            UnicastEvent::CigCreated {
                group_id,
                status,
                conn_handles,
            } => self.on_cig_created(group_id, status, &conn_handles),
            UnicastEvent::CigRemoved { group_id, status } => {
                self.on_cig_removed(group_id, status)
            }
            UnicastEvent::CisEstablished {
                group_id,
                cis_conn_handle,
                status,
            } => self.on_cis_established(group_id, cis_conn_handle, status),
            UnicastEvent::CisDisconnected {
                group_id,
                cis_conn_handle,
                reason,
            } => self.on_cis_disconnected(group_id, cis_conn_handle, reason),
            UnicastEvent::DataPathSetup {
                group_id,
                cis_conn_handle,
                status,
            } => self.on_data_path_setup(group_id, cis_conn_handle, status),
            UnicastEvent::DataPathRemoved {
                group_id,
                cis_conn_handle,
                status,
            } => self.on_data_path_removed(group_id, cis_conn_handle, status),
            UnicastEvent::AclDisconnected { group_id, device } => {
                self.on_acl_disconnected(group_id, device as usize)
            }
            UnicastEvent::LinkQuality {
                group_id,
                cis_conn_handle,
                ..
            } => {
                debug!(
                    "group {}: link quality for cis {}",
                    group_id, cis_conn_handle
                );
            }
            UnicastEvent::TransitionTimeout { group_id } => {
                self.on_transition_timeout(group_id)
            }
            UnicastEvent::AutonomousTimeout { group_id, device } => {
                self.on_autonomous_timeout(group_id, device as usize)
            }
        }
    }

    fn handle_command(&mut self, command: StreamCommand) {
        let result = match command {
            StreamCommand::Start {
                group_id,
                context,
                metadata_contexts,
                ccids,
            } => self.start_stream(group_id, context, metadata_contexts, &ccids),
            StreamCommand::Configure {
                group_id,
                context,
                metadata_contexts,
                ccids,
            } => self.configure_stream(group_id, context, metadata_contexts, &ccids),
            StreamCommand::Attach {
                group_id,
                device,
                ccids,
            } => self.attach_to_stream(group_id, device as usize, &ccids),
            StreamCommand::Suspend { group_id } => self.suspend_stream(group_id),
            StreamCommand::Stop { group_id } => self.stop_stream(group_id),
            StreamCommand::SetDsaMode { group_id, mode } => self.set_dsa_mode(group_id, mode),
        };
        if let Err(e) = result {
            warn!("stream command rejected: {}", e as u8);
        }
    }

    // --- commands ---

    pub fn start_stream(
        &mut self,
        group_id: u8,
        context: ContextType,
        metadata_contexts: BidirectionalPair<ContextType>,
        ccids: &BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    ) -> Result<(), RequestError> {
        self.core(group_id)?
            .start_stream(context, metadata_contexts, ccids)
    }

    pub fn configure_stream(
        &mut self,
        group_id: u8,
        context: ContextType,
        metadata_contexts: BidirectionalPair<ContextType>,
        ccids: &BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    ) -> Result<(), RequestError> {
        self.core(group_id)?
            .configure_stream(context, metadata_contexts, ccids)
    }

    pub fn attach_to_stream(
        &mut self,
        group_id: u8,
        device: usize,
        ccids: &BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    ) -> Result<(), RequestError> {
        self.core(group_id)?.attach_to_stream(device, ccids)
    }

    pub fn suspend_stream(&mut self, group_id: u8) -> Result<(), RequestError> {
        self.core(group_id)?.suspend_stream();
        Ok(())
    }

    pub fn stop_stream(&mut self, group_id: u8) -> Result<(), RequestError> {
        self.core(group_id)?.stop_stream();
        Ok(())
    }

    pub fn set_dsa_mode(&mut self, group_id: u8, mode: DsaMode) -> Result<(), RequestError> {
        let core = self.core(group_id)?;
        core.group.dsa.mode = mode;
        Ok(())
    }

    // --- inbound events ---

    pub fn on_ase_status(&mut self, group_id: u8, device: usize, ase: usize, value: &[u8]) {
        let Ok(mut core) = self.core(group_id) else {
            warn!("notification for unknown group {}", group_id);
            return;
        };
        core.on_ase_status(device, ase, value);
    }

    pub fn on_ctp_notification(&mut self, group_id: u8, value: &[u8]) {
        let Ok(mut core) = self.core(group_id) else {
            warn!("ctp notification for unknown group {}", group_id);
            return;
        };
        core.on_ctp_notification(value);
    }

    pub fn on_cig_created(&mut self, group_id: u8, cig_status: u8, conn_handles: &[u16]) {
        if let Ok(mut core) = self.core(group_id) {
            core.on_cig_created(cig_status, conn_handles);
        }
    }

    pub fn on_cig_removed(&mut self, group_id: u8, cig_status: u8) {
        if let Ok(mut core) = self.core(group_id) {
            core.on_cig_removed(cig_status);
        }
    }

    pub fn on_cis_established(&mut self, group_id: u8, cis_conn_handle: u16, cis_status: u8) {
        if let Ok(mut core) = self.core(group_id) {
            core.on_cis_established(cis_conn_handle, cis_status);
        }
    }

    pub fn on_cis_disconnected(&mut self, group_id: u8, cis_conn_handle: u16, reason: u8) {
        if let Ok(mut core) = self.core(group_id) {
            core.on_cis_disconnected(cis_conn_handle, reason);
        }
    }

    pub fn on_data_path_setup(&mut self, group_id: u8, cis_conn_handle: u16, path_status: u8) {
        if let Ok(mut core) = self.core(group_id) {
            core.on_data_path_setup(cis_conn_handle, path_status);
        }
    }

    pub fn on_data_path_removed(&mut self, group_id: u8, cis_conn_handle: u16, path_status: u8) {
        if let Ok(mut core) = self.core(group_id) {
            core.on_data_path_removed(cis_conn_handle, path_status);
        }
    }

    pub fn on_acl_disconnected(&mut self, group_id: u8, device: usize) {
        if let Ok(mut core) = self.core(group_id) {
            core.on_acl_disconnected(device);
        }
    }

    pub fn on_transition_timeout(&mut self, group_id: u8) {
        if let Ok(core) = self.core(group_id) {
            warn!("group {}: state transition watchdog fired", group_id);
            push_action(
                core.actions,
                Action::ReportTransitionTimeout { group_id },
            );
        }
    }

    pub fn on_autonomous_timeout(&mut self, group_id: u8, device: usize) {
        if let Ok(core) = self.core(group_id) {
            if let Some(dev) = core.group.devices.get_mut(device) {
                for ase in dev.ases.iter_mut() {
                    ase.autonomous_target_state = None;
                }
            }
            push_action(
                core.actions,
                Action::ReportAutonomousTimeout {
                    group_id,
                    device: device as u8,
                },
            );
        }
    }
}

/// One group plus the machinery every handler needs.
struct Core<'a> {
    config: &'a UnicastConfig,
    stats: &'a mut HealthStats,
    actions: &'a mut ActionQueue,
    group: &'a mut UnicastGroup,
}

impl Core<'_> {
    fn push(&mut self, action: Action) {
        push_action(self.actions, action);
    }

    fn report(&mut self, status: GroupStreamStatus) {
        let group_id = self.group.group_id;
        self.push(Action::Report { group_id, status });
    }

    /// Arm the watchdog for a new target state. Re-arming replaces any
    /// previous deadline; at most one watchdog runs per group.
    fn set_target_state(&mut self, state: AseState) {
        debug!(
            "group {}: transition towards {} watched",
            self.group.group_id, state as u8
        );
        self.group.set_target_state(state);
        let group_id = self.group.group_id;
        let timeout_ms = self.config.transition_timeout_ms;
        self.push(Action::ArmTransitionTimer {
            group_id,
            timeout_ms,
        });
    }

    fn cancel_watchdog(&mut self) {
        let group_id = self.group.group_id;
        self.push(Action::CancelTransitionTimer { group_id });
    }

    fn set_ase_state(&mut self, device: usize, ase: usize, state: AseState) {
        let record = &mut self.group.devices[device].ases[ase];
        info!(
            "ase {}: state {} -> {}",
            record.id, record.state as u8, state as u8
        );
        record.state = state;
    }

    // --- control point writes ---

    fn write_to_control_point(&mut self, device: usize, value: Vec<u8, CTP_PDU_LEN>) {
        let group_id = self.group.group_id;
        let mtu = self.group.devices[device].mtu;
        let long_write = ascs::needs_long_write(value.len(), mtu);
        if long_write {
            warn!("device {}: control point write exceeds MTU, using long write", device);
        }
        self.push(Action::WriteControlPoint {
            group_id,
            device: device as u8,
            value,
            long_write,
        });
    }

    fn send_codec_configure(&mut self, device: usize) {
        if !self.group.assign_cis_ids(device) {
            error!("group {}: unable to assign CIS ids", self.group.group_id);
            self.stop_stream();
            return;
        }
        if self.group.cig.state == CigState::Created {
            // Reconnecting member: the CIG already carries handles.
            let handles: Vec<u16, MAX_GROUP_CISES> = self
                .group
                .cig
                .cises
                .iter()
                .map(|c| c.conn_handle)
                .collect();
            self.group.assign_cis_conn_handles(&handles);
        }

        let mut entries: Vec<
            (u8, ascs::TargetLatency, ascs::TargetPhy, CodecId, Vec<u8, { crate::CODEC_CONFIG_LEN }>),
            MAX_DEVICE_ASES,
        > = Vec::new();
        for ase in self.group.devices[device].active_ases() {
            let _ = entries.push((
                ase.id,
                ase.target_latency,
                *self.group.target_phy.get(ase.direction),
                ase.codec_id,
                ase.codec_configuration.to_ltv(),
            ));
        }
        let mut ops: Vec<ascs::CodecConfigOperation, MAX_DEVICE_ASES> = Vec::new();
        for (ase_id, target_latency, target_phy, codec_id, ltv) in entries.iter() {
            let _ = ops.push(ascs::CodecConfigOperation {
                ase_id: *ase_id,
                target_latency: *target_latency,
                target_phy: *target_phy,
                codec_id: *codec_id,
                codec_configuration: ltv,
            });
        }
        match ascs::config_codec(&ops) {
            Ok(value) => self.write_to_control_point(device, value),
            Err(_) => {
                error!("group {}: config codec did not fit", self.group.group_id);
                self.stop_stream();
            }
        }
    }

    /// Returns false when the group has no active device.
    fn send_codec_configure_to_group(&mut self) -> bool {
        let devices: Vec<usize, { crate::MAX_GROUP_DEVICES }> =
            self.group.active_device_indexes().collect();
        if devices.is_empty() {
            error!("group {}: no active device", self.group.group_id);
            return false;
        }
        for device in devices {
            self.send_codec_configure(device);
        }
        true
    }

    fn send_config_qos(&mut self, device: usize) {
        let mut ops: Vec<ascs::QosConfigOperation, MAX_DEVICE_ASES> = Vec::new();
        let mut validate_latency = false;
        let mut validate_sdu = false;
        let mut consistent = true;

        {
            let group = &self.group;
            for ase in group.devices[device].active_ases() {
                let Some(presentation_delay_us) = group.presentation_delay_us(ase.direction)
                else {
                    error!("group {}: inconsistent presentation delay", group.group_id);
                    consistent = false;
                    break;
                };
                let sdu_interval_us = group.sdu_interval_us(ase.direction);
                if sdu_interval_us == 0 {
                    error!("group {}: unsupported SDU interval", group.group_id);
                    consistent = false;
                    break;
                }
                let max_transport_latency_ms = group.max_transport_latency_ms(ase.direction);
                if max_transport_latency_ms > MAX_TRANSPORT_LATENCY_MIN_MS {
                    validate_latency = true;
                }
                if ase.max_sdu_size > 0 {
                    validate_sdu = true;
                }
                let _ = ops.push(ascs::QosConfigOperation {
                    ase_id: ase.id,
                    cig_id: group.group_id,
                    cis_id: ase.cis_id,
                    sdu_interval_us,
                    framing: group.framing,
                    phy: group.phy_bitmask(ase.direction),
                    max_sdu: ase.max_sdu_size,
                    retransmission_number: ase.retransmission_number,
                    max_transport_latency_ms,
                    presentation_delay_us,
                });
            }
        }

        if !consistent || ops.is_empty() || !validate_latency || !validate_sdu {
            error!(
                "group {}: invalid QoS configuration or latency or sdu size",
                self.group.group_id
            );
            self.stop_stream();
            return;
        }
        match ascs::config_qos(&ops) {
            Ok(value) => self.write_to_control_point(device, value),
            Err(_) => {
                error!("group {}: config qos did not fit", self.group.group_id);
                self.stop_stream();
            }
        }
    }

    fn send_qos_to_group(&mut self) {
        let devices: Vec<usize, { crate::MAX_GROUP_DEVICES }> =
            self.group.active_device_indexes().collect();
        if devices.is_empty() {
            error!("group {}: no active device", self.group.group_id);
            self.clear_group(true);
            return;
        }
        for device in devices {
            self.send_config_qos(device);
        }
    }

    fn send_enable(&mut self, device: usize) {
        let mut metadata: Vec<(u8, Vec<u8, { crate::METADATA_LEN }>), MAX_DEVICE_ASES> =
            Vec::new();
        for ase in self.group.devices[device].active_ases() {
            let _ = metadata.push((ase.id, ase.metadata.clone()));
        }
        let mut ops: Vec<ascs::MetadataOperation, MAX_DEVICE_ASES> = Vec::new();
        for (ase_id, meta) in metadata.iter() {
            let _ = ops.push(ascs::MetadataOperation {
                ase_id: *ase_id,
                metadata: meta,
            });
        }
        match ascs::enable(&ops) {
            Ok(value) => self.write_to_control_point(device, value),
            Err(_) => {
                error!("group {}: enable did not fit", self.group.group_id);
                self.stop_stream();
            }
        }
    }

    fn send_enable_to_group(&mut self) {
        let devices: Vec<usize, { crate::MAX_GROUP_DEVICES }> =
            self.group.active_device_indexes().collect();
        if devices.is_empty() {
            error!("group {}: no active device", self.group.group_id);
            self.clear_group(true);
            return;
        }
        for device in devices {
            self.send_enable(device);
        }
    }

    fn send_ase_id_op(
        &mut self,
        device: usize,
        build: fn(&[u8]) -> Result<Vec<u8, CTP_PDU_LEN>, crate::CodecError>,
    ) {
        let ids: Vec<u8, MAX_DEVICE_ASES> = self.group.devices[device]
            .active_ases()
            .map(|a| a.id)
            .collect();
        if ids.is_empty() {
            return;
        }
        match build(&ids) {
            Ok(value) => self.write_to_control_point(device, value),
            Err(_) => error!("group {}: control point op did not fit", self.group.group_id),
        }
    }

    /// Disable broadcast; IDLE when the group has no active device any more.
    fn send_disable_to_group(&mut self) -> GroupStreamStatus {
        let devices: Vec<usize, { crate::MAX_GROUP_DEVICES }> =
            self.group.active_device_indexes().collect();
        if devices.is_empty() {
            error!("group {}: no active device", self.group.group_id);
            self.clear_group(false);
            return GroupStreamStatus::Idle;
        }
        for device in devices {
            self.send_ase_id_op(device, ascs::disable);
        }
        GroupStreamStatus::Suspending
    }

    fn send_release_to_group(&mut self) -> GroupStreamStatus {
        let devices: Vec<usize, { crate::MAX_GROUP_DEVICES }> =
            self.group.active_device_indexes().collect();
        if devices.is_empty() {
            error!("group {}: no active device", self.group.group_id);
            self.clear_group(false);
            return GroupStreamStatus::Idle;
        }
        for device in devices {
            self.send_ase_id_op(device, ascs::release);
        }
        GroupStreamStatus::Releasing
    }

    /// Receiver Start Ready for the device's Source ASEs; Sink ASEs start
    /// autonomously once their CIS is up.
    fn send_receiver_start_ready(&mut self, device: usize) {
        let ids: Vec<u8, MAX_DEVICE_ASES> = self.group.devices[device]
            .active_ases()
            .filter(|a| a.direction == Direction::Source)
            .map(|a| a.id)
            .collect();
        if ids.is_empty() {
            return;
        }
        match ascs::receiver_start_ready(&ids) {
            Ok(value) => self.write_to_control_point(device, value),
            Err(_) => error!("group {}: start ready did not fit", self.group.group_id),
        }
    }

    fn send_receiver_stop_ready(&mut self, device: usize, ase: usize) {
        let id = self.group.devices[device].ases[ase].id;
        match ascs::receiver_stop_ready(&[id]) {
            Ok(value) => self.write_to_control_point(device, value),
            Err(_) => error!("group {}: stop ready did not fit", self.group.group_id),
        }
    }

    fn send_update_metadata(
        &mut self,
        device: usize,
        metadata_contexts: &BidirectionalPair<ContextType>,
        ccids: &BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    ) {
        let mut changed: Vec<(u8, Vec<u8, { crate::METADATA_LEN }>), MAX_DEVICE_ASES> =
            Vec::new();
        {
            let dev = &mut self.group.devices[device];
            let available = dev.available_contexts;
            for ase in dev.ases.iter_mut().filter(|a| a.active) {
                if ase.state != AseState::Enabling && ase.state != AseState::Streaming {
                    debug!("ase {}: metadata not updatable in this state", ase.id);
                    continue;
                }
                let new = crate::group::build_metadata(
                    available.get(ase.direction),
                    ase.direction,
                    metadata_contexts,
                    ccids,
                );
                if new == ase.metadata {
                    continue;
                }
                ase.metadata = new.clone();
                let _ = changed.push((ase.id, new));
            }
        }
        if changed.is_empty() {
            return;
        }
        let mut ops: Vec<ascs::MetadataOperation, MAX_DEVICE_ASES> = Vec::new();
        for (ase_id, meta) in changed.iter() {
            let _ = ops.push(ascs::MetadataOperation {
                ase_id: *ase_id,
                metadata: meta,
            });
        }
        match ascs::update_metadata(&ops) {
            Ok(value) => self.write_to_control_point(device, value),
            Err(_) => error!("group {}: update metadata did not fit", self.group.group_id),
        }
    }

    // --- commands ---

    fn start_stream(
        &mut self,
        context: ContextType,
        metadata_contexts: BidirectionalPair<ContextType>,
        ccids: &BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    ) -> Result<(), RequestError> {
        info!(
            "group {}: start stream, current state {}",
            self.group.group_id,
            self.group.state() as u8
        );

        let mut state = self.group.state();
        if state == AseState::CodecConfigured {
            if self.group.is_configured_for_context(context)
                && self.group.activate(context, metadata_contexts, ccids)
            {
                self.set_target_state(AseState::Streaming);
                if self.cig_create() {
                    return Ok(());
                }
                info!("group {}: could not activate, reconfiguring", self.group.group_id);
            }
            // The cached configuration cannot be reused for this context.
            self.group.deactivate();
            self.release_cis_ids();
            state = AseState::Idle;
        }

        match state {
            AseState::Idle => {
                if !self.group.configure(context, metadata_contexts, ccids) {
                    self.stats.stream_context_not_available += 1;
                    return Err(RequestError::ContextUnavailable);
                }
                if !self.group.generate_cis_ids() {
                    return Err(RequestError::ConfigurationFailed);
                }
                self.set_target_state(AseState::Streaming);
                if !self.send_codec_configure_to_group() {
                    self.clear_group(true);
                }
                Ok(())
            }
            AseState::QosConfigured => {
                if !self.group.has_active_device() {
                    error!("group {}: no active device", self.group.group_id);
                    return Err(RequestError::NoActiveDevice);
                }
                self.set_target_state(AseState::Streaming);
                self.send_enable_to_group();
                Ok(())
            }
            AseState::Streaming => {
                // Metadata-only update; no state transition involved.
                if !self.group.is_metadata_changed(&metadata_contexts, ccids) {
                    return Ok(());
                }
                if !self.group.has_active_device() {
                    return Err(RequestError::NoActiveDevice);
                }
                let devices: Vec<usize, { crate::MAX_GROUP_DEVICES }> =
                    self.group.active_device_indexes().collect();
                for device in devices {
                    self.send_update_metadata(device, &metadata_contexts, ccids);
                }
                Ok(())
            }
            _ => {
                error!(
                    "group {}: unable to transition from {}",
                    self.group.group_id,
                    state as u8
                );
                Err(RequestError::InvalidGroupState)
            }
        }
    }

    fn configure_stream(
        &mut self,
        context: ContextType,
        metadata_contexts: BidirectionalPair<ContextType>,
        ccids: &BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    ) -> Result<(), RequestError> {
        if self.group.state() > AseState::CodecConfigured {
            error!(
                "group {}: stream must be stopped before reconfiguration",
                self.group.group_id
            );
            return Err(RequestError::InvalidGroupState);
        }
        self.group.deactivate();
        self.release_cis_ids();
        if !self.group.configure(context, metadata_contexts, ccids) {
            self.stats.stream_context_not_available += 1;
            return Err(RequestError::ContextUnavailable);
        }
        if !self.group.generate_cis_ids() {
            return Err(RequestError::ConfigurationFailed);
        }
        self.group.pending_configuration = true;
        self.set_target_state(AseState::CodecConfigured);
        if !self.send_codec_configure_to_group() {
            return Err(RequestError::NoActiveDevice);
        }
        Ok(())
    }

    /// Bring a reconnected member into a group that keeps streaming.
    fn attach_to_stream(
        &mut self,
        device: usize,
        ccids: &BidirectionalPair<Vec<ContentControlId, MAX_CCIDS>>,
    ) -> Result<(), RequestError> {
        if self.group.state() != AseState::Streaming
            || self.group.target_state() != AseState::Streaming
        {
            error!(
                "group {}: not streaming, cannot attach member",
                self.group.group_id
            );
            return Err(RequestError::InvalidGroupState);
        }
        let Some(context) = self.group.configuration_context else {
            return Err(RequestError::InvalidGroupState);
        };
        {
            let dev = self
                .group
                .devices
                .get(device)
                .ok_or(RequestError::UnknownGroup)?;
            let wanted = self.group.metadata_contexts.sink
                | self.group.metadata_contexts.source;
            let available = *dev.available_contexts.get(Direction::Sink)
                | *dev.available_contexts.get(Direction::Source);
            if (wanted & available).is_empty() {
                info!("device {}: required context not available", device);
                return Err(RequestError::ContextUnavailable);
            }
        }
        let metadata_contexts = self.group.metadata_contexts;
        if !self.group.configure(context, metadata_contexts, ccids) {
            error!("group {}: failed to set ASE configuration", self.group.group_id);
            return Err(RequestError::ConfigurationFailed);
        }
        self.send_codec_configure(device);
        Ok(())
    }

    fn suspend_stream(&mut self) {
        self.set_target_state(AseState::QosConfigured);
        let status = self.send_disable_to_group();
        self.report(status);
    }

    fn stop_stream(&mut self) {
        if self.group.is_releasing_or_idle() {
            info!(
                "group {}: already in releasing process",
                self.group.group_id
            );
            return;
        }
        self.set_target_state(AseState::Idle);
        let status = self.send_release_to_group();
        self.report(status);
    }

    // --- CIG / CIS ---

    fn release_cis_ids(&mut self) {
        debug!("group {}: releasing CIS ids", self.group.group_id);
        self.group.release_cis_ids();
    }

    fn remove_cig(&mut self) {
        if self.group.cig.state != CigState::Created {
            warn!(
                "group {}: CIG in state {} cannot be removed",
                self.group.group_id,
                self.group.cig.state as u8
            );
            return;
        }
        self.group.cig.state = CigState::Removing;
        let group_id = self.group.group_id;
        self.push(Action::RemoveCig {
            group_id,
            force: false,
        });
    }

    /// Terminal cleanup: forget the transition, the CIS assignments and the
    /// controller-side CIG.
    fn clear_group(&mut self, report_idle: bool) {
        debug!("group {}: clearing", self.group.group_id);
        self.group.set_state(AseState::Idle);
        self.group.set_target_state(AseState::Idle);
        self.group.pending_configuration = false;
        self.group.pending_available_contexts_change = false;
        self.group.notify_streaming_when_cises_are_ready = false;
        self.cancel_watchdog();
        self.release_cis_ids();
        self.remove_cig();
        if report_idle {
            self.report(GroupStreamStatus::Idle);
        }
    }

    fn interval_and_latency_consistent(sdu_interval_us: u32, max_latency_ms: u16) -> bool {
        if sdu_interval_us == 0 {
            return max_latency_ms == MAX_TRANSPORT_LATENCY_MIN_MS;
        }
        1000 * max_latency_ms as u32 >= sdu_interval_us
    }

    fn cig_create(&mut self) -> bool {
        let group = &mut self.group;
        debug!(
            "group {}: cig create, state {}",
            group.group_id, group.cig.state as u8
        );
        if group.cig.state != CigState::None {
            warn!(
                "group {}: invalid cig state {}",
                group.group_id, group.cig.state as u8
            );
            return false;
        }

        let sdu_interval_mtos = group.sdu_interval_us(Direction::Sink);
        let sdu_interval_stom = group.sdu_interval_us(Direction::Source);
        let max_trans_lat_mtos = group.max_transport_latency_ms(Direction::Sink);
        let max_trans_lat_stom = group.max_transport_latency_ms(Direction::Source);
        let phy_mtos = group.phy_bitmask(Direction::Sink);
        let mut phy_stom = group.phy_bitmask(Direction::Source);

        if !Self::interval_and_latency_consistent(sdu_interval_mtos, max_trans_lat_mtos)
            || !Self::interval_and_latency_consistent(sdu_interval_stom, max_trans_lat_stom)
        {
            error!("group {}: latency and interval not properly set", group.group_id);
            return false;
        }

        // 1M PHY for the acknowledgement direction of a unidirectional CIS
        // buys sensitivity on the return link.
        if group.asymmetric_phy_for_unidirectional_cis_supported
            && sdu_interval_stom == 0
            && phy_stom.contains(PhyMask::M1)
        {
            info!("group {}: asymmetric PHY for unidirectional CIS", group.group_id);
            phy_stom = PhyMask::M1;
        }

        // Sink/Source configuration is assumed uniform across CIS types;
        // adopt the first non-zero value any CIS reports.
        let mut max_sdu_size_mtos = 0u16;
        let mut max_sdu_size_stom = 0u16;
        let mut rtn_mtos = 0u8;
        let mut rtn_stom = 0u8;
        for cis in group.cig.cises.iter() {
            let mtos = group.max_sdu_size(Direction::Sink, cis.id);
            let stom = group.max_sdu_size(Direction::Source, cis.id);
            let r_mtos = group.retransmission_number(Direction::Sink, cis.id);
            let r_stom = group.retransmission_number(Direction::Source, cis.id);
            max_sdu_size_mtos = if mtos != 0 { mtos } else { max_sdu_size_mtos };
            max_sdu_size_stom = if stom != 0 { stom } else { max_sdu_size_stom };
            rtn_mtos = if r_mtos != 0 { r_mtos } else { rtn_mtos };
            rtn_stom = if r_stom != 0 { r_stom } else { rtn_stom };
        }

        let mut cis_params: Vec<CisParameters, MAX_GROUP_CISES> = Vec::new();
        for cis in group.cig.cises.iter() {
            let mut params = CisParameters {
                cis_id: cis.id,
                phy_mtos,
                phy_stom,
                ..Default::default()
            };
            match cis.cis_type {
                CisType::Bidirectional => {
                    params.max_sdu_size_mtos = max_sdu_size_mtos;
                    params.rtn_mtos = rtn_mtos;
                    params.max_sdu_size_stom = max_sdu_size_stom;
                    params.rtn_stom = rtn_stom;
                }
                CisType::UnidirectionalSink => {
                    params.max_sdu_size_mtos = max_sdu_size_mtos;
                    params.rtn_mtos = rtn_mtos;
                }
                CisType::UnidirectionalSource => {
                    params.max_sdu_size_stom = max_sdu_size_stom;
                    params.rtn_stom = rtn_stom;
                }
            }
            let _ = cis_params.push(params);
        }

        if (sdu_interval_mtos == 0 && sdu_interval_stom == 0)
            || (max_trans_lat_mtos == MAX_TRANSPORT_LATENCY_MIN_MS
                && max_trans_lat_stom == MAX_TRANSPORT_LATENCY_MIN_MS)
            || (max_sdu_size_mtos == 0 && max_sdu_size_stom == 0)
        {
            error!("group {}: trying to create invalid CIG", group.group_id);
            return false;
        }

        let mut params = CigParameters {
            sdu_interval_mtos_us: sdu_interval_mtos,
            sdu_interval_stom_us: sdu_interval_stom,
            sca: 0x00,
            packing: 0x00,
            framing: group.framing,
            max_transport_latency_mtos_ms: max_trans_lat_mtos,
            max_transport_latency_stom_ms: max_trans_lat_stom,
            cis: cis_params,
        };
        self.apply_dsa_params(&mut params);

        self.group.cig.state = CigState::Creating;
        let group_id = self.group.group_id;
        self.push(Action::CreateCig { group_id, params });
        true
    }

    /// Head-tracking overrides for unidirectional (media) streaming: the
    /// return direction of a DSA capable member carries position data.
    fn apply_dsa_params(&mut self, params: &mut CigParameters) {
        let group = &mut self.group;
        group.dsa.active = false;
        if params.sdu_interval_stom_us != 0 {
            debug!("group {}: bidirectional streaming, DSA ignored", group.group_id);
            return;
        }
        if !matches!(group.dsa.mode, DsaMode::IsoSw | DsaMode::IsoHw) {
            return;
        }
        info!("group {}: media streaming, applying DSA parameters", group.group_id);
        for cis in params.cis.iter_mut() {
            let Some(descriptor) = group.cig.cises.iter().find(|c| c.id == cis.cis_id) else {
                continue;
            };
            let Some(device) = group.devices.get(descriptor.device_index as usize) else {
                continue;
            };
            if !device.dsa_modes.supports(group.dsa.mode) {
                continue;
            }
            group.dsa.active = true;
            params.sdu_interval_stom_us = self.config.dsa_sdu_interval_stom_us;
            params.max_transport_latency_stom_ms = self.config.dsa_max_transport_latency_stom_ms;
            cis.max_sdu_size_stom = self.config.dsa_max_sdu_size_stom;
            cis.rtn_stom = self.config.dsa_retransmission_number_stom;
        }
    }

    /// Establish every not-yet-pending CIS of the group.
    fn cis_create(&mut self) -> bool {
        if self.group.cig.state != CigState::Created {
            error!("group {}: CIG is not created", self.group.group_id);
            return false;
        }
        let mut connections: Vec<CisConnection, MAX_GROUP_CISES> = Vec::new();
        let device_count = self.group.devices.len();
        for device in 0..device_count {
            self.collect_cis_connections(device, &mut connections);
        }
        if connections.is_empty() {
            return false;
        }
        let group_id = self.group.group_id;
        self.push(Action::EstablishCis {
            group_id,
            connections,
        });
        true
    }

    /// Establish the CISes of a single (reconnected) member.
    fn cis_create_for_device(&mut self, device: usize) -> bool {
        if self.group.cig.state != CigState::Created {
            error!("group {}: CIG is not created", self.group.group_id);
            return false;
        }
        let mut connections: Vec<CisConnection, MAX_GROUP_CISES> = Vec::new();
        self.collect_cis_connections(device, &mut connections);
        if connections.is_empty() {
            return false;
        }
        let group_id = self.group.group_id;
        self.push(Action::EstablishCis {
            group_id,
            connections,
        });
        true
    }

    fn collect_cis_connections(
        &mut self,
        device: usize,
        connections: &mut Vec<CisConnection, MAX_GROUP_CISES>,
    ) {
        let dev = &mut self.group.devices[device];
        if !dev.has_active_ase() {
            return;
        }
        let acl_conn_handle = dev.acl_conn_handle;
        let ase_count = dev.ases.len();
        for index in 0..ase_count {
            let ase = &dev.ases[index];
            if !ase.active || !ase.has_cis() {
                continue;
            }
            // A bidirectional partner may have marked this CIS already.
            if ase.cis_state == CisState::Connecting || ase.cis_state == CisState::Connected {
                continue;
            }
            let cis_conn_handle = ase.cis_conn_handle;
            let pair = dev.ases_by_cis_handle(cis_conn_handle);
            if let Some(sink) = pair.sink {
                dev.ases[sink].cis_state = CisState::Connecting;
            }
            if let Some(source) = pair.source {
                dev.ases[source].cis_state = CisState::Connecting;
            }
            info!(
                "cis handle {}, acl handle {}",
                cis_conn_handle, acl_conn_handle
            );
            let _ = connections.push(CisConnection {
                cis_conn_handle,
                acl_conn_handle,
            });
        }
    }

    // --- ISO data paths ---

    fn prepare_data_path(&mut self, device: usize, ase: usize) {
        let record = &mut self.group.devices[device].ases[ase];
        let direction = match record.direction {
            Direction::Sink => iso::DATA_PATH_DIRECTION_INPUT,
            Direction::Source => iso::DATA_PATH_DIRECTION_OUTPUT,
        };
        record.data_path_state = DataPathState::Configuring;
        let cis_conn_handle = record.cis_conn_handle;
        let params = DataPathParameters {
            direction,
            data_path_id: iso::DATA_PATH_ID_HCI,
            codec_id: CodecId {
                coding_format: iso::CODING_FORMAT_TRANSPARENT,
                vendor_company_id: 0,
                vendor_codec_id: 0,
            },
            controller_delay_us: 0,
            codec_configuration: Vec::new(),
        };
        let group_id = self.group.group_id;
        self.push(Action::SetupDataPath {
            group_id,
            cis_conn_handle,
            params,
        });
    }

    /// Extra controller-to-host path carrying head-tracking data.
    fn apply_dsa_data_path(&mut self, device: usize, cis_conn_handle: u16) {
        if !self.group.dsa.active {
            return;
        }
        let mode = self.group.dsa.mode;
        let dev = &mut self.group.devices[device];
        if !dev.dsa_modes.supports(mode) {
            warn!("device {}: DSA mode not supported", device);
            self.group.dsa.active = false;
            return;
        }
        let data_path_id = match mode {
            DsaMode::IsoHw => iso::DATA_PATH_ID_PLATFORM_DEFAULT,
            DsaMode::IsoSw => iso::DATA_PATH_ID_HCI,
            _ => {
                warn!("group {}: unexpected DSA mode", self.group.group_id);
                self.group.dsa.active = false;
                return;
            }
        };
        dev.dsa_data_path_state = DataPathState::Configuring;
        dev.dsa_cis_handle = cis_conn_handle;
        let group_id = self.group.group_id;
        self.push(Action::SetupDataPath {
            group_id,
            cis_conn_handle,
            params: DataPathParameters {
                direction: iso::DATA_PATH_DIRECTION_OUTPUT,
                data_path_id,
                codec_id: CodecId::HEADTRACKING,
                controller_delay_us: 0,
                codec_configuration: Vec::new(),
            },
        });
    }

    fn remove_data_path_by_cis_handle(&mut self, device: usize, cis_conn_handle: u16) {
        let dev = &mut self.group.devices[device];
        let pair = dev.ases_by_cis_handle(cis_conn_handle);
        let mut mask = 0u8;
        if let Some(sink) = pair.sink {
            if dev.ases[sink].data_path_state == DataPathState::Configured {
                mask |= iso::REMOVE_DATA_PATH_INPUT;
                dev.ases[sink].data_path_state = DataPathState::Removing;
            }
        }
        let mut source_removed = false;
        if let Some(source) = pair.source {
            if dev.ases[source].data_path_state == DataPathState::Configured {
                mask |= iso::REMOVE_DATA_PATH_OUTPUT;
                dev.ases[source].data_path_state = DataPathState::Removing;
                source_removed = true;
            }
        }
        if !source_removed && dev.dsa_data_path_state == DataPathState::Configured {
            mask |= iso::REMOVE_DATA_PATH_OUTPUT;
            dev.dsa_data_path_state = DataPathState::Removing;
        }
        if mask == 0 {
            info!("cis {}: no data path to remove", cis_conn_handle);
            return;
        }
        let group_id = self.group.group_id;
        self.push(Action::RemoveDataPath {
            group_id,
            cis_conn_handle,
            direction_mask: mask,
        });
    }

    /// Kick off data path teardown on the first active ASE that still has
    /// one; subsequent ASEs are handled as the completions cascade.
    fn release_data_path(&mut self) {
        let found = self.group.devices.iter().enumerate().find_map(|(d, dev)| {
            dev.ases
                .iter()
                .position(|a| {
                    a.active
                        && a.cis_state == CisState::Connected
                        && a.data_path_state == DataPathState::Configured
                })
                .map(|a| (d, dev.ases[a].cis_conn_handle))
        });
        if let Some((device, cis_conn_handle)) = found {
            self.remove_data_path_by_cis_handle(device, cis_conn_handle);
        }
    }

    fn disconnect_cis_if_needed(&mut self, device: usize, ase: usize) {
        let dev = &self.group.devices[device];
        let record = &dev.ases[ase];
        let cis_conn_handle = record.cis_conn_handle;
        if let Some(partner) = dev.bidirectional_partner(ase) {
            let partner = &dev.ases[partner];
            if partner.cis_state == CisState::Connected
                && (partner.state == AseState::Streaming || partner.state == AseState::Enabling)
            {
                info!(
                    "ase {}: waiting for the bidirectional partner to be released",
                    record.id
                );
                return;
            }
        }
        self.group
            .remove_cis_from_stream_configuration(cis_conn_handle);
        let group_id = self.group.group_id;
        self.push(Action::DisconnectCis {
            group_id,
            cis_conn_handle,
            reason: status::REMOTE_USER_TERMINATED,
        });
    }

    // --- notification handlers ---

    fn on_ctp_notification(&mut self, value: &[u8]) {
        let target_state = self.group.target_state();
        let in_transition = self.group.is_in_transition();
        if !in_transition || target_state != AseState::Streaming {
            debug!(
                "group {}: not interested in ctp result",
                self.group.group_id
            );
            return;
        }
        let Ok(notification) = CtpNotification::parse(value) else {
            // Let the guard timer catch it.
            error!("group {}: invalid CTP notification", self.group.group_id);
            return;
        };
        for entry in notification.entries.iter() {
            if !entry.is_success() {
                error!(
                    "ase {}: control point error {} reason {}, stopping stream",
                    entry.ase_id, entry.response_code, entry.reason
                );
                self.stats.stream_create_signaling_failed += 1;
                self.stop_stream();
                return;
            }
        }
        debug!("group {}: ctp result ok", self.group.group_id);
    }

    fn on_ase_status(&mut self, device: usize, ase: usize, value: &[u8]) {
        let known = self
            .group
            .devices
            .get(device)
            .is_some_and(|d| ase < d.ases.len());
        if !known {
            warn!("notification for unknown ase");
            return;
        }
        let Ok((header, payload)) = ascs::parse_ase_status(value) else {
            warn!("malformed ASE status, ignoring");
            return;
        };
        if self.group.devices[device].ases[ase].id == 0x00 {
            // Initial state, the server just revealed the id.
            info!("discovered ase id {}", header.ase_id);
            self.group.devices[device].ases[ase].id = header.ase_id;
        }

        info!(
            "ase {}: status {} (current {})",
            header.ase_id,
            header.state as u8,
            self.group.devices[device].ases[ase].state as u8
        );

        match header.state {
            AseState::Idle => self.ase_status_idle(device, ase),
            AseState::CodecConfigured => self.ase_status_codec_configured(device, ase, payload),
            AseState::QosConfigured => self.ase_status_qos_configured(device, ase),
            AseState::Enabling => self.ase_status_enabling(device, ase),
            AseState::Streaming => self.ase_status_streaming(device, ase, payload),
            AseState::Disabling => self.ase_status_disabling(device, ase),
            AseState::Releasing => self.ase_status_releasing(device, ase),
        }
    }

    fn ase_status_idle(&mut self, device: usize, ase: usize) {
        let state = self.group.devices[device].ases[ase].state;
        match state {
            AseState::Idle | AseState::CodecConfigured => {}
            AseState::Releasing => {
                self.set_ase_state(device, ase, AseState::Idle);
                let record = &mut self.group.devices[device].ases[ase];
                record.active = false;
                record.configured_for_context = None;

                if !self.group.devices[device]
                    .have_all_active_ases_same_state(AseState::Idle)
                {
                    debug!("device {}: more ASEs to release", device);
                    return;
                }
                if self.group.target_state() != AseState::Idle {
                    debug!("device {}: autonomous release, just store it", device);
                    return;
                }
                if !self
                    .group
                    .have_all_active_devices_ases_same_state(AseState::Idle)
                    && self.group.has_active_device()
                {
                    debug!("group {}: waiting for more devices", self.group.group_id);
                    return;
                }
                self.group.set_state(AseState::Idle);
                if !self.group.have_all_cises_disconnected() {
                    warn!(
                        "group {}: not all CISes down before IDLE, waiting",
                        self.group.group_id
                    );
                    return;
                }
                self.cancel_watchdog();
                self.release_cis_ids();
                self.report(GroupStreamStatus::Idle);
            }
            AseState::QosConfigured | AseState::Disabling => {
                error!(
                    "ase {}: ignoring invalid transition to Idle",
                    self.group.devices[device].ases[ase].id
                );
            }
            AseState::Enabling | AseState::Streaming => {
                error!(
                    "ase {}: invalid transition to Idle, stopping the stream",
                    self.group.devices[device].ases[ase].id
                );
                self.stop_stream();
            }
        }
    }

    /// Cache the server's preferred QoS values, tightening only.
    fn adopt_codec_configured_preferences(
        &mut self,
        device: usize,
        ase: usize,
        response: &CodecConfiguredStatus,
    ) {
        let record = &mut self.group.devices[device].ases[ase];
        record.framing = response.framing;
        record.preferred_phy = response.preferred_phy;
        if record.max_transport_latency_ms == 0
            || record.max_transport_latency_ms > response.max_transport_latency_ms
            || record.retransmission_number == 0
        {
            record.max_transport_latency_ms = response.max_transport_latency_ms;
            record.retransmission_number = response.preferred_retransmission_number;
            info!(
                "ase {}: using server preferred QoS, latency {} rtn {}",
                record.id, record.max_transport_latency_ms, record.retransmission_number
            );
        }
        record.presentation_delay_min_us = response.presentation_delay_min_us;
        record.presentation_delay_max_us = response.presentation_delay_max_us;
        record.preferred_presentation_delay_min_us =
            response.preferred_presentation_delay_min_us;
        record.preferred_presentation_delay_max_us =
            response.preferred_presentation_delay_max_us;
    }

    /// A reconnecting member whose ASE cannot carry the CIG's current
    /// transport latency forces a reconfiguration on the next start.
    fn reconnect_latency_conflicts(&self, device: usize, ase: usize, latency_ms: u16) -> bool {
        let direction = self.group.devices[device].ases[ase].direction;
        self.group.state() == AseState::Streaming
            && self.group.max_transport_latency_ms(direction) > latency_ms
    }

    fn ase_status_codec_configured(&mut self, device: usize, ase: usize, payload: &[u8]) {
        let state = self.group.devices[device].ases[ase].state;
        match state {
            AseState::Idle => {
                let Ok(response) = CodecConfiguredStatus::parse(payload) else {
                    self.stop_stream();
                    return;
                };
                if self.reconnect_latency_conflicts(
                    device,
                    ase,
                    response.max_transport_latency_ms,
                ) {
                    self.group.pending_configuration = true;
                    self.stop_stream();
                    return;
                }
                self.adopt_codec_configured_preferences(device, ase, &response);
                self.set_ase_state(device, ase, AseState::CodecConfigured);

                if self.group.target_state() == AseState::Idle {
                    // Autonomous change of the remote device; admit the
                    // configured state and stop there.
                    debug!("device {}: autonomous codec config, stored", device);
                    self.group.set_state(AseState::CodecConfigured);
                    return;
                }
                if self.group.devices[device].have_any_unconfigured_ases() {
                    debug!("device {}: more ASEs to configure", device);
                    return;
                }
                if self.group.state() == AseState::Streaming {
                    // Reconnecting member; configure QoS once it is ready.
                    if self.group.devices[device].connection_state
                        == DeviceConnectState::Connected
                    {
                        self.send_config_qos(device);
                    } else {
                        debug!("device {}: not yet ready to be configured", device);
                    }
                    return;
                }
                if self.group.have_any_active_device_unconfigured() {
                    debug!("group {}: waiting for all ASEs configured", self.group.group_id);
                    return;
                }
                self.group.set_state(AseState::CodecConfigured);
                self.group_codec_configured();
            }
            AseState::CodecConfigured => {
                // Autonomous reconfiguration done by us or by the server.
                let Ok(response) = CodecConfiguredStatus::parse(payload) else {
                    self.stop_stream();
                    return;
                };
                self.adopt_codec_configured_preferences(device, ase, &response);
                self.group.devices[device].ases[ase].reconfigure = false;

                if self.group.devices[device].have_any_unconfigured_ases() {
                    return;
                }
                if self.group.state() == AseState::Streaming {
                    if self.group.devices[device].connection_state
                        == DeviceConnectState::Connected
                    {
                        self.send_config_qos(device);
                    } else {
                        debug!("device {}: not yet ready to be configured", device);
                    }
                    return;
                }
                if self.group.have_any_active_device_unconfigured() {
                    return;
                }
                self.group.set_state(AseState::CodecConfigured);
                self.group_codec_configured();
            }
            AseState::QosConfigured => {
                self.set_ase_state(device, ase, AseState::CodecConfigured);
            }
            AseState::Disabling => {
                error!(
                    "ase {}: ignoring invalid transition to Codec Configured",
                    self.group.devices[device].ases[ase].id
                );
            }
            AseState::Releasing => {
                // Server caches the codec configuration across release.
                self.set_ase_state(device, ase, AseState::CodecConfigured);
                self.group.devices[device].ases[ase].active = false;

                if !self.group.devices[device]
                    .have_all_active_ases_same_state(AseState::CodecConfigured)
                {
                    debug!("device {}: more ASEs to settle", device);
                    return;
                }
                if self.group.target_state() != AseState::Idle {
                    debug!("device {}: autonomous release with caching", device);
                    return;
                }
                if self.group.has_active_device() {
                    debug!("group {}: waiting for devices to go inactive", self.group.group_id);
                    return;
                }
                self.group.set_state(AseState::CodecConfigured);
                // The server kept its cache; treat Codec Configured as the
                // new resting state.
                self.group.set_target_state(AseState::CodecConfigured);
                if !self.group.have_all_cises_disconnected() {
                    warn!(
                        "group {}: not all CISes down before Configured, waiting",
                        self.group.group_id
                    );
                    return;
                }
                self.cancel_watchdog();
                self.report(GroupStreamStatus::ConfiguredAutonomous);
            }
            AseState::Streaming | AseState::Enabling => {
                error!(
                    "ase {}: invalid transition to Codec Configured, stopping the stream",
                    self.group.devices[device].ases[ase].id
                );
                self.stop_stream();
            }
        }
    }

    /// The whole group reached Codec Configured; continue towards the
    /// target.
    fn group_codec_configured(&mut self) {
        if self.group.target_state() == AseState::Streaming {
            if !self.cig_create() {
                error!("group {}: could not create CIG", self.group.group_id);
                self.stop_stream();
            }
            return;
        }
        if self.group.target_state() == AseState::CodecConfigured
            && self.group.pending_configuration
        {
            info!("group {}: configured state completed", self.group.group_id);
            if !self.group.have_all_cises_disconnected() {
                warn!(
                    "group {}: not all CISes down before Configured, waiting",
                    self.group.group_id
                );
                return;
            }
            self.group.pending_configuration = false;
            self.report(GroupStreamStatus::ConfiguredByUser);
            self.cancel_watchdog();
            return;
        }
        error!(
            "group {}: invalid transition towards {}",
            self.group.group_id,
            self.group.target_state() as u8
        );
        self.stop_stream();
    }

    fn ase_status_qos_configured(&mut self, device: usize, ase: usize) {
        let state = self.group.devices[device].ases[ase].state;
        match state {
            AseState::CodecConfigured => {
                self.set_ase_state(device, ase, AseState::QosConfigured);
                if !self.group.devices[device]
                    .have_all_active_ases_same_state(AseState::QosConfigured)
                {
                    return;
                }
                if self.group.state() == AseState::Streaming {
                    // Reconnecting member.
                    self.send_enable(device);
                    return;
                }
                if !self
                    .group
                    .have_all_active_devices_ases_same_state(AseState::QosConfigured)
                {
                    debug!("group {}: waiting for all devices in QoS state", self.group.group_id);
                    return;
                }
                self.send_enable_to_group();
            }
            AseState::Streaming => {
                // Autonomous disable; only a Sink ASE may fall straight to
                // QoS Configured.
                if self.group.devices[device].ases[ase].direction == Direction::Source {
                    error!(
                        "ase {}: source cannot fall from Streaming to QoS Configured",
                        self.group.devices[device].ases[ase].id
                    );
                    self.stop_stream();
                    return;
                }
                self.set_ase_state(device, ase, AseState::QosConfigured);
                if self.group.target_state() != AseState::QosConfigured {
                    self.process_autonomous_disable(device, ase);
                }
                if self.group.devices[device].is_ready_to_suspend_stream() {
                    self.process_group_disable();
                }
            }
            AseState::Disabling => {
                self.set_ase_state(device, ase, AseState::QosConfigured);
                if !self
                    .group
                    .have_all_active_devices_ases_same_state(AseState::QosConfigured)
                {
                    return;
                }
                self.group.set_state(AseState::QosConfigured);
                if !self.group.have_all_cises_disconnected() {
                    return;
                }
                if self.group.target_state() == AseState::QosConfigured {
                    self.cancel_watchdog();
                    self.report(GroupStreamStatus::Suspended);
                } else {
                    error!(
                        "group {}: invalid transition towards {}",
                        self.group.group_id,
                        self.group.target_state() as u8
                    );
                    self.stop_stream();
                }
            }
            AseState::QosConfigured => {
                info!(
                    "ase {}: unexpected QoS Configured from QoS Configured",
                    self.group.devices[device].ases[ase].id
                );
            }
            AseState::Idle | AseState::Releasing => {
                error!(
                    "ase {}: ignoring invalid transition to QoS Configured",
                    self.group.devices[device].ases[ase].id
                );
            }
            AseState::Enabling => {
                error!(
                    "ase {}: invalid transition to QoS Configured, stopping the stream",
                    self.group.devices[device].ases[ase].id
                );
                self.stop_stream();
            }
        }
    }

    fn ase_status_enabling(&mut self, device: usize, ase: usize) {
        let state = self.group.devices[device].ases[ase].state;
        match state {
            AseState::QosConfigured => {
                self.set_ase_state(device, ase, AseState::Enabling);
                if self.group.state() == AseState::Streaming {
                    // Reconnecting member joins the running stream.
                    if self.group.devices[device].ases[ase].cis_state < CisState::Connecting
                        && !self.cis_create_for_device(device)
                    {
                        self.stop_stream();
                        return;
                    }
                    if !self.group.devices[device].have_all_active_ases_cis_established() {
                        return;
                    }
                    if !self.group.devices[device].is_ready_to_create_stream() {
                        return;
                    }
                    self.send_receiver_start_ready(device);
                    return;
                }
                if self.group.devices[device].is_ready_to_create_stream() {
                    self.process_group_enable();
                }
            }
            AseState::Enabling => {
                // Metadata update while enabling.
            }
            _ => {
                error!(
                    "ase {}: invalid transition to Enabling, stopping the stream",
                    self.group.devices[device].ases[ase].id
                );
                self.stop_stream();
            }
        }
    }

    fn ase_status_streaming(&mut self, device: usize, ase: usize, payload: &[u8]) {
        let state = self.group.devices[device].ases[ase].state;
        match state {
            AseState::Enabling => {
                self.set_ase_state(device, ase, AseState::Streaming);
                if !self
                    .group
                    .have_all_active_devices_ases_same_state(AseState::Streaming)
                {
                    return;
                }
                if self.group.state() == AseState::Streaming {
                    // Reconnecting member finished joining.
                    self.cancel_watchdog();
                    self.report(GroupStreamStatus::Streaming);
                    return;
                }
                if !self.group.is_group_stream_ready() {
                    info!("group {}: CISes not yet ready, waiting", self.group.group_id);
                    self.group.notify_streaming_when_cises_are_ready = true;
                    return;
                }
                if self.group.target_state() == AseState::Streaming {
                    self.cancel_watchdog();
                    self.group.set_state(AseState::Streaming);
                    self.report(GroupStreamStatus::Streaming);
                } else {
                    error!(
                        "group {}: invalid transition towards {}",
                        self.group.group_id,
                        self.group.target_state() as u8
                    );
                    self.stop_stream();
                }
            }
            AseState::Streaming => {
                // Metadata changed by the server; cache it for later
                // reconfiguration.
                let Ok(response) = TransientStatus::parse(payload) else {
                    self.stop_stream();
                    return;
                };
                if !response.metadata.is_empty() {
                    self.group.devices[device].ases[ase].metadata = response.metadata;
                }
            }
            _ => {
                error!(
                    "ase {}: invalid transition to Streaming, stopping the stream",
                    self.group.devices[device].ases[ase].id
                );
                self.stop_stream();
            }
        }
    }

    fn ase_status_disabling(&mut self, device: usize, ase: usize) {
        if self.group.devices[device].ases[ase].direction == Direction::Sink {
            // Sink ASE state machine has no Disabling state.
            error!(
                "ase {}: sink ASE cannot enter Disabling, stopping the stream",
                self.group.devices[device].ases[ase].id
            );
            self.stop_stream();
            return;
        }
        let state = self.group.devices[device].ases[ase].state;
        match state {
            AseState::Enabling => {
                debug!(
                    "ase {}: disable while still enabling",
                    self.group.devices[device].ases[ase].id
                );
            }
            AseState::Streaming => {
                self.set_ase_state(device, ase, AseState::Disabling);
                if self.group.target_state() != AseState::QosConfigured {
                    self.process_autonomous_disable(device, ase);
                }
                if self.group.devices[device].is_ready_to_suspend_stream() {
                    self.process_group_disable();
                }
            }
            _ => {
                error!(
                    "ase {}: invalid transition to Disabling, stopping the stream",
                    self.group.devices[device].ases[ase].id
                );
                self.stop_stream();
            }
        }
    }

    fn ase_status_releasing(&mut self, device: usize, ase: usize) {
        let state = self.group.devices[device].ases[ase].state;
        match state {
            AseState::CodecConfigured | AseState::QosConfigured | AseState::Disabling => {
                self.set_ase_state(device, ase, AseState::Releasing);
                if self
                    .group
                    .have_all_active_devices_ases_same_state(AseState::Releasing)
                {
                    self.group.set_state(AseState::Releasing);
                }
                if self.group.cig.state == CigState::Created
                    && self.group.have_all_cises_disconnected()
                {
                    self.remove_cig();
                }
            }
            AseState::Enabling => {
                self.set_ase_state(device, ase, AseState::Releasing);
                let record = &self.group.devices[device].ases[ase];
                let cis_state = record.cis_state;
                let data_path_state = record.data_path_state;
                // The bidirectional partner may already be taking the CIS
                // down.
                if cis_state == CisState::Disconnecting {
                    return;
                }
                let mut remove_cig = true;
                if (cis_state == CisState::Connected || cis_state == CisState::Connecting)
                    && data_path_state == DataPathState::Idle
                {
                    self.disconnect_cis_if_needed(device, ase);
                    // CISes are still there; the CIG goes when they are down.
                    remove_cig = false;
                }
                if !self
                    .group
                    .have_all_active_devices_ases_same_state(AseState::Releasing)
                {
                    return;
                }
                self.group.set_state(AseState::Releasing);
                if remove_cig {
                    self.remove_cig();
                }
            }
            AseState::Streaming => {
                self.set_ase_state(device, ase, AseState::Releasing);
                let record = &self.group.devices[device].ases[ase];
                let cis_state = record.cis_state;
                let data_path_state = record.data_path_state;
                let cis_conn_handle = record.cis_conn_handle;
                if cis_state == CisState::Disconnecting {
                    return;
                }
                if data_path_state == DataPathState::Configured {
                    self.remove_data_path_by_cis_handle(device, cis_conn_handle);
                } else if (cis_state == CisState::Connected
                    || cis_state == CisState::Connecting)
                    && data_path_state == DataPathState::Idle
                {
                    self.disconnect_cis_if_needed(device, ase);
                } else {
                    debug!("ase: nothing to do for data path state");
                }
            }
            _ => {
                error!(
                    "ase {}: invalid transition to Releasing",
                    self.group.devices[device].ases[ase].id
                );
            }
        }
    }

    // --- group-level progression ---

    fn process_group_enable(&mut self) {
        if self.group.state() != AseState::Enabling {
            if !self.group.is_group_ready_to_create_stream() {
                debug!(
                    "group {}: waiting for more ASEs to be enabling",
                    self.group.group_id
                );
                return;
            }
            self.group.set_state(AseState::Enabling);
        }
        if self.group.target_state() != AseState::Streaming {
            error!(
                "group {}: invalid transition towards {}",
                self.group.group_id,
                self.group.target_state() as u8
            );
            self.stop_stream();
            return;
        }
        if !self.cis_create() {
            self.stop_stream();
        }
    }

    fn process_group_disable(&mut self) {
        if self.group.state() != AseState::Disabling {
            if !self.group.is_group_ready_to_suspend_stream() {
                info!(
                    "group {}: waiting for all devices in disable state",
                    self.group.group_id
                );
                return;
            }
            self.group.set_state(AseState::Disabling);
        }
        // Sink ASEs have no Disabling state, so an all-sink group may
        // already sit in QoS Configured here.
        if self
            .group
            .have_all_active_devices_ases_same_state(AseState::QosConfigured)
        {
            self.group.set_state(AseState::QosConfigured);
        }
        if self.group.target_state() == AseState::QosConfigured {
            self.release_data_path();
        } else {
            error!(
                "group {}: invalid transition towards {}",
                self.group.group_id,
                self.group.target_state() as u8
            );
            self.stop_stream();
        }
    }

    /// One half of a bidirectional CIS was disabled by the server. Watch the
    /// partner with a bounded timer so a stuck half cannot wedge the group.
    fn process_autonomous_disable(&mut self, device: usize, ase: usize) {
        let Some(partner) = self.group.devices[device].bidirectional_partner(ase) else {
            return;
        };
        let group_id = self.group.group_id;
        if self.group.devices[device].ases[partner].state == AseState::QosConfigured {
            // Both halves are now disabled.
            let record = &mut self.group.devices[device].ases[ase];
            if record.autonomous_target_state == Some(AseState::QosConfigured) {
                record.autonomous_target_state = None;
                self.push(Action::CancelAutonomousTimer {
                    group_id,
                    device: device as u8,
                    ase: ase as u8,
                });
            }
            return;
        }
        if self.group.devices[device].ases[partner]
            .autonomous_target_state
            .is_none()
        {
            self.group.devices[device].ases[partner].autonomous_target_state =
                Some(AseState::QosConfigured);
            let timeout_ms = self.config.autonomous_timeout_ms;
            self.push(Action::ArmAutonomousTimer {
                group_id,
                device: device as u8,
                ase: partner as u8,
                timeout_ms,
            });
        }
    }

    // --- controller completions ---

    fn on_cig_created(&mut self, cig_status: u8, conn_handles: &[u16]) {
        if cig_status != status::SUCCESS {
            if cig_status == status::COMMAND_DISALLOWED {
                // A CIG left behind by an earlier shutdown blocks creation;
                // force-remove it and try once more.
                self.group.cig.state = CigState::Recovering;
                let group_id = self.group.group_id;
                self.push(Action::RemoveCig {
                    group_id,
                    force: true,
                });
                return;
            }
            self.group.cig.state = CigState::None;
            error!(
                "group {}: failed to create CIG, status {}",
                self.group.group_id, cig_status
            );
            self.stop_stream();
            return;
        }

        if self.group.cig.state != CigState::Creating {
            error!(
                "group {}: unexpected CIG created in state {}",
                self.group.group_id,
                self.group.cig.state as u8
            );
            self.stop_stream();
            return;
        }
        self.group.cig.state = CigState::Created;
        info!(
            "group {}: cig created, {} cis handles",
            self.group.group_id,
            conn_handles.len()
        );
        self.group.assign_cis_conn_handles(conn_handles);
        self.group.set_state(AseState::QosConfigured);
        if self.group.target_state() == AseState::Streaming {
            self.send_qos_to_group();
        } else {
            error!(
                "group {}: invalid transition towards {}",
                self.group.group_id,
                self.group.target_state() as u8
            );
            self.stop_stream();
        }
    }

    fn on_cig_removed(&mut self, cig_status: u8) {
        if self.group.cig.state == CigState::Recovering {
            self.group.cig.state = CigState::None;
            if cig_status != status::SUCCESS {
                error!(
                    "group {}: could not recover from Command Disallowed, status {}",
                    self.group.group_id, cig_status
                );
                self.stop_stream();
                return;
            }
            info!("group {}: CIG recovered, creating again", self.group.group_id);
            if !self.cig_create() {
                error!("group {}: could not create CIG", self.group.group_id);
                self.stop_stream();
            }
            return;
        }

        if cig_status != status::SUCCESS {
            self.group.cig.state = CigState::Created;
            error!(
                "group {}: failed to remove CIG, status {}",
                self.group.group_id, cig_status
            );
            return;
        }
        if self.group.cig.state != CigState::Removing {
            warn!(
                "group {}: unexpected CIG removal in state {}",
                self.group.group_id,
                self.group.cig.state as u8
            );
        }
        self.group.cig.state = CigState::None;
        if self.config.link_quality_watch {
            let group_id = self.group.group_id;
            let handles: Vec<u16, MAX_GROUP_CISES> = self
                .group
                .cig
                .cises
                .iter()
                .map(|c| c.conn_handle)
                .filter(|h| *h != crate::group::INVALID_CIS_HANDLE)
                .collect();
            for cis_conn_handle in handles {
                self.push(Action::StopLinkQualityWatch {
                    group_id,
                    cis_conn_handle,
                });
            }
        }
        for device in self.group.devices.iter_mut() {
            for ase in device.ases.iter_mut() {
                ase.cis_state = CisState::Idle;
                ase.data_path_state = DataPathState::Idle;
            }
        }
    }

    fn on_cis_established(&mut self, cis_conn_handle: u16, cis_status: u8) {
        let Some(device) = self.group.device_index_by_cis_handle(cis_conn_handle) else {
            warn!("cis {}: established event for unknown CIS", cis_conn_handle);
            return;
        };
        let pair = self.group.devices[device].ases_by_cis_handle(cis_conn_handle);

        if cis_status != status::SUCCESS {
            self.set_pair_cis_state(device, &pair, CisState::Assigned);
            warn!(
                "cis {}: failed to establish, status {}",
                cis_conn_handle, cis_status
            );
            let retries = {
                let dev = &mut self.group.devices[device];
                dev.cis_retry_count += 1;
                dev.cis_retry_count
            };
            if cis_status == status::CONNECTION_FAILED_TO_BE_ESTABLISHED
                && retries <= self.config.cis_establish_retries
                && self.cis_create_for_device(device)
            {
                info!("device {}: retrying ({}) to create CIS", device, retries);
                return;
            }
            if cis_status == status::UNSUPPORTED_REMOTE_FEATURE
                && self.group.asymmetric_phy_for_unidirectional_cis_supported
                && self.group.sdu_interval_us(Direction::Source) == 0
            {
                self.group.asymmetric_phy_for_unidirectional_cis_supported = false;
            }
            error!(
                "device {}: CIS creation failed {} times, stopping the stream",
                device, retries
            );
            self.group.devices[device].cis_retry_count = 0;
            // No CIS survived; without this the next CIG create is refused.
            if self.group.have_all_cises_disconnected() {
                self.remove_cig();
            }
            self.stop_stream();
            return;
        }

        self.group.devices[device].cis_retry_count = 0;

        if self.group.target_state() != AseState::Streaming {
            error!(
                "group {}: unintended CIS established event",
                self.group.group_id
            );
            self.stop_stream();
            return;
        }

        self.set_pair_cis_state(device, &pair, CisState::Connected);

        if let Some(sink) = pair.sink {
            if self.group.devices[device].ases[sink].data_path_state == DataPathState::Idle {
                self.prepare_data_path(device, sink);
            }
        }
        if let Some(source) = pair.source {
            if self.group.devices[device].ases[source].data_path_state == DataPathState::Idle {
                self.prepare_data_path(device, source);
            }
        } else {
            self.apply_dsa_data_path(device, cis_conn_handle);
        }

        if self.config.link_quality_watch {
            let group_id = self.group.group_id;
            let interval_ms = self.config.link_quality_interval_ms;
            self.push(Action::StartLinkQualityWatch {
                group_id,
                cis_conn_handle,
                interval_ms,
            });
        }

        if !self.group.devices[device].have_all_active_ases_cis_established() {
            // More CIS established events have to come.
            return;
        }
        if !self.group.devices[device].is_ready_to_create_stream() {
            // More enabling notifications have to come; possible on
            // reconnection of a bidirectional member.
            return;
        }
        self.send_receiver_start_ready(device);
    }

    fn set_pair_cis_state(&mut self, device: usize, pair: &AsePair, state: CisState) {
        if let Some(sink) = pair.sink {
            self.group.devices[device].ases[sink].cis_state = state;
        }
        if let Some(source) = pair.source {
            self.group.devices[device].ases[source].cis_state = state;
        }
    }

    fn on_cis_disconnected(&mut self, cis_conn_handle: u16, reason: u8) {
        let Some(device) = self.group.device_index_by_cis_handle(cis_conn_handle) else {
            warn!("cis {}: disconnect event for unknown CIS", cis_conn_handle);
            return;
        };
        if self.config.link_quality_watch {
            let group_id = self.group.group_id;
            self.push(Action::StopLinkQualityWatch {
                group_id,
                cis_conn_handle,
            });
        }

        let pair = self.group.devices[device].ases_by_cis_handle(cis_conn_handle);
        self.set_pair_cis_state(device, &pair, CisState::Assigned);
        self.remove_data_path_by_cis_handle(device, cis_conn_handle);

        if reason != status::CONNECTION_TERMINATED_BY_LOCAL_HOST {
            // Peer took the CIS down; leave Streaming before cleanup.
            for index in [pair.sink, pair.source].into_iter().flatten() {
                if self.group.devices[device].ases[index].state == AseState::Streaming {
                    self.set_ase_state(device, index, AseState::CodecConfigured);
                }
            }
        }

        self.group
            .remove_cis_from_stream_configuration(cis_conn_handle);

        match self.group.target_state() {
            AseState::Streaming => {
                // Something went wrong while streaming or creating the
                // stream. Keep going if any other member still has a CIS.
                if !self.group.have_all_cises_disconnected() {
                    warn!(
                        "cis {}: group member disconnected during streaming",
                        cis_conn_handle
                    );
                    return;
                }
                info!("group {}: lost all members", self.group.group_id);
                self.group.cig.cises.clear();
                self.remove_cig();
                self.group.set_state(AseState::Idle);
                self.group.set_target_state(AseState::Idle);
                self.report(GroupStreamStatus::Idle);
                return;
            }
            AseState::QosConfigured => {
                // Intentional suspend; the last CIS event may trail the ASE
                // notifications.
                if self.group.state() == AseState::QosConfigured
                    && self.group.have_all_cises_disconnected()
                {
                    self.cancel_watchdog();
                    self.report(GroupStreamStatus::Suspended);
                    return;
                }
            }
            AseState::Idle | AseState::CodecConfigured => {
                // Closing the stream; CIS disconnections are expected.
                if !self.group.have_all_cises_disconnected() {
                    debug!(
                        "group {}: still waiting for all CISes to disconnect",
                        self.group.group_id
                    );
                    return;
                }
                self.cancel_watchdog();
                let current = self.group.state();
                if current == AseState::Idle {
                    info!("group {}: CISes disconnected in Idle", self.group.group_id);
                    self.release_cis_ids();
                    self.report(GroupStreamStatus::Idle);
                } else if current == AseState::CodecConfigured {
                    if self.group.target_state() == current {
                        self.report(GroupStreamStatus::ConfiguredAutonomous);
                    }
                }
                self.remove_cig();
            }
            _ => {}
        }

        // Acting as audio source: acknowledge the server's disable now that
        // the CIS is down.
        if let Some(source) = pair.source {
            if self.group.devices[device].ases[source].state == AseState::Disabling {
                self.send_receiver_stop_ready(device, source);
            }
        }

        // Continue tearing down the group's data paths.
        let next = self.next_teardown_target(device);
        if let Some((next_device, handle)) = next {
            self.remove_data_path_by_cis_handle(next_device, handle);
        }
    }

    /// Next ASE whose data path still stands, this device first, then the
    /// remaining active devices in order.
    fn next_teardown_target(&self, device: usize) -> Option<(usize, u16)> {
        let configured = |d: usize| {
            self.group.devices[d]
                .ases
                .iter()
                .find(|a| {
                    a.active
                        && a.cis_state == CisState::Connected
                        && a.data_path_state == DataPathState::Configured
                })
                .map(|a| (d, a.cis_conn_handle))
        };
        if let Some(found) = configured(device) {
            return Some(found);
        }
        (device + 1..self.group.devices.len())
            .filter(|d| self.group.devices[*d].has_active_ase())
            .find_map(configured)
    }

    fn on_data_path_setup(&mut self, cis_conn_handle: u16, path_status: u8) {
        let Some(device) = self.group.device_index_by_cis_handle(cis_conn_handle) else {
            warn!("cis {}: data path setup for unknown CIS", cis_conn_handle);
            return;
        };
        if path_status != status::SUCCESS {
            error!(
                "cis {}: failed to setup data path, status {}",
                cis_conn_handle, path_status
            );
            self.stop_stream();
            return;
        }

        if self.group.dsa.active
            && matches!(self.group.dsa.mode, DsaMode::IsoSw | DsaMode::IsoHw)
            && self.group.devices[device].dsa_data_path_state == DataPathState::Configuring
        {
            info!("device {}: data path configured for headtracking", device);
            self.group.devices[device].dsa_data_path_state = DataPathState::Configured;
            return;
        }

        let Some(ase) = self.group.devices[device].ases.iter().position(|a| {
            a.active
                && a.cis_state == CisState::Connected
                && a.data_path_state == DataPathState::Configuring
                && a.cis_conn_handle == cis_conn_handle
        }) else {
            error!("cis {}: no ASE awaiting data path", cis_conn_handle);
            return;
        };
        self.group.devices[device].ases[ase].data_path_state = DataPathState::Configured;

        if self.group.target_state() != AseState::Streaming {
            warn!(
                "group {}: no longer targeting streaming",
                self.group.group_id
            );
            return;
        }

        let direction = self.group.devices[device].ases[ase].direction;
        self.group.add_cis_to_stream_configuration(device, ase);
        let group_id = self.group.group_id;
        self.push(Action::UpdatedCisConfiguration {
            group_id,
            direction,
        });

        if self.group.state() == AseState::Streaming && !self.late_join_pending() {
            // Late join finished; no more transitions outstanding.
            self.cancel_watchdog();
        }

        if self.group.notify_streaming_when_cises_are_ready
            && self.group.is_group_stream_ready()
        {
            self.group.notify_streaming_when_cises_are_ready = false;
            info!("group {}: ready to notify streaming", self.group.group_id);
            self.cancel_watchdog();
            if self.group.state() != AseState::Streaming {
                self.group.set_state(AseState::Streaming);
            }
            self.report(GroupStreamStatus::Streaming);
        }
    }

    /// An active ASE still has a connected CIS without its data path.
    fn late_join_pending(&self) -> bool {
        self.group.devices.iter().any(|d| {
            d.active_ases().any(|a| {
                a.cis_state == CisState::Connected && a.data_path_state == DataPathState::Idle
            })
        })
    }

    fn on_data_path_removed(&mut self, cis_conn_handle: u16, path_status: u8) {
        let Some(device) = self.group.device_index_by_cis_handle(cis_conn_handle) else {
            warn!("cis {}: data path removed for unknown CIS", cis_conn_handle);
            return;
        };
        if path_status != status::SUCCESS {
            // Disconnecting the CIS removes the data path as well; continue.
            error!(
                "cis {}: failed to remove data path, status {}",
                cis_conn_handle, path_status
            );
        }

        let pair = self.group.devices[device].ases_by_cis_handle(cis_conn_handle);
        let mut do_disconnect = false;

        if let Some(sink) = pair.sink {
            let ase = &mut self.group.devices[device].ases[sink];
            if ase.data_path_state == DataPathState::Removing {
                ase.data_path_state = DataPathState::Idle;
                if ase.cis_state == CisState::Connected {
                    ase.cis_state = CisState::Disconnecting;
                    do_disconnect = true;
                }
            }
        }
        let mut source_handled = false;
        if let Some(source) = pair.source {
            let ase = &mut self.group.devices[device].ases[source];
            if ase.data_path_state == DataPathState::Removing {
                source_handled = true;
                ase.data_path_state = DataPathState::Idle;
                if ase.cis_state == CisState::Connected {
                    ase.cis_state = CisState::Disconnecting;
                    do_disconnect = true;
                }
            }
        }
        let dsa_active = self.group.dsa.active;
        if !source_handled {
            let dev = &mut self.group.devices[device];
            if dsa_active && dev.dsa_data_path_state == DataPathState::Removing {
                info!("device {}: DSA data path removed", device);
                dev.dsa_data_path_state = DataPathState::Idle;
                dev.dsa_cis_handle = crate::group::INVALID_CIS_HANDLE;
            }
        }

        if do_disconnect {
            self.group
                .remove_cis_from_stream_configuration(cis_conn_handle);
            let group_id = self.group.group_id;
            self.push(Action::DisconnectCis {
                group_id,
                cis_conn_handle,
                reason: status::REMOTE_USER_TERMINATED,
            });
        }
    }

    fn on_acl_disconnected(&mut self, device: usize) {
        if self.group.devices.get(device).is_none() {
            return;
        }
        let group_id = self.group.group_id;

        // The ACL may drop before the CIS disconnection events arrive.
        let handles: Vec<u16, MAX_DEVICE_ASES> = self.group.devices[device]
            .ases
            .iter()
            .filter(|a| a.cis_conn_handle != crate::group::INVALID_CIS_HANDLE)
            .map(|a| a.cis_conn_handle)
            .collect();
        for handle in handles {
            if self.config.link_quality_watch {
                self.push(Action::StopLinkQualityWatch {
                    group_id,
                    cis_conn_handle: handle,
                });
            }
            self.group.remove_cis_from_stream_configuration(handle);
        }

        self.group.devices[device].deactivate_all_ases();
        self.group.devices[device].connection_state = DeviceConnectState::Disconnected;

        // Membership changed: cached configurations may no longer fit.
        self.group.devices[device].invalidate_cached_configurations();
        self.group.pending_available_contexts_change = true;

        if self.group.state() == AseState::Idle && !self.group.is_in_transition() {
            info!("group {}: is in IDLE", self.group.group_id);
            // A stale CIG would give Command Disallowed on the next create.
            if self.group.cig.state == CigState::Created {
                self.remove_cig();
            }
            return;
        }

        if self.group.is_any_device_connected() && !self.group.have_all_cises_disconnected() {
            if self.group.state() == AseState::Streaming
                && self.group.target_state() == AseState::Streaming
            {
                // Let the upper layer re-derive the CIS topology.
                self.report(GroupStreamStatus::Streaming);
            } else {
                warn!(
                    "group {}: not streaming but CISes are still up",
                    self.group.group_id
                );
            }
            return;
        }

        // Group is gone: no member connected, no CIS up.
        self.clear_group(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ascs::{CtpOpcode, TargetLatency};
    use crate::generic_audio::{
        AudioLocation, CodecConfiguration, ContextType, FrameDuration, SamplingFrequency,
    };
    use crate::group::{ContextConfig, Device, DirectionConfig};
    use trouble_host::prelude::BdAddr;

    const GROUP: u8 = 1;

    fn lc3(octets: u16) -> CodecConfiguration {
        CodecConfiguration {
            sampling_frequency: SamplingFrequency::Hz48000,
            frame_duration: FrameDuration::Duration10000Us,
            audio_channel_allocation: AudioLocation::MONO,
            octets_per_codec_frame: octets,
            codec_frame_blocks_per_sdu: 1,
        }
    }

    fn media_config() -> ContextConfig {
        let mut sink = DirectionConfig::new(lc3(100));
        sink.allocations
            .extend_from_slice(&[AudioLocation::FrontLeft, AudioLocation::FrontRight])
            .unwrap();
        sink.target_latency = TargetLatency::BalancedLatencyReliability;
        ContextConfig {
            context: ContextType::Media,
            sink: Some(sink),
            source: None,
            framing: crate::iso::Framing::Unframed,
        }
    }

    fn conversational_config() -> ContextConfig {
        let mut sink = DirectionConfig::new(lc3(40));
        sink.allocations
            .extend_from_slice(&[AudioLocation::FrontLeft, AudioLocation::FrontRight])
            .unwrap();
        ContextConfig {
            context: ContextType::Conversational,
            sink: Some(sink),
            source: Some(DirectionConfig::new(lc3(40))),
            framing: crate::iso::Framing::Unframed,
        }
    }

    fn add_device(machine: &mut UnicastStateMachine, ases: &[(u8, Direction)]) -> usize {
        let group = machine.group_mut(GROUP).unwrap();
        let index = group.devices.len();
        let mut device = Device::new(
            BdAddr::new([0, 0, 0, 0, 0, index as u8 + 1]),
            0x0010 + index as u16,
            100,
        );
        device.available_contexts = BidirectionalPair {
            sink: ContextType::Media | ContextType::Conversational,
            source: ContextType::Conversational,
        };
        for (id, direction) in ases {
            device.add_ase(*direction).unwrap();
            device.ases.last_mut().unwrap().id = *id;
        }
        group.devices.push(device).map_err(|_| ()).unwrap();
        index
    }

    fn machine_with(config: ContextConfig, devices: &[&[(u8, Direction)]]) -> UnicastStateMachine {
        let mut machine = UnicastStateMachine::new(UnicastConfig::default());
        machine.create_group(GROUP).unwrap();
        machine
            .group_mut(GROUP)
            .unwrap()
            .add_context_config(config)
            .unwrap();
        for ases in devices {
            add_device(&mut machine, ases);
        }
        machine
    }

    fn media_contexts() -> BidirectionalPair<ContextType> {
        BidirectionalPair {
            sink: ContextType::Media,
            source: ContextType::empty(),
        }
    }

    fn conversational_contexts() -> BidirectionalPair<ContextType> {
        BidirectionalPair {
            sink: ContextType::Conversational,
            source: ContextType::Conversational,
        }
    }

    fn no_ccids() -> BidirectionalPair<heapless::Vec<u8, MAX_CCIDS>> {
        BidirectionalPair::default()
    }

    fn drain(machine: &mut UnicastStateMachine) -> std::vec::Vec<Action> {
        machine.take_actions().into_iter().collect()
    }

    // --- notification builders (server side of the wire) ---

    fn codec_configured_ntf(ase_id: u8, max_transport_latency_ms: u16) -> std::vec::Vec<u8> {
        let mut data = vec![ase_id, 0x01];
        data.extend_from_slice(&[0x00, 0x03, 0x02]); // framing, 1M|2M, rtn 2
        data.extend_from_slice(&max_transport_latency_ms.to_le_bytes());
        data.extend_from_slice(&10000u32.to_le_bytes()[..3]);
        data.extend_from_slice(&40000u32.to_le_bytes()[..3]);
        data.extend_from_slice(&15000u32.to_le_bytes()[..3]);
        data.extend_from_slice(&40000u32.to_le_bytes()[..3]);
        data.extend_from_slice(&[0x06, 0x00, 0x00, 0x00, 0x00]);
        data.push(0x00);
        data
    }

    fn bare_ntf(ase_id: u8, state: u8) -> std::vec::Vec<u8> {
        vec![ase_id, state]
    }

    fn transient_ntf(ase_id: u8, state: u8) -> std::vec::Vec<u8> {
        vec![ase_id, state, GROUP, 0x00, 0x00]
    }

    // --- action matchers ---

    fn ctp_writes(actions: &[Action]) -> std::vec::Vec<(u8, u8)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::WriteControlPoint { device, value, .. } => Some((*device, value[0])),
                _ => None,
            })
            .collect()
    }

    fn has_report(actions: &[Action], wanted: GroupStreamStatus) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, Action::Report { status, .. } if *status == wanted))
    }

    fn cig_params(actions: &[Action]) -> Option<CigParameters> {
        actions.iter().find_map(|a| match a {
            Action::CreateCig { params, .. } => Some(params.clone()),
            _ => None,
        })
    }

    // --- flow drivers ---

    fn start_media(machine: &mut UnicastStateMachine) -> std::vec::Vec<Action> {
        machine
            .start_stream(GROUP, ContextType::Media, media_contexts(), &no_ccids())
            .unwrap();
        drain(machine)
    }

    /// Drive a one-device media group (sink ASE id 1) all the way to
    /// Streaming, returning the actions of the final step.
    fn media_to_streaming(machine: &mut UnicastStateMachine) -> std::vec::Vec<Action> {
        start_media(machine);
        machine.on_ase_status(GROUP, 0, 0, &codec_configured_ntf(1, 100));
        drain(machine);
        machine.on_cig_created(GROUP, status::SUCCESS, &[0x0060]);
        drain(machine);
        machine.on_ase_status(GROUP, 0, 0, &bare_ntf(1, 0x02));
        drain(machine);
        machine.on_ase_status(GROUP, 0, 0, &transient_ntf(1, 0x03));
        drain(machine);
        machine.on_cis_established(GROUP, 0x0060, status::SUCCESS);
        drain(machine);
        machine.on_ase_status(GROUP, 0, 0, &transient_ntf(1, 0x04));
        drain(machine);
        machine.on_data_path_setup(GROUP, 0x0060, status::SUCCESS);
        drain(machine)
    }

    #[test]
    fn single_device_media_start() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);

        let actions = start_media(&mut machine);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ArmTransitionTimer { .. })));
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::ConfigCodec as u8)]);

        // Codec Configured on the only ASE completes the phase and creates
        // the CIG.
        machine.on_ase_status(GROUP, 0, 0, &codec_configured_ntf(1, 100));
        let actions = drain(&mut machine);
        let params = cig_params(&actions).expect("cig create");
        assert_eq!(params.sdu_interval_mtos_us, 10000);
        assert_eq!(params.sdu_interval_stom_us, 0);
        assert!(params.max_transport_latency_mtos_ms >= 10);
        assert_eq!(params.cis.len(), 1);
        assert_eq!(params.cis[0].max_sdu_size_mtos, 100);
        assert_eq!(params.cis[0].max_sdu_size_stom, 0);
        // Unidirectional stream: the return PHY is forced to 1M.
        assert_eq!(params.cis[0].phy_stom, PhyMask::M1);

        machine.on_cig_created(GROUP, status::SUCCESS, &[0x0060]);
        let actions = drain(&mut machine);
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::ConfigQos as u8)]);
        assert_eq!(
            machine.group(GROUP).unwrap().state(),
            AseState::QosConfigured
        );

        machine.on_ase_status(GROUP, 0, 0, &bare_ntf(1, 0x02));
        let actions = drain(&mut machine);
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::Enable as u8)]);

        machine.on_ase_status(GROUP, 0, 0, &transient_ntf(1, 0x03));
        let actions = drain(&mut machine);
        let connections = actions
            .iter()
            .find_map(|a| match a {
                Action::EstablishCis { connections, .. } => Some(connections.clone()),
                _ => None,
            })
            .expect("establish cis");
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].cis_conn_handle, 0x0060);
        assert_eq!(connections[0].acl_conn_handle, 0x0010);

        machine.on_cis_established(GROUP, 0x0060, status::SUCCESS);
        let actions = drain(&mut machine);
        let setup = actions
            .iter()
            .find_map(|a| match a {
                Action::SetupDataPath { params, .. } => Some(params.clone()),
                _ => None,
            })
            .expect("data path setup");
        assert_eq!(setup.direction, iso::DATA_PATH_DIRECTION_INPUT);

        // The Streaming notification may beat the data path completion; the
        // report waits for both.
        machine.on_ase_status(GROUP, 0, 0, &transient_ntf(1, 0x04));
        let actions = drain(&mut machine);
        assert!(!has_report(&actions, GroupStreamStatus::Streaming));

        machine.on_data_path_setup(GROUP, 0x0060, status::SUCCESS);
        let actions = drain(&mut machine);
        assert!(has_report(&actions, GroupStreamStatus::Streaming));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::CancelTransitionTimer { .. })));

        let group = machine.group(GROUP).unwrap();
        assert_eq!(group.state(), AseState::Streaming);
        let params = group.stream_conf.params.get(Direction::Sink);
        assert_eq!(params.num_of_devices, 1);
        assert_eq!(params.num_of_channels, 1);
        assert_eq!(params.sample_frequency_hz, 48000);
    }

    #[test]
    fn two_device_conversational_start() {
        let ases: &[(u8, Direction)] = &[(1, Direction::Sink), (2, Direction::Source)];
        let mut machine = machine_with(conversational_config(), &[ases, ases]);

        machine
            .start_stream(
                GROUP,
                ContextType::Conversational,
                conversational_contexts(),
                &no_ccids(),
            )
            .unwrap();
        let actions = drain(&mut machine);
        assert_eq!(
            ctp_writes(&actions),
            vec![
                (0, CtpOpcode::ConfigCodec as u8),
                (1, CtpOpcode::ConfigCodec as u8)
            ]
        );

        // One bidirectional CIS per device.
        {
            let group = machine.group(GROUP).unwrap();
            assert_eq!(group.cig.cises.len(), 2);
            assert!(group
                .cig
                .cises
                .iter()
                .all(|c| c.cis_type == CisType::Bidirectional));
        }

        for (device, ase, id) in [(0, 0, 1), (0, 1, 2), (1, 0, 1), (1, 1, 2)] {
            machine.on_ase_status(GROUP, device, ase, &codec_configured_ntf(id, 100));
        }
        let actions = drain(&mut machine);
        let params = cig_params(&actions).expect("cig create");
        assert_eq!(params.sdu_interval_mtos_us, 10000);
        assert_eq!(params.sdu_interval_stom_us, 10000);
        assert_eq!(params.cis.len(), 2);
        assert!(params.cis.iter().all(|c| c.max_sdu_size_mtos == 40));
        assert!(params.cis.iter().all(|c| c.max_sdu_size_stom == 40));

        machine.on_cig_created(GROUP, status::SUCCESS, &[0x0060, 0x0061]);
        let actions = drain(&mut machine);
        assert_eq!(
            ctp_writes(&actions),
            vec![(0, CtpOpcode::ConfigQos as u8), (1, CtpOpcode::ConfigQos as u8)]
        );

        for (device, ase, id) in [(0, 0, 1), (0, 1, 2), (1, 0, 1), (1, 1, 2)] {
            machine.on_ase_status(GROUP, device, ase, &bare_ntf(id, 0x02));
        }
        let actions = drain(&mut machine);
        assert_eq!(
            ctp_writes(&actions),
            vec![(0, CtpOpcode::Enable as u8), (1, CtpOpcode::Enable as u8)]
        );

        for (device, ase, id) in [(0, 0, 1), (0, 1, 2), (1, 0, 1), (1, 1, 2)] {
            machine.on_ase_status(GROUP, device, ase, &transient_ntf(id, 0x03));
        }
        let actions = drain(&mut machine);
        let connections = actions
            .iter()
            .find_map(|a| match a {
                Action::EstablishCis { connections, .. } => Some(connections.clone()),
                _ => None,
            })
            .expect("establish cis");
        assert_eq!(connections.len(), 2);

        // Each established CIS sets up both data path directions, then the
        // source ASE gets its Receiver Start Ready.
        machine.on_cis_established(GROUP, 0x0060, status::SUCCESS);
        let actions = drain(&mut machine);
        let directions: std::vec::Vec<u8> = actions
            .iter()
            .filter_map(|a| match a {
                Action::SetupDataPath { params, .. } => Some(params.direction),
                _ => None,
            })
            .collect();
        assert_eq!(
            directions,
            vec![iso::DATA_PATH_DIRECTION_INPUT, iso::DATA_PATH_DIRECTION_OUTPUT]
        );
        assert_eq!(
            ctp_writes(&actions),
            vec![(0, CtpOpcode::ReceiverStartReady as u8)]
        );

        machine.on_cis_established(GROUP, 0x0061, status::SUCCESS);
        let actions = drain(&mut machine);
        assert_eq!(
            ctp_writes(&actions),
            vec![(1, CtpOpcode::ReceiverStartReady as u8)]
        );

        for handle in [0x0060u16, 0x0061] {
            machine.on_data_path_setup(GROUP, handle, status::SUCCESS);
            machine.on_data_path_setup(GROUP, handle, status::SUCCESS);
        }
        drain(&mut machine);

        for (device, ase, id) in [(0, 0, 1), (0, 1, 2), (1, 0, 1)] {
            machine.on_ase_status(GROUP, device, ase, &transient_ntf(id, 0x04));
            assert!(!has_report(&drain(&mut machine), GroupStreamStatus::Streaming));
        }
        machine.on_ase_status(GROUP, 1, 1, &transient_ntf(2, 0x04));
        let actions = drain(&mut machine);
        assert!(has_report(&actions, GroupStreamStatus::Streaming));
        assert_eq!(machine.group(GROUP).unwrap().state(), AseState::Streaming);
    }

    #[test]
    fn cig_command_disallowed_recovers_once() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);
        start_media(&mut machine);
        machine.on_ase_status(GROUP, 0, 0, &codec_configured_ntf(1, 100));
        drain(&mut machine);

        machine.on_cig_created(GROUP, status::COMMAND_DISALLOWED, &[]);
        let actions = drain(&mut machine);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::RemoveCig { force: true, .. })));
        assert_eq!(
            machine.group(GROUP).unwrap().cig.state,
            CigState::Recovering
        );

        // Forced removal done: exactly one more create attempt.
        machine.on_cig_removed(GROUP, status::SUCCESS);
        let actions = drain(&mut machine);
        assert!(cig_params(&actions).is_some());
        assert_eq!(machine.group(GROUP).unwrap().cig.state, CigState::Creating);

        machine.on_cig_created(GROUP, status::SUCCESS, &[0x0060]);
        let actions = drain(&mut machine);
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::ConfigQos as u8)]);
    }

    #[test]
    fn cig_create_failure_stops_stream() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);
        start_media(&mut machine);
        machine.on_ase_status(GROUP, 0, 0, &codec_configured_ntf(1, 100));
        drain(&mut machine);

        machine.on_cig_created(GROUP, 0x11, &[]);
        let actions = drain(&mut machine);
        assert_eq!(machine.group(GROUP).unwrap().cig.state, CigState::None);
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::Release as u8)]);
        assert!(has_report(&actions, GroupStreamStatus::Releasing));
    }

    #[test]
    fn cis_establishment_retries_twice_then_aborts() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);
        start_media(&mut machine);
        machine.on_ase_status(GROUP, 0, 0, &codec_configured_ntf(1, 100));
        drain(&mut machine);
        machine.on_cig_created(GROUP, status::SUCCESS, &[0x0060]);
        drain(&mut machine);
        machine.on_ase_status(GROUP, 0, 0, &bare_ntf(1, 0x02));
        drain(&mut machine);
        machine.on_ase_status(GROUP, 0, 0, &transient_ntf(1, 0x03));
        drain(&mut machine);

        for _ in 0..2 {
            machine.on_cis_established(
                GROUP,
                0x0060,
                status::CONNECTION_FAILED_TO_BE_ESTABLISHED,
            );
            let actions = drain(&mut machine);
            assert!(
                actions
                    .iter()
                    .any(|a| matches!(a, Action::EstablishCis { .. })),
                "retry expected"
            );
        }

        // Third failure in a row aborts the stream and tears the CIG down.
        machine.on_cis_established(
            GROUP,
            0x0060,
            status::CONNECTION_FAILED_TO_BE_ESTABLISHED,
        );
        let actions = drain(&mut machine);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::EstablishCis { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::RemoveCig { .. })));
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::Release as u8)]);
    }

    #[test]
    fn ctp_reject_during_setup_stops_stream_once() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);
        start_media(&mut machine);
        machine.on_ase_status(GROUP, 0, 0, &codec_configured_ntf(1, 100));
        drain(&mut machine);

        // Config QoS rejected: Invalid ASE state machine transition.
        machine.on_ctp_notification(GROUP, &[0x02, 1, 1, 0x04, 0x00]);
        let actions = drain(&mut machine);
        assert_eq!(machine.stats().stream_create_signaling_failed, 1);
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::Release as u8)]);
        assert!(has_report(&actions, GroupStreamStatus::Releasing));

        // Further results for the aborted transition are ignored.
        machine.on_ctp_notification(GROUP, &[0x03, 1, 1, 0x04, 0x00]);
        assert_eq!(machine.stats().stream_create_signaling_failed, 1);
    }

    #[test]
    fn suspend_reaches_suspended_and_keeps_cig() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);
        media_to_streaming(&mut machine);

        machine.suspend_stream(GROUP).unwrap();
        let actions = drain(&mut machine);
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::Disable as u8)]);
        assert!(has_report(&actions, GroupStreamStatus::Suspending));

        // Sink ASE falls straight to QoS Configured; data path and CIS are
        // torn down afterwards.
        machine.on_ase_status(GROUP, 0, 0, &bare_ntf(1, 0x02));
        let actions = drain(&mut machine);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::RemoveDataPath { cis_conn_handle: 0x0060, .. })));

        machine.on_data_path_removed(GROUP, 0x0060, status::SUCCESS);
        let actions = drain(&mut machine);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::DisconnectCis { cis_conn_handle: 0x0060, .. })));

        machine.on_cis_disconnected(
            GROUP,
            0x0060,
            status::CONNECTION_TERMINATED_BY_LOCAL_HOST,
        );
        let actions = drain(&mut machine);
        assert!(has_report(&actions, GroupStreamStatus::Suspended));

        let group = machine.group(GROUP).unwrap();
        assert_eq!(group.state(), AseState::QosConfigured);
        assert_eq!(group.cig.state, CigState::Created);
        assert!(group.have_all_cises_disconnected());
    }

    #[test]
    fn suspend_then_start_skips_cig_creation() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);
        media_to_streaming(&mut machine);
        machine.suspend_stream(GROUP).unwrap();
        drain(&mut machine);
        machine.on_ase_status(GROUP, 0, 0, &bare_ntf(1, 0x02));
        drain(&mut machine);
        machine.on_data_path_removed(GROUP, 0x0060, status::SUCCESS);
        drain(&mut machine);
        machine.on_cis_disconnected(
            GROUP,
            0x0060,
            status::CONNECTION_TERMINATED_BY_LOCAL_HOST,
        );
        drain(&mut machine);

        // Restart from QoS Configured: straight to Enable, no new CIG.
        machine
            .start_stream(GROUP, ContextType::Media, media_contexts(), &no_ccids())
            .unwrap();
        let actions = drain(&mut machine);
        assert!(cig_params(&actions).is_none());
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::Enable as u8)]);
        assert_eq!(machine.group(GROUP).unwrap().cig.state, CigState::Created);
    }

    #[test]
    fn stop_stream_returns_group_to_idle() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);
        media_to_streaming(&mut machine);

        machine.stop_stream(GROUP).unwrap();
        let actions = drain(&mut machine);
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::Release as u8)]);
        assert!(has_report(&actions, GroupStreamStatus::Releasing));

        machine.on_ase_status(GROUP, 0, 0, &bare_ntf(1, 0x06));
        let actions = drain(&mut machine);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::RemoveDataPath { .. })));

        machine.on_data_path_removed(GROUP, 0x0060, status::SUCCESS);
        drain(&mut machine);
        machine.on_cis_disconnected(
            GROUP,
            0x0060,
            status::CONNECTION_TERMINATED_BY_LOCAL_HOST,
        );
        let actions = drain(&mut machine);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::RemoveCig { force: false, .. })));

        machine.on_ase_status(GROUP, 0, 0, &bare_ntf(1, 0x00));
        let actions = drain(&mut machine);
        assert!(has_report(&actions, GroupStreamStatus::Idle));

        machine.on_cig_removed(GROUP, status::SUCCESS);
        drain(&mut machine);

        let group = machine.group(GROUP).unwrap();
        assert_eq!(group.state(), AseState::Idle);
        assert_eq!(group.target_state(), AseState::Idle);
        assert_eq!(group.cig.state, CigState::None);
        assert!(group.cig.cises.is_empty());
        assert!(group.have_all_cises_disconnected());
        assert!(group.devices[0].ases.iter().all(|a| !a.has_cis()));
    }

    #[test]
    fn watchdog_expiry_reports_timeout() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);
        start_media(&mut machine);
        machine.on_ase_status(GROUP, 0, 0, &codec_configured_ntf(1, 100));
        drain(&mut machine);

        // The CIG completion never arrives; the driver fires the armed
        // watchdog.
        machine.on_transition_timeout(GROUP);
        let actions = drain(&mut machine);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ReportTransitionTimeout { group_id: GROUP })));

        // The upper layer reacts with a stop.
        machine.stop_stream(GROUP).unwrap();
        let actions = drain(&mut machine);
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::Release as u8)]);

        machine.on_ase_status(GROUP, 0, 0, &bare_ntf(1, 0x06));
        drain(&mut machine);
        machine.on_ase_status(GROUP, 0, 0, &bare_ntf(1, 0x00));
        let actions = drain(&mut machine);
        assert!(has_report(&actions, GroupStreamStatus::Idle));
    }

    #[test]
    fn configure_stream_reports_configured_by_user() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);
        machine
            .configure_stream(GROUP, ContextType::Media, media_contexts(), &no_ccids())
            .unwrap();
        let actions = drain(&mut machine);
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::ConfigCodec as u8)]);
        assert!(machine.group(GROUP).unwrap().pending_configuration);

        machine.on_ase_status(GROUP, 0, 0, &codec_configured_ntf(1, 100));
        let actions = drain(&mut machine);
        assert!(has_report(&actions, GroupStreamStatus::ConfiguredByUser));
        assert!(!machine.group(GROUP).unwrap().pending_configuration);
        assert_eq!(
            machine.group(GROUP).unwrap().state(),
            AseState::CodecConfigured
        );

        // Starting for the same context reuses the cached configuration:
        // no Config Codec phase, the CIG is created right away.
        machine
            .start_stream(GROUP, ContextType::Media, media_contexts(), &no_ccids())
            .unwrap();
        let actions = drain(&mut machine);
        assert!(ctp_writes(&actions).is_empty());
        assert!(cig_params(&actions).is_some());
    }

    #[test]
    fn late_reconnect_with_tighter_latency_forces_reconfiguration() {
        let ases: &[(u8, Direction)] = &[(1, Direction::Sink)];
        let mut machine = machine_with(media_config(), &[ases, ases]);
        machine
            .group_mut(GROUP)
            .unwrap()
            .devices[1]
            .connection_state = DeviceConnectState::Disconnected;

        media_to_streaming(&mut machine);
        assert_eq!(machine.group(GROUP).unwrap().state(), AseState::Streaming);

        // The second member reconnects and is attached to the stream:
        // Config Codec goes only to it.
        machine.group_mut(GROUP).unwrap().devices[1].connection_state =
            DeviceConnectState::Connected;
        machine.attach_to_stream(GROUP, 1, &no_ccids()).unwrap();
        let actions = drain(&mut machine);
        assert_eq!(ctp_writes(&actions), vec![(1, CtpOpcode::ConfigCodec as u8)]);
        assert_eq!(machine.group(GROUP).unwrap().state(), AseState::Streaming);

        // Its ASE cannot carry the CIG's max transport latency: reconfigure
        // on the next start.
        machine.on_ase_status(GROUP, 1, 0, &codec_configured_ntf(1, 15));
        let actions = drain(&mut machine);
        assert!(machine.group(GROUP).unwrap().pending_configuration);
        assert_eq!(
            ctp_writes(&actions),
            vec![(0, CtpOpcode::Release as u8), (1, CtpOpcode::Release as u8)]
        );
    }

    #[test]
    fn autonomous_sink_disable_arms_partner_timer() {
        let ases: &[(u8, Direction)] = &[(1, Direction::Sink), (2, Direction::Source)];
        let mut machine = machine_with(conversational_config(), &[ases]);

        machine
            .start_stream(
                GROUP,
                ContextType::Conversational,
                conversational_contexts(),
                &no_ccids(),
            )
            .unwrap();
        drain(&mut machine);
        for (ase, id) in [(0, 1), (1, 2)] {
            machine.on_ase_status(GROUP, 0, ase, &codec_configured_ntf(id, 100));
        }
        drain(&mut machine);
        machine.on_cig_created(GROUP, status::SUCCESS, &[0x0060]);
        drain(&mut machine);
        for (ase, id) in [(0, 1), (1, 2)] {
            machine.on_ase_status(GROUP, 0, ase, &bare_ntf(id, 0x02));
        }
        drain(&mut machine);
        for (ase, id) in [(0, 1), (1, 2)] {
            machine.on_ase_status(GROUP, 0, ase, &transient_ntf(id, 0x03));
        }
        drain(&mut machine);
        machine.on_cis_established(GROUP, 0x0060, status::SUCCESS);
        drain(&mut machine);
        machine.on_data_path_setup(GROUP, 0x0060, status::SUCCESS);
        machine.on_data_path_setup(GROUP, 0x0060, status::SUCCESS);
        drain(&mut machine);
        for (ase, id) in [(0, 1), (1, 2)] {
            machine.on_ase_status(GROUP, 0, ase, &transient_ntf(id, 0x04));
        }
        drain(&mut machine);
        assert_eq!(machine.group(GROUP).unwrap().state(), AseState::Streaming);

        // The server autonomously disables the sink half of the
        // bidirectional CIS; a timer watches the stuck source half.
        machine.on_ase_status(GROUP, 0, 0, &bare_ntf(1, 0x02));
        let actions = drain(&mut machine);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::ArmAutonomousTimer {
                device: 0,
                ase: 1,
                ..
            }
        )));

        // The source half follows into Disabling: the timer is disarmed, and
        // since the host never asked for a suspend the group backs out of
        // the stream.
        machine.on_ase_status(GROUP, 0, 1, &transient_ntf(2, 0x05));
        let actions = drain(&mut machine);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::CancelAutonomousTimer {
                device: 0,
                ase: 1,
                ..
            }
        )));
        assert_eq!(ctp_writes(&actions), vec![(0, CtpOpcode::Release as u8)]);
        assert!(has_report(&actions, GroupStreamStatus::Releasing));
    }

    #[test]
    fn acl_disconnect_of_last_member_clears_group() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);
        media_to_streaming(&mut machine);

        machine.on_acl_disconnected(GROUP, 0);
        let actions = drain(&mut machine);
        assert!(has_report(&actions, GroupStreamStatus::Idle));
        let group = machine.group(GROUP).unwrap();
        assert_eq!(group.state(), AseState::Idle);
        assert!(!group.has_active_device());
        assert_eq!(
            group.devices[0].connection_state,
            DeviceConnectState::Disconnected
        );
    }

    #[test]
    fn start_for_unknown_context_is_rejected() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);
        let result = machine.start_stream(
            GROUP,
            ContextType::Game,
            BidirectionalPair {
                sink: ContextType::Game,
                source: ContextType::empty(),
            },
            &no_ccids(),
        );
        assert_eq!(result, Err(RequestError::ContextUnavailable));
        assert_eq!(machine.stats().stream_context_not_available, 1);
        assert_eq!(machine.group(GROUP).unwrap().state(), AseState::Idle);
    }

    #[test]
    fn metadata_only_start_while_streaming() {
        let mut machine = machine_with(media_config(), &[&[(1, Direction::Sink)]]);
        media_to_streaming(&mut machine);

        // Same metadata: nothing to send.
        machine
            .start_stream(GROUP, ContextType::Media, media_contexts(), &no_ccids())
            .unwrap();
        assert!(ctp_writes(&drain(&mut machine)).is_empty());

        // Changed contexts: Update Metadata to the affected device.
        let contexts = BidirectionalPair {
            sink: ContextType::Media | ContextType::Conversational,
            source: ContextType::empty(),
        };
        machine
            .start_stream(GROUP, ContextType::Media, contexts, &no_ccids())
            .unwrap();
        let actions = drain(&mut machine);
        assert_eq!(
            ctp_writes(&actions),
            vec![(0, CtpOpcode::UpdateMetadata as u8)]
        );
    }
}
