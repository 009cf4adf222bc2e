//! Session loop tying the state machine to an embassy executor.
//!
//! All event sources funnel into one channel: stream commands from the
//! audio transport, ASE status and control point notifications from the
//! GATT client, CIG/CIS/data-path completions from the ISO manager and the
//! timer expiries kept in [`TimerTable`]. The loop pops one event at a
//! time, lets the state machine reduce it and then executes the resulting
//! actions, so no handler ever runs concurrently with another.
//!
//! The GATT client and the ISO manager stay outside this crate; the
//! embedder implements [`UnicastOps`] on top of its host stack (e.g. a
//! trouble-host `GattClient` for the control point writes) and feeds
//! notifications back through the [`UnicastHandle`].

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_time::{Duration, Instant, Timer};
use static_cell::StaticCell;

use crate::iso::{CigParameters, CisConnection, DataPathParameters};
use crate::state_machine::{
    Action, GroupStreamStatus, StreamCommand, UnicastConfig, UnicastEvent, UnicastStateMachine,
};
use crate::watchdog::{TimerKey, TimerTable};
use crate::Direction;

/// Events the inbox can hold before senders are back-pressured.
pub const INBOX_DEPTH: usize = 8;

/// The session inbox. Allocate it where the session and its feeders can
/// both reach it, typically through [`InboxStorage`].
pub type UnicastChannel<M> = Channel<M, UnicastEvent, INBOX_DEPTH>;

/// Static storage for the session inbox, for the common one-session setup:
///
/// ```ignore
/// static INBOX: InboxStorage<NoopRawMutex> = InboxStorage::new();
/// let (mut session, handle) =
///     UnicastSession::new(UnicastConfig::default(), INBOX.init(), ops, events);
/// ```
pub struct InboxStorage<M: RawMutex + 'static> {
    channel: StaticCell<UnicastChannel<M>>,
}

impl<M: RawMutex + 'static> InboxStorage<M> {
    pub const fn new() -> Self {
        Self {
            channel: StaticCell::new(),
        }
    }

    /// Hand out the channel; panics if called twice.
    pub fn init(&'static self) -> &'static UnicastChannel<M> {
        self.channel.init(Channel::new())
    }
}

/// Outbound primitives, implemented by the embedder on its GATT client and
/// ISO manager. Calls are fire-and-forget: failures surface as the absence
/// of a completion event and the watchdog cleans up.
pub trait UnicastOps {
    async fn write_control_point(
        &mut self,
        group_id: u8,
        device: u8,
        value: &[u8],
        long_write: bool,
    );
    async fn create_cig(&mut self, cig_id: u8, params: &CigParameters);
    async fn remove_cig(&mut self, cig_id: u8, force: bool);
    async fn establish_cis(&mut self, connections: &[CisConnection]);
    async fn disconnect_cis(&mut self, cis_conn_handle: u16, reason: u8);
    async fn setup_iso_data_path(&mut self, cis_conn_handle: u16, params: &DataPathParameters);
    async fn remove_iso_data_path(&mut self, cis_conn_handle: u16, direction_mask: u8);
    async fn read_iso_link_quality(&mut self, cis_conn_handle: u16);
}

/// Status callbacks towards the upper audio layer.
pub trait UnicastEvents {
    fn on_status_report(&mut self, group_id: u8, status: GroupStreamStatus);
    fn on_state_transition_timeout(&mut self, group_id: u8);
    fn on_updated_cis_configuration(&mut self, group_id: u8, direction: Direction);
    fn on_device_autonomous_transition_timeout(&mut self, group_id: u8, device: u8);
}

/// Cloneable feeder side of the session inbox.
pub struct UnicastHandle<'ch, M: RawMutex> {
    sender: Sender<'ch, M, UnicastEvent, INBOX_DEPTH>,
}

impl<M: RawMutex> Clone for UnicastHandle<'_, M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender,
        }
    }
}

impl<'ch, M: RawMutex> UnicastHandle<'ch, M> {
    /// Post a raw event; waits while the inbox is full.
    pub async fn post(&self, event: UnicastEvent) {
        self.sender.send(event).await;
    }

    pub async fn command(&self, command: StreamCommand) {
        self.post(UnicastEvent::Command(command)).await;
    }
}

/// The single owner of the state machine and its timers.
pub struct UnicastSession<'ch, M: RawMutex, O: UnicastOps, E: UnicastEvents> {
    machine: UnicastStateMachine,
    inbox: Receiver<'ch, M, UnicastEvent, INBOX_DEPTH>,
    ops: O,
    events: E,
    timers: TimerTable,
}

impl<'ch, M: RawMutex, O: UnicastOps, E: UnicastEvents> UnicastSession<'ch, M, O, E> {
    pub fn new(
        config: UnicastConfig,
        channel: &'ch UnicastChannel<M>,
        ops: O,
        events: E,
    ) -> (Self, UnicastHandle<'ch, M>) {
        let session = Self {
            machine: UnicastStateMachine::new(config),
            inbox: channel.receiver(),
            ops,
            events,
            timers: TimerTable::new(),
        };
        let handle = UnicastHandle {
            sender: channel.sender(),
        };
        (session, handle)
    }

    /// Group and device setup, e.g. after discovery.
    pub fn machine(&mut self) -> &mut UnicastStateMachine {
        &mut self.machine
    }

    /// Serve the inbox forever.
    pub async fn run(&mut self) -> ! {
        loop {
            let event = self.next_event().await;
            self.machine.handle(event);
            self.execute_actions().await;
        }
    }

    async fn next_event(&mut self) -> UnicastEvent {
        loop {
            let Some(deadline) = self.timers.next_deadline() else {
                return self.inbox.receive().await;
            };
            match select(self.inbox.receive(), Timer::at(deadline)).await {
                Either::First(event) => return event,
                Either::Second(()) => {
                    let Some(key) = self.timers.pop_expired(Instant::now()) else {
                        continue;
                    };
                    match key {
                        TimerKey::Transition { group_id } => {
                            return UnicastEvent::TransitionTimeout { group_id };
                        }
                        TimerKey::Autonomous {
                            group_id, device, ..
                        } => {
                            return UnicastEvent::AutonomousTimeout { group_id, device };
                        }
                        TimerKey::LinkQuality {
                            cis_conn_handle, ..
                        } => {
                            // Handled here; the read completion enters the
                            // inbox as a LinkQuality event.
                            self.ops.read_iso_link_quality(cis_conn_handle).await;
                        }
                    }
                }
            }
        }
    }

    async fn execute_actions(&mut self) {
        let now = Instant::now();
        for action in self.machine.take_actions() {
            match action {
                Action::WriteControlPoint {
                    group_id,
                    device,
                    value,
                    long_write,
                } => {
                    self.ops
                        .write_control_point(group_id, device, &value, long_write)
                        .await;
                }
                Action::CreateCig { group_id, params } => {
                    self.ops.create_cig(group_id, &params).await;
                }
                Action::RemoveCig { group_id, force } => {
                    self.ops.remove_cig(group_id, force).await;
                }
                Action::EstablishCis { connections, .. } => {
                    self.ops.establish_cis(&connections).await;
                }
                Action::DisconnectCis {
                    cis_conn_handle,
                    reason,
                    ..
                } => {
                    self.ops.disconnect_cis(cis_conn_handle, reason).await;
                }
                Action::SetupDataPath {
                    cis_conn_handle,
                    params,
                    ..
                } => {
                    self.ops
                        .setup_iso_data_path(cis_conn_handle, &params)
                        .await;
                }
                Action::RemoveDataPath {
                    cis_conn_handle,
                    direction_mask,
                    ..
                } => {
                    self.ops
                        .remove_iso_data_path(cis_conn_handle, direction_mask)
                        .await;
                }
                Action::ArmTransitionTimer {
                    group_id,
                    timeout_ms,
                } => {
                    self.timers.arm(
                        TimerKey::Transition { group_id },
                        now,
                        Duration::from_millis(timeout_ms as u64),
                    );
                }
                Action::CancelTransitionTimer { group_id } => {
                    self.timers.cancel(TimerKey::Transition { group_id });
                }
                Action::ArmAutonomousTimer {
                    group_id,
                    device,
                    ase,
                    timeout_ms,
                } => {
                    self.timers.arm(
                        TimerKey::Autonomous {
                            group_id,
                            device,
                            ase,
                        },
                        now,
                        Duration::from_millis(timeout_ms as u64),
                    );
                }
                Action::CancelAutonomousTimer {
                    group_id,
                    device,
                    ase,
                } => {
                    self.timers.cancel(TimerKey::Autonomous {
                        group_id,
                        device,
                        ase,
                    });
                }
                Action::StartLinkQualityWatch {
                    group_id,
                    cis_conn_handle,
                    interval_ms,
                } => {
                    self.timers.arm_periodic(
                        TimerKey::LinkQuality {
                            group_id,
                            cis_conn_handle,
                        },
                        now,
                        Duration::from_millis(interval_ms as u64),
                    );
                }
                Action::StopLinkQualityWatch {
                    group_id,
                    cis_conn_handle,
                } => {
                    self.timers.cancel(TimerKey::LinkQuality {
                        group_id,
                        cis_conn_handle,
                    });
                }
                Action::Report { group_id, status } => {
                    self.events.on_status_report(group_id, status);
                }
                Action::ReportTransitionTimeout { group_id } => {
                    self.events.on_state_transition_timeout(group_id);
                }
                Action::ReportAutonomousTimeout { group_id, device } => {
                    self.events
                        .on_device_autonomous_transition_timeout(group_id, device);
                }
                Action::UpdatedCisConfiguration {
                    group_id,
                    direction,
                } => {
                    self.events.on_updated_cis_configuration(group_id, direction);
                }
            }
        }
    }
}
