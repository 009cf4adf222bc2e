//! Audio transport boundary.
//!
//! Bridges the upper audio stack to the group state machine: the
//! start/suspend/stop handshake, latency mode selection, PCM configuration
//! and the presentation position bookkeeping. The start handshake is racy
//! by nature: the resume callback may confirm or cancel the stream before
//! or after it returns, so the request state is reconciled against five
//! sentinel values exactly once per attempt. The canonical path protects
//! that reconciliation with a mutex; the legacy lock-free CAS sequence is
//! kept behind the (default-on) `start-stream-race-fix` feature's absence.

#[cfg(not(feature = "start-stream-race-fix"))]
use core::marker::PhantomData;
#[cfg(not(feature = "start-stream-race-fix"))]
use core::sync::atomic::{AtomicU8, Ordering};

#[cfg(feature = "start-stream-race-fix")]
use core::cell::Cell;
#[cfg(feature = "start-stream-race-fix")]
use embassy_sync::blocking_mutex::Mutex;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Instant;

use crate::generic_audio::ContextType;
use crate::{DsaMode, LatencyMode};

/// Result of a start/suspend request towards the audio stack.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRequestStatus {
    SuccessFinished,
    Pending,
    Failure,
}

/// Where the current start attempt stands.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StartRequestState {
    Idle = 0,
    PendingBeforeResume = 1,
    PendingAfterResume = 2,
    Confirmed = 3,
    Canceled = 4,
}

impl StartRequestState {
    #[cfg(not(feature = "start-stream-race-fix"))]
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => StartRequestState::PendingBeforeResume,
            2 => StartRequestState::PendingAfterResume,
            3 => StartRequestState::Confirmed,
            4 => StartRequestState::Canceled,
            _ => StartRequestState::Idle,
        }
    }
}

/// One audio track of a metadata update.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataTrack {
    pub contexts: ContextType,
}

/// Callbacks into the stream owner.
pub trait StreamHooks {
    /// Resume (or start) the stream. Returning false fails the request.
    fn on_resume(&mut self, start: bool) -> bool;
    /// Suspend the stream. Returning false fails the request.
    fn on_suspend(&mut self) -> bool;
    /// Drop any audio buffered towards the peer.
    fn flush(&mut self);
    fn on_source_metadata_update(&mut self, tracks: &[MetadataTrack], dsa_mode: DsaMode);
    fn on_sink_metadata_update(&mut self, tracks: &[MetadataTrack]);
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelMode {
    Mono,
    Stereo,
    #[default]
    Unknown,
}

impl ChannelMode {
    pub fn from_channel_count(channels: u8) -> Self {
        match channels {
            1 => ChannelMode::Mono,
            2 => ChannelMode::Stereo,
            _ => ChannelMode::Unknown,
        }
    }
}

/// PCM format agreed with the audio stack.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmConfiguration {
    pub sample_rate_hz: u32,
    pub bits_per_sample: u8,
    pub channel_mode: ChannelMode,
    pub data_interval_us: u32,
}

impl Default for PcmConfiguration {
    fn default() -> Self {
        Self {
            sample_rate_hz: 16000,
            bits_per_sample: 16,
            channel_mode: ChannelMode::Stereo,
            data_interval_us: 0,
        }
    }
}

/// Playback position as reported to the audio stack.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationPosition {
    pub remote_delay_ns: u64,
    pub total_bytes_processed: u64,
    /// Monotonic timestamp of the last processed chunk.
    pub timestamp: Option<Instant>,
}

#[cfg(feature = "start-stream-race-fix")]
struct StartState<M: RawMutex>(Mutex<M, Cell<StartRequestState>>);

#[cfg(feature = "start-stream-race-fix")]
impl<M: RawMutex> StartState<M> {
    fn new() -> Self {
        Self(Mutex::new(Cell::new(StartRequestState::Idle)))
    }

    fn get(&self) -> StartRequestState {
        self.0.lock(|cell| cell.get())
    }

    fn set(&self, state: StartRequestState) {
        self.0.lock(|cell| cell.set(state));
    }

    /// Apply one state transition atomically with respect to every other
    /// reconciliation.
    fn reconcile<R>(&self, f: impl Fn(StartRequestState) -> (StartRequestState, R)) -> R {
        self.0.lock(|cell| {
            let (state, result) = f(cell.get());
            cell.set(state);
            result
        })
    }
}

#[cfg(not(feature = "start-stream-race-fix"))]
struct StartState<M: RawMutex>(AtomicU8, PhantomData<M>);

#[cfg(not(feature = "start-stream-race-fix"))]
impl<M: RawMutex> StartState<M> {
    fn new() -> Self {
        Self(
            AtomicU8::new(StartRequestState::Idle as u8),
            PhantomData,
        )
    }

    fn get(&self) -> StartRequestState {
        StartRequestState::from_raw(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: StartRequestState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn compare_exchange(&self, expected: StartRequestState, new: StartRequestState) -> bool {
        self.0
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn reconcile<R>(&self, f: impl Fn(StartRequestState) -> (StartRequestState, R)) -> R {
        loop {
            let current = self.get();
            let (state, result) = f(current);
            if self.compare_exchange(current, state) {
                return result;
            }
        }
    }
}

/// The audio stack facing half of the unicast client: one instance per
/// stream direction session.
pub struct AudioTransport<M: RawMutex, H: StreamHooks> {
    hooks: H,
    start_request_state: StartState<M>,
    remote_delay_ms: u16,
    total_bytes_processed: u64,
    position_timestamp: Option<Instant>,
    pcm: PcmConfiguration,
    dsa_mode: DsaMode,
}

impl<M: RawMutex, H: StreamHooks> AudioTransport<M, H> {
    pub fn new(hooks: H, pcm: PcmConfiguration) -> Self {
        Self {
            hooks,
            start_request_state: StartState::new(),
            remote_delay_ms: 0,
            total_bytes_processed: 0,
            position_timestamp: None,
            pcm,
            dsa_mode: DsaMode::Disabled,
        }
    }

    pub fn start_request_state(&self) -> StartRequestState {
        self.start_request_state.get()
    }

    pub fn set_start_request_state(&self, state: StartRequestState) {
        self.start_request_state.set(state);
    }

    pub fn clear_start_request_state(&self) {
        self.start_request_state.set(StartRequestState::Idle);
    }

    /// Start the stream. Returns `Pending` while the group transition is
    /// still in flight; the later confirm/cancel resolves it.
    #[cfg(feature = "start-stream-race-fix")]
    pub fn start_request(&mut self, _is_low_latency: bool) -> StartRequestStatus {
        if self.start_request_state.get() == StartRequestState::PendingAfterResume {
            info!("start request already pending, ignoring");
            return StartRequestStatus::Pending;
        }
        self.start_request_state
            .set(StartRequestState::PendingBeforeResume);
        if self.hooks.on_resume(true) {
            return self.start_request_state.reconcile(|state| match state {
                StartRequestState::Confirmed => {
                    (StartRequestState::Idle, StartRequestStatus::SuccessFinished)
                }
                StartRequestState::Canceled => {
                    (StartRequestState::Idle, StartRequestStatus::Failure)
                }
                StartRequestState::PendingBeforeResume => (
                    StartRequestState::PendingAfterResume,
                    StartRequestStatus::Pending,
                ),
                _ => (StartRequestState::Idle, StartRequestStatus::Failure),
            });
        }
        self.start_request_state.set(StartRequestState::Idle);
        info!("on resume failed");
        StartRequestStatus::Failure
    }

    /// Legacy lock-free start sequence.
    #[cfg(not(feature = "start-stream-race-fix"))]
    pub fn start_request(&mut self, _is_low_latency: bool) -> StartRequestStatus {
        if self.start_request_state.get() == StartRequestState::PendingAfterResume {
            info!("start request already pending, ignoring");
            return StartRequestStatus::Pending;
        }
        self.start_request_state
            .set(StartRequestState::PendingBeforeResume);
        if self.hooks.on_resume(true) {
            if self
                .start_request_state
                .compare_exchange(StartRequestState::Confirmed, StartRequestState::Idle)
            {
                return StartRequestStatus::SuccessFinished;
            }
            if self
                .start_request_state
                .compare_exchange(StartRequestState::Canceled, StartRequestState::Idle)
            {
                return StartRequestStatus::Failure;
            }
            if self.start_request_state.compare_exchange(
                StartRequestState::PendingBeforeResume,
                StartRequestState::PendingAfterResume,
            ) {
                return StartRequestStatus::Pending;
            }
        }
        let _ = self.start_request_state.compare_exchange(
            StartRequestState::PendingBeforeResume,
            StartRequestState::Idle,
        );
        StartRequestStatus::Failure
    }

    /// The stream came up (STREAMING reported). Returns true when a pending
    /// request must now be acknowledged towards the audio stack.
    pub fn confirm_start_request(&self) -> bool {
        self.start_request_state.reconcile(|state| match state {
            StartRequestState::PendingBeforeResume => (StartRequestState::Confirmed, false),
            StartRequestState::PendingAfterResume => (StartRequestState::Idle, true),
            other => (other, false),
        })
    }

    /// The stream failed to come up. Returns true when a pending request
    /// must now be failed towards the audio stack.
    pub fn cancel_start_request(&self) -> bool {
        self.start_request_state.reconcile(|state| match state {
            StartRequestState::PendingBeforeResume => (StartRequestState::Canceled, false),
            StartRequestState::PendingAfterResume => (StartRequestState::Idle, true),
            other => (other, false),
        })
    }

    /// Reconcile the request state with a caller supplied transition.
    pub fn reconcile_start_request<R>(
        &self,
        f: impl Fn(StartRequestState) -> (StartRequestState, R),
    ) -> R {
        self.start_request_state.reconcile(f)
    }

    pub fn suspend_request(&mut self) -> StartRequestStatus {
        if self.hooks.on_suspend() {
            self.hooks.flush();
            StartRequestStatus::SuccessFinished
        } else {
            StartRequestStatus::Failure
        }
    }

    pub fn stop_request(&mut self) {
        if self.hooks.on_suspend() {
            self.hooks.flush();
        }
    }

    /// Map the audio stack's latency mode onto a DSA transport mode.
    pub fn set_latency_mode(&mut self, mode: LatencyMode) {
        self.dsa_mode = match mode {
            LatencyMode::Free => DsaMode::Disabled,
            LatencyMode::LowLatency => DsaMode::Acl,
            LatencyMode::DynamicSpatialAudioSoftware => DsaMode::IsoSw,
            LatencyMode::DynamicSpatialAudioHardware => DsaMode::IsoHw,
        };
    }

    pub fn dsa_mode(&self) -> DsaMode {
        self.dsa_mode
    }

    pub fn source_metadata_changed(&mut self, tracks: &[MetadataTrack]) {
        if tracks.is_empty() {
            warn!("invalid number of metadata changed tracks");
            return;
        }
        let dsa_mode = self.dsa_mode;
        self.hooks.on_source_metadata_update(tracks, dsa_mode);
    }

    pub fn sink_metadata_changed(&mut self, tracks: &[MetadataTrack]) {
        if tracks.is_empty() {
            warn!("invalid number of metadata changed tracks");
            return;
        }
        self.hooks.on_sink_metadata_update(tracks);
    }

    pub fn presentation_position(&self) -> PresentationPosition {
        PresentationPosition {
            remote_delay_ns: self.remote_delay_ms as u64 * 1_000_000,
            total_bytes_processed: self.total_bytes_processed,
            timestamp: self.position_timestamp,
        }
    }

    pub fn log_bytes_processed(&mut self, bytes: usize, now: Instant) {
        if bytes > 0 {
            self.total_bytes_processed += bytes as u64;
            self.position_timestamp = Some(now);
        }
    }

    pub fn reset_presentation_position(&mut self) {
        self.remote_delay_ms = 0;
        self.total_bytes_processed = 0;
        self.position_timestamp = None;
    }

    pub fn set_remote_delay(&mut self, delay_ms: u16) {
        info!("remote delay report: {} ms", delay_ms);
        self.remote_delay_ms = delay_ms;
    }

    pub fn pcm_config(&self) -> &PcmConfiguration {
        &self.pcm
    }

    pub fn set_pcm_config(
        &mut self,
        sample_rate_hz: u32,
        bits_per_sample: u8,
        channels: u8,
        data_interval_us: u32,
    ) {
        self.pcm = PcmConfiguration {
            sample_rate_hz,
            bits_per_sample,
            channel_mode: ChannelMode::from_channel_count(channels),
            data_interval_us,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    #[derive(Default)]
    struct Hooks {
        resume_result: bool,
        resumes: usize,
        suspends: usize,
        flushes: usize,
        source_updates: usize,
    }

    impl StreamHooks for Hooks {
        fn on_resume(&mut self, _start: bool) -> bool {
            self.resumes += 1;
            self.resume_result
        }

        fn on_suspend(&mut self) -> bool {
            self.suspends += 1;
            true
        }

        fn flush(&mut self) {
            self.flushes += 1;
        }

        fn on_source_metadata_update(&mut self, _tracks: &[MetadataTrack], _dsa: DsaMode) {
            self.source_updates += 1;
        }

        fn on_sink_metadata_update(&mut self, _tracks: &[MetadataTrack]) {}
    }

    fn transport(resume_result: bool) -> AudioTransport<NoopRawMutex, Hooks> {
        AudioTransport::new(
            Hooks {
                resume_result,
                ..Default::default()
            },
            PcmConfiguration::default(),
        )
    }

    #[test]
    fn start_goes_pending_until_confirmed() {
        let mut transport = transport(true);
        assert_eq!(transport.start_request(false), StartRequestStatus::Pending);
        assert_eq!(
            transport.start_request_state(),
            StartRequestState::PendingAfterResume
        );

        // A second request while pending is ignored.
        assert_eq!(transport.start_request(false), StartRequestStatus::Pending);
        assert_eq!(transport.hooks.resumes, 1);

        // Stream came up: the pending request must be acknowledged.
        assert!(transport.confirm_start_request());
        assert_eq!(transport.start_request_state(), StartRequestState::Idle);
    }

    #[test]
    fn confirm_before_resume_completes_inline() {
        let transport = transport(true);
        transport.set_start_request_state(StartRequestState::PendingBeforeResume);
        // Confirmed while still inside the resume callback: start_request
        // itself reports the success, nothing to acknowledge later.
        assert!(!transport.confirm_start_request());
        assert_eq!(
            transport.start_request_state(),
            StartRequestState::Confirmed
        );
    }

    #[test]
    fn cancel_resolves_pending_request() {
        let mut transport = transport(true);
        assert_eq!(transport.start_request(false), StartRequestStatus::Pending);
        assert!(transport.cancel_start_request());
        assert_eq!(transport.start_request_state(), StartRequestState::Idle);

        // Nothing pending: cancel is a no-op.
        assert!(!transport.cancel_start_request());
    }

    #[test]
    fn resume_failure_fails_request() {
        let mut transport = transport(false);
        assert_eq!(transport.start_request(false), StartRequestStatus::Failure);
        assert_eq!(transport.start_request_state(), StartRequestState::Idle);
    }

    #[test]
    fn suspend_flushes() {
        let mut transport = transport(true);
        assert_eq!(
            transport.suspend_request(),
            StartRequestStatus::SuccessFinished
        );
        assert_eq!(transport.hooks.suspends, 1);
        assert_eq!(transport.hooks.flushes, 1);
    }

    #[test]
    fn latency_mode_maps_to_dsa_mode() {
        let mut transport = transport(true);
        transport.set_latency_mode(LatencyMode::DynamicSpatialAudioHardware);
        assert_eq!(transport.dsa_mode(), DsaMode::IsoHw);
        transport.set_latency_mode(LatencyMode::Free);
        assert_eq!(transport.dsa_mode(), DsaMode::Disabled);
    }

    #[test]
    fn metadata_update_requires_tracks() {
        let mut transport = transport(true);
        transport.source_metadata_changed(&[]);
        assert_eq!(transport.hooks.source_updates, 0);
        transport.source_metadata_changed(&[MetadataTrack {
            contexts: ContextType::Media,
        }]);
        assert_eq!(transport.hooks.source_updates, 1);
    }

    #[test]
    fn presentation_position_tracks_bytes() {
        let mut transport = transport(true);
        transport.set_remote_delay(40);
        transport.log_bytes_processed(960, Instant::from_ticks(1000));
        transport.log_bytes_processed(0, Instant::from_ticks(2000));

        let position = transport.presentation_position();
        assert_eq!(position.remote_delay_ns, 40_000_000);
        assert_eq!(position.total_bytes_processed, 960);
        assert_eq!(position.timestamp, Some(Instant::from_ticks(1000)));

        transport.reset_presentation_position();
        let position = transport.presentation_position();
        assert_eq!(position.total_bytes_processed, 0);
        assert_eq!(position.timestamp, None);
    }
}
