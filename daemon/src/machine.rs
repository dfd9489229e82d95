//! The playback state machine.
//!
//! A single [`StateMachine`] task owns the [`NowPlaying`] state. Everything else reaches it
//! through a [`MachineHandle`], which only sends [`Input`]s, so transitions happen one at a
//! time and in the order the inputs were sent.
//!
//! Bus queries triggered by a transition run as separate tasks and report back with the
//! generation they were scheduled for. A result whose generation is outdated is dropped.

use smol::Task;
use smol::channel::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{BusClient, BusError, Method, Transport};
use crate::notification::{Event, Notification};
use crate::state::{Followup, NowPlaying, TrackInfo};

/// How metadata of a track known only by id is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait before the first attempt, the backend registers its endpoint late.
    pub settle_delay: Duration,
    /// Wait between attempts.
    pub backoff: Duration,
    /// Total number of attempts.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            backoff: Duration::from_millis(500),
            attempts: 3,
        }
    }
}

/// Accepted inputs of the state machine.
pub enum Input {
    Notify(Event),
    /// Result of a metadata query scheduled for the given track generation.
    Metadata { generation: u64, info: TrackInfo },
    /// Result of a volume query scheduled for the given volume generation.
    Volume { generation: u64, volume: f64 },
    /// A volume was successfully written to the backend.
    VolumeApplied(f64),
    /// Registers an observer, which immediately receives the current state.
    Subscribe(Sender<NowPlaying>),
    /// Sends a copy of the current state.
    Snapshot(Sender<NowPlaying>),
    Shutdown,
}

pub struct StateMachine<T: Transport> {
    state: NowPlaying,
    bus: Arc<BusClient<T>>,
    policy: RetryPolicy,
    tx: Sender<Input>,
    rx: Receiver<Input>,
    observers: Vec<Sender<NowPlaying>>,

    track_generation: u64,
    volume_generation: u64,
    metadata_task: Option<Task<()>>,
    volume_task: Option<Task<()>>,
}

impl<T: Transport> StateMachine<T> {
    pub fn new(
        bus: BusClient<T>,
        initial_volume: f64,
        policy: RetryPolicy,
    ) -> (Self, MachineHandle<T>) {
        let (tx, rx) = smol::channel::unbounded();
        let bus = Arc::new(bus);
        let handle = MachineHandle {
            tx: tx.clone(),
            bus: bus.clone(),
        };
        (
            Self {
                state: NowPlaying::new(initial_volume),
                bus,
                policy,
                tx,
                rx,
                observers: Vec::new(),
                track_generation: 0,
                volume_generation: 0,
                metadata_task: None,
                volume_task: None,
            },
            handle,
        )
    }

    /// The main task, runs until [`Input::Shutdown`].
    pub async fn run(mut self) {
        while let Ok(input) = self.rx.recv().await {
            if let Input::Shutdown = input {
                break;
            }
            self.handle(input);
        }
        log::debug!("State machine stopped");
    }

    /// Handles one input. Never blocks, follow-up work is spawned.
    fn handle(&mut self, input: Input) {
        match input {
            Input::Notify(event) => self.transition(&event),
            Input::Metadata { generation, info } => {
                if generation != self.track_generation {
                    log::debug!("Discarding metadata for a superseded track");
                    return;
                }
                let Some(track) = &mut self.state.track else {
                    return;
                };
                track.merge(info);
                self.metadata_task = None;
                self.publish();
            }
            Input::Volume { generation, volume } => {
                if generation != self.volume_generation {
                    log::debug!("Discarding outdated volume {volume}");
                    return;
                }
                self.state.set_volume(volume);
                self.volume_task = None;
                self.publish();
            }
            Input::VolumeApplied(volume) => {
                // Supersedes any volume query still in flight
                self.volume_generation += 1;
                self.volume_task = None;
                self.state.set_volume(volume);
                self.publish();
            }
            Input::Subscribe(observer) => {
                if observer.try_send(self.state.clone()).is_ok() {
                    self.observers.push(observer);
                }
            }
            Input::Snapshot(reply) => {
                let _ = reply.try_send(self.state.clone());
            }
            Input::Shutdown => {}
        }
    }

    fn transition(&mut self, event: &Event) {
        log::info!("Received event: {event:?}");
        if matches!(
            event,
            Event::TrackChanged(_) | Event::TrackIdChanged { .. } | Event::SessionDisconnected
        ) {
            self.track_generation += 1;
            // Dropping the task cancels it
            self.metadata_task = None;
        }

        match self.state.apply(event) {
            Followup::Nothing => {}
            Followup::FetchMetadata => {
                self.metadata_task = Some(smol::spawn(fetch_metadata(
                    self.bus.clone(),
                    self.tx.clone(),
                    self.track_generation,
                    self.policy,
                )));
            }
            Followup::FetchVolume => {
                self.volume_generation += 1;
                self.volume_task = Some(smol::spawn(fetch_volume(
                    self.bus.clone(),
                    self.tx.clone(),
                    self.volume_generation,
                )));
            }
        }
        self.publish();
    }

    /// Sends the current state to every observer, forgetting those that went away.
    fn publish(&mut self) {
        let state = &self.state;
        self.observers
            .retain(|observer| observer.try_send(state.clone()).is_ok());
    }
}

async fn fetch_metadata<T: Transport>(
    bus: Arc<BusClient<T>>,
    tx: Sender<Input>,
    generation: u64,
    policy: RetryPolicy,
) {
    smol::Timer::after(policy.settle_delay).await;
    for attempt in 1..=policy.attempts {
        match bus.get_metadata().await {
            Ok(info) => {
                let _ = tx.send(Input::Metadata { generation, info }).await;
                return;
            }
            Err(err) => {
                log::debug!("Metadata fetch attempt {attempt} failed: {err}");
            }
        }
        if attempt < policy.attempts {
            smol::Timer::after(policy.backoff).await;
        }
    }
    log::info!(
        "Giving up on metadata after {} attempts",
        policy.attempts
    );
}

async fn fetch_volume<T: Transport>(bus: Arc<BusClient<T>>, tx: Sender<Input>, generation: u64) {
    match bus.get_volume().await {
        Ok(volume) => {
            let _ = tx.send(Input::Volume { generation, volume }).await;
        }
        Err(err) => log::debug!("Volume fetch failed: {err}"),
    }
}

/// Cheap, cloneable access to a running [`StateMachine`].
pub struct MachineHandle<T: Transport> {
    tx: Sender<Input>,
    bus: Arc<BusClient<T>>,
}

impl<T: Transport> Clone for MachineHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            bus: self.bus.clone(),
        }
    }
}

impl<T: Transport> MachineHandle<T> {
    /// Normalises and queues a notification. Order of calls is the order of transitions.
    pub fn dispatch(&self, notification: Notification) {
        self.send(Input::Notify(Event::from(notification)));
    }

    fn send(&self, input: Input) {
        if self.tx.try_send(input).is_err() {
            log::warn!("State machine is not running, input dropped");
        }
    }

    /// Receives the current state, then the state after every transition.
    pub fn subscribe(&self) -> Receiver<NowPlaying> {
        let (tx, rx) = smol::channel::unbounded();
        self.send(Input::Subscribe(tx));
        rx
    }

    /// The current state, `None` if the machine has stopped.
    pub async fn snapshot(&self) -> Option<NowPlaying> {
        let (tx, rx) = smol::channel::bounded(1);
        self.send(Input::Snapshot(tx));
        rx.recv().await.ok()
    }

    /// # Errors
    /// See [`BusClient::invoke`].
    pub async fn play_pause(&self) -> Result<(), BusError> {
        self.bus.invoke(Method::PlayPause).await
    }

    /// # Errors
    /// See [`BusClient::invoke`].
    pub async fn next(&self) -> Result<(), BusError> {
        self.bus.invoke(Method::Next).await
    }

    /// # Errors
    /// See [`BusClient::invoke`].
    pub async fn previous(&self) -> Result<(), BusError> {
        self.bus.invoke(Method::Previous).await
    }

    /// Reads the live volume from the backend without touching the state.
    ///
    /// # Errors
    /// See [`BusClient::get_volume`].
    pub async fn volume(&self) -> Result<f64, BusError> {
        self.bus.get_volume().await
    }

    /// Writes the volume, and only once the backend accepted it, updates the state.
    ///
    /// # Errors
    /// See [`BusClient::set_volume`].
    pub async fn set_volume(&self, volume: f64) -> Result<f64, BusError> {
        let volume = self.bus.set_volume(volume).await?;
        self.send(Input::VolumeApplied(volume));
        Ok(volume)
    }

    /// Stops the state machine after the inputs already queued.
    pub fn shutdown(&self) {
        self.send(Input::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::{FakeBus, NAMES};
    use crate::bus::{DEFAULT_PREFIX, Request};
    use crate::state::{PlaybackState, Track};

    const METADATA: &str = r#"method return time=1 sender=:1.5 -> destination=:1.9 serial=12 reply_serial=2
   variant       array [
         dict entry(
            string "xesam:title"
            variant                string "Song A"
         )
         dict entry(
            string "xesam:album"
            variant                string "Album Z"
         )
         dict entry(
            string "mpris:length"
            variant                uint64 180000000
         )
      ]
"#;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            settle_delay: Duration::from_millis(10),
            backoff: Duration::from_millis(5),
            attempts: 3,
        }
    }

    /// A machine driven by hand through [`StateMachine::handle`], whose fetches never finish.
    fn idle() -> StateMachine<FakeBus> {
        let bus = FakeBus::empty().delayed(Duration::from_secs(60));
        StateMachine::new(BusClient::new(bus, DEFAULT_PREFIX), 0.5, quick()).0
    }

    fn running(bus: FakeBus, volume: f64) -> (MachineHandle<FakeBus>, Task<()>) {
        let (machine, handle) = StateMachine::new(BusClient::new(bus, DEFAULT_PREFIX), volume, quick());
        (handle, smol::spawn(machine.run()))
    }

    fn notification(kind: &str, fields: &[(&str, &str)]) -> Notification {
        Notification {
            kind: kind.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    fn within<F: Future>(future: F) -> F::Output {
        smol::block_on(smol::future::or(async { Some(future.await) }, async {
            smol::Timer::after(Duration::from_secs(5)).await;
            None
        }))
        .expect("timeout waiting for the state machine")
    }

    /// Waits for a published state matching `predicate`.
    async fn until(
        rx: &Receiver<NowPlaying>,
        predicate: impl Fn(&NowPlaying) -> bool,
    ) -> NowPlaying {
        loop {
            let state = rx.recv().await.expect("state machine stopped");
            if predicate(&state) {
                return state;
            }
        }
    }

    #[test]
    fn id_change_fetches_metadata() {
        let bus = FakeBus::answering(METADATA);
        let (handle, task) = running(bus.clone(), 0.5);
        let rx = handle.subscribe();

        handle.dispatch(notification(
            "change",
            &[("track_id", "spotify:track:1"), ("duration_ms", "1000")],
        ));

        let immediate = within(until(&rx, |state| state.track.is_some()));
        assert!(immediate.connected);
        assert_eq!(immediate.position_ms, 0);
        assert_eq!(
            immediate.track,
            Some(Track {
                id: Some("spotify:track:1".to_string()),
                duration_ms: 1000,
                ..Track::default()
            })
        );

        let merged = within(until(&rx, |state| {
            state.track.as_ref().is_some_and(|track| track.name.is_some())
        }));
        let track = merged.track.unwrap();
        assert_eq!(track.id.as_deref(), Some("spotify:track:1"));
        assert_eq!(track.name.as_deref(), Some("Song A"));
        assert_eq!(track.album.as_deref(), Some("Album Z"));
        assert_eq!(track.duration_ms, 180_000);
        assert!(track.artists.is_empty());

        handle.shutdown();
        within(task);
        assert_eq!(
            bus.count(|r| matches!(r, Request::GetProperty { name, .. } if name == "Metadata")),
            1
        );
    }

    #[test]
    fn gives_up_after_three_attempts() {
        let bus = FakeBus::empty();
        let (handle, task) = running(bus.clone(), 0.5);

        handle.dispatch(notification("change", &[("track_id", "spotify:track:1")]));
        within(smol::Timer::after(Duration::from_millis(300)));

        // Each attempt rediscovers the endpoint, and only that fails
        assert_eq!(bus.count(|r| *r == Request::ListNames), 3);
        let state = within(handle.snapshot()).unwrap();
        assert_eq!(
            state.track.and_then(|track| track.id).as_deref(),
            Some("spotify:track:1")
        );

        handle.shutdown();
        within(task);
    }

    #[test]
    fn inline_track_fetches_nothing() {
        let bus = FakeBus::answering(METADATA);
        let (handle, task) = running(bus.clone(), 0.5);

        handle.dispatch(notification(
            "track_changed",
            &[("name", "Song B"), ("artists", "X\nY"), ("duration_ms", "5")],
        ));
        within(smol::Timer::after(Duration::from_millis(100)));

        let track = within(handle.snapshot()).unwrap().track.unwrap();
        assert_eq!(track.name.as_deref(), Some("Song B"));
        assert_eq!(track.artists, vec!["X".to_string(), "Y".to_string()]);
        assert_eq!(track.duration_ms, 5);
        assert_eq!(bus.count(|_| true), 0);

        handle.shutdown();
        within(task);
    }

    #[test]
    fn stale_metadata_is_discarded() {
        let mut machine = idle();
        let changed = |id: &str| {
            Input::Notify(Event::TrackIdChanged {
                id: Some(id.to_string()),
                duration_ms: 0,
            })
        };
        let named = |name: &str| TrackInfo {
            name: Some(name.to_string()),
            ..TrackInfo::default()
        };

        machine.handle(changed("a"));
        let first = machine.track_generation;
        machine.handle(changed("b"));
        machine.handle(Input::Metadata {
            generation: first,
            info: named("Song of a"),
        });
        let track = machine.state.track.clone().unwrap();
        assert_eq!(track.id.as_deref(), Some("b"));
        assert_eq!(track.name, None);

        // A disconnect supersedes the fetch of the current track too
        let current = machine.track_generation;
        machine.handle(Input::Notify(Event::SessionDisconnected));
        machine.handle(Input::Metadata {
            generation: current,
            info: named("Song of b"),
        });
        assert_eq!(machine.state.track, None);
        assert!(!machine.state.connected);
    }

    #[test]
    fn volume_event_queries_bus() {
        let (handle, task) = running(FakeBus::answering("   variant       double 0.25\n"), 0.8);
        let rx = handle.subscribe();

        handle.dispatch(notification("volumeset", &[]));
        let state = within(until(&rx, |state| (state.volume - 0.25).abs() < 1e-9));
        assert_eq!(state.playback_state, PlaybackState::Stopped);

        handle.shutdown();
        within(task);
    }

    #[test]
    fn set_volume_updates_only_on_success() {
        let (handle, task) = running(FakeBus::answering(""), 0.5);
        assert_eq!(within(handle.set_volume(1.5)), Ok(1.0));
        assert!((within(handle.snapshot()).unwrap().volume - 1.0).abs() < f64::EPSILON);

        // Not a number is refused before the bus is asked
        assert!(within(handle.set_volume(f64::NAN)).is_err());
        let state = within(handle.snapshot()).unwrap();
        assert!((state.volume - 1.0).abs() < f64::EPSILON);
        assert!(serde_json::to_value(&state).unwrap()["volume"].is_f64());
        handle.shutdown();
        within(task);

        let failing = FakeBus::new(|request| match request {
            Request::ListNames => Ok(NAMES.to_string()),
            _ => Err(BusError::CallFailed("rejected".to_string())),
        });
        let (handle, task) = running(failing, 0.5);
        assert!(within(handle.set_volume(-0.2)).is_err());
        assert!((within(handle.snapshot()).unwrap().volume - 0.5).abs() < f64::EPSILON);
        handle.shutdown();
        within(task);
    }

    #[test]
    fn outdated_volume_is_discarded() {
        let mut machine = idle();
        machine.handle(Input::Notify(Event::VolumeChanged));
        let queried = machine.volume_generation;
        machine.handle(Input::VolumeApplied(0.9));
        machine.handle(Input::Volume {
            generation: queried,
            volume: 0.1,
        });
        assert!((machine.state.volume - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn observers_receive_every_transition_in_order() {
        let (handle, task) = running(FakeBus::empty(), 0.5);
        let rx = handle.subscribe();
        drop(handle.subscribe());

        handle.dispatch(notification("sessionconnected", &[]));
        handle.dispatch(notification("start", &[("position_ms", "10")]));
        handle.dispatch(notification("pause", &[("position_ms", "20")]));
        handle.dispatch(notification("session_disconnected", &[]));

        let states: Vec<NowPlaying> = within(async {
            let mut states = Vec::new();
            for _ in 0..5 {
                states.push(rx.recv().await.unwrap());
            }
            states
        });
        assert!(!states[0].connected);
        assert!(states[1].connected);
        assert_eq!(states[2].playback_state, PlaybackState::Playing);
        assert_eq!(states[3].position_ms, 20);
        assert!(!states[4].connected);
        assert_eq!(states[4].playback_state, PlaybackState::Stopped);

        handle.shutdown();
        within(task);
    }
}
