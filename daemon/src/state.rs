//! The canonical "now playing" state and its transitions.
//!
//! [`NowPlaying::apply`] is the only place where an [`Event`] turns into a state change. It never
//! talks to the bus itself, instead it reports a [`Followup`] that the state machine schedules.

use serde::Serialize;

use crate::notification::Event;

/// Transport state of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// A track as known to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Track {
    pub id: Option<String>,
    pub name: Option<String>,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub cover_url: Option<String>,
    pub duration_ms: u64,
}

/// Partial track metadata, as returned by a bus query.
///
/// A `None` field means the reply did not carry it, which is different from an empty value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackInfo {
    pub name: Option<String>,
    pub artists: Option<Vec<String>>,
    pub album: Option<String>,
    pub cover_url: Option<String>,
    pub duration_ms: Option<u64>,
}

impl Track {
    /// Overwrites the fields present in `info`, keeping everything else.
    pub fn merge(&mut self, info: TrackInfo) {
        if let Some(name) = info.name {
            self.name = Some(name);
        }
        if let Some(artists) = info.artists {
            self.artists = artists;
        }
        if let Some(album) = info.album {
            self.album = Some(album);
        }
        if let Some(cover_url) = info.cover_url {
            self.cover_url = Some(cover_url);
        }
        if let Some(duration_ms) = info.duration_ms {
            self.duration_ms = duration_ms;
        }
    }
}

/// Work the state machine has to schedule after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    Nothing,
    /// The track is only known by id, its metadata must be queried from the bus.
    FetchMetadata,
    /// The volume changed behind our back.
    FetchVolume,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NowPlaying {
    pub connected: bool,
    pub session_user: Option<String>,
    pub session_id: Option<String>,
    pub track: Option<Track>,
    pub playback_state: PlaybackState,
    pub position_ms: u64,
    /// Output volume in `[0.0, 1.0]`.
    pub volume: f64,
}

impl NowPlaying {
    pub fn new(initial_volume: f64) -> Self {
        Self {
            connected: false,
            session_user: None,
            session_id: None,
            track: None,
            playback_state: PlaybackState::Stopped,
            position_ms: 0,
            volume: if initial_volume.is_nan() {
                0.0
            } else {
                initial_volume.clamp(0.0, 1.0)
            },
        }
    }

    /// Applies a single event.
    pub fn apply(&mut self, event: &Event) -> Followup {
        match event {
            Event::SessionConnected {
                user,
                connection_id,
            } => {
                self.connected = true;
                if user.is_some() {
                    self.session_user.clone_from(user);
                }
                if connection_id.is_some() {
                    self.session_id.clone_from(connection_id);
                }
            }
            Event::SessionDisconnected => {
                self.connected = false;
                self.session_user = None;
                self.session_id = None;
                self.track = None;
                self.playback_state = PlaybackState::Stopped;
            }
            Event::TrackChanged(track) => {
                self.connected = true;
                self.track = Some(track.clone());
                self.position_ms = 0;
            }
            Event::TrackIdChanged { id, duration_ms } => {
                self.connected = true;
                self.track = Some(Track {
                    id: id.clone(),
                    duration_ms: *duration_ms,
                    ..Track::default()
                });
                self.position_ms = 0;
                return Followup::FetchMetadata;
            }
            Event::Playing { position_ms } => {
                self.connected = true;
                self.playback_state = PlaybackState::Playing;
                if let Some(position_ms) = position_ms {
                    self.position_ms = *position_ms;
                }
            }
            Event::Paused { position_ms } => {
                self.playback_state = PlaybackState::Paused;
                if let Some(position_ms) = position_ms {
                    self.position_ms = *position_ms;
                }
            }
            Event::Stopped => {
                self.playback_state = PlaybackState::Stopped;
                self.position_ms = 0;
            }
            Event::VolumeChanged => return Followup::FetchVolume,
            Event::Unknown(kind) => {
                log::debug!("Ignoring unknown event `{kind}`");
            }
        }
        Followup::Nothing
    }

    /// Stores a volume, clamped to `[0.0, 1.0]`. `NaN` is ignored.
    pub fn set_volume(&mut self, volume: f64) {
        if volume.is_nan() {
            log::debug!("Ignoring volume that is not a number");
            return;
        }
        self.volume = volume.clamp(0.0, 1.0);
    }
}
