#![forbid(unsafe_code)]

use tracing::info;

/// Default speaking-slot duration in seconds.
const DEFAULT_SPEAK_SECS: u64 = 120;

/// Room configuration, loaded from environment variables. The countdown is
/// fixed per room and restarts fully for each newly promoted speaker.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Seconds a granted speaker holds the mic before timed rotation
    pub speak_secs: u64,
    /// Start with manual-approval mode on
    pub manual_approval: bool,
    /// Start with the room locked to new speaking requests
    pub locked: bool,
}

impl RoomSettings {
    pub fn from_env() -> Self {
        let speak_secs = std::env::var("SPEAK_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v| v > 0)
            .unwrap_or(DEFAULT_SPEAK_SECS);
        let manual_approval = std::env::var("MANUAL_APPROVAL")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let locked = std::env::var("ROOM_LOCKED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        info!(
            "Room settings: speak time {}s, manual approval {}, locked {}",
            speak_secs, manual_approval, locked
        );
        Self { speak_secs, manual_approval, locked }
    }
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            speak_secs: DEFAULT_SPEAK_SECS,
            manual_approval: false,
            locked: false,
        }
    }
}
