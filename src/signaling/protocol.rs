#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::registry::BanEntry;
use crate::room::permissions::{PermissionMatrix, Role};
use serde::{Deserialize, Serialize};

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join the room. Must be the first message on a connection. Joining
    /// under a preconfigured admin name requires the matching password.
    #[serde(rename_all = "camelCase")]
    Join {
        name: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        avatar: Option<String>,
    },
    /// Leave the room (the socket may stay open to rejoin)
    Leave,
    /// Send a chat message to the room
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        text: String,
        #[serde(default)]
        reply_to: Option<String>,
    },
    /// Ask for the mic
    RequestSpeak,
    /// Give up the mic voluntarily
    ReleaseSpeak,
    /// Take the mic from another speaker (requires `force-release`)
    #[serde(rename_all = "camelCase")]
    ForceRelease { target_id: String },
    /// Move a pending mic request into the queue (requires `approve-speak`)
    #[serde(rename_all = "camelCase")]
    ApproveSpeak { target_id: String },
    /// Discard a pending mic request (requires `approve-speak`)
    #[serde(rename_all = "camelCase")]
    RejectSpeak { target_id: String },
    /// Change another user's role (requires `set-role`)
    #[serde(rename_all = "camelCase")]
    SetRole { target_id: String, role: Role },
    /// Mute or unmute another user's chat (requires `mute`)
    #[serde(rename_all = "camelCase")]
    SetMute { target_id: String, muted: bool },
    /// Remove a user from the room (requires `kick`)
    #[serde(rename_all = "camelCase")]
    Kick { target_id: String },
    /// Ban a user's address and device fingerprint, then kick them
    /// (requires `ban`)
    #[serde(rename_all = "camelCase")]
    Ban { target_id: String },
    /// Remove ban entries by address and/or device fingerprint
    /// (requires `unban`)
    #[serde(rename_all = "camelCase")]
    Unban {
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        device_id: Option<String>,
    },
    /// Open or close the room to new speaking requests (requires `lock-room`)
    SetRoomLock { locked: bool },
    /// Toggle manual-approval mode for mic requests (requires `lock-room`)
    SetManualApproval { enabled: bool },
    /// Update own display settings
    #[serde(rename_all = "camelCase")]
    UpdateSettings {
        #[serde(default)]
        color: Option<String>,
        #[serde(default)]
        font_size: Option<String>,
        #[serde(default)]
        avatar: Option<String>,
    },
    /// Ask for the current permission matrix
    GetPermissions,
    /// Replace the permission matrix wholesale (requires `edit-permissions`)
    UpdatePermissions { permissions: PermissionMatrix },
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Join succeeded — carries the full room snapshot
    #[serde(rename_all = "camelCase")]
    Joined {
        user_id: String,
        snapshot: RoomSnapshot,
    },
    /// Error response, sent to the originating session only
    Error { message: String },
    /// A user joined the room
    UserJoined { user: UserSummary },
    /// A user left the room
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String },
    /// Chat message fan-out
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        user_id: String,
        name: String,
        avatar: String,
        text: String,
        color: String,
        font_size: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<String>,
    },
    /// The mic was granted to a user for `seconds`
    #[serde(rename_all = "camelCase")]
    SpeakGranted { user_id: String, seconds: u64 },
    /// The speaker gave up (or was forced off) the mic
    #[serde(rename_all = "camelCase")]
    SpeakReleased { user_id: String },
    /// The speaker's countdown ran out
    #[serde(rename_all = "camelCase")]
    SpeakExpired { user_id: String },
    /// Wait-queue state changed
    QueueUpdated {
        speaker: Option<UserSummary>,
        queue: Vec<UserSummary>,
    },
    /// A mic request awaits approval (sent to `approve-speak` holders)
    SpeakRequested { user: UserSummary },
    /// Pending-approval queue changed (sent to `approve-speak` holders)
    PendingUpdated { pending: Vec<UserSummary> },
    /// The permission matrix was replaced
    PermissionsUpdated { permissions: PermissionMatrix },
    /// The ban list changed
    BanUpdated { banned: Vec<BanEntry> },
    /// A user's role changed
    #[serde(rename_all = "camelCase")]
    RoleChanged {
        user_id: String,
        role: Role,
        changed_by: String,
    },
    /// A user was muted or unmuted
    #[serde(rename_all = "camelCase")]
    MuteChanged { user_id: String, muted: bool },
    /// A user changed their display settings
    #[serde(rename_all = "camelCase")]
    SettingsChanged { user: UserSummary },
    /// A user was kicked out
    #[serde(rename_all = "camelCase")]
    Kicked { user_id: String },
    /// A user was banned (and removed)
    #[serde(rename_all = "camelCase")]
    Banned { user_id: String },
    /// The room lock was toggled
    RoomLockChanged { locked: bool },
    /// Manual-approval mode was toggled
    ManualApprovalChanged { enabled: bool },
}

/// Per-user display settings, echoed into every chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplaySettings {
    pub color: String,
    pub font_size: String,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            color: "#fff".to_string(),
            font_size: "18px".to_string(),
        }
    }
}

/// Public view of a user session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub muted: bool,
    pub avatar: String,
    pub settings: DisplaySettings,
}

/// Current room state, sent to new joiners instead of backfilled events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub users: Vec<UserSummary>,
    pub speaker: Option<UserSummary>,
    pub queue: Vec<UserSummary>,
    pub pending: Vec<UserSummary>,
    pub locked: bool,
    pub manual_approval: bool,
    pub speak_secs: u64,
    pub permissions: PermissionMatrix,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_tag_format() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"setMute","targetId":"u1","muted":true}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SetMute { ref target_id, muted: true } if target_id == "u1"));
    }

    #[test]
    fn test_join_password_is_optional() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"join","name":"alice"}"#).unwrap();
        match msg {
            ClientMessage::Join { name, password, avatar } => {
                assert_eq!(name, "alice");
                assert!(password.is_none());
                assert!(avatar.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_speak_granted_wire_shape() {
        let json = serde_json::to_string(&ServerMessage::SpeakGranted {
            user_id: "u1".to_string(),
            seconds: 120,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"speakGranted","userId":"u1","seconds":120}"#);
    }
}
