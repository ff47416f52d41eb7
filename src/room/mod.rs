#![forbid(unsafe_code)]

// Room module - session tracking, speaking-queue coordination, and broadcast

pub mod mic;
pub mod moderation;
pub mod permissions;
pub mod settings;

use crate::error::{ChatError, ChatResult};
use crate::metrics::ServerMetrics;
use crate::persistence::Store;
use crate::registry::{verify_password, BanEntry, Registry};
use crate::signaling::protocol::{DisplaySettings, RoomSnapshot, ServerMessage, UserSummary};
use mic::{MicState, Removal, RequestOutcome};
use permissions::{Action, PermissionMatrix, Role};
use settings::RoomSettings;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// A connected user session
#[derive(Clone)]
pub struct User {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub muted: bool,
    pub avatar: String,
    pub settings: DisplaySettings,
    pub sender: mpsc::Sender<Arc<String>>,
    pub address: String,
    pub device_id: String,
}

/// Room state. All mutation is serialized through one `tokio::sync::RwLock`,
/// so handlers run to completion against a consistent view.
pub struct Room {
    pub users: HashMap<String, User>,
    pub mic: MicState,
    pub matrix: PermissionMatrix,
    pub locked: bool,
    pub manual_approval: bool,
    /// Armed countdown for the current speaker, aborted on release
    speak_timer: Option<tokio::task::JoinHandle<()>>,
}

impl Room {
    fn new(matrix: PermissionMatrix, settings: &RoomSettings) -> Self {
        Self {
            users: HashMap::new(),
            mic: MicState::new(),
            matrix,
            locked: settings.locked,
            manual_approval: settings.manual_approval,
            speak_timer: None,
        }
    }

    pub fn is_name_taken(&self, name: &str) -> bool {
        self.users.values().any(|u| u.name == name)
    }

    fn summary_of(&self, user_id: &str) -> Option<UserSummary> {
        self.users.get(user_id).map(summarize)
    }

    fn queue_summaries(&self) -> Vec<UserSummary> {
        self.mic.queue().filter_map(|id| self.summary_of(id)).collect()
    }

    fn pending_summaries(&self) -> Vec<UserSummary> {
        self.mic.pending().filter_map(|id| self.summary_of(id)).collect()
    }

    fn queue_update_message(&self) -> ServerMessage {
        ServerMessage::QueueUpdated {
            speaker: self.mic.speaker().and_then(|id| self.summary_of(id)),
            queue: self.queue_summaries(),
        }
    }

    fn snapshot(&self, speak_secs: u64) -> RoomSnapshot {
        RoomSnapshot {
            users: self.users.values().map(summarize).collect(),
            speaker: self.mic.speaker().and_then(|id| self.summary_of(id)),
            queue: self.queue_summaries(),
            pending: self.pending_summaries(),
            locked: self.locked,
            manual_approval: self.manual_approval,
            speak_secs,
            permissions: self.matrix.clone(),
        }
    }

    /// Broadcast a message to all connected users
    fn broadcast_all(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, user) in &self.users {
            deliver(id, &user.sender, json.clone());
        }
    }

    /// Broadcast a message to all users except the given one
    fn broadcast_except(&self, exclude_id: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, user) in &self.users {
            if id != exclude_id {
                deliver(id, &user.sender, json.clone());
            }
        }
    }

    /// Broadcast a message to every user whose role carries `action` —
    /// used for admin-facing notifications like pending mic requests
    fn broadcast_to_capable(&self, action: Action, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, user) in &self.users {
            if self.matrix.can(user.role, action) {
                deliver(id, &user.sender, json.clone());
            }
        }
    }

    /// Send a message to a specific user
    fn send_to(&self, user_id: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize message: {}", e);
                return;
            }
        };
        if let Some(user) = self.users.get(user_id) {
            deliver(user_id, &user.sender, json);
        }
    }
}

fn summarize(user: &User) -> UserSummary {
    UserSummary {
        id: user.id.clone(),
        name: user.name.clone(),
        role: user.role,
        muted: user.muted,
        avatar: user.avatar.clone(),
        settings: user.settings.clone(),
    }
}

fn deliver(user_id: &str, sender: &mpsc::Sender<Arc<String>>, json: Arc<String>) {
    match sender.try_send(json) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel full for user {}, dropping message", user_id);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for user {} (disconnected)", user_id);
        }
    }
}

/// Coordinates the single shared room: admissions, the speaking queue and
/// its countdown, moderation actions, and permission updates. Every
/// privileged request passes through the permission matrix before touching
/// shared state.
pub struct RoomCoordinator {
    room: Arc<TokioRwLock<Room>>,
    registry: Registry,
    store: Store,
    metrics: ServerMetrics,
    settings: RoomSettings,
}

impl RoomCoordinator {
    pub fn new(
        settings: RoomSettings,
        matrix: PermissionMatrix,
        registry: Registry,
        store: Store,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            room: Arc::new(TokioRwLock::new(Room::new(matrix, &settings))),
            registry,
            store,
            metrics,
            settings,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn user_count(&self) -> usize {
        self.room.read().await.users.len()
    }

    pub async fn queue_len(&self) -> usize {
        self.room.read().await.mic.queue().count()
    }

    pub async fn user_role(&self, user_id: &str) -> Option<Role> {
        self.room.read().await.users.get(user_id).map(|u| u.role)
    }

    /// Admit a user into the room. Display names are unique among active
    /// sessions; joining under a preconfigured admin name requires the
    /// matching password. The first user in an empty room becomes owner
    /// unless an admin account says otherwise.
    #[allow(clippy::too_many_arguments)]
    pub async fn join(
        &self,
        user_id: &str,
        name: &str,
        password: Option<&str>,
        avatar: Option<String>,
        address: String,
        device_id: String,
        sender: mpsc::Sender<Arc<String>>,
    ) -> ChatResult<RoomSnapshot> {
        // Admin lookup and password check happen before taking the room lock
        let admin_role = match self.registry.find_admin(name) {
            Some(admin) => {
                let ok = password.is_some_and(|p| verify_password(p, &admin.password_hash));
                if !ok {
                    info!("join: rejected admin login for {}", name);
                    return Err(ChatError::Unauthorized("admin login"));
                }
                Some(admin.role)
            }
            None => None,
        };

        let mut room = self.room.write().await;

        if room.is_name_taken(name) {
            return Err(ChatError::NameTaken(name.to_string()));
        }

        let role = match admin_role {
            Some(role) => role,
            None if room.users.is_empty() => Role::Owner,
            None => Role::Member,
        };

        let user = User {
            id: user_id.to_string(),
            name: name.to_string(),
            role,
            muted: false,
            avatar: avatar.unwrap_or_default(),
            settings: DisplaySettings::default(),
            sender,
            address,
            device_id,
        };
        let joined = summarize(&user);
        room.users.insert(user_id.to_string(), user);
        self.metrics.inc_joins();

        info!("join: {} ({}) joined as {}", user_id, name, role.name());
        room.broadcast_except(user_id, &ServerMessage::UserJoined { user: joined });

        Ok(room.snapshot(self.settings.speak_secs))
    }

    /// Remove a session entirely: mic structures, user record, broadcasts.
    /// Safe to call for ids that never joined (no-op).
    pub async fn disconnect(&self, user_id: &str) {
        let mut room = self.room.write().await;
        if self.remove_user(&mut room, user_id).is_some() {
            self.metrics.inc_leaves();
            info!("leave: {} left the room", user_id);
        }
    }

    /// Relay a chat message to everyone. Muted users are rejected.
    pub async fn chat(&self, user_id: &str, text: String, reply_to: Option<String>) -> ChatResult<()> {
        let room = self.room.read().await;
        let user = room
            .users
            .get(user_id)
            .ok_or_else(|| ChatError::UserNotFound(user_id.to_string()))?;
        if !moderation::can_chat(user.muted) {
            return Err(ChatError::Unauthorized("chat"));
        }
        room.broadcast_all(&ServerMessage::ChatMessage {
            user_id: user.id.clone(),
            name: user.name.clone(),
            avatar: user.avatar.clone(),
            text,
            color: user.settings.color.clone(),
            font_size: user.settings.font_size.clone(),
            reply_to,
            attachment: None,
        });
        self.metrics.inc_chat_messages();
        Ok(())
    }

    /// Broadcast a chat message carrying an uploaded attachment link.
    pub async fn broadcast_attachment(&self, user_id: &str, url: String) -> ChatResult<()> {
        let room = self.room.read().await;
        let user = room
            .users
            .get(user_id)
            .ok_or_else(|| ChatError::UserNotFound(user_id.to_string()))?;
        room.broadcast_all(&ServerMessage::ChatMessage {
            user_id: user.id.clone(),
            name: user.name.clone(),
            avatar: user.avatar.clone(),
            text: "📎 attachment".to_string(),
            color: user.settings.color.clone(),
            font_size: user.settings.font_size.clone(),
            reply_to: None,
            attachment: Some(url),
        });
        Ok(())
    }

    /// Ask for the mic. Locked rooms reject requesters without the
    /// `override-lock` capability; manual-approval mode parks the request
    /// for admin sign-off instead of queueing it.
    pub async fn request_speak(&self, user_id: &str) -> ChatResult<()> {
        let mut room = self.room.write().await;
        let user = room
            .users
            .get(user_id)
            .ok_or_else(|| ChatError::UserNotFound(user_id.to_string()))?;
        if room.locked && !room.matrix.can(user.role, Action::OverrideLock) {
            return Err(ChatError::RoomLocked);
        }

        let manual = room.manual_approval;
        match room.mic.request(user_id, manual) {
            RequestOutcome::Unchanged => Ok(()),
            RequestOutcome::PendingApproval => {
                info!("speak: {} awaits approval", user_id);
                if let Some(user) = room.summary_of(user_id) {
                    room.broadcast_to_capable(
                        Action::ApproveSpeak,
                        &ServerMessage::SpeakRequested { user },
                    );
                }
                let pending = room.pending_summaries();
                room.broadcast_to_capable(
                    Action::ApproveSpeak,
                    &ServerMessage::PendingUpdated { pending },
                );
                Ok(())
            }
            RequestOutcome::Queued => {
                self.promote_if_idle(&mut room);
                let update = room.queue_update_message();
                room.broadcast_all(&update);
                Ok(())
            }
        }
    }

    /// Give up the mic. Only valid for the current speaker.
    pub async fn release_speak(&self, user_id: &str) -> ChatResult<()> {
        let mut room = self.room.write().await;
        self.release_internal(&mut room, user_id)
    }

    /// Take the mic from `target_id` on their behalf (disconnect cleanup,
    /// abuse handling). Requires the `force-release` capability.
    pub async fn force_release(&self, admin_id: &str, target_id: &str) -> ChatResult<()> {
        let mut room = self.room.write().await;
        require(&room, admin_id, Action::ForceRelease)?;
        info!("speak: {} force-released the mic from {}", admin_id, target_id);
        self.release_internal(&mut room, target_id)
    }

    fn release_internal(&self, room: &mut Room, user_id: &str) -> ChatResult<()> {
        if !room.mic.release(user_id) {
            return Err(ChatError::NotSpeaking);
        }
        if let Some(timer) = room.speak_timer.take() {
            timer.abort();
        }
        info!("speak: {} released the mic", user_id);
        room.broadcast_all(&ServerMessage::SpeakReleased { user_id: user_id.to_string() });
        self.promote_if_idle(room);
        let update = room.queue_update_message();
        room.broadcast_all(&update);
        Ok(())
    }

    /// Move a pending mic request into the wait queue. Requires the
    /// `approve-speak` capability. Approving a user who is no longer
    /// pending is a harmless no-op.
    pub async fn approve_speak(&self, admin_id: &str, target_id: &str) -> ChatResult<()> {
        let mut room = self.room.write().await;
        require(&room, admin_id, Action::ApproveSpeak)?;
        if !room.mic.approve(target_id) {
            return Ok(());
        }
        info!("speak: {} approved mic request from {}", admin_id, target_id);
        let pending = room.pending_summaries();
        room.broadcast_to_capable(Action::ApproveSpeak, &ServerMessage::PendingUpdated { pending });
        self.promote_if_idle(&mut room);
        let update = room.queue_update_message();
        room.broadcast_all(&update);
        Ok(())
    }

    /// Discard a pending mic request. Requires the `approve-speak`
    /// capability.
    pub async fn reject_speak(&self, admin_id: &str, target_id: &str) -> ChatResult<()> {
        let mut room = self.room.write().await;
        require(&room, admin_id, Action::ApproveSpeak)?;
        if !room.mic.reject(target_id) {
            return Ok(());
        }
        info!("speak: {} rejected mic request from {}", admin_id, target_id);
        let pending = room.pending_summaries();
        room.broadcast_to_capable(Action::ApproveSpeak, &ServerMessage::PendingUpdated { pending });
        Ok(())
    }

    /// Mute or unmute a user's chat. Requires the `mute` capability.
    pub async fn set_mute(&self, admin_id: &str, target_id: &str, muted: bool) -> ChatResult<()> {
        let mut room = self.room.write().await;
        require(&room, admin_id, Action::Mute)?;
        let target = room
            .users
            .get_mut(target_id)
            .ok_or_else(|| ChatError::UserNotFound(target_id.to_string()))?;
        target.muted = muted;
        info!("mute: {} set muted={} on {}", admin_id, muted, target_id);
        room.broadcast_all(&ServerMessage::MuteChanged { user_id: target_id.to_string(), muted });
        Ok(())
    }

    /// Change a user's role. Requires the `set-role` capability. An active
    /// speaking slot is not vacated by a role change.
    pub async fn set_role(&self, admin_id: &str, target_id: &str, role: Role) -> ChatResult<()> {
        let mut room = self.room.write().await;
        require(&room, admin_id, Action::SetRole)?;
        let changed_by = room.users.get(admin_id).map(|u| u.name.clone()).unwrap_or_default();
        let target = room
            .users
            .get_mut(target_id)
            .ok_or_else(|| ChatError::UserNotFound(target_id.to_string()))?;
        target.role = role;
        info!("set_role: {} set {} to {}", admin_id, target_id, role.name());
        room.broadcast_all(&ServerMessage::RoleChanged {
            user_id: target_id.to_string(),
            role,
            changed_by,
        });
        Ok(())
    }

    /// Remove a user from the room. Requires the `kick` capability.
    pub async fn kick(&self, admin_id: &str, target_id: &str) -> ChatResult<()> {
        let mut room = self.room.write().await;
        require(&room, admin_id, Action::Kick)?;
        if !room.users.contains_key(target_id) {
            return Err(ChatError::UserNotFound(target_id.to_string()));
        }
        // The target receives the kick notice before removal
        room.broadcast_all(&ServerMessage::Kicked { user_id: target_id.to_string() });
        self.remove_user(&mut room, target_id);
        info!("kick: {} kicked {}", admin_id, target_id);
        Ok(())
    }

    /// Ban a user's address and device fingerprint, then remove them.
    /// Requires the `ban` capability. The ban gates future admissions; this
    /// pairing with a kick is what ends the current session.
    pub async fn ban(&self, admin_id: &str, target_id: &str) -> ChatResult<()> {
        let mut room = self.room.write().await;
        require(&room, admin_id, Action::Ban)?;
        let target = room
            .users
            .get(target_id)
            .ok_or_else(|| ChatError::UserNotFound(target_id.to_string()))?;

        let entry = BanEntry {
            address: Some(target.address.clone()),
            device_id: (!target.device_id.is_empty()).then(|| target.device_id.clone()),
        };
        self.registry.add_ban(entry);

        room.broadcast_all(&ServerMessage::Banned { user_id: target_id.to_string() });
        let banned = self.registry.banned_snapshot();
        room.broadcast_all(&ServerMessage::BanUpdated { banned });
        self.remove_user(&mut room, target_id);
        info!("ban: {} banned {}", admin_id, target_id);
        Ok(())
    }

    /// Remove ban entries by address and/or device fingerprint. Requires
    /// the `unban` capability.
    pub async fn unban(
        &self,
        admin_id: &str,
        address: Option<&str>,
        device_id: Option<&str>,
    ) -> ChatResult<()> {
        let room = self.room.read().await;
        require(&room, admin_id, Action::Unban)?;
        if self.registry.remove_ban(address, device_id) {
            info!("unban: {} removed ban entries", admin_id);
            let banned = self.registry.banned_snapshot();
            room.broadcast_all(&ServerMessage::BanUpdated { banned });
        }
        Ok(())
    }

    /// Open or close the room to new speaking requests. Requires the
    /// `lock-room` capability.
    pub async fn set_room_lock(&self, admin_id: &str, locked: bool) -> ChatResult<()> {
        let mut room = self.room.write().await;
        require(&room, admin_id, Action::LockRoom)?;
        room.locked = locked;
        info!("lock: {} set room lock to {}", admin_id, locked);
        room.broadcast_all(&ServerMessage::RoomLockChanged { locked });
        Ok(())
    }

    /// Toggle manual-approval mode. Already-pending requests stay pending
    /// when the mode is switched off; admins can still approve or reject
    /// them.
    pub async fn set_manual_approval(&self, admin_id: &str, enabled: bool) -> ChatResult<()> {
        let mut room = self.room.write().await;
        require(&room, admin_id, Action::LockRoom)?;
        room.manual_approval = enabled;
        info!("approval: {} set manual approval to {}", admin_id, enabled);
        room.broadcast_all(&ServerMessage::ManualApprovalChanged { enabled });
        Ok(())
    }

    /// Update own display settings.
    pub async fn update_settings(
        &self,
        user_id: &str,
        color: Option<String>,
        font_size: Option<String>,
        avatar: Option<String>,
    ) -> ChatResult<()> {
        let mut room = self.room.write().await;
        let user = room
            .users
            .get_mut(user_id)
            .ok_or_else(|| ChatError::UserNotFound(user_id.to_string()))?;
        if let Some(color) = color {
            user.settings.color = color;
        }
        if let Some(font_size) = font_size {
            user.settings.font_size = font_size;
        }
        if let Some(avatar) = avatar {
            user.avatar = avatar;
        }
        if let Some(user) = room.summary_of(user_id) {
            room.broadcast_all(&ServerMessage::SettingsChanged { user });
        }
        Ok(())
    }

    /// Send the current permission matrix to the requester.
    pub async fn send_permissions(&self, user_id: &str) {
        let room = self.room.read().await;
        let permissions = room.matrix.clone();
        room.send_to(user_id, &ServerMessage::PermissionsUpdated { permissions });
    }

    /// Replace the permission matrix wholesale, persist it, and notify all
    /// sessions. Requires the `edit-permissions` capability. Last writer
    /// wins.
    pub async fn update_permissions(&self, admin_id: &str, new: PermissionMatrix) -> ChatResult<()> {
        let mut room = self.room.write().await;
        require(&room, admin_id, Action::EditPermissions)?;
        room.matrix.replace(new);
        self.store.save_detached("role-permissions", &room.matrix);
        info!("permissions: {} replaced the permission matrix", admin_id);
        let permissions = room.matrix.clone();
        room.broadcast_all(&ServerMessage::PermissionsUpdated { permissions });
        Ok(())
    }

    /// Synchronously persist everything the coordinator owns, for shutdown.
    pub async fn flush(&self) {
        let matrix = self.room.read().await.matrix.clone();
        if let Err(e) = self.store.save("role-permissions", &matrix) {
            warn!("Failed to flush permission matrix: {}", e);
        }
        if let Err(e) = self.registry.flush() {
            warn!("Failed to flush ban list: {}", e);
        }
    }

    /// Remove a user and clean up every mic structure. The speaking slot is
    /// handed to the next waiter in the same processing step — no dangling
    /// references survive this call.
    fn remove_user(&self, room: &mut Room, user_id: &str) -> Option<User> {
        let user = room.users.remove(user_id)?;
        match room.mic.remove(user_id) {
            Removal::WasSpeaker => {
                if let Some(timer) = room.speak_timer.take() {
                    timer.abort();
                }
                room.broadcast_all(&ServerMessage::SpeakReleased { user_id: user_id.to_string() });
                self.promote_if_idle(room);
                let update = room.queue_update_message();
                room.broadcast_all(&update);
            }
            Removal::WasWaiting => {
                let update = room.queue_update_message();
                room.broadcast_all(&update);
            }
            Removal::WasPending => {
                let pending = room.pending_summaries();
                room.broadcast_to_capable(
                    Action::ApproveSpeak,
                    &ServerMessage::PendingUpdated { pending },
                );
            }
            Removal::NotPresent => {}
        }
        room.broadcast_all(&ServerMessage::UserLeft { user_id: user_id.to_string() });
        Some(user)
    }

    /// Promote the queue head if the slot is idle, announce the grant, and
    /// arm the countdown. The countdown restarts fully for each speaker.
    fn promote_if_idle(&self, room: &mut Room) {
        if room.mic.speaker().is_some() {
            return;
        }
        let Some(next_id) = room.mic.promote_next() else {
            return;
        };
        let secs = self.settings.speak_secs;
        info!("speak: mic granted to {} for {}s", next_id, secs);
        self.metrics.inc_speak_grants();
        room.broadcast_all(&ServerMessage::SpeakGranted { user_id: next_id, seconds: secs });
        if let Some(old) = room.speak_timer.take() {
            old.abort();
        }
        room.speak_timer = Some(spawn_expiry_timer(
            Arc::downgrade(&self.room),
            room.mic.grant_seq(),
            secs,
            self.metrics.clone(),
        ));
    }
}

/// Countdown for the current speaker. The task captures the grant sequence
/// at arm time and checks it again on fire, so a callback racing a manual
/// release is a no-op. Expiry then promotes the next waiter itself and keeps
/// running for the new grant, mirroring voluntary release exactly except for
/// the emitted event.
fn spawn_expiry_timer(
    weak_room: Weak<TokioRwLock<Room>>,
    granted_seq: u64,
    secs: u64,
    metrics: ServerMetrics,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut seq = granted_seq;
        loop {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let Some(room_arc) = weak_room.upgrade() else {
                return;
            };
            let mut room = room_arc.write().await;
            if room.mic.grant_seq() != seq {
                // A release or disconnect beat us to it
                return;
            }
            let Some(speaker) = room.mic.speaker().map(String::from) else {
                return;
            };
            info!("speak: countdown expired for {}", speaker);
            room.broadcast_all(&ServerMessage::SpeakExpired { user_id: speaker.clone() });
            room.mic.release(&speaker);

            if let Some(next_id) = room.mic.promote_next() {
                info!("speak: mic granted to {} for {}s", next_id, secs);
                metrics.inc_speak_grants();
                room.broadcast_all(&ServerMessage::SpeakGranted {
                    user_id: next_id,
                    seconds: secs,
                });
                let update = room.queue_update_message();
                room.broadcast_all(&update);
                seq = room.mic.grant_seq();
            } else {
                let update = room.queue_update_message();
                room.broadcast_all(&update);
                return;
            }
        }
    })
}

fn require(room: &Room, actor_id: &str, action: Action) -> ChatResult<Role> {
    let actor = room
        .users
        .get(actor_id)
        .ok_or_else(|| ChatError::UserNotFound(actor_id.to_string()))?;
    if !room.matrix.can(actor.role, action) {
        return Err(ChatError::Unauthorized(action.name()));
    }
    Ok(actor.role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn test_coordinator(settings: RoomSettings) -> RoomCoordinator {
        let dir = std::env::temp_dir().join(format!("openmic-test-{}", uuid::Uuid::new_v4()));
        let store = Store::with_dir(dir);
        let registry = Registry::load(store.clone());
        RoomCoordinator::new(
            settings,
            PermissionMatrix::default(),
            registry,
            store,
            ServerMetrics::new(),
        )
    }

    async fn join(coordinator: &RoomCoordinator, id: &str, name: &str) -> ChatResult<RoomSnapshot> {
        let (tx, rx) = mpsc::channel(64);
        // Keep receivers alive so try_send never reports closed channels
        std::mem::forget(rx);
        coordinator
            .join(id, name, None, None, "127.0.0.1".to_string(), format!("dev-{id}"), tx)
            .await
    }

    fn mute_only_mod_matrix() -> PermissionMatrix {
        let mut grants = HashMap::new();
        grants.insert(Role::Mod, HashSet::from([Action::Mute]));
        grants.insert(
            Role::Owner,
            HashSet::from([Action::EditPermissions, Action::SetRole]),
        );
        PermissionMatrix::from_grants(grants)
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let coordinator = test_coordinator(RoomSettings::default());
        join(&coordinator, "u1", "alice").await.unwrap();

        let err = join(&coordinator, "u2", "alice").await.unwrap_err();
        assert!(matches!(err, ChatError::NameTaken(_)));
        // The first session is unaffected
        assert_eq!(coordinator.user_count().await, 1);
        assert_eq!(coordinator.user_role("u1").await, Some(Role::Owner));
    }

    #[tokio::test]
    async fn test_first_joiner_owns_the_room_rest_are_members() {
        let coordinator = test_coordinator(RoomSettings::default());
        join(&coordinator, "u1", "alice").await.unwrap();
        join(&coordinator, "u2", "bob").await.unwrap();

        assert_eq!(coordinator.user_role("u1").await, Some(Role::Owner));
        assert_eq!(coordinator.user_role("u2").await, Some(Role::Member));
    }

    #[tokio::test]
    async fn test_capability_matrix_gates_moderation() {
        let coordinator = test_coordinator(RoomSettings::default());
        join(&coordinator, "owner", "alice").await.unwrap();
        join(&coordinator, "mod", "bob").await.unwrap();
        join(&coordinator, "victim", "carol").await.unwrap();

        coordinator.set_role("owner", "mod", Role::Mod).await.unwrap();
        coordinator
            .update_permissions("owner", mute_only_mod_matrix())
            .await
            .unwrap();

        // Matrix {mod: [mute]}: kick is unauthorized, mute is allowed
        let err = coordinator.kick("mod", "victim").await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(_)));
        coordinator.set_mute("mod", "victim", true).await.unwrap();

        let room = coordinator.room.read().await;
        assert!(room.users.get("victim").unwrap().muted);
        assert_eq!(room.users.len(), 3);
    }

    #[tokio::test]
    async fn test_replacing_matrix_drops_old_grants() {
        let coordinator = test_coordinator(RoomSettings::default());
        join(&coordinator, "owner", "alice").await.unwrap();
        join(&coordinator, "other", "bob").await.unwrap();

        coordinator
            .update_permissions("owner", mute_only_mod_matrix())
            .await
            .unwrap();

        // The wholesale replacement removed the owner's kick grant too
        let err = coordinator.kick("owner", "other").await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized("kick")));
    }

    #[tokio::test]
    async fn test_fifo_queue_and_voluntary_release() {
        let coordinator = test_coordinator(RoomSettings::default());
        for (id, name) in [("a", "alice"), ("b", "bob"), ("c", "carol")] {
            join(&coordinator, id, name).await.unwrap();
        }

        coordinator.request_speak("a").await.unwrap();
        coordinator.request_speak("b").await.unwrap();
        coordinator.request_speak("c").await.unwrap();

        {
            let room = coordinator.room.read().await;
            assert_eq!(room.mic.speaker(), Some("a"));
            assert_eq!(room.mic.queue().collect::<Vec<_>>(), ["b", "c"]);
        }

        coordinator.release_speak("a").await.unwrap();
        {
            let room = coordinator.room.read().await;
            assert_eq!(room.mic.speaker(), Some("b"));
            assert_eq!(room.mic.queue().collect::<Vec<_>>(), ["c"]);
        }

        // Release by a non-speaker is refused
        let err = coordinator.release_speak("c").await.unwrap_err();
        assert!(matches!(err, ChatError::NotSpeaking));
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_expiry_rotates_the_queue() {
        let settings = RoomSettings { speak_secs: 30, ..RoomSettings::default() };
        let coordinator = test_coordinator(settings);
        for (id, name) in [("a", "alice"), ("b", "bob"), ("c", "carol")] {
            join(&coordinator, id, name).await.unwrap();
        }
        coordinator.request_speak("a").await.unwrap();
        coordinator.request_speak("b").await.unwrap();
        coordinator.request_speak("c").await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        {
            let room = coordinator.room.read().await;
            assert_eq!(room.mic.speaker(), Some("b"));
            assert_eq!(room.mic.queue().collect::<Vec<_>>(), ["c"]);
        }

        // The countdown restarted fully for the promoted speaker
        tokio::time::sleep(Duration::from_secs(31)).await;
        let room = coordinator.room.read().await;
        assert_eq!(room.mic.speaker(), Some("c"));
        assert_eq!(room.mic.queue().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_after_manual_release_is_a_no_op() {
        let settings = RoomSettings { speak_secs: 30, ..RoomSettings::default() };
        let coordinator = test_coordinator(settings);
        join(&coordinator, "a", "alice").await.unwrap();
        join(&coordinator, "b", "bob").await.unwrap();

        coordinator.request_speak("a").await.unwrap();
        coordinator.request_speak("b").await.unwrap();

        // Manual release promotes b well before a's deadline
        tokio::time::sleep(Duration::from_secs(5)).await;
        coordinator.release_speak("a").await.unwrap();
        {
            let room = coordinator.room.read().await;
            assert_eq!(room.mic.speaker(), Some("b"));
        }

        // Past a's original deadline: b must still hold the mic
        tokio::time::sleep(Duration::from_secs(26)).await;
        let room = coordinator.room.read().await;
        assert_eq!(room.mic.speaker(), Some("b"));
    }

    #[tokio::test]
    async fn test_disconnecting_speaker_promotes_next_in_same_step() {
        let coordinator = test_coordinator(RoomSettings::default());
        join(&coordinator, "a", "alice").await.unwrap();
        join(&coordinator, "b", "bob").await.unwrap();

        coordinator.request_speak("a").await.unwrap();
        coordinator.request_speak("b").await.unwrap();

        coordinator.disconnect("a").await;
        let room = coordinator.room.read().await;
        assert!(!room.users.contains_key("a"));
        assert_eq!(room.mic.speaker(), Some("b"));
        assert_eq!(room.mic.queue().count(), 0);
    }

    #[tokio::test]
    async fn test_manual_approval_holds_requests_until_signed_off() {
        let coordinator = test_coordinator(RoomSettings::default());
        join(&coordinator, "owner", "alice").await.unwrap();
        join(&coordinator, "d", "dave").await.unwrap();

        coordinator.set_manual_approval("owner", true).await.unwrap();
        coordinator.request_speak("d").await.unwrap();
        {
            let room = coordinator.room.read().await;
            assert!(room.mic.is_pending("d"));
            assert!(!room.mic.is_waiting("d"));
            assert_eq!(room.mic.speaker(), None);
        }

        // Rejection discards the request for good — dave never speaks
        coordinator.reject_speak("owner", "d").await.unwrap();
        let room = coordinator.room.read().await;
        assert!(!room.mic.is_pending("d"));
        assert_eq!(room.mic.speaker(), None);
        assert_eq!(room.mic.queue().count(), 0);
    }

    #[tokio::test]
    async fn test_approved_request_joins_the_queue() {
        let coordinator = test_coordinator(RoomSettings::default());
        join(&coordinator, "owner", "alice").await.unwrap();
        join(&coordinator, "d", "dave").await.unwrap();

        coordinator.set_manual_approval("owner", true).await.unwrap();
        coordinator.request_speak("d").await.unwrap();
        coordinator.approve_speak("owner", "d").await.unwrap();

        let room = coordinator.room.read().await;
        // Idle slot: approval promotes immediately
        assert_eq!(room.mic.speaker(), Some("d"));
        assert!(!room.mic.is_pending("d"));
    }

    #[tokio::test]
    async fn test_locked_room_rejects_without_override() {
        let coordinator = test_coordinator(RoomSettings::default());
        join(&coordinator, "owner", "alice").await.unwrap();
        join(&coordinator, "b", "bob").await.unwrap();

        coordinator.set_room_lock("owner", true).await.unwrap();

        let err = coordinator.request_speak("b").await.unwrap_err();
        assert!(matches!(err, ChatError::RoomLocked));

        // Owner carries override-lock in the default matrix
        coordinator.request_speak("owner").await.unwrap();
        let room = coordinator.room.read().await;
        assert_eq!(room.mic.speaker(), Some("owner"));
    }

    #[tokio::test]
    async fn test_ban_records_both_fingerprints_and_removes_user() {
        let coordinator = test_coordinator(RoomSettings::default());
        join(&coordinator, "owner", "alice").await.unwrap();
        join(&coordinator, "b", "bob").await.unwrap();

        coordinator.ban("owner", "b").await.unwrap();

        assert_eq!(coordinator.user_count().await, 1);
        assert!(coordinator.registry().is_banned("127.0.0.1", "anything"));
        assert!(coordinator.registry().is_banned("10.9.9.9", "dev-b"));
    }

    #[tokio::test]
    async fn test_muted_user_cannot_chat() {
        let coordinator = test_coordinator(RoomSettings::default());
        join(&coordinator, "owner", "alice").await.unwrap();
        join(&coordinator, "b", "bob").await.unwrap();

        coordinator.set_mute("owner", "b", true).await.unwrap();
        let err = coordinator.chat("b", "hello".to_string(), None).await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized("chat")));

        coordinator.set_mute("owner", "b", false).await.unwrap();
        coordinator.chat("b", "hello".to_string(), None).await.unwrap();
    }
}
