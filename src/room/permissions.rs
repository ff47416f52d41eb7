#![forbid(unsafe_code)]

// Role hierarchy and the runtime-editable role → capability matrix.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest = 0,
    Member = 1,
    Mod = 2,
    Admin = 3,
    Superadmin = 4,
    Owner = 5,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Superadmin => "superadmin",
            Role::Admin => "admin",
            Role::Mod => "mod",
            Role::Member => "member",
            Role::Guest => "guest",
        }
    }
}

/// Privileged actions gated by the permission matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Mute,
    Kick,
    Ban,
    Unban,
    SetRole,
    ApproveSpeak,
    ForceRelease,
    EditPermissions,
    LockRoom,
    OverrideLock,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Mute => "mute",
            Action::Kick => "kick",
            Action::Ban => "ban",
            Action::Unban => "unban",
            Action::SetRole => "set-role",
            Action::ApproveSpeak => "approve-speak",
            Action::ForceRelease => "force-release",
            Action::EditPermissions => "edit-permissions",
            Action::LockRoom => "lock-room",
            Action::OverrideLock => "override-lock",
        }
    }
}

const ALL_ACTIONS: [Action; 10] = [
    Action::Mute,
    Action::Kick,
    Action::Ban,
    Action::Unban,
    Action::SetRole,
    Action::ApproveSpeak,
    Action::ForceRelease,
    Action::EditPermissions,
    Action::LockRoom,
    Action::OverrideLock,
];

/// Mapping from role to its permitted actions. Roles absent from the map
/// have an empty capability set — lookups fail closed rather than erroring
/// on unknown roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionMatrix {
    grants: HashMap<Role, HashSet<Action>>,
}

impl PermissionMatrix {
    pub fn empty() -> Self {
        Self { grants: HashMap::new() }
    }

    pub fn from_grants(grants: HashMap<Role, HashSet<Action>>) -> Self {
        Self { grants }
    }

    /// True iff `action` is in `role`'s capability set.
    pub fn can(&self, role: Role, action: Action) -> bool {
        self.grants.get(&role).is_some_and(|set| set.contains(&action))
    }

    /// Wholesale replacement — last writer wins, no merge semantics.
    pub fn replace(&mut self, new: PermissionMatrix) {
        self.grants = new.grants;
    }
}

impl Default for PermissionMatrix {
    /// The built-in matrix, used when no persisted matrix exists. Owner and
    /// superadmin hold every capability so the matrix itself always stays
    /// editable by someone.
    fn default() -> Self {
        let mut grants: HashMap<Role, HashSet<Action>> = HashMap::new();
        grants.insert(Role::Owner, ALL_ACTIONS.into_iter().collect());
        grants.insert(Role::Superadmin, ALL_ACTIONS.into_iter().collect());
        grants.insert(
            Role::Admin,
            [
                Action::Mute,
                Action::Kick,
                Action::Ban,
                Action::Unban,
                Action::SetRole,
                Action::ApproveSpeak,
                Action::ForceRelease,
                Action::LockRoom,
            ]
            .into_iter()
            .collect(),
        );
        grants.insert(
            Role::Mod,
            [Action::Mute, Action::Kick, Action::ApproveSpeak, Action::ForceRelease]
                .into_iter()
                .collect(),
        );
        Self { grants }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Owner > Role::Superadmin);
        assert!(Role::Superadmin > Role::Admin);
        assert!(Role::Admin > Role::Mod);
        assert!(Role::Mod > Role::Member);
        assert!(Role::Member > Role::Guest);
    }

    #[test]
    fn test_absent_role_fails_closed() {
        let mut grants = HashMap::new();
        grants.insert(Role::Mod, HashSet::from([Action::Mute]));
        let matrix = PermissionMatrix::from_grants(grants);

        for action in ALL_ACTIONS {
            assert!(!matrix.can(Role::Admin, action));
            assert!(!matrix.can(Role::Guest, action));
        }
    }

    #[test]
    fn test_mod_with_mute_only() {
        let mut grants = HashMap::new();
        grants.insert(Role::Mod, HashSet::from([Action::Mute]));
        let matrix = PermissionMatrix::from_grants(grants);

        assert!(matrix.can(Role::Mod, Action::Mute));
        assert!(!matrix.can(Role::Mod, Action::Kick));
    }

    #[test]
    fn test_replace_is_wholesale() {
        let mut matrix = PermissionMatrix::default();
        assert!(matrix.can(Role::Mod, Action::Mute));

        let mut grants = HashMap::new();
        grants.insert(Role::Member, HashSet::from([Action::Mute]));
        matrix.replace(PermissionMatrix::from_grants(grants));

        assert!(matrix.can(Role::Member, Action::Mute));
        // Old grants are gone, not merged
        assert!(!matrix.can(Role::Mod, Action::Mute));
        assert!(!matrix.can(Role::Owner, Action::Kick));
    }

    #[test]
    fn test_default_matrix_keeps_itself_editable() {
        let matrix = PermissionMatrix::default();
        assert!(matrix.can(Role::Owner, Action::EditPermissions));
        assert!(matrix.can(Role::Superadmin, Action::OverrideLock));
        assert!(!matrix.can(Role::Admin, Action::EditPermissions));
        assert!(!matrix.can(Role::Member, Action::Mute));
    }

    #[test]
    fn test_wire_format_uses_kebab_case_actions() {
        let mut grants = HashMap::new();
        grants.insert(Role::Mod, HashSet::from([Action::ApproveSpeak]));
        let json = serde_json::to_string(&PermissionMatrix::from_grants(grants)).unwrap();
        assert_eq!(json, r#"{"mod":["approve-speak"]}"#);

        let parsed: PermissionMatrix = serde_json::from_str(&json).unwrap();
        assert!(parsed.can(Role::Mod, Action::ApproveSpeak));
    }
}
