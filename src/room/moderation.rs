#![forbid(unsafe_code)]

use crate::room::permissions::Role;

/// Check if a user can send chat messages (not muted).
pub fn can_chat(muted: bool) -> bool {
    !muted
}

/// Check if a role can upload attachments. The upload gate is a fixed role
/// floor (mod and above), independent of the editable permission matrix.
pub fn can_upload(role: Role) -> bool {
    role >= Role::Mod
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_muted_users_cannot_chat() {
        assert!(can_chat(false));
        assert!(!can_chat(true));
    }

    #[test]
    fn test_upload_role_floor() {
        assert!(can_upload(Role::Owner));
        assert!(can_upload(Role::Superadmin));
        assert!(can_upload(Role::Admin));
        assert!(can_upload(Role::Mod));
        assert!(!can_upload(Role::Member));
        assert!(!can_upload(Role::Guest));
    }
}
