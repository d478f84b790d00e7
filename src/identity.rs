use std::collections::HashSet;
use std::ffi::{CStr, CString};

use anyhow::Result;
use libc::{getpwnam, getpwuid, uid_t};

/// An account confirmed to exist by a [`CredentialStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRef {
    pub username: String,
    pub uid: Option<u32>,
}

/// Username lookup consulted before a verification session starts.
pub trait CredentialStore: Send + Sync {
    fn resolve_identity(&self, username: &str) -> Option<IdentityRef>;
}

/// Resolves against the system password database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAccounts;

impl CredentialStore for SystemAccounts {
    fn resolve_identity(&self, username: &str) -> Option<IdentityRef> {
        let name = CString::new(username).ok()?;
        // SAFETY: getpwnam returns null or a pointer to static storage that
        // stays valid until the next getpw* call on this thread.
        unsafe {
            let pwd = getpwnam(name.as_ptr());
            if pwd.is_null() {
                return None;
            }
            Some(IdentityRef {
                username: CStr::from_ptr((*pwd).pw_name)
                    .to_string_lossy()
                    .into_owned(),
                uid: Some((*pwd).pw_uid),
            })
        }
    }
}

/// Fixed set of known usernames, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashSet<String>,
}

impl StaticCredentials {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: users.into_iter().map(Into::into).collect(),
        }
    }
}

impl CredentialStore for StaticCredentials {
    fn resolve_identity(&self, username: &str) -> Option<IdentityRef> {
        self.users.contains(username).then(|| IdentityRef {
            username: username.to_string(),
            uid: None,
        })
    }
}

pub fn current_user_id() -> Result<String> {
    if let Ok(user) = std::env::var("SUDO_USER") {
        return Ok(user);
    }
    unsafe {
        let uid = libc::geteuid();
        let pwd = getpwuid(uid as uid_t);
        if pwd.is_null() {
            return Err(anyhow::anyhow!("failed to resolve current user"));
        }
        let name = CStr::from_ptr((*pwd).pw_name);
        Ok(name.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials_resolve_known_users_only() {
        let creds = StaticCredentials::new(["alice", "bob"]);
        assert_eq!(
            creds.resolve_identity("alice").map(|i| i.username),
            Some("alice".to_string())
        );
        assert!(creds.resolve_identity("mallory").is_none());
    }

    #[test]
    fn system_accounts_know_root() {
        let root = SystemAccounts.resolve_identity("root").unwrap();
        assert_eq!(root.uid, Some(0));
        assert!(SystemAccounts
            .resolve_identity("no-such-user-facegate")
            .is_none());
    }

    #[test]
    fn interior_nul_is_not_a_user() {
        assert!(SystemAccounts.resolve_identity("ro\0ot").is_none());
    }
}
