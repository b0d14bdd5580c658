// dumpship/src/utils/identity.rs
use nix::unistd::{Uid, User};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::errors::{BackupError, Result};

/// Source of the name of the OS user running this process.
#[cfg_attr(test, automock)]
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Result<String>;
}

/// Reads the real uid and its passwd entry.
pub struct OsIdentity;

impl IdentityProvider for OsIdentity {
    fn current_user(&self) -> Result<String> {
        let uid = Uid::current();
        match User::from_uid(uid) {
            Ok(Some(user)) => Ok(user.name),
            Ok(None) => Err(BackupError::Identity(format!("no passwd entry for uid {}", uid))),
            Err(e) => Err(BackupError::Identity(e.to_string())),
        }
    }
}

/// Fails unless the process runs as `expected`.
pub fn ensure_os_user(provider: &dyn IdentityProvider, expected: &str) -> Result<()> {
    let actual = provider.current_user()?;
    if actual != expected {
        return Err(BackupError::IdentityMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    debug!(user = %actual, "Running as the database owner");
    Ok(())
}
