//! Deterministic collaborators for tests and local embedding.
//!
//! None of these are suitable for production: the clock stands still, IDs
//! are guessable, and [`PlainHasher`] does not hash.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use crate::command::CommandContext;
use crate::crypto::AesGcmEncryption;
use crate::error::{CommandError, CryptoError};
use crate::services::{Clock, IdGenerator, PasswordHasher, PermissionCheck};

/// Key ID of [`test_encryption`].
pub const TEST_KEY_ID: &str = "test-key-1";

const TEST_KEY: [u8; 32] = [7u8; 32];

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// 2024-01-01T00:00:00Z.
    pub fn epoch() -> Self {
        Self::new(Utc.timestamp_opt(1_704_067_200, 0).single().unwrap_or_default())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.lock() = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.lock();
        *now += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// IDs of the form `{prefix}-{n}`, counting from 1.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> Result<String, CommandError> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(format!("{}-{n}", self.prefix))
    }
}

/// Rejects every permission check.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl PermissionCheck for DenyAll {
    fn check_permission(
        &self,
        _ctx: &CommandContext,
        permission: &str,
        _resource_owner: &str,
        target_id: &str,
    ) -> Result<(), CommandError> {
        Err(CommandError::PermissionDenied(format!(
            "{permission} on {target_id}"
        )))
    }
}

/// Stores passwords with a marker prefix instead of hashing them.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainHasher;

impl PasswordHasher for PlainHasher {
    fn hash(&self, password: &str) -> Result<String, CommandError> {
        Ok(format!("plain${password}"))
    }
}

/// AES-256-GCM keyring with a single well-known key.
///
/// # Errors
///
/// Never fails in practice; the key material is fixed and well-formed.
pub fn test_encryption() -> Result<AesGcmEncryption, CryptoError> {
    AesGcmEncryption::new(TEST_KEY_ID, &TEST_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_moves_only_when_told() {
        let clock = FixedClock::epoch();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance(TimeDelta::minutes(5));
        assert_eq!(clock.now() - t0, TimeDelta::minutes(5));
    }

    #[test]
    fn sequential_ids_count_up() {
        let ids = SequentialIds::new("user");
        assert_eq!(ids.next_id().expect("id"), "user-1");
        assert_eq!(ids.next_id().expect("id"), "user-2");
    }

    #[test]
    fn deny_all_denies() {
        let ctx = CommandContext::new("inst-1");
        assert!(matches!(
            DenyAll.check_permission(&ctx, "user.write", "org-1", "u-1"),
            Err(CommandError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_encryption_is_stable() {
        use crate::crypto::{self, EncryptionAlgorithm};
        let alg = test_encryption().expect("key should be accepted");
        assert_eq!(alg.encryption_key_id(), TEST_KEY_ID);
        let value = crypto::encrypt(b"hello", &alg).expect("encrypt should succeed");
        let again = test_encryption().expect("key should be accepted");
        assert_eq!(
            crypto::decrypt_to_string(&value, &again).expect("decrypt should succeed"),
            "hello"
        );
    }
}
