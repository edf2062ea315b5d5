//! Secret and verification-code lifecycle: generation, encryption, expiry,
//! and verification with failed-attempt tracking.
//!
//! The plain value of a code only ever leaves this module in an
//! [`EncryptedCode`] returned to the issuing command; events carry the
//! encrypted [`CryptoValue`] and the expiry.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, CryptoValue, EncryptionAlgorithm};
use crate::error::CommandError;
use crate::preparation::Filter;
use crate::write_model::SecretGeneratorWriteModel;

const LOWER_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER_LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"~!@#$^&*()_+`-={}|[]:<>?,./";

/// Purpose a secret is generated for. Each purpose has its own
/// configuration per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretGeneratorType {
    AppSecret,
    InitCode,
    VerifyEmailCode,
    VerifyPhoneCode,
    PasswordResetCode,
    PasswordlessInitCode,
    VerifyDomain,
    OtpSms,
    OtpEmail,
}

impl SecretGeneratorType {
    /// Platform default used when the instance configured nothing.
    pub fn default_config(self) -> SecretGeneratorConfig {
        let hour = Duration::from_secs(60 * 60);
        let five_minutes = Duration::from_secs(5 * 60);
        match self {
            SecretGeneratorType::AppSecret => {
                SecretGeneratorConfig::new(64, Duration::ZERO, true, true, true, false)
            }
            SecretGeneratorType::InitCode => {
                SecretGeneratorConfig::new(6, hour * 72, false, true, true, false)
            }
            SecretGeneratorType::VerifyEmailCode
            | SecretGeneratorType::VerifyPhoneCode
            | SecretGeneratorType::PasswordResetCode => {
                SecretGeneratorConfig::new(6, hour, false, true, true, false)
            }
            SecretGeneratorType::PasswordlessInitCode => {
                SecretGeneratorConfig::new(12, hour, true, true, true, false)
            }
            SecretGeneratorType::VerifyDomain => {
                SecretGeneratorConfig::new(32, Duration::ZERO, true, true, true, false)
            }
            SecretGeneratorType::OtpSms | SecretGeneratorType::OtpEmail => {
                SecretGeneratorConfig::new(8, five_minutes, false, false, true, false)
            }
        }
    }
}

/// Length, character classes, and time-to-live of generated secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretGeneratorConfig {
    pub length: u32,
    /// Validity after issuance; zero means the secret never expires.
    pub expiry: Duration,
    pub include_lower_letters: bool,
    pub include_upper_letters: bool,
    pub include_digits: bool,
    pub include_symbols: bool,
}

impl SecretGeneratorConfig {
    pub fn new(
        length: u32,
        expiry: Duration,
        include_lower_letters: bool,
        include_upper_letters: bool,
        include_digits: bool,
        include_symbols: bool,
    ) -> Self {
        Self {
            length,
            expiry,
            include_lower_letters,
            include_upper_letters,
            include_digits,
            include_symbols,
        }
    }

    /// Check that the configuration can produce a secret.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidArgument`] for a zero length or when no
    /// character class is enabled.
    pub fn validate(&self) -> Result<(), CommandError> {
        if self.length == 0 {
            return Err(CommandError::invalid("secret length must be positive"));
        }
        if self.alphabet().is_empty() {
            return Err(CommandError::invalid(
                "secret generator needs at least one character class",
            ));
        }
        Ok(())
    }

    fn alphabet(&self) -> Vec<u8> {
        let mut alphabet = Vec::new();
        if self.include_lower_letters {
            alphabet.extend_from_slice(LOWER_LETTERS);
        }
        if self.include_upper_letters {
            alphabet.extend_from_slice(UPPER_LETTERS);
        }
        if self.include_digits {
            alphabet.extend_from_slice(DIGITS);
        }
        if self.include_symbols {
            alphabet.extend_from_slice(SYMBOLS);
        }
        alphabet
    }
}

/// Generate a random secret from the OS RNG.
///
/// # Errors
///
/// Returns [`CommandError::InvalidArgument`] if `config` is unusable.
pub fn generate_secret(config: &SecretGeneratorConfig) -> Result<String, CommandError> {
    config.validate()?;
    let alphabet = config.alphabet();
    let secret = (0..config.length)
        .map(|_| alphabet[OsRng.gen_range(0..alphabet.len())] as char)
        .collect();
    Ok(secret)
}

/// A freshly issued code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedCode {
    /// Plain value; never persisted, only returned to the caller or handed
    /// to a notification channel.
    pub plain: String,
    /// Encrypted value for the event payload.
    pub crypted: CryptoValue,
    /// Validity after issuance.
    pub expiry: Duration,
}

/// Issue a code for `generator_type`.
///
/// Reads the instance's generator configuration through `filter` and falls
/// back to `fallback` when none is configured. The secret is encrypted with
/// the active key of `alg`.
///
/// # Errors
///
/// - [`CommandError::Internal`] if the filter or the encryption fails.
/// - [`CommandError::InvalidArgument`] if the effective configuration is unusable.
pub async fn issue(
    filter: &Filter<'_>,
    generator_type: SecretGeneratorType,
    fallback: &SecretGeneratorConfig,
    alg: &dyn EncryptionAlgorithm,
) -> Result<EncryptedCode, CommandError> {
    let model = filter
        .load(SecretGeneratorWriteModel::new(filter.instance_id(), generator_type))
        .await?;
    let config = model.config.as_ref().unwrap_or(fallback);
    let plain = generate_secret(config)?;
    let crypted = crypto::encrypt(plain.as_bytes(), alg)?;
    tracing::debug!(
        generator = ?generator_type,
        configured = model.config.is_some(),
        key_id = %crypted.key_id,
        "issued code"
    );
    Ok(EncryptedCode {
        plain,
        crypted,
        expiry: config.expiry,
    })
}

/// A code waiting for verification, as reduced by a write model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCode {
    pub code: CryptoValue,
    /// Creation time of the event that issued the code.
    pub created_at: DateTime<Utc>,
    pub expiry: Duration,
}

impl PendingCode {
    /// Instant after which the code is expired; `None` if it never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.expiry.is_zero() {
            return None;
        }
        let ttl = TimeDelta::from_std(self.expiry).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now > at)
    }
}

/// Result of checking a candidate against a pending code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The candidate matches an unexpired code.
    Valid,
    /// The candidate does not match; the caller records a failed check.
    InvalidCode,
    /// The code outlived its expiry.
    Expired,
    /// The failure ceiling was already reached before this attempt.
    Locked,
    /// There is no code to check against.
    NoCodePending,
}

/// Check `candidate` against a pending code.
///
/// Checks run in order: no code, failure ceiling, expiry, then a
/// constant-time comparison with the decrypted value. A `ceiling` of zero
/// disables the failure ceiling.
///
/// # Errors
///
/// Returns [`CommandError::Internal`] if the stored code cannot be decrypted.
pub fn verify(
    pending: Option<&PendingCode>,
    failed_attempts: u32,
    ceiling: u32,
    candidate: &str,
    now: DateTime<Utc>,
    alg: &dyn EncryptionAlgorithm,
) -> Result<VerifyOutcome, CommandError> {
    let Some(pending) = pending else {
        return Ok(VerifyOutcome::NoCodePending);
    };
    if ceiling > 0 && failed_attempts >= ceiling {
        return Ok(VerifyOutcome::Locked);
    }
    if pending.is_expired(now) {
        return Ok(VerifyOutcome::Expired);
    }
    let stored = crypto::decrypt_to_string(&pending.code, alg)?;
    if constant_time_eq(stored.as_bytes(), candidate.as_bytes()) {
        Ok(VerifyOutcome::Valid)
    } else {
        Ok(VerifyOutcome::InvalidCode)
    }
}

// Length is not secret: codes have a configured fixed length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
