//! Closed set of event payloads, one enum per aggregate type.
//!
//! Every variant is keyed by its dotted event type, so the pair
//! `(aggregate type, event type)` selects exactly one decoder.

pub mod instance;
pub mod metadata;
pub mod org;
pub mod project;
pub mod user;

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} must not be empty"))
    } else {
        Ok(())
    }
}
