//! Content-derived record identity.
//!
//! The source feed has no stable sequence numbers and may reissue or
//! reorder entries between polls, so identity is a digest over the parts of
//! a record that do not change when it is reissued.

use sha2::{Digest, Sha256};

use crate::feed::normalize_timestamp;

const FIELD_SEPARATOR: u8 = 0x1f;

/// Derives the identifier for a record from its timestamp, title and link.
/// The description only takes part when the link is empty.
pub fn record_identity(published: &str, title: &str, description: &str, link: &str) -> String {
    let timestamp = match normalize_timestamp(published) {
        Some(dt) => dt.to_rfc3339(),
        None => collapse_whitespace(published),
    };
    let link = collapse_whitespace(link);

    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(collapse_whitespace(title).as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(link.as_bytes());
    if link.is_empty() {
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(collapse_whitespace(description).as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
