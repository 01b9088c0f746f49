//! Pure utility functions.
//!
//! These are stateless helper functions used across the codebase.

pub mod bootstrap;
pub mod retry;

/// Longest body excerpt written to logs.
pub const LOG_BODY_LIMIT: usize = 200;

/// First [`LOG_BODY_LIMIT`] characters of a message body, lossily decoded.
pub fn truncate_for_log(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut excerpt: String = text.chars().take(LOG_BODY_LIMIT).collect();
    if text.chars().nth(LOG_BODY_LIMIT).is_some() {
        excerpt.push_str("...");
    }
    excerpt
}
