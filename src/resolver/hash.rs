use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use url::Url;
use uuid::Uuid;

static PERMALINK_RE: OnceLock<Regex> = OnceLock::new();

fn permalink_re() -> &'static Regex {
    PERMALINK_RE.get_or_init(|| {
        Regex::new(r"^https?://.*/datasets/r/([0-9a-fA-F-]{36})/?$")
            .unwrap_or_else(|e| unreachable!("static permalink pattern: {e}"))
    })
}

/// Normalize `url` and hash it so it can be compared with stored resource hashes.
///
/// Parsable URLs go through WHATWG serialization (lowercased scheme and
/// host, IDNA host encoding, default port removed); anything else is hashed
/// trimmed as-is.
pub fn hash_url(url: &str) -> String {
    let trimmed = url.trim();
    let normalized = match Url::parse(trimmed) {
        Ok(parsed) => parsed.to_string(),
        Err(_) => trimmed.to_string(),
    };
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

/// Extract the resource id of a stable `/datasets/r/<uuid>` permalink.
pub fn permalink_id(url: &str) -> Option<Uuid> {
    let captures = permalink_re().captures(url.trim())?;
    Uuid::parse_str(captures.get(1)?.as_str()).ok()
}
