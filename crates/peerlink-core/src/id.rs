//! Identifier helpers

use regex_lite::Regex;
use std::sync::OnceLock;

const ID_PATTERN: &str = r"^[A-Za-z0-9]+(?:[ _-][A-Za-z0-9]+)*$";

fn matches_id_pattern(s: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(ID_PATTERN).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(s))
}

/// Random alphanumeric token used for connection ids and relay tokens
pub fn random_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Fresh connection id with the given kind prefix
pub fn connection_id(prefix: &str) -> String {
    format!("{}{}", prefix, random_token())
}

/// Whether `id` is acceptable as a peer id. An empty id means "let the
/// relay assign one" and is accepted.
pub fn validate_id(id: &str) -> bool {
    id.is_empty() || matches_id_pattern(id)
}

/// Whether `key` is acceptable as a relay API key
pub fn validate_key(key: &str) -> bool {
    matches_id_pattern(key)
}
