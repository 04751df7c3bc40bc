/// Maximum translation text length accepted for synthesis, in characters.
/// Longer texts are rejected with a validation error before any TTS tier.
pub const MAX_TTS_TEXT_CHARS: usize = 3000;

/// Maximum listeners per session unless overridden by configuration.
pub const DEFAULT_MAX_CLIENTS_PER_SESSION: usize = 50;

/// Seconds an unauthenticated socket may idle before the hub closes it.
pub const DEFAULT_AUTH_GRACE_WINDOW_SECS: u64 = 30;

/// Session id prefix length bounds (the part before the year stamp).
pub const SESSION_ID_PREFIX_MIN: usize = 2;
pub const SESSION_ID_PREFIX_MAX: usize = 16;

/// Validate a session id against the documented pattern:
/// `PREFIX-YYYY-NNN` where PREFIX is 2-16 ASCII alphanumerics starting with
/// a letter, YYYY is a 4-digit year stamp, and NNN is a 3-4 digit sequence.
/// Equivalent regular expression:
/// `^[A-Za-z][A-Za-z0-9]{1,15}-[0-9]{4}-[0-9]{3,4}$`
pub fn is_valid_session_id(id: &str) -> bool {
    let mut parts = id.split('-');
    let (Some(prefix), Some(year), Some(seq), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    if prefix.len() < SESSION_ID_PREFIX_MIN || prefix.len() > SESSION_ID_PREFIX_MAX {
        return false;
    }
    let mut chars = prefix.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric()) {
        return false;
    }

    if year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }

    (seq.len() == 3 || seq.len() == 4) && seq.chars().all(|c| c.is_ascii_digit())
}
