//! Phone number normalization.
//!
//! Numbers reach us as bare digits, `+55 (11) 9...`, or WhatsApp JIDs
//! (`5511999887766@s.whatsapp.net`). Everything stored is digits only.

/// Digits kept for the suffix match used when country codes drift.
pub const SUFFIX_DIGITS: usize = 10;

/// Strip a JID suffix and every non-digit character.
pub fn normalize(raw: &str) -> String {
    let local = raw.split('@').next().unwrap_or(raw);
    // Multi-device JIDs carry a `:device` suffix on the user part.
    let local = local.split(':').next().unwrap_or(local);
    local.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// The last [`SUFFIX_DIGITS`] digits of a normalized number, or `None` if shorter.
pub fn suffix(normalized: &str) -> Option<&str> {
    if normalized.len() < SUFFIX_DIGITS {
        return None;
    }
    Some(&normalized[normalized.len() - SUFFIX_DIGITS..])
}

/// Whether a raw identifier names a group chat rather than a person.
pub fn is_group_jid(raw: &str) -> bool {
    raw.ends_with("@g.us") || raw.contains("-group")
}
