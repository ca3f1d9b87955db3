//! Credential redaction for outbound payload logs

/// Mask a bot token down to its first segment.
///
/// Bot tokens are three dot-separated segments; the first is the base64 bot
/// id and is safe to print. Every other character is replaced with `*`.
/// A token without a separator is masked entirely.
pub fn mask_token(token: &str) -> String {
    match token.split_once('.') {
        Some((head, rest)) => {
            let masked: String = rest
                .chars()
                .map(|c| if c == '.' { '.' } else { '*' })
                .collect();
            format!("{head}.{masked}")
        }
        None => "*".repeat(token.chars().count()),
    }
}

/// Replace every occurrence of `token` in `text` with its masked form.
pub fn redact(text: &str, token: &str) -> String {
    if token.is_empty() {
        return text.to_string();
    }
    text.replace(token, &mask_token(token))
}
