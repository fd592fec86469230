//! Utility functions for the blelink crate.

/// Format bytes as `0x` followed by space separated upper-case hex pairs.
///
/// # Example
///
/// ```
/// use blelink::to_hex_string;
///
/// assert_eq!(to_hex_string(&[0x01, 0x00, 0xFF]), "0x01 00 FF");
/// ```
pub fn to_hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 3);
    out.push_str("0x");
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02X}", byte));
    }
    out
}

/// Decode a value as UTF-8 text if it is printable.
///
/// Returns `None` for invalid UTF-8 or when control characters other than
/// trailing NULs are present.
///
/// # Example
///
/// ```
/// use blelink::utils::printable_text;
///
/// assert_eq!(printable_text(b"Mi Band\0"), Some("Mi Band".to_string()));
/// assert_eq!(printable_text(&[0x01, 0x02]), None);
/// ```
pub fn printable_text(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    let text = text.trim_end_matches('\0');
    if text.chars().any(char::is_control) {
        return None;
    }
    Some(text.to_string())
}
