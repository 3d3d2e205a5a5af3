//! Deriving safe local file names for direct transfers.

use url::Url;

/// Characters that are invalid in Windows filenames.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved filenames (case-insensitive).
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Longest file name produced, in bytes.
const MAX_NAME_LEN: usize = 200;

/// Make `input` safe to use as a single path component on every platform.
///
/// Invalid and control characters collapse into one `_`, leading/trailing
/// dots and spaces are trimmed, reserved Windows names get a `_` prefix and
/// an empty result becomes `None`.
pub fn sanitize_filename(input: &str) -> Option<String> {
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;
    for c in input.chars() {
        if c.is_control() || INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() || trimmed == "_" {
        return None;
    }

    let mut name = truncate_on_char_boundary(trimmed, MAX_NAME_LEN).to_string();
    let stem = name.split('.').next().unwrap_or_default().to_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        name.insert(0, '_');
    }
    Some(name)
}

fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// File name announced by a `Content-Disposition` header value.
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';').map(str::trim) {
        if let Some(encoded) = part.strip_prefix("filename*=") {
            // RFC 5987: charset'lang'percent-encoded
            let encoded = encoded.rsplit('\'').next().unwrap_or(encoded);
            let decoded = url::form_urlencoded::parse(format!("n={encoded}").as_bytes())
                .next()
                .map(|(_, v)| v.into_owned());
            if let Some(name) = decoded.as_deref().and_then(sanitize_filename) {
                return Some(name);
            }
        } else if let Some(raw) = part.strip_prefix("filename=") {
            plain = sanitize_filename(raw.trim_matches('"'));
        }
    }
    plain
}

/// File name taken from the last non-empty path segment of `url`.
pub fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url
        .path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())?;
    // a literal '+' in a path is not a space
    let segment = segment.replace('+', "%2B");
    let decoded = url::form_urlencoded::parse(format!("n={segment}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())?;
    sanitize_filename(&decoded)
}
