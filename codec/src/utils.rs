// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// More than 65535 bytes.
    TooManyData,

    /// Bytes are not well-formed UTF-8.
    InvalidUtf8,

    /// Contains U+0000 or other disallowed code points.
    InvalidChar,
}

/// Generate a random alphanumeric string, used as default client id.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Check that `s` fits in a length-prefixed string field.
///
/// The character data MUST be well-formed UTF-8 and MUST NOT include
/// the null character U+0000 [MQTT-1.5.3-1], [MQTT-1.5.3-2].
///
/// # Errors
///
/// Returns error if `s` is too long or contains disallowed code points.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > usize::from(u16::MAX) {
        return Err(StringError::TooManyData);
    }
    if s.contains('\u{0}') {
        return Err(StringError::InvalidChar);
    }
    Ok(())
}

/// Convert raw bytes into an owned validated string.
///
/// # Errors
///
/// Returns error if bytes are not a valid length-prefixed string payload.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = String::from_utf8(bytes.to_vec()).map_err(|_e| StringError::InvalidUtf8)?;
    validate_utf8_string(&s)?;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_string_len() {
        assert_eq!(random_string(8).len(), 8);
    }

    #[test]
    fn test_reject_nul() {
        assert_eq!(
            validate_utf8_string("a\u{0}b"),
            Err(StringError::InvalidChar)
        );
    }
}
