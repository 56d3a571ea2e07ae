//! Constant-time bearer and basic-auth checks.
//!
//! Comparisons run over the full byte length of both operands; early-out on
//! length mismatch is acceptable (spec.md 9) because it leaks nothing beyond
//! what callers already control (the token/password length, not its value).

use base64::Engine as _;
use base64::engine::general_purpose;

use crate::error::AuthError;

/// Constant-time byte comparison. Returns `false` immediately on length
/// mismatch without touching byte contents, otherwise compares every byte.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Validates `Authorization: Bearer <token>` against a fork's configured
/// update token.
pub fn check_bearer(header: Option<&str>, expected_token: &str) -> Result<(), AuthError> {
    let Some(header) = header else {
        return Err(AuthError::InvalidBearer);
    };
    let Some(token) = header.strip_prefix("Bearer ") else {
        return Err(AuthError::InvalidBearer);
    };
    if constant_time_eq(token.as_bytes(), expected_token.as_bytes()) {
        Ok(())
    } else {
        Err(AuthError::InvalidBearer)
    }
}

/// Validates `Authorization: Basic <base64>` against a fork's private-user
/// map.
pub fn check_basic(
    header: Option<&str>,
    private_users: &std::collections::HashMap<String, String>,
    fork: &str,
) -> Result<(), AuthError> {
    let realm = format!("fork_{fork}");
    let Some(header) = header else {
        return Err(AuthError::InvalidBasic { realm });
    };
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return Err(AuthError::InvalidBasic { realm });
    };
    let decoded = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| AuthError::InvalidBasic { realm: realm.clone() })?;
    let text = String::from_utf8(decoded).map_err(|_| AuthError::InvalidBasic { realm: realm.clone() })?;
    let Some((user, password)) = text.split_once(':') else {
        return Err(AuthError::InvalidBasic { realm });
    };
    match private_users.get(user) {
        Some(expected) if constant_time_eq(password.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(AuthError::InvalidBasic { realm }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokeN"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }

    #[test]
    fn bearer_accepts_matching_token() {
        assert!(check_bearer(Some("Bearer secret"), "secret").is_ok());
        assert!(check_bearer(Some("Bearer wrong"), "secret").is_err());
        assert!(check_bearer(None, "secret").is_err());
        assert!(check_bearer(Some("secret"), "secret").is_err());
    }

    #[test]
    fn basic_auth_round_trip() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "hunter2".to_string());
        // "alice:hunter2" base64-encoded.
        let header = "Basic YWxpY2U6aHVudGVyMg==";
        assert!(check_basic(Some(header), &users, "priv").is_ok());
    }

    #[test]
    fn basic_auth_rejects_bad_password() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "hunter2".to_string());
        let header = "Basic YWxpY2U6d3JvbmY=";
        let err = check_basic(Some(header), &users, "priv").unwrap_err();
        assert!(matches!(err, AuthError::InvalidBasic { realm } if realm == "fork_priv"));
    }

    #[test]
    fn basic_auth_missing_header() {
        let users = HashMap::new();
        let err = check_basic(None, &users, "priv").unwrap_err();
        assert!(matches!(err, AuthError::InvalidBasic { .. }));
    }
}
