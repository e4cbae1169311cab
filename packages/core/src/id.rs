// ABOUTME: Prefixed, time-ordered resource identifiers
// ABOUTME: UUIDv7 bytes encoded as fixed-width base62 behind a resource prefix

use thiserror::Error;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const ENCODED_LENGTH: usize = 22;

#[derive(Error, Debug, PartialEq)]
pub enum IdError {
    #[error("Invalid ID format: {0}")]
    InvalidFormat(String),
    #[error("Expected {expected} ID, got prefix '{actual}'")]
    WrongKind { expected: &'static str, actual: String },
}

/// Resource kinds that carry their own ID prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Sandbox,
    Exec,
    Session,
    Artifact,
    Node,
}

impl IdKind {
    pub fn prefix(self) -> &'static str {
        match self {
            IdKind::Sandbox => "sb_",
            IdKind::Exec => "ex_",
            IdKind::Session => "sess_",
            IdKind::Artifact => "art_",
            IdKind::Node => "node_",
        }
    }
}

fn base62_encode(bytes: &[u8; 16]) -> String {
    let mut num = u128::from_be_bytes(*bytes);
    let mut chars = [b'0'; ENCODED_LENGTH];

    for slot in chars.iter_mut().rev() {
        *slot = ALPHABET[(num % 62) as usize];
        num /= 62;
    }

    chars.iter().map(|&c| c as char).collect()
}

fn base62_decode(s: &str) -> Result<[u8; 16], IdError> {
    if s.len() != ENCODED_LENGTH {
        return Err(IdError::InvalidFormat(format!(
            "expected {} characters, got {}",
            ENCODED_LENGTH,
            s.len()
        )));
    }

    let mut num: u128 = 0;
    for c in s.bytes() {
        let idx = match c {
            b'0'..=b'9' => c - b'0',
            b'A'..=b'Z' => c - b'A' + 10,
            b'a'..=b'z' => c - b'a' + 36,
            _ => {
                return Err(IdError::InvalidFormat(format!(
                    "invalid base62 character '{}'",
                    c as char
                )))
            }
        };
        num = num
            .checked_mul(62)
            .and_then(|n| n.checked_add(idx as u128))
            .ok_or_else(|| IdError::InvalidFormat("value overflows 128 bits".to_string()))?;
    }

    Ok(num.to_be_bytes())
}

/// Generate a new ID of the given kind, e.g. `sb_0Bxx...`.
pub fn generate_id(kind: IdKind) -> String {
    let bytes = *uuid::Uuid::now_v7().as_bytes();
    format!("{}{}", kind.prefix(), base62_encode(&bytes))
}

/// Validate that `id` is a well-formed ID of `kind` and return its raw bytes.
pub fn parse_id(kind: IdKind, id: &str) -> Result<[u8; 16], IdError> {
    let encoded = id.strip_prefix(kind.prefix()).ok_or_else(|| {
        let actual = id
            .rfind('_')
            .map(|idx| id[..=idx].to_string())
            .unwrap_or_default();
        IdError::WrongKind {
            expected: kind.prefix(),
            actual,
        }
    })?;
    base62_decode(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_prefix_and_fixed_width() {
        let id = generate_id(IdKind::Sandbox);
        assert!(id.starts_with("sb_"));
        assert_eq!(id.len(), 3 + ENCODED_LENGTH);
    }

    #[test]
    fn parse_recovers_uuid_version() {
        let id = generate_id(IdKind::Exec);
        let bytes = parse_id(IdKind::Exec, &id).unwrap();
        assert_eq!((bytes[6] >> 4) & 0x0f, 7);
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let first = generate_id(IdKind::Sandbox);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = generate_id(IdKind::Sandbox);
        assert!(first < second);
    }

    #[test]
    fn wrong_prefix_is_rejected() {
        let id = generate_id(IdKind::Session);
        let err = parse_id(IdKind::Sandbox, &id).unwrap_err();
        assert_eq!(
            err,
            IdError::WrongKind {
                expected: "sb_",
                actual: "sess_".to_string()
            }
        );
    }

    #[test]
    fn malformed_body_is_rejected() {
        assert!(matches!(
            parse_id(IdKind::Sandbox, "sb_short"),
            Err(IdError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_id(IdKind::Sandbox, &format!("sb_{}", "!".repeat(ENCODED_LENGTH))),
            Err(IdError::InvalidFormat(_))
        ));
    }
}
