//! Signature grammar: validation and complete-type splitting.

use crate::{Result, VariantError};

/// Maximum container nesting depth accepted in a signature.
pub const MAX_DEPTH: usize = 32;

/// Maximum signature length in bytes (fits the wire's u8 length prefix).
pub const MAX_LEN: usize = 255;

/// Whether `c` is a basic (non-container) type character.
#[must_use]
pub const fn is_basic(c: u8) -> bool {
    matches!(
        c,
        b'b' | b'y' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's'
    )
}

/// Encoded width of a fixed-size basic type, `None` for `s` and containers.
#[must_use]
pub const fn fixed_width(c: u8) -> Option<usize> {
    match c {
        b'b' | b'y' => Some(1),
        b'n' | b'q' => Some(2),
        b'i' | b'u' => Some(4),
        b'x' | b't' | b'd' => Some(8),
        _ => None,
    }
}

/// Length in bytes of the first complete type in `sig`.
fn complete_len(sig: &[u8], depth: usize) -> Result<usize> {
    if depth > MAX_DEPTH {
        return Err(VariantError::DepthLimit);
    }
    match sig.first() {
        None => Err(VariantError::BadSignature("empty type".into())),
        Some(&c) if is_basic(c) || c == b'v' => Ok(1),
        Some(b'a') => Ok(1 + complete_len(&sig[1..], depth + 1)?),
        Some(b'(') => {
            let mut i = 1;
            loop {
                match sig.get(i) {
                    Some(b')') => return Ok(i + 1),
                    Some(_) => i += complete_len(&sig[i..], depth + 1)?,
                    None => {
                        return Err(VariantError::BadSignature(
                            "unbalanced parenthesis".into(),
                        ))
                    }
                }
            }
        }
        Some(&c) => Err(VariantError::BadSignature(format!(
            "unknown type character '{}'",
            c as char
        ))),
    }
}

/// Split the first complete type off the front of `sig`.
pub fn split_first(sig: &str) -> Result<(&str, &str)> {
    let n = complete_len(sig.as_bytes(), 0)?;
    Ok(sig.split_at(n))
}

/// Validate `sig` as a sequence of zero or more complete types.
pub fn validate(sig: &str) -> Result<()> {
    if sig.len() > MAX_LEN {
        return Err(VariantError::SignatureTooLong(sig.len()));
    }
    let mut rest = sig;
    while !rest.is_empty() {
        let (_, r) = split_first(rest)?;
        rest = r;
    }
    Ok(())
}

/// Whether `sig` is exactly one complete type.
#[must_use]
pub fn is_complete_type(sig: &str) -> bool {
    matches!(split_first(sig), Ok((_, rest)) if rest.is_empty())
}

/// Number of complete types in `sig`.
pub fn count_types(sig: &str) -> Result<usize> {
    let mut rest = sig;
    let mut n = 0;
    while !rest.is_empty() {
        let (_, r) = split_first(rest)?;
        rest = r;
        n += 1;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_basic() {
        assert_eq!(split_first("tu").unwrap(), ("t", "u"));
        assert_eq!(split_first("s").unwrap(), ("s", ""));
    }

    #[test]
    fn test_split_containers() {
        assert_eq!(split_first("(tu)s").unwrap(), ("(tu)", "s"));
        assert_eq!(split_first("a(su)t").unwrap(), ("a(su)", "t"));
        assert_eq!(split_first("aatu").unwrap(), ("aat", "u"));
    }

    #[test]
    fn test_nested() {
        assert_eq!(split_first("((t)(u))x").unwrap(), ("((t)(u))", "x"));
        assert_eq!(split_first("va(tv)").unwrap(), ("v", "a(tv)"));
    }

    #[test]
    fn test_invalid() {
        assert!(split_first("").is_err());
        assert!(split_first("(t").is_err());
        assert!(split_first("z").is_err());
        assert!(split_first("a").is_err());
        assert!(validate("t u").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(validate("").is_ok());
        assert!(validate("tuv(sa(su))").is_ok());
        assert!(validate(&"a".repeat(40)).is_err()); // depth
        assert!(validate(&"t".repeat(300)).is_err()); // length
    }

    #[test]
    fn test_count() {
        assert_eq!(count_types("").unwrap(), 0);
        assert!(count_types("tu(s)a").is_err());
        assert_eq!(count_types("tu(s)v").unwrap(), 4);
    }

    #[test]
    fn test_complete() {
        assert!(is_complete_type("(tu)"));
        assert!(!is_complete_type("tu"));
        assert!(!is_complete_type(""));
    }
}
