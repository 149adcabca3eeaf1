//! Scoped writer producing sealed variants.
//!
//! The builder keeps a stack of scopes, one per open container. Basic writes
//! land in the innermost scope; closing a container folds its signature and
//! data into the parent as one complete type. Arrays infer their element
//! signature from the first element and enforce it on the rest.

use bytes::{BufMut, Bytes, BytesMut};

use crate::signature::{self, MAX_DEPTH, MAX_LEN};
use crate::variant::Variant;
use crate::{Result, Value, VariantError};

enum ScopeKind {
    Root,
    Tuple,
    Array {
        elem_sig: Option<String>,
        count: u32,
    },
    Variant,
}

struct Scope {
    kind: ScopeKind,
    sig: String,
    data: BytesMut,
}

impl Scope {
    fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            sig: String::new(),
            data: BytesMut::new(),
        }
    }
}

/// Incremental writer for a variant value.
///
/// # Examples
///
/// ```
/// use busbar_variant::VariantBuilder;
///
/// let mut b = VariantBuilder::new();
/// b.begin_tuple().unwrap();
/// b.write_u64(1).unwrap();
/// b.write_u32(2).unwrap();
/// b.end_tuple().unwrap();
/// let v = b.seal().unwrap();
/// assert_eq!(v.signature(), "(tu)");
/// ```
pub struct VariantBuilder {
    scopes: Vec<Scope>,
}

impl Default for VariantBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VariantBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::new(ScopeKind::Root)],
        }
    }

    /// Accept one complete type (signature fragment plus encoded bytes)
    /// into the innermost scope.
    fn accept(&mut self, type_sig: &str, data: &[u8]) -> Result<()> {
        let scope = self.scopes.last_mut().unwrap();
        match &mut scope.kind {
            ScopeKind::Array { elem_sig, count } => {
                match elem_sig {
                    Some(expected) if expected != type_sig => {
                        return Err(VariantError::ElementMismatch {
                            expected: expected.clone(),
                            found: type_sig.to_string(),
                        })
                    }
                    Some(_) => {}
                    None => *elem_sig = Some(type_sig.to_string()),
                }
                *count = count.checked_add(1).ok_or(VariantError::TrailingData)?;
            }
            _ => {
                if scope.sig.len() + type_sig.len() > MAX_LEN {
                    return Err(VariantError::SignatureTooLong(
                        scope.sig.len() + type_sig.len(),
                    ));
                }
                scope.sig.push_str(type_sig);
            }
        }
        scope.data.extend_from_slice(data);
        Ok(())
    }

    fn push_scope(&mut self, kind: ScopeKind) -> Result<()> {
        if self.scopes.len() > MAX_DEPTH {
            return Err(VariantError::DepthLimit);
        }
        self.scopes.push(Scope::new(kind));
        Ok(())
    }

    /// Open a tuple.
    pub fn begin_tuple(&mut self) -> Result<()> {
        self.push_scope(ScopeKind::Tuple)
    }

    /// Close the innermost tuple.
    pub fn end_tuple(&mut self) -> Result<()> {
        match self.scopes.last() {
            Some(Scope {
                kind: ScopeKind::Tuple,
                ..
            }) => {}
            _ => return Err(VariantError::NotInContainer),
        }
        let scope = self.scopes.pop().unwrap();
        let sig = format!("({})", scope.sig);
        self.accept(&sig, &scope.data)
    }

    /// Open an array whose element type is inferred from the first element.
    pub fn begin_array(&mut self) -> Result<()> {
        self.push_scope(ScopeKind::Array {
            elem_sig: None,
            count: 0,
        })
    }

    /// Open an array with an explicit element type, allowing it to stay
    /// empty.
    pub fn begin_array_of(&mut self, elem_sig: &str) -> Result<()> {
        signature::validate(elem_sig)?;
        if !signature::is_complete_type(elem_sig) {
            return Err(VariantError::BadSignature(format!(
                "array element must be one complete type, got '{elem_sig}'"
            )));
        }
        self.push_scope(ScopeKind::Array {
            elem_sig: Some(elem_sig.to_string()),
            count: 0,
        })
    }

    /// Close the innermost array.
    pub fn end_array(&mut self) -> Result<()> {
        match self.scopes.last() {
            Some(Scope {
                kind: ScopeKind::Array { .. },
                ..
            }) => {}
            _ => return Err(VariantError::NotInContainer),
        }
        let scope = self.scopes.pop().unwrap();
        let (elem_sig, count) = match scope.kind {
            ScopeKind::Array { elem_sig, count } => (elem_sig, count),
            _ => unreachable!(),
        };
        let elem = elem_sig.ok_or(VariantError::EmptyArray)?;
        let sig = format!("a{elem}");
        let mut buf = BytesMut::with_capacity(4 + scope.data.len());
        buf.put_u32_le(count);
        buf.extend_from_slice(&scope.data);
        self.accept(&sig, &buf)
    }

    /// Open a nested variant.
    pub fn begin_variant(&mut self) -> Result<()> {
        self.push_scope(ScopeKind::Variant)
    }

    /// Close the innermost nested variant.
    pub fn end_variant(&mut self) -> Result<()> {
        match self.scopes.last() {
            Some(Scope {
                kind: ScopeKind::Variant,
                ..
            }) => {}
            _ => return Err(VariantError::NotInContainer),
        }
        let scope = self.scopes.pop().unwrap();
        let buf = encode_variant(&scope.sig, &scope.data)?;
        self.accept("v", &buf)
    }

    /// Splice an already sealed variant as one `v` value.
    pub fn write_variant(&mut self, v: &Variant) -> Result<()> {
        let buf = encode_variant(v.signature(), v.data())?;
        self.accept("v", &buf)
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.accept("b", &[u8::from(v)])
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.accept("y", &[v])
    }

    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.accept("n", &v.to_le_bytes())
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.accept("q", &v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.accept("i", &v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.accept("u", &v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.accept("x", &v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.accept("t", &v.to_le_bytes())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.accept("d", &v.to_le_bytes())
    }

    /// Write a string value (u32 length prefix, UTF-8 bytes).
    pub fn write_str(&mut self, v: &str) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4 + v.len());
        buf.put_u32_le(v.len() as u32);
        buf.extend_from_slice(v.as_bytes());
        self.accept("s", &buf)
    }

    /// Write one dynamically typed basic value.
    pub fn write_value(&mut self, v: &Value) -> Result<()> {
        match v {
            Value::Bool(x) => self.write_bool(*x),
            Value::U8(x) => self.write_u8(*x),
            Value::I16(x) => self.write_i16(*x),
            Value::U16(x) => self.write_u16(*x),
            Value::I32(x) => self.write_i32(*x),
            Value::U32(x) => self.write_u32(*x),
            Value::I64(x) => self.write_i64(*x),
            Value::U64(x) => self.write_u64(*x),
            Value::F64(x) => self.write_f64(*x),
            Value::Str(x) => self.write_str(x),
        }
    }

    /// Write a sequence of basic values.
    pub fn write_values(&mut self, values: &[Value]) -> Result<()> {
        for v in values {
            self.write_value(v)?;
        }
        Ok(())
    }

    /// Signature accumulated at the top level so far.
    ///
    /// Only meaningful while no container is open.
    #[must_use]
    pub fn signature(&self) -> &str {
        &self.scopes[0].sig
    }

    /// Whether any container is currently open.
    #[must_use]
    pub fn in_container(&self) -> bool {
        self.scopes.len() > 1
    }

    /// Freeze the builder into an immutable [`Variant`].
    pub fn seal(mut self) -> Result<Variant> {
        if self.scopes.len() != 1 {
            return Err(VariantError::UnclosedContainer);
        }
        let root = self.scopes.pop().unwrap();
        Ok(Variant::from_trusted(root.sig, root.data.freeze()))
    }
}

/// Encode (signature, data) as the body of a `v` value:
/// u8 signature length, signature bytes, u32 data length, data bytes.
fn encode_variant(sig: &str, data: &[u8]) -> Result<Bytes> {
    if sig.len() > MAX_LEN {
        return Err(VariantError::SignatureTooLong(sig.len()));
    }
    let mut buf = BytesMut::with_capacity(1 + sig.len() + 4 + data.len());
    buf.put_u8(sig.len() as u8);
    buf.extend_from_slice(sig.as_bytes());
    buf.put_u32_le(data.len() as u32);
    buf.extend_from_slice(data);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_values() {
        let mut b = VariantBuilder::new();
        b.write_u64(7).unwrap();
        b.write_str("hi").unwrap();
        let v = b.seal().unwrap();
        assert_eq!(v.signature(), "ts");
        assert_eq!(v.data().len(), 8 + 4 + 2);
    }

    #[test]
    fn test_tuple() {
        let mut b = VariantBuilder::new();
        b.begin_tuple().unwrap();
        b.write_u64(1).unwrap();
        b.write_u32(2).unwrap();
        b.end_tuple().unwrap();
        let v = b.seal().unwrap();
        assert_eq!(v.signature(), "(tu)");
        assert_eq!(v.data().len(), 12);
    }

    #[test]
    fn test_array_inference() {
        let mut b = VariantBuilder::new();
        b.begin_array().unwrap();
        b.write_u32(1).unwrap();
        b.write_u32(2).unwrap();
        b.end_array().unwrap();
        let v = b.seal().unwrap();
        assert_eq!(v.signature(), "au");
        // count prefix + two elements
        assert_eq!(v.data().len(), 4 + 8);
    }

    #[test]
    fn test_array_element_mismatch() {
        let mut b = VariantBuilder::new();
        b.begin_array().unwrap();
        b.write_u32(1).unwrap();
        assert!(matches!(
            b.write_u64(2),
            Err(VariantError::ElementMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_array() {
        let mut b = VariantBuilder::new();
        b.begin_array().unwrap();
        assert!(matches!(b.end_array(), Err(VariantError::EmptyArray)));

        let mut b = VariantBuilder::new();
        b.begin_array_of("(su)").unwrap();
        b.end_array().unwrap();
        let v = b.seal().unwrap();
        assert_eq!(v.signature(), "a(su)");
        assert_eq!(v.data().len(), 4);
    }

    #[test]
    fn test_array_of_tuples() {
        let mut b = VariantBuilder::new();
        b.begin_array().unwrap();
        b.begin_tuple().unwrap();
        b.write_str("a").unwrap();
        b.write_u32(0).unwrap();
        b.end_tuple().unwrap();
        b.begin_tuple().unwrap();
        b.write_str("b").unwrap();
        b.write_u32(1).unwrap();
        b.end_tuple().unwrap();
        b.end_array().unwrap();
        let v = b.seal().unwrap();
        assert_eq!(v.signature(), "a(su)");
    }

    #[test]
    fn test_nested_variant() {
        let mut b = VariantBuilder::new();
        b.begin_variant().unwrap();
        b.write_u64(9).unwrap();
        b.end_variant().unwrap();
        let v = b.seal().unwrap();
        assert_eq!(v.signature(), "v");
    }

    #[test]
    fn test_unclosed() {
        let mut b = VariantBuilder::new();
        b.begin_tuple().unwrap();
        assert!(matches!(b.seal(), Err(VariantError::UnclosedContainer)));
    }

    #[test]
    fn test_mismatched_close() {
        let mut b = VariantBuilder::new();
        b.begin_tuple().unwrap();
        assert!(matches!(b.end_array(), Err(VariantError::NotInContainer)));
    }

    #[test]
    fn test_empty_builder() {
        let v = VariantBuilder::new().seal().unwrap();
        assert_eq!(v.signature(), "");
        assert!(v.data().is_empty());
    }
}
