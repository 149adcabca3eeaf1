//! Sealed variant artifact and its wire form.
//!
//! Wire form of a top-level variant: u8 signature length, signature bytes,
//! data bytes. The data length is bounded by the enclosing transport record,
//! so it carries no explicit prefix of its own.

use bytes::{BufMut, Bytes, BytesMut};

use crate::cursor::VariantCursor;
use crate::signature::{self, MAX_LEN};
use crate::{Result, VariantError};

/// An immutable, sealed variant value: signature plus encoded data.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    sig: String,
    data: Bytes,
}

impl Variant {
    /// Build from parts produced by the builder (already consistent).
    pub(crate) fn from_trusted(sig: String, data: Bytes) -> Self {
        Self { sig, data }
    }

    /// Build from untrusted parts, verifying that the data is exactly what
    /// the signature describes.
    pub fn from_parts(sig: &str, data: Bytes) -> Result<Self> {
        signature::validate(sig)?;
        verify(sig, &data)?;
        Ok(Self {
            sig: sig.to_string(),
            data,
        })
    }

    /// The empty variant (no values).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            sig: String::new(),
            data: Bytes::new(),
        }
    }

    #[must_use]
    pub fn signature(&self) -> &str {
        &self.sig
    }

    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Whether the variant holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sig.is_empty()
    }

    /// A fresh cursor positioned at the first value.
    #[must_use]
    pub fn cursor(&self) -> VariantCursor {
        VariantCursor::new(self.sig.clone(), self.data.clone())
    }

    /// Export wire segments for vectored transport I/O: a header segment
    /// (u8 signature length + signature) followed by the data segment.
    #[must_use]
    pub fn segments(&self) -> Vec<Bytes> {
        let mut hdr = BytesMut::with_capacity(1 + self.sig.len());
        hdr.put_u8(self.sig.len() as u8);
        hdr.extend_from_slice(self.sig.as_bytes());
        vec![hdr.freeze(), self.data.clone()]
    }

    /// Total encoded wire length.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        1 + self.sig.len() + self.data.len()
    }

    /// Concatenated wire form.
    #[must_use]
    pub fn to_wire(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        for seg in self.segments() {
            buf.extend_from_slice(&seg);
        }
        buf.freeze()
    }

    /// Parse the wire form back into a verified variant.
    pub fn from_wire(buf: Bytes) -> Result<Self> {
        let sig_len = *buf.first().ok_or(VariantError::Truncated)? as usize;
        if sig_len > MAX_LEN || 1 + sig_len > buf.len() {
            return Err(VariantError::Truncated);
        }
        let sig = std::str::from_utf8(&buf[1..1 + sig_len])?.to_string();
        let data = buf.slice(1 + sig_len..);
        Self::from_parts(&sig, data)
    }
}

/// Walk the whole signature over `data`, requiring an exact length match.
///
/// Nested variant payloads are bounds-checked here and fully verified when
/// entered by a cursor.
fn verify(sig: &str, data: &Bytes) -> Result<()> {
    let mut cursor = VariantCursor::new(sig.to_string(), data.clone());
    while cursor.peek_type().is_some() {
        cursor.skip()?;
    }
    if cursor.position() != data.len() {
        return Err(VariantError::TrailingData);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VariantBuilder;

    fn sample() -> Variant {
        let mut b = VariantBuilder::new();
        b.begin_tuple().unwrap();
        b.write_u64(1).unwrap();
        b.write_str("payload").unwrap();
        b.end_tuple().unwrap();
        b.seal().unwrap()
    }

    #[test]
    fn test_wire_roundtrip() {
        let v = sample();
        let wire = v.to_wire();
        assert_eq!(wire.len(), v.wire_len());
        let back = Variant::from_wire(wire).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_segments_concat() {
        let v = sample();
        let total: usize = v.segments().iter().map(Bytes::len).sum();
        assert_eq!(total, v.wire_len());
    }

    #[test]
    fn test_from_wire_truncated() {
        let v = sample();
        let wire = v.to_wire();
        let cut = wire.slice(..wire.len() - 1);
        assert!(Variant::from_wire(cut).is_err());
    }

    #[test]
    fn test_from_wire_trailing() {
        let v = sample();
        let mut wire = BytesMut::from(&v.to_wire()[..]);
        wire.extend_from_slice(b"junk");
        assert!(matches!(
            Variant::from_wire(wire.freeze()),
            Err(VariantError::TrailingData)
        ));
    }

    #[test]
    fn test_from_parts_rejects_bad_sig() {
        assert!(Variant::from_parts("z", Bytes::new()).is_err());
    }

    #[test]
    fn test_empty() {
        let v = Variant::empty();
        assert!(v.is_empty());
        let back = Variant::from_wire(v.to_wire()).unwrap();
        assert_eq!(back, v);
    }
}
