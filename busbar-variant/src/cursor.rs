//! Forward read cursor over a sealed variant.
//!
//! The cursor mirrors the builder's scope stack with container frames:
//! `enter` pushes a frame for the tuple/array/variant at the cursor, `exit`
//! skips whatever is left in the frame and pops it. `skip` steps over one
//! complete type without decoding it.

use bytes::Bytes;

use crate::signature::{self, fixed_width, split_first, MAX_DEPTH};
use crate::{Result, Value, VariantError};

enum FrameKind {
    Root,
    Tuple,
    Array { elem_sig: String, remaining: u32 },
    Variant,
}

struct Frame {
    kind: FrameKind,
    sig: String,
    sig_pos: usize,
    /// Absolute exclusive data bound for this frame.
    end: usize,
    /// Signature bytes consumed in the parent when this frame pops.
    parent_advance: usize,
}

/// Read cursor over a sealed variant.
pub struct VariantCursor {
    data: Bytes,
    frames: Vec<Frame>,
    pos: usize,
}

impl VariantCursor {
    pub(crate) fn new(sig: String, data: Bytes) -> Self {
        let end = data.len();
        Self {
            data,
            frames: vec![Frame {
                kind: FrameKind::Root,
                sig,
                sig_pos: 0,
                end,
                parent_advance: 0,
            }],
            pos: 0,
        }
    }

    fn top(&self) -> &Frame {
        self.frames.last().unwrap()
    }

    /// Absolute data offset of the cursor.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Signature of the next complete value, `None` at container end.
    #[must_use]
    pub fn peek_type(&self) -> Option<&str> {
        let f = self.top();
        match &f.kind {
            FrameKind::Array {
                elem_sig,
                remaining,
            } => {
                if *remaining > 0 {
                    Some(elem_sig.as_str())
                } else {
                    None
                }
            }
            _ => {
                let rest = &f.sig[f.sig_pos..];
                if rest.is_empty() {
                    None
                } else {
                    split_first(rest).ok().map(|(t, _)| t)
                }
            }
        }
    }

    /// Remaining value count: length of the array at the cursor, or the
    /// number of values left in the current container.
    pub fn peek_count(&self) -> Result<u32> {
        if let Some(t) = self.peek_type() {
            if t.starts_with('a') {
                return self.get_u32(self.pos);
            }
        }
        match &self.top().kind {
            FrameKind::Array { remaining, .. } => Ok(*remaining),
            _ => {
                let f = self.top();
                let n = signature::count_types(&f.sig[f.sig_pos..])?;
                Ok(n as u32)
            }
        }
    }

    /// Whether the current container has no values left.
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.peek_type().is_none()
    }

    /// Full content signature of the current container: the element type for
    /// arrays, the field sequence otherwise.
    #[must_use]
    pub fn container_signature(&self) -> &str {
        let f = self.top();
        match &f.kind {
            FrameKind::Array { elem_sig, .. } => elem_sig.as_str(),
            _ => f.sig.as_str(),
        }
    }

    fn advance_frame(&mut self, sig_len: usize) {
        let f = self.frames.last_mut().unwrap();
        match &mut f.kind {
            FrameKind::Array { remaining, .. } => *remaining -= 1,
            _ => f.sig_pos += sig_len,
        }
    }

    fn get_u8(&self, pos: usize) -> Result<u8> {
        self.data.get(pos).copied().ok_or(VariantError::Truncated)
    }

    fn get_u32(&self, pos: usize) -> Result<u32> {
        let end = pos.checked_add(4).ok_or(VariantError::Truncated)?;
        let b = self.data.get(pos..end).ok_or(VariantError::Truncated)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    /// Consume `n` bytes, bounded by the current frame.
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self.pos.checked_add(n).ok_or(VariantError::Truncated)?;
        if end > self.top().end || end > self.data.len() {
            return Err(VariantError::Truncated);
        }
        let s = &self.data[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn take_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        b.copy_from_slice(self.take(1)?);
        Ok(b[0])
    }

    fn take_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn expect_basic(&mut self, t: char) -> Result<()> {
        let found = self.peek_type().map(str::to_string);
        match found {
            Some(s) if s.len() == 1 && s.as_bytes()[0] == t as u8 => Ok(()),
            Some(s) => Err(VariantError::TypeMismatch {
                expected: t.to_string(),
                found: s,
            }),
            None => Err(VariantError::TypeMismatch {
                expected: t.to_string(),
                found: "end of container".into(),
            }),
        }
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.expect_basic('b')?;
        let b = self.take_u8()?;
        self.advance_frame(1);
        Ok(b != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.expect_basic('y')?;
        let b = self.take_u8()?;
        self.advance_frame(1);
        Ok(b)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.expect_basic('n')?;
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        self.advance_frame(1);
        Ok(i16::from_le_bytes(b))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.expect_basic('q')?;
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        self.advance_frame(1);
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.expect_basic('i')?;
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        self.advance_frame(1);
        Ok(i32::from_le_bytes(b))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.expect_basic('u')?;
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        self.advance_frame(1);
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.expect_basic('x')?;
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        self.advance_frame(1);
        Ok(i64::from_le_bytes(b))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.expect_basic('t')?;
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        self.advance_frame(1);
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.expect_basic('d')?;
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        self.advance_frame(1);
        Ok(f64::from_le_bytes(b))
    }

    pub fn read_str(&mut self) -> Result<String> {
        self.expect_basic('s')?;
        let len = self.take_u32()? as usize;
        let bytes = self.take(len)?.to_vec();
        self.advance_frame(1);
        String::from_utf8(bytes).map_err(|e| VariantError::Utf8(e.utf8_error()))
    }

    /// Read one dynamically typed basic value.
    pub fn read_value(&mut self) -> Result<Value> {
        let t = self.peek_type().map(str::to_string);
        match t.as_deref() {
            Some("b") => Ok(Value::Bool(self.read_bool()?)),
            Some("y") => Ok(Value::U8(self.read_u8()?)),
            Some("n") => Ok(Value::I16(self.read_i16()?)),
            Some("q") => Ok(Value::U16(self.read_u16()?)),
            Some("i") => Ok(Value::I32(self.read_i32()?)),
            Some("u") => Ok(Value::U32(self.read_u32()?)),
            Some("x") => Ok(Value::I64(self.read_i64()?)),
            Some("t") => Ok(Value::U64(self.read_u64()?)),
            Some("d") => Ok(Value::F64(self.read_f64()?)),
            Some("s") => Ok(Value::Str(self.read_str()?)),
            Some(other) => Err(VariantError::TypeMismatch {
                expected: "basic type".into(),
                found: other.to_string(),
            }),
            None => Err(VariantError::TypeMismatch {
                expected: "basic type".into(),
                found: "end of container".into(),
            }),
        }
    }

    /// Read `n` dynamically typed basic values.
    pub fn read_values(&mut self, n: usize) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.read_value()?);
        }
        Ok(values)
    }

    /// Enter the container at the cursor.
    pub fn enter(&mut self) -> Result<()> {
        let t = self
            .peek_type()
            .map(str::to_string)
            .ok_or_else(|| VariantError::TypeMismatch {
                expected: "container".into(),
                found: "end of container".into(),
            })?;
        if self.frames.len() > MAX_DEPTH {
            return Err(VariantError::DepthLimit);
        }
        let parent_end = self.top().end;
        let frame = match t.as_bytes()[0] {
            b'(' => Frame {
                kind: FrameKind::Tuple,
                sig: t[1..t.len() - 1].to_string(),
                sig_pos: 0,
                end: parent_end,
                parent_advance: t.len(),
            },
            b'a' => {
                let count = self.take_u32()?;
                Frame {
                    kind: FrameKind::Array {
                        elem_sig: t[1..].to_string(),
                        remaining: count,
                    },
                    sig: String::new(),
                    sig_pos: 0,
                    end: parent_end,
                    parent_advance: t.len(),
                }
            }
            b'v' => {
                let sig_len = self.take_u8()? as usize;
                let sig = std::str::from_utf8(self.take(sig_len)?)?.to_string();
                signature::validate(&sig)?;
                let data_len = self.take_u32()? as usize;
                let end = self
                    .pos
                    .checked_add(data_len)
                    .ok_or(VariantError::Truncated)?;
                if end > parent_end {
                    return Err(VariantError::Truncated);
                }
                Frame {
                    kind: FrameKind::Variant,
                    sig,
                    sig_pos: 0,
                    end,
                    parent_advance: 1,
                }
            }
            _ => {
                return Err(VariantError::TypeMismatch {
                    expected: "container".into(),
                    found: t,
                })
            }
        };
        self.frames.push(frame);
        Ok(())
    }

    /// Leave the current container, skipping any values left in it.
    pub fn exit(&mut self) -> Result<()> {
        if self.frames.len() == 1 {
            return Err(VariantError::NotInContainer);
        }
        if matches!(self.top().kind, FrameKind::Variant) {
            self.pos = self.top().end;
        } else {
            while self.peek_type().is_some() {
                self.skip()?;
            }
        }
        let frame = self.frames.pop().unwrap();
        self.advance_frame(frame.parent_advance);
        Ok(())
    }

    /// Step over one complete value without decoding it.
    pub fn skip(&mut self) -> Result<()> {
        let t = self
            .peek_type()
            .map(str::to_string)
            .ok_or_else(|| VariantError::TypeMismatch {
                expected: "value".into(),
                found: "end of container".into(),
            })?;
        let new_pos = self.walk(&t, self.pos)?;
        if new_pos > self.top().end {
            return Err(VariantError::Truncated);
        }
        self.pos = new_pos;
        self.advance_frame(t.len());
        Ok(())
    }

    /// Compute the data offset just past one complete type at `pos`.
    fn walk(&self, t: &str, pos: usize) -> Result<usize> {
        let c = t.as_bytes()[0];
        if let Some(w) = fixed_width(c) {
            return self.bounded(pos, w);
        }
        match c {
            b's' => {
                let len = self.get_u32(pos)? as usize;
                self.bounded(pos, 4 + len)
            }
            b'v' => {
                let sig_len = self.get_u8(pos)? as usize;
                let data_at = pos
                    .checked_add(1 + sig_len)
                    .ok_or(VariantError::Truncated)?;
                let data_len = self.get_u32(data_at)? as usize;
                self.bounded(data_at, 4 + data_len)
            }
            b'a' => {
                let count = self.get_u32(pos)?;
                let elem = &t[1..];
                let mut p = self.bounded(pos, 4)?;
                for _ in 0..count {
                    let next = self.walk(elem, p)?;
                    if next == p {
                        // zero-sized elements occupy no data
                        break;
                    }
                    p = next;
                }
                Ok(p)
            }
            b'(' => {
                let mut rest = &t[1..t.len() - 1];
                let mut p = pos;
                while !rest.is_empty() {
                    let (field, r) = split_first(rest)?;
                    p = self.walk(field, p)?;
                    rest = r;
                }
                Ok(p)
            }
            _ => Err(VariantError::BadSignature(format!(
                "unknown type character '{}'",
                c as char
            ))),
        }
    }

    fn bounded(&self, pos: usize, n: usize) -> Result<usize> {
        let end = pos.checked_add(n).ok_or(VariantError::Truncated)?;
        if end > self.data.len() {
            return Err(VariantError::Truncated);
        }
        Ok(end)
    }

    /// Reset the cursor to the start of the variant.
    pub fn rewind(&mut self) {
        self.frames.truncate(1);
        self.frames[0].sig_pos = 0;
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VariantBuilder;

    #[test]
    fn test_basic_roundtrip() {
        let mut b = VariantBuilder::new();
        b.write_u64(42).unwrap();
        b.write_str("hello").unwrap();
        b.write_bool(true).unwrap();
        let v = b.seal().unwrap();

        let mut c = v.cursor();
        assert_eq!(c.peek_type(), Some("t"));
        assert_eq!(c.read_u64().unwrap(), 42);
        assert_eq!(c.read_str().unwrap(), "hello");
        assert!(c.read_bool().unwrap());
        assert!(c.at_end());
    }

    #[test]
    fn test_tuple_roundtrip() {
        let mut b = VariantBuilder::new();
        b.begin_tuple().unwrap();
        b.write_u64(1).unwrap();
        b.write_u32(2).unwrap();
        b.end_tuple().unwrap();
        let v = b.seal().unwrap();

        let mut c = v.cursor();
        assert_eq!(c.peek_type(), Some("(tu)"));
        c.enter().unwrap();
        assert_eq!(c.read_u64().unwrap(), 1);
        assert_eq!(c.read_u32().unwrap(), 2);
        c.exit().unwrap();
        assert!(c.at_end());
    }

    #[test]
    fn test_array_iteration() {
        let mut b = VariantBuilder::new();
        b.begin_array().unwrap();
        for i in 0..3u32 {
            b.write_u32(i).unwrap();
        }
        b.end_array().unwrap();
        let v = b.seal().unwrap();

        let mut c = v.cursor();
        assert_eq!(c.peek_count().unwrap(), 3);
        c.enter().unwrap();
        let mut seen = Vec::new();
        while !c.at_end() {
            seen.push(c.read_u32().unwrap());
        }
        c.exit().unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_array_of_tuples() {
        let mut b = VariantBuilder::new();
        b.begin_array_of("(su)").unwrap();
        for (s, n) in [("a", 1u32), ("b", 2u32)] {
            b.begin_tuple().unwrap();
            b.write_str(s).unwrap();
            b.write_u32(n).unwrap();
            b.end_tuple().unwrap();
        }
        b.end_array().unwrap();
        let v = b.seal().unwrap();

        let mut c = v.cursor();
        c.enter().unwrap();
        assert_eq!(c.peek_count().unwrap(), 2);
        c.enter().unwrap();
        assert_eq!(c.read_str().unwrap(), "a");
        assert_eq!(c.read_u32().unwrap(), 1);
        c.exit().unwrap();
        c.enter().unwrap();
        assert_eq!(c.read_str().unwrap(), "b");
        c.exit().unwrap();
        c.exit().unwrap();
        assert!(c.at_end());
    }

    #[test]
    fn test_nested_variant() {
        let mut inner = VariantBuilder::new();
        inner.write_u64(9).unwrap();
        let inner = inner.seal().unwrap();

        let mut b = VariantBuilder::new();
        b.write_str("before").unwrap();
        b.write_variant(&inner).unwrap();
        b.write_str("after").unwrap();
        let v = b.seal().unwrap();
        assert_eq!(v.signature(), "svs");

        let mut c = v.cursor();
        assert_eq!(c.read_str().unwrap(), "before");
        c.enter().unwrap();
        assert_eq!(c.read_u64().unwrap(), 9);
        c.exit().unwrap();
        assert_eq!(c.read_str().unwrap(), "after");
    }

    #[test]
    fn test_skip() {
        let mut b = VariantBuilder::new();
        b.write_u64(1).unwrap();
        b.begin_array().unwrap();
        b.write_str("x").unwrap();
        b.write_str("y").unwrap();
        b.end_array().unwrap();
        b.write_u32(7).unwrap();
        let v = b.seal().unwrap();

        let mut c = v.cursor();
        c.skip().unwrap();
        c.skip().unwrap();
        assert_eq!(c.read_u32().unwrap(), 7);
    }

    #[test]
    fn test_partial_exit() {
        let mut b = VariantBuilder::new();
        b.begin_tuple().unwrap();
        b.write_u64(1).unwrap();
        b.write_str("skipped").unwrap();
        b.write_u32(2).unwrap();
        b.end_tuple().unwrap();
        b.write_u8(5).unwrap();
        let v = b.seal().unwrap();

        let mut c = v.cursor();
        c.enter().unwrap();
        assert_eq!(c.read_u64().unwrap(), 1);
        c.exit().unwrap();
        assert_eq!(c.read_u8().unwrap(), 5);
    }

    #[test]
    fn test_rewind() {
        let mut b = VariantBuilder::new();
        b.write_u64(3).unwrap();
        let v = b.seal().unwrap();

        let mut c = v.cursor();
        assert_eq!(c.read_u64().unwrap(), 3);
        assert!(c.at_end());
        c.rewind();
        assert_eq!(c.read_u64().unwrap(), 3);
    }

    #[test]
    fn test_type_mismatch() {
        let mut b = VariantBuilder::new();
        b.write_u64(3).unwrap();
        let v = b.seal().unwrap();

        let mut c = v.cursor();
        assert!(matches!(
            c.read_u32(),
            Err(VariantError::TypeMismatch { .. })
        ));
        // failed read does not advance
        assert_eq!(c.read_u64().unwrap(), 3);
    }

    #[test]
    fn test_exit_at_root() {
        let v = VariantBuilder::new().seal().unwrap();
        let mut c = v.cursor();
        assert!(matches!(c.exit(), Err(VariantError::NotInContainer)));
    }
}
