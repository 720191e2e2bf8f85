//! Bounds-checked reader for the offset-indirected table layout of manifest bodies.
//!
//! Objects start with an `i32` pointing back to their field table. The field
//! table holds its own byte size (`u16`), the object's inline size (`u16`),
//! then one `u16` slot per field with the field's offset inside the object.
//! Strings and vectors are reached through a forward `u32` offset relative to
//! the field that references them. Every position derived from the buffer is
//! validated before it is dereferenced.

use crate::error::{Result, RmanError};

#[derive(Clone, Copy, Debug)]
pub struct Buf<'a> {
    data: &'a [u8],
    max_vector_len: usize,
}

impl<'a> Buf<'a> {
    pub fn new(data: &'a [u8], max_vector_len: usize) -> Self {
        Self { data, max_vector_len }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn bytes(&self, pos: usize, len: usize) -> Result<&'a [u8]> {
        pos.checked_add(len).and_then(|end| self.data.get(pos..end)).ok_or_else(|| {
            RmanError::format(format!(
                "read of {len} bytes at {pos} exceeds body of {} bytes",
                self.data.len()
            ))
        })
    }

    fn array<const N: usize>(&self, pos: usize) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(pos, N)?);
        Ok(out)
    }

    pub fn u8_at(&self, pos: usize) -> Result<u8> {
        Ok(self.bytes(pos, 1)?[0])
    }

    pub fn u16_at(&self, pos: usize) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array(pos)?))
    }

    pub fn u32_at(&self, pos: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array(pos)?))
    }

    pub fn i32_at(&self, pos: usize) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array(pos)?))
    }

    pub fn u64_at(&self, pos: usize) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array(pos)?))
    }

    /// Follow the forward `u32` offset stored at `pos`.
    fn follow(&self, pos: usize) -> Result<usize> {
        let rel = self.u32_at(pos)? as usize;
        match pos.checked_add(rel) {
            Some(target) if target < self.data.len() => Ok(target),
            _ => Err(RmanError::format(format!("offset {rel} at {pos} points outside the body"))),
        }
    }

    /// The root object, located by the `u32` at the start of the body.
    pub fn root(&self) -> Result<Table<'a>> {
        let pos = self.u32_at(0)? as usize;
        Table::at(*self, pos)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Table<'a> {
    buf: Buf<'a>,
    pos: usize,
    vtable: usize,
    vtable_len: usize,
}

impl<'a> Table<'a> {
    pub fn at(buf: Buf<'a>, pos: usize) -> Result<Self> {
        let back = buf.i32_at(pos)? as i64;
        let vtable = usize::try_from(pos as i64 - back).map_err(|_| {
            RmanError::format(format!("field table of object at {pos} lies before the body"))
        })?;
        let vtable_len = buf.u16_at(vtable)? as usize;
        if vtable_len < 4 || vtable_len % 2 != 0 {
            return Err(RmanError::format(format!(
                "field table at {vtable} has invalid size {vtable_len}"
            )));
        }
        buf.bytes(vtable, vtable_len)?;
        Ok(Self { buf, pos, vtable, vtable_len })
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Absolute position of field `slot`, or `None` when it is absent.
    fn field(&self, slot: usize) -> Result<Option<usize>> {
        let entry = 4 + slot * 2;
        if entry + 2 > self.vtable_len {
            return Ok(None);
        }
        match self.buf.u16_at(self.vtable + entry)? {
            0 => Ok(None),
            off => Ok(Some(self.pos + off as usize)),
        }
    }

    pub fn u8(&self, slot: usize) -> Result<u8> {
        self.field(slot)?.map_or(Ok(0), |p| self.buf.u8_at(p))
    }

    pub fn u32(&self, slot: usize) -> Result<u32> {
        self.field(slot)?.map_or(Ok(0), |p| self.buf.u32_at(p))
    }

    pub fn u64(&self, slot: usize) -> Result<u64> {
        self.field(slot)?.map_or(Ok(0), |p| self.buf.u64_at(p))
    }

    pub fn string(&self, slot: usize) -> Result<&'a str> {
        let Some(p) = self.field(slot)? else {
            return Ok("");
        };
        let start = self.buf.follow(p)?;
        let len = self.buf.u32_at(start)? as usize;
        let bytes = self.buf.bytes(start + 4, len)?;
        std::str::from_utf8(bytes)
            .map_err(|e| RmanError::format(format!("string at {start} is not UTF-8: {e}")))
    }

    /// Locate a vector: position of its first element and its element count.
    fn vector(&self, slot: usize, width: usize) -> Result<(usize, usize)> {
        let Some(p) = self.field(slot)? else {
            return Ok((0, 0));
        };
        let start = self.buf.follow(p)?;
        let declared = self.buf.u32_at(start)? as usize;
        let first = start + 4;
        let room = self.buf.len().saturating_sub(first) / width;
        let count = declared.min(room).min(self.buf.max_vector_len);
        if count < declared {
            tracing::warn!(
                at = start,
                declared,
                kept = count,
                "vector longer than the body allows, truncated"
            );
        }
        Ok((first, count))
    }

    pub fn u64_vector(&self, slot: usize) -> Result<Vec<u64>> {
        let (first, count) = self.vector(slot, 8)?;
        (0..count).map(|i| self.buf.u64_at(first + i * 8)).collect()
    }

    pub fn tables(&self, slot: usize) -> Result<Vec<Table<'a>>> {
        let (first, count) = self.vector(slot, 4)?;
        (0..count)
            .map(|i| {
                let target = self.buf.follow(first + i * 4)?;
                Table::at(self.buf, target)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// root@12 -> field table@4 {u32 field 0, string field 1}; string "hello"@24.
    fn sample() -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&12u32.to_le_bytes());
        b.extend_from_slice(&8u16.to_le_bytes()); // field table size
        b.extend_from_slice(&12u16.to_le_bytes()); // object size
        b.extend_from_slice(&4u16.to_le_bytes()); // slot 0
        b.extend_from_slice(&8u16.to_le_bytes()); // slot 1
        b.extend_from_slice(&8i32.to_le_bytes()); // object@12 -> table@4
        b.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        b.extend_from_slice(&4u32.to_le_bytes()); // @20 -> @24
        b.extend_from_slice(&5u32.to_le_bytes());
        b.extend_from_slice(b"hello");
        b
    }

    #[test]
    fn reads_present_and_absent_fields() {
        let data = sample();
        let root = Buf::new(&data, 16).root().unwrap();
        assert_eq!(root.u32(0).unwrap(), 0xDEAD_BEEF);
        assert_eq!(root.string(1).unwrap(), "hello");
        assert_eq!(root.u64(5).unwrap(), 0);
        assert_eq!(root.string(7).unwrap(), "");
        assert!(root.tables(3).unwrap().is_empty());
    }

    #[test]
    fn string_length_past_end_is_rejected() {
        let mut data = sample();
        data[24..28].copy_from_slice(&500u32.to_le_bytes());
        let root = Buf::new(&data, 16).root().unwrap();
        assert!(matches!(root.string(1), Err(RmanError::Format(_))));
    }

    #[test]
    fn field_table_outside_body_is_rejected() {
        let mut data = sample();
        data[12..16].copy_from_slice(&64i32.to_le_bytes());
        assert!(matches!(Buf::new(&data, 16).root(), Err(RmanError::Format(_))));
        data[12..16].copy_from_slice(&(-400i32).to_le_bytes());
        assert!(matches!(Buf::new(&data, 16).root(), Err(RmanError::Format(_))));
    }

    #[test]
    fn oversized_vector_count_is_clamped() {
        let mut data = sample();
        // Reinterpret field 1 as a vector: no u64 fits in the 5 trailing bytes.
        let root = Buf::new(&data, 16).root().unwrap();
        assert_eq!(root.u64_vector(1).unwrap(), Vec::<u64>::new());
        data[24..28].copy_from_slice(&1u32.to_le_bytes());
        let root = Buf::new(&data, 0).root().unwrap();
        assert!(root.tables(1).unwrap().is_empty());
        // One u32 offset fits, but "hell" does not point at a table.
        let root = Buf::new(&data, 16).root().unwrap();
        assert!(matches!(root.tables(1), Err(RmanError::Format(_))));
    }

    #[test]
    fn truncated_body_errors_instead_of_panicking() {
        let data = sample();
        for cut in 0..data.len() {
            let buf = Buf::new(&data[..cut], 16);
            if let Ok(root) = buf.root() {
                let _ = root.string(1);
                let _ = root.u32(0);
            }
        }
    }
}
