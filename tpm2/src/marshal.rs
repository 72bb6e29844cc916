// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 marshalling/unmarshalling utilities
//!
//! Provides serialization and deserialization for TPM structures. Integers
//! are big-endian on the wire; [`ByteOrder::Little`] exists for
//! platform-local blobs that are never sent to the TPM.

use tracing::warn;

use crate::error::{Error, Result};

/// Integer byte order of a buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// Width of a length or count prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeWidth {
    U8,
    U16,
    U32,
}

impl SizeWidth {
    pub fn bytes(self) -> usize {
        match self {
            SizeWidth::U8 => 1,
            SizeWidth::U16 => 2,
            SizeWidth::U32 => 4,
        }
    }

    fn length_kind(self) -> &'static str {
        match self {
            SizeWidth::U8 => "8-bit length",
            SizeWidth::U16 => "TPM2B length",
            SizeWidth::U32 => "32-bit length",
        }
    }

    fn max(self) -> usize {
        match self {
            SizeWidth::U8 => u8::MAX as usize,
            SizeWidth::U16 => u16::MAX as usize,
            SizeWidth::U32 => u32::MAX as usize,
        }
    }
}

/// Reservation returned by [`CommandBuffer::push_size`]; must be handed back
/// to [`CommandBuffer::pop_size`] in LIFO order.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a pushed size placeholder must be popped"]
pub struct SizeMarker {
    pos: usize,
    width: SizeWidth,
    depth: usize,
}

/// Buffer for building TPM commands
///
/// Length prefixes that do not fit their field, and values a `marshal`
/// impl rejects, are recorded rather than written silently wrong;
/// [`CommandBuffer::finish`] reports the first one.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    data: Vec<u8>,
    order: ByteOrder,
    pending: Vec<usize>,
    failed: Option<Error>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(order: ByteOrder) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        match self.order {
            ByteOrder::Big => self.data.extend_from_slice(&v.to_be_bytes()),
            ByteOrder::Little => self.data.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn put_u32(&mut self, v: u32) {
        match self.order {
            ByteOrder::Big => self.data.extend_from_slice(&v.to_be_bytes()),
            ByteOrder::Little => self.data.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn put_u64(&mut self, v: u64) {
        match self.order {
            ByteOrder::Big => self.data.extend_from_slice(&v.to_be_bytes()),
            ByteOrder::Little => self.data.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data)
    pub fn put_tpm2b(&mut self, data: &[u8]) {
        self.put_width(SizeWidth::U16, data.len());
        self.put_bytes(data);
    }

    /// Put an empty TPM2B structure
    pub fn put_tpm2b_empty(&mut self) {
        self.put_u16(0);
    }

    /// Put a variable-length array preceded by its element count.
    pub fn put_array<T: Marshal>(&mut self, items: &[T], count: SizeWidth) {
        self.put_width(count, items.len());
        for item in items {
            item.marshal(self);
        }
    }

    /// Reserve a length field of `width` bytes at the current position.
    pub fn push_size(&mut self, width: SizeWidth) -> SizeMarker {
        let pos = self.data.len();
        self.data.resize(pos + width.bytes(), 0);
        self.pending.push(pos);
        SizeMarker {
            pos,
            width,
            depth: self.pending.len(),
        }
    }

    /// Back-patch the most recent reservation with the number of bytes
    /// written since it was pushed.
    pub fn pop_size(&mut self, marker: SizeMarker) -> Result<()> {
        let len = self.data.len() - marker.pos - marker.width.bytes();
        self.close_size(marker, len)
    }

    /// Back-patch the reservation with the length of the whole buffer, the
    /// way a command or response header counts its own size.
    pub fn pop_frame_size(&mut self, marker: SizeMarker) -> Result<()> {
        let len = self.data.len();
        self.close_size(marker, len)
    }

    fn close_size(&mut self, marker: SizeMarker, len: usize) -> Result<()> {
        if self.pending.len() != marker.depth || self.pending.last() != Some(&marker.pos) {
            return Err(Error::logic(format!(
                "size placeholder at offset {} popped out of order",
                marker.pos
            )));
        }
        self.pending.pop();
        if len > marker.width.max() {
            return Err(Error::logic(format!(
                "{len} bytes do not fit a {}-byte length field",
                marker.width.bytes()
            )));
        }
        self.patch_width(marker.pos, marker.width, len);
        Ok(())
    }

    /// Marshal a size-prefixed sub-structure; `None` encodes as size 0.
    pub fn put_sized<T: Marshal>(&mut self, width: SizeWidth, value: Option<&T>) {
        let pos = self.data.len();
        self.data.resize(pos + width.bytes(), 0);
        if let Some(value) = value {
            value.marshal(self);
        }
        let len = self.data.len() - pos - width.bytes();
        self.check_width(width, len);
        self.patch_width(pos, width, len);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Finish the buffer; every placeholder must have been popped.
    pub fn finish(self) -> Result<Vec<u8>> {
        if let Some(err) = self.failed {
            return Err(err);
        }
        if !self.pending.is_empty() {
            return Err(Error::logic(format!(
                "{} size placeholders never popped",
                self.pending.len()
            )));
        }
        Ok(self.data)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Update a u32 at a specific position (for size fields)
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        let bytes = match self.order {
            ByteOrder::Big => v.to_be_bytes(),
            ByteOrder::Little => v.to_le_bytes(),
        };
        self.data[pos..pos + 4].copy_from_slice(&bytes);
    }

    /// Record an encoding failure; only the first one is kept.
    pub fn fail(&mut self, err: Error) {
        if self.failed.is_none() {
            warn!("marshaling failed: {err}");
            self.failed = Some(err);
        }
    }

    fn check_width(&mut self, width: SizeWidth, len: usize) {
        if len > width.max() {
            self.fail(Error::InvalidValue {
                kind: width.length_kind(),
                value: u32::try_from(len).unwrap_or(u32::MAX),
            });
        }
    }

    /// Put a length or count prefix of `width` bytes.
    pub fn put_width(&mut self, width: SizeWidth, v: usize) {
        self.check_width(width, v);
        match width {
            SizeWidth::U8 => self.put_u8(v as u8),
            SizeWidth::U16 => self.put_u16(v as u16),
            SizeWidth::U32 => self.put_u32(v as u32),
        }
    }

    fn patch_width(&mut self, pos: usize, width: SizeWidth, v: usize) {
        match width {
            SizeWidth::U8 => self.data[pos] = v as u8,
            SizeWidth::U16 => {
                let bytes = match self.order {
                    ByteOrder::Big => (v as u16).to_be_bytes(),
                    ByteOrder::Little => (v as u16).to_le_bytes(),
                };
                self.data[pos..pos + 2].copy_from_slice(&bytes);
            }
            SizeWidth::U32 => self.update_u32(pos, v as u32),
        }
    }
}

/// Buffer for parsing TPM responses
#[derive(Debug)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            order: ByteOrder::Big,
        }
    }

    pub fn with_order(data: &'a [u8], order: ByteOrder) -> Self {
        Self {
            data,
            pos: 0,
            order,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take_slice(N)?);
        Ok(out)
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::Truncated {
                wanted: len,
                remaining: self.remaining(),
            });
        }
        let data = self.data;
        let v = &data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take::<2>()?;
        Ok(match self.order {
            ByteOrder::Big => u16::from_be_bytes(b),
            ByteOrder::Little => u16::from_le_bytes(b),
        })
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take::<4>()?;
        Ok(match self.order {
            ByteOrder::Big => u32::from_be_bytes(b),
            ByteOrder::Little => u32::from_le_bytes(b),
        })
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take::<8>()?;
        Ok(match self.order {
            ByteOrder::Big => u64::from_be_bytes(b),
            ByteOrder::Little => u64::from_le_bytes(b),
        })
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take_slice(len)?.to_vec())
    }

    fn get_width(&mut self, width: SizeWidth) -> Result<usize> {
        Ok(match width {
            SizeWidth::U8 => self.get_u8()? as usize,
            SizeWidth::U16 => self.get_u16()? as usize,
            SizeWidth::U32 => self.get_u32()? as usize,
        })
    }

    /// Read a length prefix and check it against the remaining buffer.
    pub fn get_length(&mut self, width: SizeWidth) -> Result<usize> {
        let declared = self.get_width(width)?;
        if declared > self.remaining() {
            return Err(Error::BadLength {
                declared,
                remaining: self.remaining(),
            });
        }
        Ok(declared)
    }

    /// Get a TPM2B structure (2-byte size prefix + data)
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_length(SizeWidth::U16)?;
        self.get_bytes(size)
    }

    /// Get a variable-length array preceded by its element count.
    pub fn get_array<T: Unmarshal>(&mut self, count: SizeWidth) -> Result<Vec<T>> {
        let n = self.get_width(count)?;
        // Every element occupies at least one byte.
        if n > self.remaining() {
            return Err(Error::BadLength {
                declared: n,
                remaining: self.remaining(),
            });
        }
        (0..n).map(|_| T::unmarshal(self)).collect()
    }

    /// Get a size-prefixed sub-structure. A declared size of zero means the
    /// structure is absent.
    pub fn get_sized<T: Unmarshal>(&mut self, width: SizeWidth) -> Result<Option<T>> {
        let size = self.get_length(width)?;
        if size == 0 {
            return Ok(None);
        }
        let mut inner = ResponseBuffer::with_order(self.take_slice(size)?, self.order);
        let value = T::unmarshal(&mut inner)?;
        inner.ensure_consumed(std::any::type_name::<T>())?;
        Ok(Some(value))
    }

    /// Get remaining bytes
    pub fn get_remaining(&mut self) -> Vec<u8> {
        let v = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        v
    }

    /// Skip bytes
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take_slice(len).map(|_| ())
    }

    /// Peek at bytes without advancing position
    pub fn peek_bytes(&self, len: usize) -> Result<&[u8]> {
        if len > self.remaining() {
            return Err(Error::Truncated {
                wanted: len,
                remaining: self.remaining(),
            });
        }
        Ok(&self.data[self.pos..self.pos + len])
    }

    /// Fail if anything is left after a complete top-level structure.
    pub fn ensure_consumed(&self, what: &'static str) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            count => {
                warn!("{count} trailing bytes after {what}");
                Err(Error::TrailingBytes { what, count })
            }
        }
    }
}

/// Trait for types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }

    /// Like [`Marshal::to_bytes`], but reports failures recorded while
    /// marshaling.
    fn try_to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.finish()
    }
}

/// Trait for types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    /// Parse a complete value; trailing bytes are an error.
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        let v = Self::unmarshal(&mut buf)?;
        buf.ensure_consumed(std::any::type_name::<Self>())?;
        Ok(v)
    }
}

/// Union member selected by a previously unmarshalled selector
pub trait UnmarshalUnion: Sized {
    fn unmarshal_union(selector: u16, buf: &mut ResponseBuffer) -> Result<Self>;
}

/// Union member that knows the selector value it must be marshalled under
pub trait Selector {
    fn selector(&self) -> u16;
}

impl Marshal for u8 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u8(*self);
    }
}

impl Marshal for u16 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(*self);
    }
}

impl Marshal for u32 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(*self);
    }
}

impl Marshal for u64 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u64(*self);
    }
}

impl Unmarshal for u8 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u8()
    }
}

impl Unmarshal for u16 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u16()
    }
}

impl Unmarshal for u32 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u32()
    }
}

impl Unmarshal for u64 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_size_placeholders() {
        let mut buf = CommandBuffer::new();
        let outer = buf.push_size(SizeWidth::U32);
        buf.put_u8(0xAA);
        let inner = buf.push_size(SizeWidth::U16);
        buf.put_bytes(&[1, 2, 3]);
        let innermost = buf.push_size(SizeWidth::U8);
        buf.pop_size(innermost).unwrap();
        buf.pop_size(inner).unwrap();
        buf.put_u8(0xBB);
        buf.pop_size(outer).unwrap();
        assert_eq!(
            buf.finish().unwrap(),
            vec![0, 0, 0, 9, 0xAA, 0, 4, 1, 2, 3, 0, 0xBB]
        );
    }

    #[test]
    fn test_pop_out_of_order_fails() {
        let mut buf = CommandBuffer::new();
        let outer = buf.push_size(SizeWidth::U16);
        let _inner = buf.push_size(SizeWidth::U16);
        assert!(matches!(buf.pop_size(outer), Err(Error::Logic(_))));
    }

    #[test]
    fn test_pop_overflow_fails() {
        let mut buf = CommandBuffer::new();
        let m = buf.push_size(SizeWidth::U8);
        buf.put_bytes(&[0u8; 300]);
        assert!(matches!(buf.pop_size(m), Err(Error::Logic(_))));
    }

    #[test]
    fn test_oversized_tpm2b_fails_finish() {
        let mut buf = CommandBuffer::new();
        buf.put_tpm2b(&vec![0u8; 0x1_0000]);
        buf.put_tpm2b(&[1, 2]);
        assert!(matches!(
            buf.finish(),
            Err(Error::InvalidValue {
                kind: "TPM2B length",
                value: 0x1_0000
            })
        ));

        let mut buf = CommandBuffer::new();
        buf.put_tpm2b(&vec![0u8; 0xFFFF]);
        let bytes = buf.finish().unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xFF]);
        assert_eq!(bytes.len(), 0x1_0001);
    }

    #[test]
    fn test_frame_size_counts_whole_buffer() {
        let mut buf = CommandBuffer::new();
        buf.put_u16(0x8001);
        let frame = buf.push_size(SizeWidth::U32);
        let _inner = buf.push_size(SizeWidth::U16);
        buf.put_u8(7);
        assert!(matches!(buf.pop_frame_size(frame), Err(Error::Logic(_))));

        let mut buf = CommandBuffer::new();
        buf.put_u16(0x8001);
        let frame = buf.push_size(SizeWidth::U32);
        let inner = buf.push_size(SizeWidth::U16);
        buf.put_u8(7);
        buf.pop_size(inner).unwrap();
        buf.pop_frame_size(frame).unwrap();
        assert_eq!(
            buf.finish().unwrap(),
            vec![0x80, 0x01, 0, 0, 0, 9, 0, 1, 7]
        );
    }

    #[test]
    fn test_unpopped_placeholder_fails_finish() {
        let mut buf = CommandBuffer::new();
        let _m = buf.push_size(SizeWidth::U32);
        assert!(buf.finish().is_err());
    }

    #[test]
    fn test_little_endian_mode() {
        let mut buf = CommandBuffer::with_order(ByteOrder::Little);
        buf.put_u32(0x01020304);
        buf.put_u16(0x0506);
        assert_eq!(buf.as_bytes(), &[4, 3, 2, 1, 6, 5]);
        let bytes = buf.into_vec();
        let mut rb = ResponseBuffer::with_order(&bytes, ByteOrder::Little);
        assert_eq!(rb.get_u32().unwrap(), 0x01020304);
        assert_eq!(rb.get_u16().unwrap(), 0x0506);
    }

    #[test]
    fn test_tpm2b_length_exceeds_buffer() {
        let data = [0x00, 0x05, 1, 2];
        let mut buf = ResponseBuffer::new(&data);
        assert!(matches!(
            buf.get_tpm2b(),
            Err(Error::BadLength {
                declared: 5,
                remaining: 2
            })
        ));
    }

    #[test]
    fn test_truncated_integer() {
        let mut buf = ResponseBuffer::new(&[0x01, 0x02, 0x03]);
        assert!(matches!(buf.get_u32(), Err(Error::Truncated { .. })));
    }

    #[test]
    fn test_sized_zero_is_absent() {
        let mut buf = ResponseBuffer::new(&[0x00, 0x00]);
        assert_eq!(buf.get_sized::<u32>(SizeWidth::U16).unwrap(), None);
        assert_eq!(buf.remaining(), 0);

        let mut buf = ResponseBuffer::new(&[0x00, 0x04, 0, 0, 1, 0]);
        assert_eq!(buf.get_sized::<u32>(SizeWidth::U16).unwrap(), Some(256));
    }

    #[test]
    fn test_sized_with_leftover_is_trailing() {
        let mut buf = ResponseBuffer::new(&[0x00, 0x03, 0, 1, 2]);
        assert!(matches!(
            buf.get_sized::<u16>(SizeWidth::U16),
            Err(Error::TrailingBytes { count: 1, .. })
        ));
    }

    #[test]
    fn test_arrays() {
        let mut buf = CommandBuffer::new();
        buf.put_array(&[1u16, 2, 3], SizeWidth::U32);
        let bytes = buf.into_vec();
        assert_eq!(bytes, vec![0, 0, 0, 3, 0, 1, 0, 2, 0, 3]);
        let mut rb = ResponseBuffer::new(&bytes);
        assert_eq!(rb.get_array::<u16>(SizeWidth::U32).unwrap(), vec![1, 2, 3]);

        let mut rb = ResponseBuffer::new(&[0, 0, 0, 200, 0]);
        assert!(rb.get_array::<u8>(SizeWidth::U32).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_trailing() {
        assert_eq!(u16::from_bytes(&[0x12, 0x34]).unwrap(), 0x1234);
        assert!(matches!(
            u16::from_bytes(&[0x12, 0x34, 0x00]),
            Err(Error::TrailingBytes { count: 1, .. })
        ));
    }
}
