//! Typed byte containers for parameter slots.

use bytes::Bytes;
use smallvec::SmallVec;

/// Byte order tag for copied multi-byte integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// A parameter value captured during one decode pass.
///
/// The three variants are the three ownership modes a module needs:
///
/// - `View` — zero-copy reference into the packet buffer, in network
///   (big-endian) byte order. The common case for header fields.
/// - `Copied` — small owned copy with an explicit endianness tag, for
///   values computed by the module rather than lifted off the wire.
/// - `Shared` — refcounted buffer for data assembled across packets
///   (reassembled stream content) that no single packet view can hold.
#[derive(Debug, Clone)]
pub enum Value<'p> {
    View(&'p [u8]),
    Copied {
        buf: SmallVec<[u8; 8]>,
        endian: Endian,
    },
    Shared(Bytes),
}

impl Default for Value<'_> {
    fn default() -> Self {
        Value::View(&[])
    }
}

impl<'p> Value<'p> {
    /// Point this slot at a view of the packet buffer.
    pub fn set(&mut self, view: &'p [u8]) {
        *self = Value::View(view);
    }

    /// Store an owned copy of `bytes` tagged with its byte order.
    pub fn cpy(&mut self, bytes: &[u8], endian: Endian) {
        *self = Value::Copied {
            buf: SmallVec::from_slice(bytes),
            endian,
        };
    }

    /// Store a refcounted buffer.
    pub fn share(&mut self, buf: Bytes) {
        *self = Value::Shared(buf);
    }

    /// The raw bytes of the value.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Value::View(v) => v,
            Value::Copied { buf, .. } => buf,
            Value::Shared(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    fn endian(&self) -> Endian {
        match self {
            Value::Copied { endian, .. } => *endian,
            // Wire views and shared buffers hold network byte order.
            _ => Endian::Big,
        }
    }

    /// Read as an unsigned 8-bit integer. `None` unless exactly one byte.
    pub fn u8(&self) -> Option<u8> {
        match self.bytes() {
            [b] => Some(*b),
            _ => None,
        }
    }

    /// Read as an unsigned 16-bit integer. `None` unless exactly two bytes.
    pub fn u16(&self) -> Option<u16> {
        let raw: [u8; 2] = self.bytes().try_into().ok()?;
        Some(match self.endian() {
            Endian::Big => u16::from_be_bytes(raw),
            Endian::Little => u16::from_le_bytes(raw),
        })
    }

    /// Read as an unsigned 32-bit integer. `None` unless exactly four bytes.
    pub fn u32(&self) -> Option<u32> {
        let raw: [u8; 4] = self.bytes().try_into().ok()?;
        Some(match self.endian() {
            Endian::Big => u32::from_be_bytes(raw),
            Endian::Little => u32::from_le_bytes(raw),
        })
    }

    /// Read as an unsigned 64-bit integer. `None` unless exactly eight bytes.
    pub fn u64(&self) -> Option<u64> {
        let raw: [u8; 8] = self.bytes().try_into().ok()?;
        Some(match self.endian() {
            Endian::Big => u64::from_be_bytes(raw),
            Endian::Little => u64::from_le_bytes(raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_is_network_order() {
        let wire = [0x1f, 0x90];
        let mut v = Value::default();
        v.set(&wire);
        assert_eq!(v.u16(), Some(8080));
        assert_eq!(v.bytes(), &wire);
    }

    #[test]
    fn test_copied_honors_endian_tag() {
        let mut v = Value::default();
        v.cpy(&500u32.to_le_bytes(), Endian::Little);
        assert_eq!(v.u32(), Some(500));

        v.cpy(&500u32.to_be_bytes(), Endian::Big);
        assert_eq!(v.u32(), Some(500));
    }

    #[test]
    fn test_size_mismatch_is_none() {
        let mut v = Value::default();
        v.set(&[1, 2, 3]);
        assert_eq!(v.u16(), None);
        assert_eq!(v.u32(), None);
        assert_eq!(v.u8(), None);
    }

    #[test]
    fn test_shared_buffer() {
        let mut v = Value::default();
        v.share(Bytes::from_static(b"reassembled"));
        assert_eq!(v.bytes(), b"reassembled");
        assert_eq!(v.len(), 11);
    }

    #[test]
    fn test_default_is_empty() {
        let v = Value::default();
        assert!(v.is_empty());
    }
}
