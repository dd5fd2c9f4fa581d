use crate::error::{Error, NetResult};
use crate::{ClientId, InstanceId, OperationId};
use byteorder::{ByteOrder, LittleEndian};

const MIN_GROWTH: usize = 64;

/// Owned, resizable byte buffer with a read cursor and a small metadata header.
///
/// Three sizes are tracked: *memory* (allocated), *used* (logical length) and the *cursor* (next
/// byte consumed by typed reads). The invariant `cursor <= used <= memory` holds at all times.
/// All wire encoding is little-endian fixed width; "size" fields travel as `u32`.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Vec<u8>,
    used: usize,
    cursor: usize,

    client_from: ClientId,
    operation: OperationId,
    age: u32,
    instance: InstanceId,
}

impl Packet {
    #[inline]
    pub fn new() -> Packet {
        Packet::with_memory(0)
    }

    /// Empty packet with `memory` bytes pre-allocated.
    pub fn with_memory(memory: usize) -> Packet {
        Packet {
            data: vec![0u8; memory],
            used: 0,
            cursor: 0,
            client_from: 0,
            operation: 0,
            age: 0,
            instance: 0,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Packet {
        let mut packet = Packet::with_memory(bytes.len());
        packet.data[..bytes.len()].copy_from_slice(bytes);
        packet.used = bytes.len();
        packet
    }

    #[inline]
    pub fn from_str(text: &str) -> Packet {
        Packet::from_slice(text.as_bytes())
    }

    #[inline]
    pub fn memory_size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn used_size(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Unread bytes between the cursor and the used size.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.used - self.cursor
    }

    /// Changes the allocated size. Growth preserves contents; shrinking below the used size is
    /// refused with `WouldTruncate` (use `set_memory_truncate` to discard the tail).
    pub fn set_memory(&mut self, memory: usize) -> NetResult<()> {
        if memory < self.used {
            return Err(Error::WouldTruncate);
        }

        self.data.resize(memory, 0);
        Ok(())
    }

    /// Changes the allocated size, truncating the used size and clamping the cursor if the new
    /// allocation is smaller.
    pub fn set_memory_truncate(&mut self, memory: usize) {
        self.data.resize(memory, 0);

        if self.used > memory {
            self.used = memory;
        }
        if self.cursor > self.used {
            self.cursor = self.used;
        }
    }

    /// Sets the logical length. The target must already be allocated.
    pub fn set_used(&mut self, used: usize) {
        assert!(used <= self.data.len(), "Used size {} exceeds memory size {}", used, self.data.len());

        self.used = used;
        if self.cursor > self.used {
            self.cursor = self.used;
        }
    }

    /// Moves the read cursor. Valid positions are `0..=used`.
    pub fn set_cursor(&mut self, cursor: usize) {
        assert!(cursor <= self.used, "Cursor {} exceeds used size {}", cursor, self.used);

        self.cursor = cursor;
    }

    /// Drops all content, keeping the allocation.
    #[inline]
    pub fn clear(&mut self) {
        self.used = 0;
        self.cursor = 0;
    }

    /// The used region, handed to socket IO without copying. Any mutation of the packet
    /// invalidates the slice, so asynchronous send paths copy instead.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// The unread region starting at the cursor.
    #[inline]
    pub fn unread_slice(&self) -> &[u8] {
        &self.data[self.cursor..self.used]
    }

    fn ensure_space(&mut self, extra: usize) {
        let needed = self.used.checked_add(extra).expect("Packet size overflow");

        if needed > self.data.len() {
            let doubled = (self.data.len() * 2).max(MIN_GROWTH);
            self.data.resize(needed.max(doubled), 0);
        }
    }

    /// Appends raw bytes, growing the allocation as required.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.ensure_space(bytes.len());
        self.data[self.used..self.used + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
    }

    /// Reads `len` raw bytes from the cursor.
    pub fn get_bytes(&mut self, len: usize) -> NetResult<Vec<u8>> {
        if self.remaining() < len {
            return Err(Error::ShortRead);
        }

        let out = self.data[self.cursor..self.cursor + len].to_vec();
        self.cursor += len;
        Ok(out)
    }

    /// Appends a string without a length prefix.
    #[inline]
    pub fn add_str(&mut self, text: &str) {
        self.add_bytes(text.as_bytes());
    }

    /// Appends a string preceded by its byte length as a size prefix.
    pub fn add_str_prefixed(&mut self, text: &str) {
        self.add_size(text.len());
        self.add_bytes(text.as_bytes());
    }

    /// Reads a length-prefixed string written by `add_str_prefixed`. The cursor is left at the
    /// failing field when the payload is incomplete.
    pub fn get_str_prefixed(&mut self) -> NetResult<String> {
        let mark = self.cursor;
        let len = self.get_size()?;

        if self.remaining() < len {
            self.cursor = mark;
            return Err(Error::ShortRead);
        }

        let bytes = self.get_bytes(len)?;
        String::from_utf8(bytes).map_err(|_| Error::ShortRead)
    }

    /// Appends a size field (`u32` on the wire).
    pub fn add_size(&mut self, value: usize) {
        assert!(value <= u32::max_value() as usize, "Size field {} exceeds the wire width", value);
        self.add_u32(value as u32);
    }

    /// Reads a size field (`u32` on the wire).
    #[inline]
    pub fn get_size(&mut self) -> NetResult<usize> {
        self.get_u32().map(|value| value as usize)
    }

    pub fn add_bool(&mut self, value: bool) {
        self.add_u8(value as u8);
    }

    pub fn get_bool(&mut self) -> NetResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Erases `[start, start + len)`, shifting the remainder left in one bulk move. The cursor
    /// is clamped so it never points into the erased region.
    pub fn erase(&mut self, start: usize, len: usize) {
        assert!(
            start + len <= self.used,
            "Erase range {}..{} exceeds used size {}",
            start,
            start + len,
            self.used
        );

        self.data.copy_within(start + len..self.used, start);
        self.used -= len;

        if self.cursor > start + len {
            self.cursor -= len;
        } else if self.cursor > start {
            self.cursor = start;
        }
    }

    /// Finds the first occurrence of `pattern` at or after `from` within the used region.
    pub fn find(&self, pattern: &[u8], from: usize) -> Option<usize> {
        if pattern.is_empty() || from >= self.used || self.used - from < pattern.len() {
            return None;
        }

        self.data[..self.used]
            .windows(pattern.len())
            .skip(from)
            .position(|window| window == pattern)
            .map(|offset| offset + from)
    }

    #[inline]
    pub fn client_from(&self) -> ClientId {
        self.client_from
    }

    #[inline]
    pub fn set_client_from(&mut self, client_id: ClientId) {
        self.client_from = client_id;
    }

    #[inline]
    pub fn operation(&self) -> OperationId {
        self.operation
    }

    #[inline]
    pub fn set_operation(&mut self, operation: OperationId) {
        self.operation = operation;
    }

    #[inline]
    pub fn age(&self) -> u32 {
        self.age
    }

    #[inline]
    pub fn set_age(&mut self, age: u32) {
        self.age = age;
    }

    #[inline]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    #[inline]
    pub fn set_instance(&mut self, instance: InstanceId) {
        self.instance = instance;
    }

    /// Loads content and metadata in one step, reusing the existing allocation where possible.
    pub fn load(
        &mut self,
        bytes: &[u8],
        client_from: ClientId,
        operation: OperationId,
        instance: InstanceId,
        age: u32,
    ) {
        self.clear();
        self.add_bytes(bytes);
        self.client_from = client_from;
        self.operation = operation;
        self.instance = instance;
        self.age = age;
    }
}

macro_rules! typed_field {
    ($add:ident, $get:ident, $ty:ty, $size:expr, $write:ident, $read:ident) => {
        impl Packet {
            pub fn $add(&mut self, value: $ty) {
                self.ensure_space($size);
                LittleEndian::$write(&mut self.data[self.used..self.used + $size], value);
                self.used += $size;
            }

            pub fn $get(&mut self) -> NetResult<$ty> {
                if self.remaining() < $size {
                    return Err(Error::ShortRead);
                }

                let value = LittleEndian::$read(&self.data[self.cursor..self.cursor + $size]);
                self.cursor += $size;
                Ok(value)
            }
        }
    };
}

typed_field!(add_u16, get_u16, u16, 2, write_u16, read_u16);
typed_field!(add_i16, get_i16, i16, 2, write_i16, read_i16);
typed_field!(add_u32, get_u32, u32, 4, write_u32, read_u32);
typed_field!(add_i32, get_i32, i32, 4, write_i32, read_i32);
typed_field!(add_u64, get_u64, u64, 8, write_u64, read_u64);
typed_field!(add_i64, get_i64, i64, 8, write_i64, read_i64);
typed_field!(add_f32, get_f32, f32, 4, write_f32, read_f32);
typed_field!(add_f64, get_f64, f64, 8, write_f64, read_f64);

impl Packet {
    pub fn add_u8(&mut self, value: u8) {
        self.ensure_space(1);
        self.data[self.used] = value;
        self.used += 1;
    }

    pub fn get_u8(&mut self) -> NetResult<u8> {
        if self.remaining() < 1 {
            return Err(Error::ShortRead);
        }

        let value = self.data[self.cursor];
        self.cursor += 1;
        Ok(value)
    }

    pub fn add_i8(&mut self, value: i8) {
        self.add_u8(value as u8);
    }

    pub fn get_i8(&mut self) -> NetResult<i8> {
        Ok(self.get_u8()? as i8)
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Packet) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl PartialEq<[u8]> for Packet {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_slice() == other
    }
}

impl PartialEq<&str> for Packet {
    fn eq(&self, other: &&str) -> bool {
        self.as_slice() == other.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_roundtrip() {
        let mut packet = Packet::new();

        packet.add_u8(0xfe);
        packet.add_i16(-12345);
        packet.add_u32(0xdead_beef);
        packet.add_i64(-1);
        packet.add_f32(1.5);
        packet.add_f64(-2.25);
        packet.add_bool(true);

        assert_eq!(packet.get_u8().unwrap(), 0xfe);
        assert_eq!(packet.get_i16().unwrap(), -12345);
        assert_eq!(packet.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(packet.get_i64().unwrap(), -1);
        assert_eq!(packet.get_f32().unwrap(), 1.5);
        assert_eq!(packet.get_f64().unwrap(), -2.25);
        assert_eq!(packet.get_bool().unwrap(), true);
        assert_eq!(packet.remaining(), 0);
    }

    #[test]
    fn test_wire_encoding_is_little_endian() {
        let mut packet = Packet::new();
        packet.add_u32(0x0b);

        assert_eq!(packet.as_slice(), &[0x0b, 0, 0, 0]);
    }

    #[test]
    fn test_read_at_appended_position() {
        let mut packet = Packet::new();
        packet.add_str("junk");

        let mark = packet.used_size();
        packet.add_u64(8008);

        packet.set_cursor(mark);
        assert_eq!(packet.get_u64().unwrap(), 8008);
    }

    #[test]
    fn test_short_read_leaves_cursor() {
        let mut packet = Packet::new();
        packet.add_u16(77);

        assert_eq!(packet.get_u32().unwrap_err(), Error::ShortRead);
        assert_eq!(packet.cursor(), 0);
        assert_eq!(packet.get_u16().unwrap(), 77);
    }

    #[test]
    fn test_prefixed_string_roundtrip() {
        let mut packet = Packet::new();
        packet.add_str_prefixed("hello world");

        assert_eq!(packet.used_size(), 4 + 11);
        assert_eq!(packet.get_str_prefixed().unwrap(), "hello world");
    }

    #[test]
    fn test_prefixed_string_short_payload_restores_cursor() {
        let mut packet = Packet::new();
        packet.add_size(100);
        packet.add_str("only a few bytes");

        assert_eq!(packet.get_str_prefixed().unwrap_err(), Error::ShortRead);
        assert_eq!(packet.cursor(), 0);
    }

    #[test]
    fn test_set_memory_refuses_truncation() {
        let mut packet = Packet::from_str("hello world");

        assert_eq!(packet.set_memory(5).unwrap_err(), Error::WouldTruncate);
        assert_eq!(packet.used_size(), 11);

        packet.set_memory_truncate(5);
        assert_eq!(packet.used_size(), 5);
        assert_eq!(packet, "hello");
    }

    #[test]
    fn test_set_memory_grow_preserves_contents() {
        let mut packet = Packet::from_str("hello");
        packet.set_memory(1024).unwrap();

        assert_eq!(packet.memory_size(), 1024);
        assert_eq!(packet, "hello");
    }

    #[test]
    fn test_erase_shifts_and_clamps_cursor() {
        let mut packet = Packet::from_str("hello world");
        packet.set_cursor(8);

        packet.erase(0, 6);

        assert_eq!(packet, "world");
        assert_eq!(packet.cursor(), 2);

        let mut packet = Packet::from_str("hello world");
        packet.set_cursor(3);
        packet.erase(1, 8);

        assert_eq!(packet.cursor(), 1);
        assert_eq!(packet.used_size(), 3);
    }

    #[test]
    fn test_find() {
        let packet = Packet::from_str("a\r\nb\r\n");

        assert_eq!(packet.find(b"\r\n", 0), Some(1));
        assert_eq!(packet.find(b"\r\n", 2), Some(4));
        assert_eq!(packet.find(b"\r\n", 5), None);
        assert_eq!(packet.find(b"zz", 0), None);
    }

    #[test]
    fn test_load_reuses_allocation() {
        let mut packet = Packet::with_memory(64);
        packet.load(b"payload", 3, 1, 9, 500);

        assert_eq!(packet.memory_size(), 64);
        assert_eq!(packet, "payload");
        assert_eq!(packet.client_from(), 3);
        assert_eq!(packet.operation(), 1);
        assert_eq!(packet.instance(), 9);
        assert_eq!(packet.age(), 500);
    }

    #[test]
    #[should_panic(expected = "Cursor 6 exceeds used size 5")]
    fn test_cursor_contract() {
        let mut packet = Packet::from_str("hello");
        packet.set_cursor(6);
    }
}
