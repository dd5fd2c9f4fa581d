//! TCP framing strategies. All three share the partial-packet machinery: received chunks are
//! appended to a rolling buffer, complete packets are sliced out through the recycler, and the
//! consumed prefix is erased in one bulk shift per `deal_with_data` round.

use crate::error::{Error, NetResult};
use crate::memory::BoundedPacketRecycler;
use crate::mode::{PacketStore, RecvCallback, TcpMode, TcpModeId};
use crate::packet::Packet;
use crate::{ClientId, InstanceId};
use std::sync::{Mutex, MutexGuard};

/// Default postfix for delimiter framing.
pub const DEFAULT_POSTFIX: &[u8] = b"\r\n";

/// Length prefix width on the wire.
const PREFIX_SIZE: usize = 4;

struct TcpModeCore {
    partial: Mutex<Packet>,
    partial_limit: usize,
    auto_resize: bool,
    recycler: BoundedPacketRecycler,
    store: PacketStore,
}

impl TcpModeCore {
    fn new(partial_size: usize, auto_resize: bool, recycler: BoundedPacketRecycler) -> TcpModeCore {
        TcpModeCore {
            partial: Mutex::new(Packet::with_memory(partial_size)),
            partial_limit: partial_size,
            auto_resize,
            recycler,
            store: PacketStore::new(),
        }
    }

    fn lock_partial(&self) -> MutexGuard<Packet> {
        self.partial.lock().expect("Partial packet poisoned")
    }

    /// Appends the chunk, growing the partial buffer when auto-resize allows it. On overflow the
    /// partial buffer is left untouched and `overflow_error` is reported.
    fn append_chunk(&self, partial: &mut Packet, data: &[u8], overflow_error: Error) -> NetResult<()> {
        let new_size = partial.used_size() + data.len();

        if new_size > partial.memory_size() {
            if !self.auto_resize {
                return Err(overflow_error);
            }
            partial.set_memory(new_size)?;
        }

        partial.add_bytes(data);
        Ok(())
    }

    /// Hands a completed packet to the callback or the store.
    fn dispatch(&self, packet: Packet, recv_fn: Option<&RecvCallback>) {
        match recv_fn {
            Some(recv_fn) => {
                recv_fn(&packet);
                self.recycler.recycle(packet);
            }
            None => self.store.push(packet),
        }
    }

    /// Slices `[from, to)` of the partial buffer out into a recycled shell.
    fn extract(
        &self,
        partial: &Packet,
        from: usize,
        to: usize,
        client_id: ClientId,
        instance_id: InstanceId,
    ) -> NetResult<Packet> {
        let mut shell = self.recycler.get(to - from)?;
        shell.load(&partial.as_slice()[from..to], client_id, 0, instance_id, 0);
        Ok(shell)
    }

    fn pull(&self, destination: &mut Packet) -> usize {
        match self.store.pull() {
            Some(shell) => {
                destination.load(
                    shell.as_slice(),
                    shell.client_from(),
                    shell.operation(),
                    shell.instance(),
                    shell.age(),
                );
                self.recycler.recycle(shell);
                1
            }
            None => 0,
        }
    }

    fn reset(&self) {
        for shell in self.store.drain() {
            self.recycler.recycle(shell);
        }

        let mut partial = self.lock_partial();
        partial.clear();
        partial.set_memory_truncate(self.partial_limit);
    }
}

/// Length-prefix framing: `[u32 length][payload]`.
pub struct TcpPrefixMode {
    core: TcpModeCore,
}

impl TcpPrefixMode {
    pub fn new(partial_size: usize, auto_resize: bool, recycler: BoundedPacketRecycler) -> TcpPrefixMode {
        TcpPrefixMode {
            core: TcpModeCore::new(partial_size, auto_resize, recycler),
        }
    }
}

impl TcpMode for TcpPrefixMode {
    fn deal_with_data(
        &self,
        data: &[u8],
        recv_fn: Option<&RecvCallback>,
        client_id: ClientId,
        instance_id: InstanceId,
    ) -> NetResult<()> {
        let mut partial = self.core.lock_partial();

        self.core
            .append_chunk(&mut partial, data, Error::TcpReceiveBufferTooSmall)?;

        let mut result = Ok(());

        loop {
            let packet_start = partial.cursor();

            let length = match partial.get_u32() {
                Ok(length) => length as usize,
                Err(_) => break,
            };

            if partial.remaining() < length {
                partial.set_cursor(packet_start);
                break;
            }

            let payload_start = partial.cursor();
            let shell = match self
                .core
                .extract(&partial, payload_start, payload_start + length, client_id, instance_id)
            {
                Ok(shell) => shell,
                Err(err) => {
                    // Leave the failed packet in the partial buffer; only the packets already
                    // dispatched this round are erased below.
                    partial.set_cursor(packet_start);
                    result = Err(err);
                    break;
                }
            };

            partial.set_cursor(payload_start + length);
            self.core.dispatch(shell, recv_fn);
        }

        let consumed = partial.cursor();
        partial.erase(0, consumed);

        result
    }

    fn get_send_object(&self, packet: &Packet) -> NetResult<Packet> {
        if packet.used_size() > u32::max_value() as usize {
            return Err(Error::IntegerOverflow);
        }

        let mut composite = Packet::with_memory(PREFIX_SIZE + packet.used_size());
        composite.add_u32(packet.used_size() as u32);
        composite.add_bytes(packet.as_slice());
        Ok(composite)
    }

    fn reset(&self) {
        self.core.reset();
    }

    fn packet_amount(&self) -> usize {
        self.core.store.len()
    }

    fn get_packet(&self, destination: &mut Packet) -> usize {
        self.core.pull(destination)
    }

    /// Fraction of the announced payload already buffered; 0 until the prefix is complete.
    fn partial_percentage(&self) -> NetResult<f64> {
        let mut partial = self.core.lock_partial();
        let mark = partial.cursor();

        let received = match partial.get_u32() {
            Ok(length) if length > 0 => partial.remaining() as f64 / f64::from(length),
            Ok(_) => 1.0,
            Err(_) => 0.0,
        };

        partial.set_cursor(mark);
        Ok(received.min(1.0))
    }

    fn partial_used(&self) -> usize {
        self.core.lock_partial().used_size()
    }

    fn memory_size(&self) -> usize {
        self.core.recycler.memory_size()
    }

    fn memory_limit(&self) -> usize {
        self.core.recycler.memory_limit()
    }

    fn mode_id(&self) -> TcpModeId {
        TcpModeId::Prefix
    }
}

/// Delimiter framing: `[payload][postfix]`; the postfix never reaches the application.
pub struct TcpPostfixMode {
    core: TcpModeCore,
    postfix: Vec<u8>,
}

impl TcpPostfixMode {
    pub fn new(
        partial_size: usize,
        auto_resize: bool,
        postfix: Vec<u8>,
        recycler: BoundedPacketRecycler,
    ) -> TcpPostfixMode {
        assert!(!postfix.is_empty(), "Postfix must be a non-empty byte sequence");

        TcpPostfixMode {
            core: TcpModeCore::new(partial_size, auto_resize, recycler),
            postfix,
        }
    }

    pub fn postfix(&self) -> &[u8] {
        &self.postfix
    }
}

impl TcpMode for TcpPostfixMode {
    fn deal_with_data(
        &self,
        data: &[u8],
        recv_fn: Option<&RecvCallback>,
        client_id: ClientId,
        instance_id: InstanceId,
    ) -> NetResult<()> {
        let mut partial = self.core.lock_partial();

        self.core
            .append_chunk(&mut partial, data, Error::TcpPostfixNotFound)?;

        let mut result = Ok(());

        while let Some(hit) = partial.find(&self.postfix, partial.cursor()) {
            let packet_start = partial.cursor();

            let shell = match self.core.extract(&partial, packet_start, hit, client_id, instance_id) {
                Ok(shell) => shell,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };

            partial.set_cursor(hit + self.postfix.len());
            self.core.dispatch(shell, recv_fn);
        }

        let consumed = partial.cursor();
        partial.erase(0, consumed);

        result
    }

    fn get_send_object(&self, packet: &Packet) -> NetResult<Packet> {
        let mut composite = Packet::with_memory(packet.used_size() + self.postfix.len());
        composite.add_bytes(packet.as_slice());
        composite.add_bytes(&self.postfix);
        Ok(composite)
    }

    fn reset(&self) {
        self.core.reset();
    }

    fn packet_amount(&self) -> usize {
        self.core.store.len()
    }

    fn get_packet(&self, destination: &mut Packet) -> usize {
        self.core.pull(destination)
    }

    /// Undefined for delimiter framing: the packet end is unknown until the postfix arrives.
    fn partial_percentage(&self) -> NetResult<f64> {
        Err(Error::NotMeaningful)
    }

    fn partial_used(&self) -> usize {
        self.core.lock_partial().used_size()
    }

    fn memory_size(&self) -> usize {
        self.core.recycler.memory_size()
    }

    fn memory_limit(&self) -> usize {
        self.core.recycler.memory_limit()
    }

    fn mode_id(&self) -> TcpModeId {
        TcpModeId::Postfix
    }
}

/// No framing: every received chunk is delivered as one packet.
pub struct TcpRawMode {
    core: TcpModeCore,
}

impl TcpRawMode {
    pub fn new(recycler: BoundedPacketRecycler) -> TcpRawMode {
        TcpRawMode {
            core: TcpModeCore::new(0, true, recycler),
        }
    }
}

impl TcpMode for TcpRawMode {
    fn deal_with_data(
        &self,
        data: &[u8],
        recv_fn: Option<&RecvCallback>,
        client_id: ClientId,
        instance_id: InstanceId,
    ) -> NetResult<()> {
        let mut shell = self.core.recycler.get(data.len())?;
        shell.load(data, client_id, 0, instance_id, 0);
        self.core.dispatch(shell, recv_fn);
        Ok(())
    }

    fn get_send_object(&self, packet: &Packet) -> NetResult<Packet> {
        let mut composite = Packet::with_memory(packet.used_size());
        composite.add_bytes(packet.as_slice());
        Ok(composite)
    }

    fn reset(&self) {
        self.core.reset();
    }

    fn packet_amount(&self) -> usize {
        self.core.store.len()
    }

    fn get_packet(&self, destination: &mut Packet) -> usize {
        self.core.pull(destination)
    }

    fn partial_percentage(&self) -> NetResult<f64> {
        Err(Error::NotMeaningful)
    }

    fn partial_used(&self) -> usize {
        0
    }

    fn memory_size(&self) -> usize {
        self.core.recycler.memory_size()
    }

    fn memory_limit(&self) -> usize {
        self.core.recycler.memory_limit()
    }

    fn mode_id(&self) -> TcpModeId {
        TcpModeId::Raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::NO_LIMIT;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn recycler() -> BoundedPacketRecycler {
        BoundedPacketRecycler::new(8, 1024, NO_LIMIT)
    }

    fn bounded_recycler(limit: usize) -> BoundedPacketRecycler {
        BoundedPacketRecycler::new(8, 1024, limit)
    }

    #[test]
    fn test_prefix_framing_over_chunked_stream() {
        let mode = TcpPrefixMode::new(1024, false, recycler());

        let buf1 = [0x0b, 0, 0, 0, b'h', b'e', b'l', b'l', b'o', b' ', b'w', b'o'];
        let buf2 = [b'r', b'l', b'd'];

        mode.deal_with_data(&buf1, None, 0, 1).unwrap();
        assert_eq!(mode.packet_amount(), 0);

        mode.deal_with_data(&buf2, None, 0, 1).unwrap();
        assert_eq!(mode.packet_amount(), 1);

        let mut received = Packet::new();
        assert_eq!(mode.get_packet(&mut received), 1);
        assert_eq!(received, "hello world");
        assert_eq!(received.instance(), 1);

        assert_eq!(mode.partial_used(), 0);
    }

    #[test]
    fn test_prefix_framing_fused_packets() {
        let mode = TcpPrefixMode::new(1024, false, recycler());

        let mut stream = Packet::new();
        for text in &["one", "two", "three"] {
            stream.add_u32(text.len() as u32);
            stream.add_str(text);
        }

        mode.deal_with_data(stream.as_slice(), None, 0, 0).unwrap();
        assert_eq!(mode.packet_amount(), 3);

        let mut received = Packet::new();
        for expected in &["one", "two", "three"] {
            assert_eq!(mode.get_packet(&mut received), 1);
            assert_eq!(received, *expected);
        }
    }

    #[test]
    fn test_prefix_framing_random_chunking() {
        let mut rng = rand::thread_rng();

        let packets: Vec<String> = (0..32)
            .map(|i| "x".repeat(rng.gen_range(0..200)) + &i.to_string())
            .collect();

        let mut stream = Packet::new();
        for text in &packets {
            stream.add_u32(text.len() as u32);
            stream.add_str(text);
        }

        let mode = TcpPrefixMode::new(4096, true, recycler());

        let bytes = stream.as_slice();
        let mut offset = 0;
        while offset < bytes.len() {
            let chunk = rng.gen_range(1..=64).min(bytes.len() - offset);
            mode.deal_with_data(&bytes[offset..offset + chunk], None, 0, 0).unwrap();
            offset += chunk;
        }

        let mut received = Packet::new();
        for expected in &packets {
            assert_eq!(mode.get_packet(&mut received), 1, "missing packet {}", expected);
            assert_eq!(received, expected.as_str());
        }
        assert_eq!(mode.partial_used(), 0);
    }

    #[test]
    fn test_prefix_send_object() {
        let mode = TcpPrefixMode::new(1024, false, recycler());

        let composite = mode.get_send_object(&Packet::from_str("hello world")).unwrap();

        assert_eq!(&composite.as_slice()[..4], &[0x0b, 0, 0, 0]);
        assert_eq!(&composite.as_slice()[4..], b"hello world");
    }

    #[test]
    fn test_prefix_overflow_without_resize() {
        let mode = TcpPrefixMode::new(8, false, recycler());

        let result = mode.deal_with_data(b"way too large for the partial", None, 0, 0);

        assert_eq!(result.unwrap_err(), Error::TcpReceiveBufferTooSmall);
        assert_eq!(mode.partial_used(), 0);
        assert_eq!(mode.packet_amount(), 0);
    }

    #[test]
    fn test_prefix_overflow_with_resize() {
        let mode = TcpPrefixMode::new(8, true, recycler());

        let mut stream = Packet::new();
        stream.add_u32(20);
        stream.add_str("exactly twenty chars");

        mode.deal_with_data(stream.as_slice(), None, 0, 0).unwrap();

        let mut received = Packet::new();
        assert_eq!(mode.get_packet(&mut received), 1);
        assert_eq!(received, "exactly twenty chars");
    }

    #[test]
    fn test_prefix_receive_memory_limit() {
        let mode = TcpPrefixMode::new(1024, false, bounded_recycler(16));

        let mut stream = Packet::new();
        stream.add_u32(12);
        stream.add_str("first packet");
        stream.add_u32(13);
        stream.add_str("second packet");

        let result = mode.deal_with_data(stream.as_slice(), None, 0, 0);

        // The first packet fits the ceiling, the second does not and stays in the partial
        // buffer with the accountant untouched by the failed add.
        assert_eq!(result.unwrap_err(), Error::MemoryLimitExceeded);
        assert_eq!(mode.packet_amount(), 1);
        assert_eq!(mode.memory_size(), 12);
        assert_eq!(mode.partial_used(), 4 + 13);
    }

    #[test]
    fn test_prefix_recv_callback_bypasses_store() {
        let mode = TcpPrefixMode::new(1024, false, recycler());
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let recv_fn: RecvCallback = Arc::new(move |packet: &Packet| {
            assert_eq!(*packet, "hello world");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut stream = Packet::new();
        stream.add_u32(11);
        stream.add_str("hello world");

        mode.deal_with_data(stream.as_slice(), Some(&recv_fn), 0, 0).unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(mode.packet_amount(), 0);
        assert_eq!(mode.memory_size(), 0);
    }

    #[test]
    fn test_postfix_framing_fused_packets() {
        let mode = TcpPostfixMode::new(1024, false, DEFAULT_POSTFIX.to_vec(), recycler());

        mode.deal_with_data(b"a\r\nb\r\n\r\n", None, 0, 0).unwrap();

        assert_eq!(mode.packet_amount(), 3);

        let mut received = Packet::new();
        assert_eq!(mode.get_packet(&mut received), 1);
        assert_eq!(received, "a");
        assert_eq!(mode.get_packet(&mut received), 1);
        assert_eq!(received, "b");
        assert_eq!(mode.get_packet(&mut received), 1);
        assert_eq!(received, "");
        assert_eq!(mode.get_packet(&mut received), 0);

        assert_eq!(mode.partial_used(), 0);
    }

    #[test]
    fn test_postfix_split_across_chunks() {
        let mode = TcpPostfixMode::new(1024, false, DEFAULT_POSTFIX.to_vec(), recycler());

        mode.deal_with_data(b"hello world\r", None, 0, 0).unwrap();
        assert_eq!(mode.packet_amount(), 0);

        mode.deal_with_data(b"\n", None, 0, 0).unwrap();
        assert_eq!(mode.packet_amount(), 1);

        let mut received = Packet::new();
        mode.get_packet(&mut received);
        assert_eq!(received, "hello world");
    }

    #[test]
    fn test_postfix_send_object_appends_delimiter() {
        let mode = TcpPostfixMode::new(1024, false, b"||".to_vec(), recycler());

        let composite = mode.get_send_object(&Packet::from_str("payload")).unwrap();
        assert_eq!(composite.as_slice(), b"payload||");
    }

    #[test]
    fn test_postfix_overflow_reports_postfix_not_found() {
        let mode = TcpPostfixMode::new(8, false, DEFAULT_POSTFIX.to_vec(), recycler());

        let result = mode.deal_with_data(b"no delimiter here", None, 0, 0);
        assert_eq!(result.unwrap_err(), Error::TcpPostfixNotFound);
    }

    #[test]
    fn test_postfix_percentage_is_not_meaningful() {
        let mode = TcpPostfixMode::new(1024, false, DEFAULT_POSTFIX.to_vec(), recycler());
        assert_eq!(mode.partial_percentage().unwrap_err(), Error::NotMeaningful);
    }

    #[test]
    fn test_raw_mode_chunk_per_packet() {
        let mode = TcpRawMode::new(recycler());

        mode.deal_with_data(b"first chunk", None, 0, 0).unwrap();
        mode.deal_with_data(b"second", None, 0, 0).unwrap();

        let mut received = Packet::new();
        assert_eq!(mode.get_packet(&mut received), 1);
        assert_eq!(received, "first chunk");
        assert_eq!(mode.get_packet(&mut received), 1);
        assert_eq!(received, "second");
    }

    #[test]
    fn test_raw_send_object_is_payload() {
        let mode = TcpRawMode::new(recycler());
        let composite = mode.get_send_object(&Packet::from_str("as is")).unwrap();
        assert_eq!(composite.as_slice(), b"as is");
    }

    #[test]
    fn test_reset_releases_everything() {
        let mode = TcpPrefixMode::new(1024, false, recycler());

        let mut stream = Packet::new();
        stream.add_u32(5);
        stream.add_str("hello");
        stream.add_u32(99);

        mode.deal_with_data(stream.as_slice(), None, 0, 0).unwrap();
        assert_eq!(mode.packet_amount(), 1);
        assert!(mode.partial_used() > 0);

        mode.reset();
        assert_eq!(mode.packet_amount(), 0);
        assert_eq!(mode.partial_used(), 0);
        assert_eq!(mode.memory_size(), 0);
    }
}
