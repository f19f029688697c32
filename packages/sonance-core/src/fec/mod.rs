//! Forward error correction seams.
//!
//! The block codec itself is an external collaborator behind the
//! [`BlockEncoder`]/[`BlockDecoder`] traits; the toolkit ships a single-parity
//! XOR codec for loopback use. Repair symbols protect the full wire bytes of
//! the source packets (length-prefixed and zero-padded to the block's symbol
//! size), so a recovered symbol parses back into a complete RTP packet.

use std::collections::{HashMap, VecDeque};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::packet::{
    self, seqnum_diff, seqnum_lt, PacketFactory, PacketPtr, PacketReader, PacketWriter,
    ReadMode, Rtp, Seqnum, SharedQueue,
};
use crate::rtp;

/// FEC scheme identifiers carried at the endpoint layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FecScheme {
    /// Reed-Solomon, m=8.
    Rs8m,
    /// LDPC-Staircase.
    Ldpc,
}

/// Size of the repair payload-ID header preceding each repair symbol.
pub const REPAIR_HEADER_SIZE: usize = 8;

/// Produces repair symbols over a block of source symbols.
pub trait BlockEncoder: Send {
    /// Returns `repair_count` symbols of `symbol_size` bytes each.
    fn encode(
        &mut self,
        sources: &[Bytes],
        repair_count: usize,
        symbol_size: usize,
    ) -> Vec<Bytes>;
}

/// Reconstructs missing source symbols of a block.
pub trait BlockDecoder: Send {
    /// Fills in as many `None` source symbols as the scheme allows.
    /// Returns the number of recovered symbols.
    fn decode(
        &mut self,
        sources: &mut [Option<Bytes>],
        repairs: &[Option<Bytes>],
        symbol_size: usize,
    ) -> usize;
}

/// Single-parity XOR codec: one repair symbol per block, recovers exactly
/// one missing source symbol.
pub struct XorBlockCodec;

impl BlockEncoder for XorBlockCodec {
    fn encode(
        &mut self,
        sources: &[Bytes],
        _repair_count: usize,
        symbol_size: usize,
    ) -> Vec<Bytes> {
        let mut parity = vec![0u8; symbol_size];
        for source in sources {
            for (out, byte) in parity.iter_mut().zip(source.iter()) {
                *out ^= byte;
            }
        }
        vec![Bytes::from(parity)]
    }
}

impl BlockDecoder for XorBlockCodec {
    fn decode(
        &mut self,
        sources: &mut [Option<Bytes>],
        repairs: &[Option<Bytes>],
        symbol_size: usize,
    ) -> usize {
        let missing: Vec<usize> = sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect();
        if missing.len() != 1 {
            return 0;
        }
        let parity = match repairs.iter().flatten().next() {
            Some(parity) => parity,
            None => return 0,
        };

        let mut recovered = vec![0u8; symbol_size];
        recovered[..parity.len().min(symbol_size)]
            .copy_from_slice(&parity[..parity.len().min(symbol_size)]);
        for source in sources.iter().flatten() {
            for (out, byte) in recovered.iter_mut().zip(source.iter()) {
                *out ^= byte;
            }
        }

        sources[missing[0]] = Some(Bytes::from(recovered));
        1
    }
}

fn build_symbol(wire: &Bytes, symbol_size: usize) -> Bytes {
    let mut symbol = BytesMut::with_capacity(symbol_size);
    symbol.put_u16(wire.len() as u16);
    symbol.extend_from_slice(wire);
    symbol.resize(symbol_size, 0);
    symbol.freeze()
}

fn extract_symbol(symbol: &Bytes) -> Result<Bytes> {
    if symbol.len() < 2 {
        return Err(Error::BadPacket);
    }
    let len = u16::from_be_bytes([symbol[0], symbol[1]]) as usize;
    if 2 + len > symbol.len() {
        return Err(Error::BadPacket);
    }
    Ok(symbol.slice(2..2 + len))
}

struct RepairBlock {
    source_count: usize,
    repairs: Vec<Option<Bytes>>,
}

/// Merges the source stream with the repair stream and synthesizes lost
/// source packets when a block has enough symbols.
pub struct FecReader {
    source: Box<dyn PacketReader + Send>,
    repair: SharedQueue,
    decoder: Box<dyn BlockDecoder + Send>,
    factory: PacketFactory,

    pending: VecDeque<PacketPtr>,
    /// Wire bytes of recently served source packets, for block assembly.
    history: HashMap<Seqnum, Bytes>,
    history_order: VecDeque<Seqnum>,
    blocks: HashMap<Seqnum, RepairBlock>,
    next_seqnum: Option<Seqnum>,

    repaired_total: u64,
}

const MAX_HISTORY: usize = 256;
const MAX_BLOCKS: usize = 64;

impl FecReader {
    pub fn new(
        source: Box<dyn PacketReader + Send>,
        repair: SharedQueue,
        decoder: Box<dyn BlockDecoder + Send>,
        factory: PacketFactory,
    ) -> Self {
        Self {
            source,
            repair,
            decoder,
            factory,
            pending: VecDeque::new(),
            history: HashMap::new(),
            history_order: VecDeque::new(),
            blocks: HashMap::new(),
            next_seqnum: None,
            repaired_total: 0,
        }
    }

    /// Number of source packets synthesized from repair data.
    pub fn num_repaired(&self) -> u64 {
        self.repaired_total
    }

    fn ingest(&mut self) -> Result<()> {
        loop {
            match self.source.read_packet(ReadMode::Fetch) {
                Ok(packet) => self.pending.push_back(packet),
                Err(Error::Drain) => break,
                Err(err) => return Err(err),
            }
        }

        loop {
            let packet = match self.repair.lock().pop() {
                Some(packet) => packet,
                None => break,
            };
            self.ingest_repair(&packet);
        }

        Ok(())
    }

    fn ingest_repair(&mut self, packet: &PacketPtr) {
        let rtp = match packet.rtp() {
            Some(rtp) => rtp,
            None => return,
        };
        let payload = &rtp.payload;
        if payload.len() < REPAIR_HEADER_SIZE {
            log::debug!("[FecReader] dropping short repair packet");
            return;
        }

        let block_begin = u16::from_be_bytes([payload[0], payload[1]]);
        let source_count = payload[2] as usize;
        let repair_count = payload[3] as usize;
        let repair_index = payload[4] as usize;
        if source_count == 0 || repair_index >= repair_count {
            log::debug!("[FecReader] dropping malformed repair header");
            return;
        }

        let block = self.blocks.entry(block_begin).or_insert_with(|| RepairBlock {
            source_count,
            repairs: vec![None; repair_count],
        });
        if repair_index < block.repairs.len() {
            block.repairs[repair_index] = Some(payload.slice(REPAIR_HEADER_SIZE..));
        }

        if self.blocks.len() > MAX_BLOCKS {
            // forget the oldest block relative to the current position
            if let Some(next) = self.next_seqnum {
                if let Some(&oldest) = self
                    .blocks
                    .keys()
                    .min_by_key(|&&begin| seqnum_diff(begin, next))
                {
                    self.blocks.remove(&oldest);
                }
            }
        }
    }

    fn remember(&mut self, packet: &PacketPtr) {
        if let Some(rtp) = packet.rtp() {
            if self.history.insert(rtp.seqnum, packet.buffer().clone()).is_none() {
                self.history_order.push_back(rtp.seqnum);
            }
            while self.history_order.len() > MAX_HISTORY {
                if let Some(old) = self.history_order.pop_front() {
                    self.history.remove(&old);
                }
            }
        }
    }

    fn lookup_wire(&self, seqnum: Seqnum) -> Option<Bytes> {
        if let Some(bytes) = self.history.get(&seqnum) {
            return Some(bytes.clone());
        }
        self.pending
            .iter()
            .find(|p| p.rtp().map(|r| r.seqnum) == Some(seqnum))
            .map(|p| p.buffer().clone())
    }

    fn try_repair(&mut self, missing: Seqnum) -> Option<PacketPtr> {
        let (block_begin, source_count, symbol_size, repairs) = {
            let (&begin, block) = self.blocks.iter().find(|(&begin, block)| {
                let offset = seqnum_diff(missing, begin);
                offset >= 0 && (offset as usize) < block.source_count
            })?;
            let symbol_size = block.repairs.iter().flatten().next()?.len();
            (begin, block.source_count, symbol_size, block.repairs.clone())
        };

        let mut sources: Vec<Option<Bytes>> = (0..source_count)
            .map(|index| {
                let seqnum = block_begin.wrapping_add(index as u16);
                if seqnum == missing {
                    None
                } else {
                    self.lookup_wire(seqnum)
                        .map(|wire| build_symbol(&wire, symbol_size))
                }
            })
            .collect();

        if self.decoder.decode(&mut sources, &repairs, symbol_size) == 0 {
            return None;
        }

        let missing_index = seqnum_diff(missing, block_begin) as usize;
        let symbol = sources[missing_index].take()?;
        let wire = extract_symbol(&symbol).ok()?;

        let packet = self.factory.new_packet_from_bytes(wire).ok()?;
        let view = rtp::parse(packet.buffer()).ok()?;
        packet.set_rtp(view);
        packet.add_flags(packet::flags::AUDIO);

        self.repaired_total += 1;
        log::debug!("[FecReader] synthesized lost packet: seqnum={}", missing);

        Some(packet)
    }
}

impl PacketReader for FecReader {
    fn read_packet(&mut self, mode: ReadMode) -> Result<PacketPtr> {
        self.ingest()?;

        if let Some(expected) = self.next_seqnum {
            let head_seqnum = self.pending.front().and_then(|p| p.rtp()).map(|r| r.seqnum);
            let has_gap = match head_seqnum {
                Some(head) => seqnum_lt(expected, head),
                // with no source packet at all, a repair block may still
                // cover the expected seqnum
                None => true,
            };
            if has_gap {
                if let Some(packet) = self.try_repair(expected) {
                    self.pending.push_front(packet);
                }
            }
        }

        let packet = match mode {
            ReadMode::Peek => return self.pending.front().cloned().ok_or(Error::Drain),
            ReadMode::Fetch => self.pending.pop_front().ok_or(Error::Drain)?,
        };

        self.remember(&packet);
        if let Some(rtp) = packet.rtp() {
            self.next_seqnum = Some(rtp.seqnum.wrapping_add(1));
        }

        Ok(packet)
    }
}

/// Sender-side FEC stage: forwards source packets and emits repair packets
/// after every full block.
pub struct FecWriter {
    source_writer: Box<dyn PacketWriter>,
    repair_writer: Box<dyn PacketWriter>,
    encoder: Box<dyn BlockEncoder>,
    factory: PacketFactory,

    source_count: usize,
    repair_count: usize,
    repair_payload_type: u8,

    block: Vec<PacketPtr>,
    repair_seqnum: Seqnum,
    repair_timestamp: u32,
    source_id: u32,
}

impl FecWriter {
    pub fn new(
        source_writer: Box<dyn PacketWriter>,
        repair_writer: Box<dyn PacketWriter>,
        encoder: Box<dyn BlockEncoder>,
        factory: PacketFactory,
        source_count: usize,
        repair_count: usize,
        repair_payload_type: u8,
    ) -> Result<Self> {
        if source_count == 0 || source_count > u8::MAX as usize || repair_count == 0 {
            return Err(Error::BadArgument);
        }
        Ok(Self {
            source_writer,
            repair_writer,
            encoder,
            factory,
            source_count,
            repair_count,
            repair_payload_type,
            block: Vec::with_capacity(source_count),
            repair_seqnum: rand::random(),
            repair_timestamp: rand::random(),
            source_id: rand::random(),
        })
    }

    fn emit_repairs(&mut self) -> Result<()> {
        let block = std::mem::take(&mut self.block);

        let block_begin = match block.first().and_then(|p| p.rtp()) {
            Some(rtp) => rtp.seqnum,
            None => return Ok(()),
        };

        let max_len = block.iter().map(|p| p.buffer().len()).max().unwrap_or(0);
        let symbol_size = 2 + max_len;

        let symbols: Vec<Bytes> = block
            .iter()
            .map(|p| build_symbol(p.buffer(), symbol_size))
            .collect();
        let repairs = self.encoder.encode(&symbols, self.repair_count, symbol_size);

        for (index, repair) in repairs.iter().enumerate().take(self.repair_count) {
            let mut buffer = self.factory.new_buffer()?;
            rtp::compose_header(
                &mut buffer,
                self.source_id,
                self.repair_seqnum,
                self.repair_timestamp,
                self.repair_payload_type,
                false,
            );
            buffer.put_u16(block_begin);
            buffer.put_u8(self.source_count as u8);
            buffer.put_u8(self.repair_count as u8);
            buffer.put_u8(index as u8);
            buffer.put_bytes(0, 3);
            buffer.extend_from_slice(repair);

            let packet = self.factory.new_packet(buffer)?;
            let view = Rtp::new(
                self.source_id,
                self.repair_seqnum,
                self.repair_timestamp,
                self.repair_payload_type,
                false,
                packet.buffer().slice(rtp::HEADER_SIZE..),
            );
            packet.set_rtp(view);
            packet.add_flags(packet::flags::REPAIR);

            self.repair_seqnum = self.repair_seqnum.wrapping_add(1);

            self.repair_writer.write_packet(packet)?;
        }

        Ok(())
    }
}

impl PacketWriter for FecWriter {
    fn write_packet(&mut self, packet: PacketPtr) -> Result<()> {
        self.block.push(packet.clone());
        self.source_writer.write_packet(packet)?;

        if self.block.len() == self.source_count {
            self.emit_repairs()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::SortedQueue;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn xor_recovers_single_missing_symbol() {
        let symbols = vec![
            Bytes::from_static(b"hello world!"),
            Bytes::from_static(b"foo bar baz!"),
            Bytes::from_static(b"quux zot 123"),
        ];
        let mut codec = XorBlockCodec;
        let repairs = codec.encode(&symbols, 1, 12);

        let mut holey: Vec<Option<Bytes>> = symbols.iter().cloned().map(Some).collect();
        holey[1] = None;
        let repair_refs: Vec<Option<Bytes>> = repairs.into_iter().map(Some).collect();
        assert_eq!(codec.decode(&mut holey, &repair_refs, 12), 1);
        assert_eq!(holey[1].as_ref().unwrap(), &symbols[1]);
    }

    #[test]
    fn xor_gives_up_on_two_missing() {
        let symbols = vec![Bytes::from_static(b"aa"), Bytes::from_static(b"bb")];
        let mut codec = XorBlockCodec;
        let repairs: Vec<Option<Bytes>> =
            codec.encode(&symbols, 1, 2).into_iter().map(Some).collect();
        let mut holey: Vec<Option<Bytes>> = vec![None, None];
        assert_eq!(codec.decode(&mut holey, &repairs, 2), 0);
    }

    #[test]
    fn symbol_round_trip_strips_padding() {
        let wire = Bytes::from_static(b"\x80\x0a1234");
        let symbol = build_symbol(&wire, 32);
        assert_eq!(symbol.len(), 32);
        assert_eq!(extract_symbol(&symbol).unwrap(), wire);
    }

    fn wire_packet(factory: &PacketFactory, seqnum: u16, ts: u32, body: &[u8]) -> PacketPtr {
        let mut buffer = factory.new_buffer().unwrap();
        rtp::compose_header(&mut buffer, 42, seqnum, ts, 10, false);
        buffer.extend_from_slice(body);
        let packet = factory.new_packet(buffer).unwrap();
        let view = rtp::parse(packet.buffer()).unwrap();
        packet.set_rtp(view);
        packet.add_flags(packet::flags::AUDIO);
        packet
    }

    #[test]
    fn writer_emits_repair_after_full_block() {
        let factory = PacketFactory::new(512, 64);
        let sources = Arc::new(Mutex::new(SortedQueue::new()));
        let repairs = Arc::new(Mutex::new(SortedQueue::new()));

        let mut writer = FecWriter::new(
            Box::new(crate::packet::QueueWriter::new(sources.clone())),
            Box::new(crate::packet::QueueWriter::new(repairs.clone())),
            Box::new(XorBlockCodec),
            factory.clone(),
            3,
            1,
            20,
        )
        .unwrap();

        for seqnum in 0..3u16 {
            writer
                .write_packet(wire_packet(&factory, seqnum, seqnum as u32 * 100, b"abcd"))
                .unwrap();
        }

        assert_eq!(sources.lock().len(), 3);
        assert_eq!(repairs.lock().len(), 1);
        let repair = repairs.lock().pop().unwrap();
        assert!(repair.has_flags(packet::flags::REPAIR));
        assert_eq!(repair.rtp().unwrap().payload_type, 20);
    }

    #[test]
    fn reader_synthesizes_lost_packet() {
        let factory = PacketFactory::new(512, 64);

        // build a 3-packet block plus its parity packet
        let p0 = wire_packet(&factory, 100, 0, b"aaaa");
        let p1 = wire_packet(&factory, 101, 100, b"bbbb");
        let p2 = wire_packet(&factory, 102, 200, b"cccc");

        let max_len = [&p0, &p1, &p2]
            .iter()
            .map(|p| p.buffer().len())
            .max()
            .unwrap();
        let symbol_size = 2 + max_len;
        let symbols: Vec<Bytes> = [&p0, &p1, &p2]
            .iter()
            .map(|p| build_symbol(p.buffer(), symbol_size))
            .collect();
        let parity = XorBlockCodec.encode(&symbols, 1, symbol_size).remove(0);

        let mut repair_wire = factory.new_buffer().unwrap();
        rtp::compose_header(&mut repair_wire, 42, 7, 0, 20, false);
        repair_wire.put_u16(100); // block begin
        repair_wire.put_u8(3); // source count
        repair_wire.put_u8(1); // repair count
        repair_wire.put_u8(0); // repair index
        repair_wire.put_bytes(0, 3);
        repair_wire.extend_from_slice(&parity);
        let repair_packet = factory.new_packet(repair_wire).unwrap();
        let view = rtp::parse(repair_packet.buffer()).unwrap();
        repair_packet.set_rtp(view);
        repair_packet.add_flags(packet::flags::REPAIR);

        // source stream misses the middle packet
        let mut source_queue = SortedQueue::new();
        source_queue.push(p0);
        source_queue.push(p2);

        let repair_queue: SharedQueue = Arc::new(Mutex::new(SortedQueue::new()));
        repair_queue.lock().push(repair_packet);

        let mut reader = FecReader::new(
            Box::new(source_queue),
            repair_queue,
            Box::new(XorBlockCodec),
            factory,
        );

        let first = reader.read_packet(ReadMode::Fetch).unwrap();
        assert_eq!(first.rtp().unwrap().seqnum, 100);

        let second = reader.read_packet(ReadMode::Fetch).unwrap();
        assert_eq!(second.rtp().unwrap().seqnum, 101, "lost packet repaired");
        assert_eq!(&second.rtp().unwrap().payload[..], b"bbbb");
        assert_eq!(reader.num_repaired(), 1);

        let third = reader.read_packet(ReadMode::Fetch).unwrap();
        assert_eq!(third.rtp().unwrap().seqnum, 102);
    }
}
