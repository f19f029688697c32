//! Seqnum-sorted packet queue, the reorder stage of the jitter buffer.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{seqnum_diff, PacketPtr, PacketReader, ReadMode};
use crate::error::{Error, Result};

/// Keeps packets ordered by RTP sequence number.
///
/// Out-of-order arrivals are inserted at their sorted position; duplicates
/// are dropped. Ordering is wrap-aware, so a window straddling the 16-bit
/// seqnum wrap stays sorted.
pub struct SortedQueue {
    packets: VecDeque<PacketPtr>,
    dropped_duplicates: u64,
}

impl SortedQueue {
    pub fn new() -> Self {
        Self {
            packets: VecDeque::new(),
            dropped_duplicates: 0,
        }
    }

    /// Inserts a packet at its sorted position.
    ///
    /// Packets without an RTP view are appended at the back.
    pub fn push(&mut self, packet: PacketPtr) {
        let seqnum = match packet.rtp() {
            Some(rtp) => rtp.seqnum,
            None => {
                self.packets.push_back(packet);
                return;
            }
        };

        // search from the back: in-order arrival is the common case
        let mut index = self.packets.len();
        while index > 0 {
            if let Some(rtp) = self.packets[index - 1].rtp() {
                let diff = seqnum_diff(seqnum, rtp.seqnum);
                if diff == 0 {
                    self.dropped_duplicates += 1;
                    return;
                }
                if diff > 0 {
                    break;
                }
            }
            index -= 1;
        }
        self.packets.insert(index, packet);
    }

    pub fn pop(&mut self) -> Option<PacketPtr> {
        self.packets.pop_front()
    }

    pub fn front(&self) -> Option<&PacketPtr> {
        self.packets.front()
    }

    pub fn back(&self) -> Option<&PacketPtr> {
        self.packets.back()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Number of duplicate packets dropped so far.
    pub fn num_duplicates(&self) -> u64 {
        self.dropped_duplicates
    }
}

impl Default for SortedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketReader for SortedQueue {
    fn read_packet(&mut self, mode: ReadMode) -> Result<PacketPtr> {
        match mode {
            ReadMode::Fetch => self.pop().ok_or(Error::Drain),
            ReadMode::Peek => self.front().cloned().ok_or(Error::Drain),
        }
    }
}

/// Sorted queue shared between a routing side and a reading side.
pub type SharedQueue = Arc<Mutex<SortedQueue>>;

/// [`PacketReader`] adapter over a [`SharedQueue`].
pub struct QueueReader {
    queue: SharedQueue,
}

impl QueueReader {
    pub fn new(queue: SharedQueue) -> Self {
        Self { queue }
    }
}

impl PacketReader for QueueReader {
    fn read_packet(&mut self, mode: ReadMode) -> Result<PacketPtr> {
        self.queue.lock().read_packet(mode)
    }
}

/// [`PacketWriter`](super::PacketWriter) adapter over a [`SharedQueue`].
pub struct QueueWriter {
    queue: SharedQueue,
}

impl QueueWriter {
    pub fn new(queue: SharedQueue) -> Self {
        Self { queue }
    }
}

impl super::PacketWriter for QueueWriter {
    fn write_packet(&mut self, packet: PacketPtr) -> Result<()> {
        self.queue.lock().push(packet);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketFactory, Rtp, Seqnum};
    use bytes::Bytes;

    fn packet(factory: &PacketFactory, seqnum: Seqnum) -> PacketPtr {
        let packet = factory.new_packet_from_bytes(Bytes::new()).unwrap();
        packet.set_rtp(Rtp::new(1, seqnum, 0, 10, false, Bytes::new()));
        packet
    }

    #[test]
    fn orders_out_of_order_arrivals() {
        let factory = PacketFactory::new(64, 16);
        let mut queue = SortedQueue::new();
        for seqnum in [5u16, 3, 4, 6] {
            queue.push(packet(&factory, seqnum));
        }
        let order: Vec<Seqnum> = std::iter::from_fn(|| queue.pop())
            .map(|p| p.rtp().unwrap().seqnum)
            .collect();
        assert_eq!(order, vec![3, 4, 5, 6]);
    }

    #[test]
    fn drops_duplicates() {
        let factory = PacketFactory::new(64, 16);
        let mut queue = SortedQueue::new();
        queue.push(packet(&factory, 1));
        queue.push(packet(&factory, 1));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.num_duplicates(), 1);
    }

    #[test]
    fn orders_across_seqnum_wrap() {
        let factory = PacketFactory::new(64, 16);
        let mut queue = SortedQueue::new();
        for seqnum in [0u16, 0xFFFF, 1, 0xFFFE] {
            queue.push(packet(&factory, seqnum));
        }
        let order: Vec<Seqnum> = std::iter::from_fn(|| queue.pop())
            .map(|p| p.rtp().unwrap().seqnum)
            .collect();
        assert_eq!(order, vec![0xFFFE, 0xFFFF, 0, 1]);
    }

    #[test]
    fn peek_does_not_consume() {
        let factory = PacketFactory::new(64, 16);
        let mut queue = SortedQueue::new();
        queue.push(packet(&factory, 9));
        let peeked = queue.read_packet(ReadMode::Peek).unwrap();
        assert_eq!(peeked.rtp().unwrap().seqnum, 9);
        assert_eq!(queue.len(), 1);
        assert!(queue.read_packet(ReadMode::Fetch).is_ok());
        assert!(matches!(
            queue.read_packet(ReadMode::Fetch),
            Err(Error::Drain)
        ));
    }
}
