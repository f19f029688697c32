//! Latency stage of the jitter buffer.

use std::collections::VecDeque;

use super::{stream_timestamp_diff, PacketPtr, PacketReader, ReadMode, StreamTimestamp};
use crate::error::{Error, Result};

/// Holds packets back until the buffered duration reaches a target latency,
/// then becomes transparent.
///
/// The delay gives out-of-order and repaired packets time to arrive before
/// the depacketizer starts consuming.
pub struct DelayedReader {
    inner: Box<dyn PacketReader + Send>,
    delay: StreamTimestamp,
    queue: VecDeque<PacketPtr>,
    started: bool,
}

impl DelayedReader {
    /// `delay` is a duration in stream timestamps (samples per channel).
    pub fn new(inner: Box<dyn PacketReader + Send>, delay: StreamTimestamp) -> Self {
        Self {
            inner,
            delay,
            queue: VecDeque::new(),
            started: false,
        }
    }

    fn buffered_span(&self) -> StreamTimestamp {
        let (first, last) = match (self.queue.front(), self.queue.back()) {
            (Some(first), Some(last)) => (first, last),
            _ => return 0,
        };
        match (first.rtp(), last.rtp()) {
            (Some(first_rtp), Some(last_rtp)) => {
                let span = stream_timestamp_diff(
                    last_rtp.end_timestamp(),
                    first_rtp.stream_timestamp,
                );
                span.max(0) as StreamTimestamp
            }
            _ => 0,
        }
    }

    fn fill(&mut self) -> Result<()> {
        loop {
            match self.inner.read_packet(ReadMode::Fetch) {
                Ok(packet) => self.queue.push_back(packet),
                Err(Error::Drain) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }
}

impl PacketReader for DelayedReader {
    fn read_packet(&mut self, mode: ReadMode) -> Result<PacketPtr> {
        if !self.started {
            self.fill()?;
            if self.buffered_span() < self.delay {
                return Err(Error::Drain);
            }
            log::debug!(
                "[Delay] accumulated initial latency: packets={} span={} target={}",
                self.queue.len(),
                self.buffered_span(),
                self.delay
            );
            self.started = true;
        }

        if let Some(front) = self.queue.front() {
            return match mode {
                ReadMode::Peek => Ok(front.clone()),
                ReadMode::Fetch => Ok(self.queue.pop_front().expect("non-empty")),
            };
        }

        self.inner.read_packet(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketFactory, Rtp, SortedQueue};
    use bytes::Bytes;

    fn packet(factory: &PacketFactory, seqnum: u16, ts: u32, duration: u32) -> PacketPtr {
        let packet = factory.new_packet_from_bytes(Bytes::new()).unwrap();
        let rtp = Rtp::new(1, seqnum, ts, 10, false, Bytes::new());
        rtp.set_duration(duration);
        packet.set_rtp(rtp);
        packet
    }

    fn queue_with(packets: Vec<PacketPtr>) -> Box<dyn PacketReader + Send> {
        let mut queue = SortedQueue::new();
        for p in packets {
            queue.push(p);
        }
        Box::new(queue)
    }

    #[test]
    fn holds_until_latency_accumulated() {
        let factory = PacketFactory::new(64, 16);
        let mut reader = DelayedReader::new(
            queue_with(vec![packet(&factory, 0, 0, 100)]),
            300,
        );
        assert!(matches!(
            reader.read_packet(ReadMode::Fetch),
            Err(Error::Drain)
        ));
    }

    #[test]
    fn serves_once_span_reached() {
        let factory = PacketFactory::new(64, 16);
        let mut reader = DelayedReader::new(
            queue_with(vec![
                packet(&factory, 0, 0, 100),
                packet(&factory, 1, 100, 100),
                packet(&factory, 2, 200, 100),
            ]),
            300,
        );
        for expected in 0u16..3 {
            let p = reader.read_packet(ReadMode::Fetch).unwrap();
            assert_eq!(p.rtp().unwrap().seqnum, expected);
        }
        assert!(matches!(
            reader.read_packet(ReadMode::Fetch),
            Err(Error::Drain)
        ));
    }

    #[test]
    fn zero_delay_is_transparent() {
        let factory = PacketFactory::new(64, 16);
        let mut reader = DelayedReader::new(queue_with(vec![packet(&factory, 5, 0, 10)]), 0);
        assert!(reader.read_packet(ReadMode::Fetch).is_ok());
    }
}
