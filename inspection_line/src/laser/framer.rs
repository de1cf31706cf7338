/*!
Sync-delimited packet extraction for the laser MDI stream.

The stream carries no length prefix that can be trusted on its own, so
packets are cut between consecutive `LEUZ` markers. The declared size at
offset 5 trims a candidate when it is within bounds, which drops trailing
garbage between packets.
*/

use bytes::{Buf, Bytes, BytesMut};
use shared::mdi::declared_size;
use shared::protocol::{MDI_MAX_PACKET, MDI_MIN_PACKET, MDI_SYNC};
use tracing::debug;

/// Counters kept across the life of a framer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Candidate packets handed to the parser
    pub packets: u64,
    /// Candidates shorter than a header plus CRC
    pub short_dropped: u64,
    /// Bytes thrown away outside any packet
    pub bytes_discarded: u64,
}

/// Byte stash that turns a TCP byte stream into MDI packet candidates
pub struct MdiFramer {
    stash: BytesMut,
    stats: FramerStats,
}

fn find_sync(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(MDI_SYNC.len())
        .position(|w| w == MDI_SYNC)
        .map(|i| from + i)
}

fn trusted_size(candidate: &[u8]) -> Option<usize> {
    declared_size(candidate).filter(|&size| (MDI_MIN_PACKET..=MDI_MAX_PACKET).contains(&size))
}

impl MdiFramer {
    /// Create a framer with an empty stash
    pub fn new() -> Self {
        Self {
            stash: BytesMut::with_capacity(64 * 1024),
            stats: FramerStats::default(),
        }
    }

    /// Append received bytes and return every complete packet
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.stash.extend_from_slice(data);
        self.extract()
    }

    /// Statistics so far
    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Bytes waiting for the rest of a packet
    pub fn pending(&self) -> usize {
        self.stash.len()
    }

    fn extract(&mut self) -> Vec<Bytes> {
        let buf = &self.stash[..];
        let len = buf.len();
        let mut packets = Vec::new();
        let mut p = 0;

        let consumed = loop {
            let Some(s0) = find_sync(buf, p) else {
                // Keep a tail that may hold the start of a split marker
                let keep = (len - p).min(MDI_SYNC.len() - 1);
                self.stats.bytes_discarded += (len - p - keep) as u64;
                break len - keep;
            };
            self.stats.bytes_discarded += (s0 - p) as u64;

            let Some(s1) = find_sync(buf, s0 + MDI_SYNC.len()) else {
                // Last packet in the stash: emit once its declared size is complete
                match trusted_size(&buf[s0..]) {
                    Some(size) if len - s0 >= size => {
                        packets.push(Bytes::copy_from_slice(&buf[s0..s0 + size]));
                        p = s0 + size;
                        continue;
                    }
                    _ => break s0,
                }
            };

            let candidate = s1 - s0;
            if candidate < MDI_MIN_PACKET {
                debug!("dropping {} byte candidate between markers", candidate);
                self.stats.short_dropped += 1;
                self.stats.bytes_discarded += candidate as u64;
                p = s1;
                continue;
            }

            let take = trusted_size(&buf[s0..s1])
                .filter(|&size| size <= candidate)
                .unwrap_or(candidate);
            self.stats.bytes_discarded += (candidate - take) as u64;
            packets.push(Bytes::copy_from_slice(&buf[s0..s0 + take]));
            p = s1;
        };

        self.stats.packets += packets.len() as u64;
        self.stash.advance(consumed);
        packets
    }
}

impl Default for MdiFramer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{MdiFrame, MdiHeader};

    fn packet(no: u16, distances: &[u16]) -> Vec<u8> {
        let header = MdiHeader {
            packet_type: 0,
            packet_size: 0,
            packet_no: no,
            total_no: 1,
            sub_no: 1,
            scan_freq_hz: 40,
            scan_spots: 0,
            first_angle_mdeg: 0,
            delta_angle_mdeg: 100,
            timestamp_ms: no,
        };
        MdiFrame::encode(&header, distances, &[])
    }

    #[test]
    fn test_two_back_to_back_packets() {
        let mut stream = packet(1, &[1000, 1001]);
        stream.extend(packet(2, &[2000, 2001]));

        let mut framer = MdiFramer::new();
        let packets = framer.push(&stream);
        assert_eq!(packets.len(), 2);

        let first = MdiFrame::parse(&packets[0]).unwrap();
        let second = MdiFrame::parse(&packets[1]).unwrap();
        assert_eq!(first.header.packet_no, 1);
        assert_eq!(first.header.scan_spots, 2);
        assert_eq!(first.distances, vec![1000, 1001]);
        assert_eq!(second.header.packet_no, 2);
        assert_eq!(second.distances, vec![2000, 2001]);
        assert_eq!(framer.pending(), 0);
        assert_eq!(framer.stats().packets, 2);
    }

    #[test]
    fn test_byte_by_byte_feed() {
        let mut stream = packet(1, &[10, 20, 30]);
        stream.extend(packet(2, &[40, 50, 60]));

        let mut framer = MdiFramer::new();
        let mut packets = Vec::new();
        for b in &stream {
            packets.extend(framer.push(std::slice::from_ref(b)));
        }
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0][..], &stream[..packets[0].len()]);
    }

    #[test]
    fn test_garbage_and_short_candidates() {
        let mut stream = vec![0xAA, 0xBB, 0xCC];
        stream.extend_from_slice(&MDI_SYNC);
        stream.extend_from_slice(&[0u8; 10]);
        stream.extend(packet(5, &[700, 710]));

        let mut framer = MdiFramer::new();
        let packets = framer.push(&stream);
        assert_eq!(packets.len(), 1);
        assert_eq!(MdiFrame::parse(&packets[0]).unwrap().header.packet_no, 5);

        let stats = framer.stats();
        assert_eq!(stats.short_dropped, 1);
        assert_eq!(stats.bytes_discarded, 3 + 14);
    }

    #[test]
    fn test_declared_size_trims_trailing_bytes() {
        let first = packet(1, &[100, 200]);
        let mut stream = first.clone();
        stream.extend_from_slice(&[0xEE; 5]);
        stream.extend(packet(2, &[300, 400]));

        let mut framer = MdiFramer::new();
        let packets = framer.push(&stream);
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0][..], &first[..]);
        assert_eq!(framer.stats().bytes_discarded, 5);
    }

    #[test]
    fn test_marker_split_across_reads() {
        let whole = packet(9, &[1, 2]);
        let mut framer = MdiFramer::new();

        let mut head = vec![0x11; 20];
        head.extend_from_slice(&whole[..2]);
        assert!(framer.push(&head).is_empty());
        assert_eq!(framer.pending(), 3);

        let packets = framer.push(&whole[2..]);
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][..], &whole[..]);
    }

    #[test]
    fn test_incomplete_packet_waits() {
        let whole = packet(3, &[5, 6, 7, 8]);
        let mut framer = MdiFramer::new();
        assert!(framer.push(&whole[..whole.len() - 1]).is_empty());
        assert_eq!(framer.pending(), whole.len() - 1);
        assert_eq!(framer.push(&whole[whole.len() - 1..]).len(), 1);
    }
}
