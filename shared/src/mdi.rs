/*!
Laser MDI packet parsing and encoding.

Every packet on the sensor's TCP stream is laid out big-endian as:

| Offset | Size | Field |
|---|---|---|
| 0 | 4 | sync marker `LEUZ` |
| 4 | 1 | packet type (0 = distance only, otherwise distance + intensity) |
| 5 | 2 | packet size (whole packet, CRC included) |
| 7 | 6 | reserved |
| 13 | 2 | packet number |
| 15 | 1 | total sub-packets |
| 16 | 1 | sub-packet number |
| 17 | 2 | scan frequency (Hz) |
| 19 | 2 | scan spot count |
| 21 | 4 | first angle (milli-degrees, signed) |
| 25 | 4 | angle delta (milli-degrees, signed) |
| 29 | 2 | timestamp (ms) |
| 31 | n | payload, 2 or 4 bytes per spot |
| end-2 | 2 | CRC16 |

A CRC mismatch is reported through [`MdiFrame::crc_valid`] and a warning log,
never as a parse failure.
*/

use crate::error::{Result, SharedError};
use crate::protocol::{MDI_CRC_POLY, MDI_CRC_SIZE, MDI_HEADER_SIZE, MDI_MIN_PACKET, MDI_SYNC};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Payload layout selected by the packet type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    /// Two bytes per spot
    DistanceOnly,
    /// Four bytes per spot, distance and intensity interleaved
    DistanceIntensity,
}

impl PacketType {
    /// Classify the raw packet type byte
    pub fn from_u8(value: u8) -> Self {
        if value == 0 {
            Self::DistanceOnly
        } else {
            Self::DistanceIntensity
        }
    }

    /// Payload bytes per scan spot
    pub fn bytes_per_spot(self) -> usize {
        match self {
            Self::DistanceOnly => 2,
            Self::DistanceIntensity => 4,
        }
    }
}

/// Decoded fixed-size MDI header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdiHeader {
    pub packet_type: u8,
    pub packet_size: u16,
    pub packet_no: u16,
    pub total_no: u8,
    pub sub_no: u8,
    pub scan_freq_hz: u16,
    pub scan_spots: u16,
    pub first_angle_mdeg: i32,
    pub delta_angle_mdeg: i32,
    pub timestamp_ms: u16,
}

impl MdiHeader {
    /// Payload layout of this packet
    pub fn kind(&self) -> PacketType {
        PacketType::from_u8(self.packet_type)
    }

    /// Angle in degrees at a fractional spot position
    pub fn angle_at(&self, spot: f64) -> f64 {
        (self.first_angle_mdeg as f64 + spot * self.delta_angle_mdeg as f64) / 1000.0
    }
}

/// One decoded scan packet. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct MdiFrame {
    pub header: MdiHeader,
    pub distances: Vec<u16>,
    /// Empty for distance-only packets
    pub intensities: Vec<u16>,
    /// Whether the trailing CRC matched the computed one
    pub crc_valid: bool,
}

impl MdiFrame {
    /// Parse one sync-delimited packet
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < MDI_MIN_PACKET {
            return Err(SharedError::PacketTooShort(packet.len()));
        }
        if packet[..4] != MDI_SYNC {
            return Err(SharedError::BadSync);
        }

        let packet_size = read_u16_be(packet, 5);
        let size = packet_size as usize;
        if size < MDI_MIN_PACKET || size > packet.len() {
            return Err(SharedError::InvalidPacketSize {
                declared: size,
                available: packet.len(),
            });
        }

        let header = MdiHeader {
            packet_type: packet[4],
            packet_size,
            packet_no: read_u16_be(packet, 13),
            total_no: packet[15],
            sub_no: packet[16],
            scan_freq_hz: read_u16_be(packet, 17),
            scan_spots: read_u16_be(packet, 19),
            first_angle_mdeg: read_i32_be(packet, 21),
            delta_angle_mdeg: read_i32_be(packet, 25),
            timestamp_ms: read_u16_be(packet, 29),
        };

        let message_len = size - MDI_HEADER_SIZE - MDI_CRC_SIZE;
        let spots = header.scan_spots as usize;
        let kind = header.kind();
        let needed = kind.bytes_per_spot() * spots;
        if message_len == 0 || message_len < needed {
            return Err(SharedError::PayloadTooShort {
                needed: needed.max(1),
                available: message_len,
            });
        }

        let payload = &packet[MDI_HEADER_SIZE..MDI_HEADER_SIZE + needed];
        let (distances, intensities) = match kind {
            PacketType::DistanceOnly => (
                payload.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect(),
                Vec::new(),
            ),
            PacketType::DistanceIntensity => payload
                .chunks_exact(4)
                .map(|c| (u16::from_be_bytes([c[0], c[1]]), u16::from_be_bytes([c[2], c[3]])))
                .unzip(),
        };

        let crc_frame = read_u16_be(packet, size - 2);
        let crc_calc = crc16(&packet[..size - 2]);
        let crc_valid = crc_frame == crc_calc;
        if !crc_valid {
            warn!(
                packet_no = header.packet_no,
                "MDI CRC mismatch: frame=0x{:04X}, calc=0x{:04X}", crc_frame, crc_calc
            );
        }

        Ok(Self {
            header,
            distances,
            intensities,
            crc_valid,
        })
    }

    /// Encode a packet the way the sensor emits it.
    ///
    /// `header.packet_size` and `header.scan_spots` are recomputed from the
    /// payload. Intensities are written only for distance+intensity packets.
    pub fn encode(header: &MdiHeader, distances: &[u16], intensities: &[u16]) -> Vec<u8> {
        let kind = header.kind();
        let size = MDI_HEADER_SIZE + kind.bytes_per_spot() * distances.len() + MDI_CRC_SIZE;

        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&MDI_SYNC);
        out.push(header.packet_type);
        out.extend_from_slice(&(size as u16).to_be_bytes());
        out.extend_from_slice(&[0u8; 6]);
        out.extend_from_slice(&header.packet_no.to_be_bytes());
        out.push(header.total_no);
        out.push(header.sub_no);
        out.extend_from_slice(&header.scan_freq_hz.to_be_bytes());
        out.extend_from_slice(&(distances.len() as u16).to_be_bytes());
        out.extend_from_slice(&header.first_angle_mdeg.to_be_bytes());
        out.extend_from_slice(&header.delta_angle_mdeg.to_be_bytes());
        out.extend_from_slice(&header.timestamp_ms.to_be_bytes());

        for (i, d) in distances.iter().enumerate() {
            out.extend_from_slice(&d.to_be_bytes());
            if kind == PacketType::DistanceIntensity {
                let intensity = intensities.get(i).copied().unwrap_or(0);
                out.extend_from_slice(&intensity.to_be_bytes());
            }
        }

        let crc = crc16(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }
}

/// CRC16 with polynomial 0x90D9, initial value 0, fed MSB first
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ MDI_CRC_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Read the declared packet size of a candidate starting at a sync marker
pub fn declared_size(candidate: &[u8]) -> Option<usize> {
    (candidate.len() >= 7).then(|| read_u16_be(candidate, 5) as usize)
}

fn read_u16_be(b: &[u8], i: usize) -> u16 {
    u16::from_be_bytes([b[i], b[i + 1]])
}

fn read_i32_be(b: &[u8], i: usize) -> i32 {
    i32::from_be_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]])
}
