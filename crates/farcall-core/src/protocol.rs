//! Length-prefixed, CRC-checked framing over a byte stream.
//!
//! Every message is laid out as:
//!
//! ```text
//! [4B marker][2B version][4B BE i32 length][4B CRC32(header)][length B body][4B CRC32(body)]
//! ```
//!
//! The protocol is a pair of small state machines driven by the transport:
//! the send side hands out blocks to write, the receive side tells the
//! transport how many bytes to read next. Validation failures are reported
//! by [`FramingProtocol::end_receiving`].
//!
//! One send and one receive may be active at the same time; starting a second
//! operation in the same direction is a programming error and panics.

use crate::config::ProtocolConfig;
use crate::error::FramingError;
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_BZIP2};
use std::collections::VecDeque;

/// Non-reflected CRC-32 (poly 0x04C11DB7, init and xorout 0xFFFFFFFF).
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_BZIP2);

const MARKER_LEN: usize = 4;
const HEADER_LEN: usize = 6;
const CRC_LEN: usize = 4;

pub fn checksum(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Encode a complete frame for `body` in one buffer.
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MARKER_LEN + HEADER_LEN + 2 * CRC_LEN + body.len());
    buf.put_slice(&preamble(body.len()));
    buf.put_slice(body);
    buf.put_u32(checksum(body));
    buf.freeze()
}

fn preamble(body_len: usize) -> [u8; MARKER_LEN + HEADER_LEN + CRC_LEN] {
    let mut out = [0u8; MARKER_LEN + HEADER_LEN + CRC_LEN];
    out[..MARKER_LEN].copy_from_slice(&ProtocolConfig::START_MARKER);
    out[4..6].copy_from_slice(&ProtocolConfig::VERSION.to_be_bytes());
    out[6..10].copy_from_slice(&(body_len as i32).to_be_bytes());
    let header_crc = checksum(&out[MARKER_LEN..MARKER_LEN + HEADER_LEN]);
    out[10..14].copy_from_slice(&header_crc.to_be_bytes());
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Marker,
    Header,
    HeaderCrc,
    Body,
    BodyCrc,
    Done,
    Failed(FramingError),
}

#[derive(Debug)]
struct ReceiveState {
    stage: Stage,
    header: [u8; HEADER_LEN],
    length: usize,
    body: Bytes,
}

/// Stateful frame encoder/decoder for one connection.
#[derive(Debug)]
pub struct FramingProtocol {
    max_packet_size: usize,
    sending: Option<VecDeque<Bytes>>,
    receiving: Option<ReceiveState>,
}

impl Default for FramingProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl FramingProtocol {
    pub fn new() -> Self {
        Self::with_max_packet_size(ProtocolConfig::MAX_PACKET_SIZE)
    }

    /// The length field is an `i32`, so larger limits are clamped to `i32::MAX`.
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(i32::MAX as usize),
            sending: None,
            receiving: None,
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn is_sending(&self) -> bool {
        self.sending.is_some()
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.is_some()
    }

    /// Begin sending `data`.
    ///
    /// # Panics
    ///
    /// Panics if a send is already in progress.
    pub fn start_sending(&mut self, data: Bytes) -> Result<(), FramingError> {
        assert!(
            self.sending.is_none(),
            "BUG: start_sending called while a send is in progress"
        );
        if data.len() > self.max_packet_size {
            return Err(FramingError::PacketTooLarge {
                size: data.len(),
                max: self.max_packet_size,
            });
        }

        let mut blocks = VecDeque::with_capacity(3);
        blocks.push_back(Bytes::copy_from_slice(&preamble(data.len())));
        let body_crc = checksum(&data);
        if !data.is_empty() {
            blocks.push_back(data);
        }
        blocks.push_back(Bytes::copy_from_slice(&body_crc.to_be_bytes()));
        self.sending = Some(blocks);
        Ok(())
    }

    /// Next block to write, or `None` once the frame is fully handed out.
    pub fn get_next_block_to_send(&mut self) -> Option<Bytes> {
        self.sending.as_mut().and_then(VecDeque::pop_front)
    }

    pub fn end_sending(&mut self) {
        self.sending = None;
    }

    /// Begin receiving a frame; returns the size of the first block to read.
    ///
    /// # Panics
    ///
    /// Panics if a receive is already in progress.
    pub fn start_receiving(&mut self) -> usize {
        assert!(
            self.receiving.is_none(),
            "BUG: start_receiving called while a receive is in progress"
        );
        self.receiving = Some(ReceiveState {
            stage: Stage::Marker,
            header: [0u8; HEADER_LEN],
            length: 0,
            body: Bytes::new(),
        });
        MARKER_LEN
    }

    /// Feed the block that was requested last.
    ///
    /// Returns the size of the following block, or 0 once the frame is
    /// complete or has failed validation. A block shorter than requested
    /// means the stream ended early and fails the frame as truncated.
    pub fn apply_next_received_block(&mut self, block: &[u8]) -> usize {
        let max_packet_size = self.max_packet_size;
        let Some(state) = self.receiving.as_mut() else {
            return 0;
        };

        let (next_stage, next_size) = match state.stage {
            Stage::Marker => {
                if block.len() < MARKER_LEN {
                    (Stage::Failed(FramingError::HeaderTruncated), 0)
                } else if block[..MARKER_LEN] != ProtocolConfig::START_MARKER {
                    (Stage::Failed(FramingError::InvalidMarker), 0)
                } else {
                    (Stage::Header, HEADER_LEN)
                }
            }
            Stage::Header => {
                if block.len() < HEADER_LEN {
                    (Stage::Failed(FramingError::HeaderTruncated), 0)
                } else {
                    state.header.copy_from_slice(&block[..HEADER_LEN]);
                    (Stage::HeaderCrc, CRC_LEN)
                }
            }
            Stage::HeaderCrc => Self::validate_header(state, block, max_packet_size),
            Stage::Body => {
                if block.len() < state.length {
                    (Stage::Failed(FramingError::BodyTruncated), 0)
                } else {
                    state.body = Bytes::copy_from_slice(&block[..state.length]);
                    (Stage::BodyCrc, CRC_LEN)
                }
            }
            Stage::BodyCrc => {
                if block.len() < CRC_LEN {
                    (Stage::Failed(FramingError::BodyCrcTruncated), 0)
                } else {
                    let expected = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
                    if expected == checksum(&state.body) {
                        (Stage::Done, 0)
                    } else {
                        (Stage::Failed(FramingError::BodyCrcMismatch), 0)
                    }
                }
            }
            Stage::Done | Stage::Failed(_) => (state.stage, 0),
        };

        state.stage = next_stage;
        next_size
    }

    fn validate_header(
        state: &mut ReceiveState,
        block: &[u8],
        max_packet_size: usize,
    ) -> (Stage, usize) {
        if block.len() < CRC_LEN {
            return (Stage::Failed(FramingError::HeaderCrcTruncated), 0);
        }
        let expected = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
        if expected != checksum(&state.header) {
            return (Stage::Failed(FramingError::HeaderCrcMismatch), 0);
        }

        let version = u16::from_be_bytes([state.header[0], state.header[1]]);
        if version != ProtocolConfig::VERSION {
            return (Stage::Failed(FramingError::UnsupportedVersion(version)), 0);
        }

        let length = i32::from_be_bytes([
            state.header[2],
            state.header[3],
            state.header[4],
            state.header[5],
        ]);
        if length < 0 {
            return (Stage::Failed(FramingError::NegativeLength(length)), 0);
        }
        let length = length as usize;
        if length > max_packet_size {
            return (
                Stage::Failed(FramingError::PacketTooLarge {
                    size: length,
                    max: max_packet_size,
                }),
                0,
            );
        }

        state.length = length;
        if length == 0 {
            (Stage::BodyCrc, CRC_LEN)
        } else {
            (Stage::Body, length)
        }
    }

    /// Finish the current receive and return its payload.
    pub fn end_receiving(&mut self) -> Result<Bytes, FramingError> {
        let Some(state) = self.receiving.take() else {
            return Err(FramingError::HeaderTruncated);
        };
        match state.stage {
            Stage::Done => Ok(state.body),
            Stage::Failed(err) => Err(err),
            Stage::Marker | Stage::Header => Err(FramingError::HeaderTruncated),
            Stage::HeaderCrc => Err(FramingError::HeaderCrcTruncated),
            Stage::Body => Err(FramingError::BodyTruncated),
            Stage::BodyCrc => Err(FramingError::BodyCrcTruncated),
        }
    }
}
