//! Movie streaming
//!
//! Answers the emulator's stream requests with packed frames from a movie,
//! remembering how far playback has got.

use crate::buttons::ButtonState;
use crate::movie::{IDLE_FRAME_BYTE, Movie};
use crate::packet::{WireFormat, WirePacket};
use bytes::BytesMut;
use tracing::warn;

/// A movie plus the number of frames already sent
#[derive(Debug, Clone)]
pub struct MovieStream {
    movie: Movie,
    sent: usize,
}

impl MovieStream {
    pub fn new(movie: Movie) -> Self {
        Self { movie, sent: 0 }
    }

    pub fn movie(&self) -> &Movie {
        &self.movie
    }

    /// Frames sent so far
    pub fn frames_sent(&self) -> usize {
        self.sent
    }

    pub fn is_finished(&self) -> bool {
        self.sent >= self.movie.frame_count()
    }

    /// Restart playback from the first frame
    pub fn rewind(&mut self) {
        self.sent = 0;
    }

    /// Build the reply to one stream request
    ///
    /// Returns a stream data packet with as many frames as fit, or a stream
    /// end packet once every frame has been sent.
    pub fn next_packet(&mut self, format: &WireFormat) -> WirePacket {
        let frames = self.movie.frames();
        if self.sent >= frames.len() {
            return WirePacket::stream_end();
        }

        let idle = ButtonState::IDLE.to_bytes();
        let mut payload = BytesMut::zeroed(format.payload_len);
        for pair in payload.chunks_exact_mut(ButtonState::LEN) {
            pair.copy_from_slice(&idle);
        }

        let count = (frames.len() - self.sent).min(format.frames_per_packet());
        for (i, frame) in frames[self.sent..self.sent + count].iter().enumerate() {
            let offset = i * ButtonState::LEN;
            payload[offset..offset + ButtonState::LEN]
                .copy_from_slice(&ButtonState::from_frame_byte(frame[0]).to_bytes());

            if frame[1] != IDLE_FRAME_BYTE || frame[2] != IDLE_FRAME_BYTE {
                warn!(
                    "Frame {}: unhandled byte(s) {:02x} {:02x}",
                    self.sent + i,
                    frame[1],
                    frame[2]
                );
            }
        }
        self.sent += count;

        WirePacket::stream_data(payload.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movie::{HEADER_LEN, SIGNATURE};
    use crate::packet::PacketType;

    fn movie_with(frames: &[[u8; 3]]) -> Movie {
        let mut data = vec![0u8; HEADER_LEN];
        data[..15].copy_from_slice(SIGNATURE);
        data[15] = b'A';
        data[20] = b'3';
        for frame in frames {
            data.extend_from_slice(frame);
        }
        Movie::parse(&data).unwrap()
    }

    #[test]
    fn test_packet_is_padded_with_idle() {
        let mut stream = MovieStream::new(movie_with(&[[0x00, 0xff, 0xff]]));
        let packet = stream.next_packet(&WireFormat::default());

        assert_eq!(packet.kind, PacketType::StreamData);
        assert_eq!(packet.payload.len(), 60);
        assert_eq!(&packet.payload[..2], &[0x00, 0x00]);
        for pair in packet.payload[2..].chunks(2) {
            assert_eq!(pair, &[0x33, 0x3f]);
        }
    }

    #[test]
    fn test_long_movie_spans_packets() {
        let frames = vec![[0xff, 0xff, 0xff]; 45];
        let mut stream = MovieStream::new(movie_with(&frames));
        let format = WireFormat::default();

        assert_eq!(stream.next_packet(&format).kind, PacketType::StreamData);
        assert_eq!(stream.frames_sent(), 30);
        assert_eq!(stream.next_packet(&format).kind, PacketType::StreamData);
        assert_eq!(stream.frames_sent(), 45);
        assert!(stream.is_finished());
        assert_eq!(stream.next_packet(&format).kind, PacketType::StreamEnd);
        assert_eq!(stream.frames_sent(), 45);
    }

    #[test]
    fn test_rewind() {
        let mut stream = MovieStream::new(movie_with(&[[0xff, 0xff, 0xff]]));
        let format = WireFormat::default();
        stream.next_packet(&format);
        assert!(stream.is_finished());

        stream.rewind();
        assert_eq!(stream.frames_sent(), 0);
        assert_eq!(stream.next_packet(&format).kind, PacketType::StreamData);
    }

    #[test]
    fn test_odd_payload_len() {
        let format = WireFormat {
            header_len: 1,
            payload_len: 5,
        };
        let mut stream = MovieStream::new(movie_with(&[[0x00, 0xff, 0xff]; 3]));
        let packet = stream.next_packet(&format);

        assert_eq!(packet.payload.len(), 5);
        assert_eq!(stream.frames_sent(), 2);
        assert_eq!(packet.payload[4], 0);
    }
}
