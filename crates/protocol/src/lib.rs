//! Wire protocol library for tas-host
//!
//! This crate defines everything that crosses the USB link between the host
//! and the controller emulator: the fixed-size packet frames, the packed
//! two-phase button register, and the GMV movie format that feeds stream
//! data packets.
//!
//! # Example
//!
//! ```
//! use protocol::{ButtonState, Button, PacketType, WireFormat, WirePacket};
//!
//! let mut state = ButtonState::IDLE;
//! state.press(Button::Start);
//!
//! let format = WireFormat::default();
//! let frame = WirePacket::fixed_state(state).encode(&format).unwrap();
//! assert_eq!(frame.len(), format.packet_len());
//!
//! let decoded = WirePacket::decode(&frame, &format).unwrap();
//! assert_eq!(decoded.kind, PacketType::FixedState);
//! assert_eq!(&decoded.payload[..2], &state.to_bytes());
//! ```
//!
//! # Streaming a movie
//!
//! ```no_run
//! use protocol::{Movie, MovieStream, WireFormat};
//!
//! let movie = Movie::load("run.gmv").unwrap();
//! let mut stream = MovieStream::new(movie);
//! let packet = stream.next_packet(&WireFormat::default());
//! ```

pub mod buttons;
pub mod error;
pub mod movie;
pub mod packet;
pub mod stream;

pub use buttons::{Button, ButtonState};
pub use error::{MovieError, ProtocolError, Result, UnsupportedFeature};
pub use movie::Movie;
pub use packet::{PacketType, WireFormat, WirePacket};
pub use stream::MovieStream;
