//! GMV movie loader
//!
//! A GMV file is a 64-byte header followed by one 3-byte record per frame:
//!
//! ```text
//! offset  size  field
//!      0    15  signature "Gens Movie TEST"
//!     15     1  version
//!     16     4  rerecord count (LE)
//!     20     1  controller 1 config ('3' or '6')
//!     21     1  controller 2 config
//!     22     2  flags (LE)
//!     24    40  name, NUL-terminated
//!     64   3*n  frames: [player 1 buttons, player 2 buttons, extra]
//! ```
//!
//! Only player 1 is streamed. The other two bytes of every frame are
//! expected to hold [`IDLE_FRAME_BYTE`].

use crate::error::{MovieError, UnsupportedFeature};
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;
use tracing::{info, warn};

pub const HEADER_LEN: usize = 64;
pub const FRAME_LEN: usize = 3;
pub const SIGNATURE: &[u8; 15] = b"Gens Movie TEST";

/// Frame byte value meaning "no button held"
pub const IDLE_FRAME_BYTE: u8 = 0xff;

/// Versions at or above this one carry a meaningful flags field
pub const FLAGS_MIN_VERSION: u8 = b'A';

pub const FLAG_PAL: u16 = 0x80;
pub const FLAG_SAVESTATE: u16 = 0x40;
pub const FLAG_THREE_PLAYER: u16 = 0x20;

const NAME_OFFSET: usize = 24;
const NAME_LEN: usize = 40;

/// A validated GMV movie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Movie {
    version: u8,
    rerecords: u32,
    controllers: [u8; 2],
    flags: u16,
    name: String,
    frames: Vec<[u8; FRAME_LEN]>,
}

impl Movie {
    /// Read and validate a movie file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MovieError> {
        let data = std::fs::read(path.as_ref())?;
        let movie = Self::parse(&data)?;

        info!("Loaded GMV: {}", movie.name);
        info!(
            "{} frames, {} rerecords",
            movie.frame_count(),
            movie.rerecords
        );

        Ok(movie)
    }

    /// Validate movie contents already in memory
    pub fn parse(data: &[u8]) -> Result<Self, MovieError> {
        let size = data.len();
        let frame_count = size.saturating_sub(HEADER_LEN) / FRAME_LEN;
        if size < HEADER_LEN || frame_count == 0 || size != HEADER_LEN + frame_count * FRAME_LEN
        {
            return Err(MovieError::BadSize {
                size,
                frames: frame_count,
            });
        }

        if &data[..SIGNATURE.len()] != SIGNATURE {
            return Err(MovieError::BadSignature);
        }

        let version = data[15];
        let rerecords = LittleEndian::read_u32(&data[16..20]);
        let controllers = [data[20], data[21]];
        let flags = LittleEndian::read_u16(&data[22..24]);

        if controllers[0] != b'3' {
            warn!(
                "Unhandled controller config: '{}'",
                controllers[0].escape_ascii()
            );
        }

        if version >= FLAGS_MIN_VERSION {
            if flags & FLAG_SAVESTATE != 0 {
                return Err(MovieError::UnsupportedFeature(
                    UnsupportedFeature::Savestate,
                ));
            }
            if flags & FLAG_THREE_PLAYER != 0 {
                return Err(MovieError::UnsupportedFeature(
                    UnsupportedFeature::ThreePlayer,
                ));
            }
            if flags & !FLAG_PAL != 0 {
                warn!("Unhandled flag(s): {:04x}", flags);
            }
        }

        // The last byte of the name field is always treated as a terminator
        let raw_name = &data[NAME_OFFSET..NAME_OFFSET + NAME_LEN - 1];
        let name_end = raw_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(raw_name.len());
        let name = String::from_utf8_lossy(&raw_name[..name_end]).into_owned();

        let frames = data[HEADER_LEN..]
            .chunks_exact(FRAME_LEN)
            .map(|chunk| [chunk[0], chunk[1], chunk[2]])
            .collect();

        Ok(Self {
            version,
            rerecords,
            controllers,
            flags,
            name,
            frames,
        })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn rerecords(&self) -> u32 {
        self.rerecords
    }

    pub fn controllers(&self) -> [u8; 2] {
        self.controllers
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frames(&self) -> &[[u8; FRAME_LEN]] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}
