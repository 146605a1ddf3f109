//! Controller button register
//!
//! The 3-button pad multiplexes eight buttons over six data lines. The
//! console reads it twice, once per level of the select line, so the state
//! is two bytes, one per read phase:
//!
//! ```text
//! phase 0: ?0SA 00DU
//! phase 1: ?1CB RLDU
//! ```
//!
//! Lines are active-low: a cleared bit means the button is held.
//!
//! Movie frames store the same buttons as one byte, `SCBA RLDU`, also
//! active-low. [`ButtonState::from_frame_byte`] and
//! [`ButtonState::to_frame_byte`] convert between the two layouts.

/// Logical controller buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    Up,
    Down,
    Left,
    Right,
    A,
    B,
    C,
    Start,
}

impl Button {
    pub const ALL: [Button; 8] = [
        Button::Up,
        Button::Down,
        Button::Left,
        Button::Right,
        Button::A,
        Button::B,
        Button::C,
        Button::Start,
    ];

    /// Bits this button drives in each read phase
    pub const fn phase_mask(self) -> [u8; 2] {
        match self {
            Button::Up => [0x01, 0x01],
            Button::Down => [0x02, 0x02],
            Button::Left => [0x00, 0x04],
            Button::Right => [0x00, 0x08],
            Button::A => [0x10, 0x00],
            Button::B => [0x00, 0x10],
            Button::C => [0x00, 0x20],
            Button::Start => [0x20, 0x00],
        }
    }
}

/// Packed two-phase button register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ButtonState([u8; 2]);

impl Default for ButtonState {
    fn default() -> Self {
        Self::IDLE
    }
}

impl ButtonState {
    /// Register size in bytes
    pub const LEN: usize = 2;

    /// Nothing pressed
    pub const IDLE: ButtonState = ButtonState([0x33, 0x3f]);

    pub const fn from_bytes(bytes: [u8; 2]) -> Self {
        Self(bytes)
    }

    pub const fn to_bytes(self) -> [u8; 2] {
        self.0
    }

    /// Hold or let go of a button, returning whether the register changed
    pub fn set(&mut self, button: Button, pressed: bool) -> bool {
        let old = self.0;
        let mask = button.phase_mask();

        for (byte, bits) in self.0.iter_mut().zip(mask) {
            if pressed {
                *byte &= !bits;
            } else {
                *byte |= bits;
            }
        }

        old != self.0
    }

    pub fn press(&mut self, button: Button) -> bool {
        self.set(button, true)
    }

    pub fn release(&mut self, button: Button) -> bool {
        self.set(button, false)
    }

    pub fn is_pressed(&self, button: Button) -> bool {
        let mask = button.phase_mask();
        self.0
            .iter()
            .zip(mask)
            .any(|(byte, bits)| bits != 0 && byte & bits == 0)
    }

    /// Split a movie frame byte (`SCBA RLDU`) into the two read phases
    pub const fn from_frame_byte(b: u8) -> Self {
        Self([
            (b & 0x13) | ((b >> 2) & 0x20),
            (b & 0x0f) | ((b >> 1) & 0x30),
        ])
    }

    /// Reassemble the movie frame byte from the two read phases
    pub const fn to_frame_byte(self) -> u8 {
        let [p0, p1] = self.0;
        (p1 & 0x0f) | (p0 & 0x10) | ((p1 & 0x30) << 1) | ((p0 & 0x20) << 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_matches_idle_frame() {
        assert_eq!(ButtonState::from_frame_byte(0xff), ButtonState::IDLE);
        assert_eq!(ButtonState::IDLE.to_frame_byte(), 0xff);
    }

    #[test]
    fn test_frame_fixtures() {
        // Start and C held, everything else released
        assert_eq!(ButtonState::from_frame_byte(0x3f).to_bytes(), [0x13, 0x1f]);
        // Everything held
        assert_eq!(ButtonState::from_frame_byte(0x00).to_bytes(), [0x00, 0x00]);
        // Only Up held
        assert_eq!(ButtonState::from_frame_byte(0xfe).to_bytes(), [0x32, 0x3e]);
    }

    #[test]
    fn test_up_press_clears_both_phases() {
        let mut state = ButtonState::IDLE;
        assert!(state.press(Button::Up));
        assert_eq!(state.to_bytes(), [0x32, 0x3e]);
        assert!(state.is_pressed(Button::Up));

        assert!(!state.press(Button::Up));
        assert!(state.release(Button::Up));
        assert_eq!(state, ButtonState::IDLE);
        assert!(!state.release(Button::Up));
    }

    #[test]
    fn test_masks_match_frame_layout() {
        // Pressing a button through the register must agree with clearing
        // the matching bit of the frame byte.
        let frame_bits = [
            (Button::Up, 0x01),
            (Button::Down, 0x02),
            (Button::Left, 0x04),
            (Button::Right, 0x08),
            (Button::A, 0x10),
            (Button::B, 0x20),
            (Button::C, 0x40),
            (Button::Start, 0x80),
        ];
        for (button, bit) in frame_bits {
            let mut state = ButtonState::IDLE;
            state.press(button);
            assert_eq!(
                state,
                ButtonState::from_frame_byte(0xff & !bit),
                "{:?}",
                button
            );
        }
    }
}
