//! # Joystick Module
//!
//! Encodes joystick positions for the wire and paces how often they go out.
//!
//! ## Wire Format
//!
//! One position per line, integer axes separated by a comma:
//!
//! | Stick | Message |
//! |-------|---------|
//! | Released | `0,0\n` |
//! | Right and down | `12,-7\n` |
//!
//! ## Usage
//!
//! ```
//! use joylink::joystick::JoystickPosition;
//!
//! let position = JoystickPosition::from_offset(12.9, -7.4).clamped(200);
//! assert_eq!(position.to_message(), "12,-7\n");
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::JoyLinkError;

/// Integer stick offset from the center
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct JoystickPosition {
    pub x: i32,
    pub y: i32,
}

impl JoystickPosition {
    /// Released stick
    pub const CENTER: JoystickPosition = JoystickPosition { x: 0, y: 0 };

    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Build from a fractional offset, truncating toward zero
    ///
    /// ```
    /// use joylink::joystick::JoystickPosition;
    ///
    /// assert_eq!(JoystickPosition::from_offset(3.99, -3.99), JoystickPosition::new(3, -3));
    /// ```
    pub fn from_offset(dx: f32, dy: f32) -> Self {
        Self {
            x: dx.trunc() as i32,
            y: dy.trunc() as i32,
        }
    }

    /// Clamp each axis to `-max..=max`
    pub fn clamped(self, max: i32) -> Self {
        let max = max.saturating_abs();
        Self {
            x: self.x.clamp(-max, max),
            y: self.y.clamp(-max, max),
        }
    }

    pub fn is_center(&self) -> bool {
        *self == Self::CENTER
    }

    /// Newline-terminated wire message
    pub fn to_message(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for JoystickPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

impl FromStr for JoystickPosition {
    type Err = JoyLinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || JoyLinkError::InvalidMessage(s.trim().to_string());

        let (x, y) = s.trim().split_once(',').ok_or_else(invalid)?;
        let x = x.trim().parse().map_err(|_| invalid())?;
        let y = y.trim().parse().map_err(|_| invalid())?;
        Ok(Self { x, y })
    }
}

/// Keeps the newest position and releases it at most once per tick
///
/// A position equal to the last one released is not sent again.
#[derive(Debug, Default)]
pub struct PositionCoalescer {
    pending: Option<JoystickPosition>,
    last_sent: Option<JoystickPosition>,
}

impl PositionCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending position
    pub fn update(&mut self, position: JoystickPosition) {
        self.pending = Some(position);
    }

    /// Position to send on this tick, if any
    pub fn take_due(&mut self) -> Option<JoystickPosition> {
        let position = self.pending.take()?;
        if self.last_sent == Some(position) {
            return None;
        }
        Some(position)
    }

    /// Record that `position` was accepted by the link
    pub fn mark_sent(&mut self, position: JoystickPosition) {
        self.last_sent = Some(position);
    }

    /// Put a refused position back unless a newer one arrived meanwhile
    pub fn retry(&mut self, position: JoystickPosition) {
        if self.pending.is_none() {
            self.pending = Some(position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_message() {
        assert_eq!(JoystickPosition::CENTER.to_message(), "0,0\n");
        assert!(JoystickPosition::default().is_center());
    }

    #[test]
    fn test_from_offset_truncates_toward_zero() {
        assert_eq!(JoystickPosition::from_offset(12.9, -7.4), JoystickPosition::new(12, -7));
        assert_eq!(JoystickPosition::from_offset(-0.9, 0.9), JoystickPosition::CENTER);
    }

    #[test]
    fn test_clamped() {
        let position = JoystickPosition::new(350, -999).clamped(200);
        assert_eq!(position, JoystickPosition::new(200, -200));

        let inside = JoystickPosition::new(-12, 7).clamped(200);
        assert_eq!(inside, JoystickPosition::new(-12, 7));
    }

    #[test]
    fn test_clamped_with_extreme_bounds() {
        let position = JoystickPosition::new(i32::MIN, i32::MAX);
        assert_eq!(position.clamped(i32::MIN), JoystickPosition::new(-i32::MAX, i32::MAX));
        assert_eq!(JoystickPosition::new(5, -5).clamped(-3), JoystickPosition::new(3, -3));
    }

    #[test]
    fn test_negative_values_in_message() {
        assert_eq!(JoystickPosition::new(-200, 15).to_message(), "-200,15\n");
    }

    #[test]
    fn test_parse_accepts_whitespace() {
        let position: JoystickPosition = " 12 , -7 \n".parse().unwrap();
        assert_eq!(position, JoystickPosition::new(12, -7));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in ["", "12", "12;7", "a,b", "1,2,3", "1.5,2"] {
            match input.parse::<JoystickPosition>() {
                Err(JoyLinkError::InvalidMessage(_)) => {}
                other => panic!("Expected InvalidMessage for {:?}, got {:?}", input, other),
            }
        }
    }

    #[test]
    fn test_coalescer_sends_only_newest() {
        let mut coalescer = PositionCoalescer::new();
        coalescer.update(JoystickPosition::new(1, 1));
        coalescer.update(JoystickPosition::new(2, 2));
        coalescer.update(JoystickPosition::new(3, 3));

        assert_eq!(coalescer.take_due(), Some(JoystickPosition::new(3, 3)));
        assert_eq!(coalescer.take_due(), None);
    }

    #[test]
    fn test_coalescer_skips_unchanged_position() {
        let mut coalescer = PositionCoalescer::new();
        coalescer.update(JoystickPosition::new(5, 5));
        let due = coalescer.take_due().unwrap();
        coalescer.mark_sent(due);

        coalescer.update(JoystickPosition::new(5, 5));
        assert_eq!(coalescer.take_due(), None);

        coalescer.update(JoystickPosition::CENTER);
        assert_eq!(coalescer.take_due(), Some(JoystickPosition::CENTER));
    }

    #[test]
    fn test_coalescer_retry_keeps_newer_position() {
        let mut coalescer = PositionCoalescer::new();
        coalescer.update(JoystickPosition::new(1, 0));
        let refused = coalescer.take_due().unwrap();

        coalescer.retry(refused);
        assert_eq!(coalescer.take_due(), Some(JoystickPosition::new(1, 0)));

        coalescer.update(JoystickPosition::new(2, 0));
        coalescer.retry(refused);
        assert_eq!(coalescer.take_due(), Some(JoystickPosition::new(2, 0)));
    }
}
