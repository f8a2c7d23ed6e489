//! Status-byte codec and command validation.
//!
//! The PLC reports its state as a single byte; each bit has a fixed
//! position and a fixed pair of human-readable phrases. The labels are
//! canonical: a deployment where the READY wire polarity is inverted maps
//! back to the same labels through `ready_inverted`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::utils::error::{AppError, AppResult};

const BIT_READY: u8 = 0;
const BIT_RUN: u8 = 1;
const BIT_MODE: u8 = 2;
const BIT_ALARM: u8 = 3;
const BIT_ESTOP: u8 = 4;
const BIT_VFD: u8 = 5;
const BIT_POS_ERROR: u8 = 6;
const BIT_DIRECTION: u8 = 7;

/// The eight named booleans projected from the raw status byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBits {
    pub ready: bool,
    pub run: bool,
    /// Bit 2: false = remote operation, true = manual operation.
    pub manual_mode: bool,
    pub alarm: bool,
    pub estop: bool,
    pub vfd_fault: bool,
    pub position_error: bool,
    /// Bit 7: false = moving up, true = moving down.
    pub direction_down: bool,
}

impl StatusBits {
    /// Projects a raw status byte into the named bit-field.
    pub fn decode(raw: u8, ready_inverted: bool) -> Self {
        let bit = |n: u8| raw >> n & 1 == 1;
        Self {
            ready: bit(BIT_READY) != ready_inverted,
            run: bit(BIT_RUN),
            manual_mode: bit(BIT_MODE),
            alarm: bit(BIT_ALARM),
            estop: bit(BIT_ESTOP),
            vfd_fault: bit(BIT_VFD),
            position_error: bit(BIT_POS_ERROR),
            direction_down: bit(BIT_DIRECTION),
        }
    }

    /// Exact inverse of [`StatusBits::decode`] for the same polarity flag.
    pub fn encode(&self, ready_inverted: bool) -> u8 {
        let mut raw = 0u8;
        if self.ready != ready_inverted {
            raw |= 1 << BIT_READY;
        }
        if self.run {
            raw |= 1 << BIT_RUN;
        }
        if self.manual_mode {
            raw |= 1 << BIT_MODE;
        }
        if self.alarm {
            raw |= 1 << BIT_ALARM;
        }
        if self.estop {
            raw |= 1 << BIT_ESTOP;
        }
        if self.vfd_fault {
            raw |= 1 << BIT_VFD;
        }
        if self.position_error {
            raw |= 1 << BIT_POS_ERROR;
        }
        if self.direction_down {
            raw |= 1 << BIT_DIRECTION;
        }
        raw
    }

    /// Canonical phrase per status flag. The mapping is fixed.
    pub fn descriptions(&self) -> BTreeMap<&'static str, &'static str> {
        let mut states = BTreeMap::new();
        states.insert(
            "READY",
            if self.ready {
                "Machine ready to operate"
            } else {
                "Machine cannot operate"
            },
        );
        states.insert(
            "RUN",
            if self.run {
                "Carousel moving"
            } else {
                "Carousel stopped"
            },
        );
        states.insert(
            "MODE",
            if self.manual_mode {
                "Manual mode"
            } else {
                "Remote mode"
            },
        );
        states.insert(
            "ALARM",
            if self.alarm { "Alarm active" } else { "No alarm" },
        );
        states.insert(
            "ESTOP",
            if self.estop {
                "Emergency stop engaged"
            } else {
                "No emergency stop"
            },
        );
        states.insert(
            "VFD_ERR",
            if self.vfd_fault {
                "Speed drive fault"
            } else {
                "Speed drive OK"
            },
        );
        states.insert(
            "POS_ERR",
            if self.position_error {
                "Positioning error"
            } else {
                "Positioning OK"
            },
        );
        states.insert(
            "DIRECTION",
            if self.direction_down {
                "Moving down"
            } else {
                "Moving up"
            },
        );
        states
    }
}

/// Immutable capture of a device's observable state at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub raw: u8,
    pub position: u8,
    pub bits: StatusBits,
    pub captured_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn capture(raw: u8, position: u8, ready_inverted: bool) -> Self {
        Self {
            raw,
            position,
            bits: StatusBits::decode(raw, ready_inverted),
            captured_at: Utc::now(),
        }
    }

    /// Change detection ignores the capture instant: two snapshots are
    /// the same state when the device reported the same bytes.
    pub fn same_state(&self, other: &StatusSnapshot) -> bool {
        self.raw == other.raw && self.position == other.position
    }

    /// Client-facing projection: raw byte, position, named bits, and the
    /// canonical phrases.
    pub fn to_json(&self) -> Value {
        json!({
            "raw": self.raw,
            "position": self.position,
            "bits": self.bits,
            "states": self.bits.descriptions(),
            "captured_at": self.captured_at.to_rfc3339(),
        })
    }
}

/// Rejects command codes outside `0..=255` before any device I/O.
pub fn validate_command(command: i64) -> AppResult<u8> {
    u8::try_from(command)
        .map_err(|_| AppError::bad_command(format!("command must be between 0 and 255, got {command}")))
}

/// Rejects argument values outside `0..=255` before any device I/O.
pub fn validate_argument(argument: i64) -> AppResult<u8> {
    u8::try_from(argument).map_err(|_| {
        AppError::bad_command(format!("argument must be between 0 and 255, got {argument}"))
    })
}

/// MOVE targets must address an existing bucket.
pub fn validate_move_position(position: i64) -> AppResult<u8> {
    match u8::try_from(position) {
        Ok(p) if p <= super::MAX_MOVE_POSITION => Ok(p),
        _ => Err(AppError::bad_command(format!(
            "position must be between 0 and {}, got {position}",
            super::MAX_MOVE_POSITION
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_maps_every_bit_position() {
        let bits = StatusBits::decode(0b1010_0110, false);
        assert!(!bits.ready);
        assert!(bits.run);
        assert!(bits.manual_mode);
        assert!(!bits.alarm);
        assert!(!bits.estop);
        assert!(bits.vfd_fault);
        assert!(!bits.position_error);
        assert!(bits.direction_down);
    }

    #[test]
    fn decode_encode_round_trips_all_bytes() {
        for raw in 0..=255u8 {
            for inverted in [false, true] {
                let bits = StatusBits::decode(raw, inverted);
                assert_eq!(bits.encode(inverted), raw);
            }
        }
    }

    #[test]
    fn ready_polarity_flag_flips_only_the_label() {
        let normal = StatusBits::decode(0b0000_0001, false);
        assert!(normal.ready);
        let inverted = StatusBits::decode(0b0000_0001, true);
        assert!(!inverted.ready);
        let inverted_zero = StatusBits::decode(0b0000_0000, true);
        assert!(inverted_zero.ready);
    }

    #[test]
    fn descriptions_cover_all_flags() {
        let states = StatusBits::decode(0xFF, false).descriptions();
        assert_eq!(states.len(), 8);
        assert_eq!(states["READY"], "Machine ready to operate");
        assert_eq!(states["RUN"], "Carousel moving");
        assert_eq!(states["DIRECTION"], "Moving down");
    }

    #[test]
    fn snapshot_equality_ignores_capture_instant() {
        let a = StatusSnapshot::capture(3, 5, false);
        let b = StatusSnapshot::capture(3, 5, false);
        assert!(a.same_state(&b));
        let c = StatusSnapshot::capture(3, 6, false);
        assert!(!a.same_state(&c));
    }

    #[test]
    fn command_validation_bounds() {
        assert!(validate_command(0).is_ok());
        assert!(validate_command(255).is_ok());
        assert!(matches!(
            validate_command(300),
            Err(AppError::BadCommand { .. })
        ));
        assert!(matches!(
            validate_command(-1),
            Err(AppError::BadCommand { .. })
        ));
        assert!(validate_argument(255).is_ok());
        assert!(validate_argument(256).is_err());
    }

    #[test]
    fn move_position_validation_bounds() {
        assert_eq!(validate_move_position(0).unwrap(), 0);
        assert_eq!(validate_move_position(9).unwrap(), 9);
        assert!(validate_move_position(10).is_err());
        assert!(validate_move_position(-1).is_err());
    }
}
