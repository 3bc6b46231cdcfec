//! HID report decoder.
//!
//! Reports are fixed-length frames polled by the OS:
//!
//! ```text
//!   byte 0  laser position (calibrated range, default 3..123)
//!   byte 1  nav wheel cumulative detent counter (wrapping)
//!   byte 2  volume wheel cumulative detent counter (wrapping)
//!   byte 3  button bitmask (bit 0 = left, 1 = right, 2 = go, 3 = power,
//!           4 = menu, 5 = back)
//! ```
//!
//! The decoder keeps a per-axis last-seen table and emits one semantic
//! event per change: identical consecutive laser positions are suppressed,
//! wheel speed is the detent delta per report clamped to `SPEED_MAX`, and
//! buttons fire on 0 -> 1 edges only.

use crate::bus::{InputEvent, SpinDirection};
use crate::config::Calibration;

/// Detents-per-interval clamp.
pub const SPEED_MAX: u32 = 32;

/// Arc angle at the calibrated minimum position.
pub const ANGLE_MIN: f64 = -90.0;
/// Arc angle at the calibrated midpoint.
pub const ANGLE_MID: f64 = 0.0;
/// Arc angle at the calibrated maximum position.
pub const ANGLE_MAX: f64 = 90.0;

const BUTTON_NAMES: [&str; 6] = ["left", "right", "go", "power", "menu", "back"];

/// Monotone piecewise-linear mapping from laser position to arc angle,
/// anchored at the three calibration points and clamped outside them.
#[derive(Debug, Clone, Copy)]
pub struct ArcMapper {
    calibration: Calibration,
}

impl ArcMapper {
    pub fn new(calibration: Calibration) -> Self {
        Self { calibration }
    }

    pub fn angle(&self, position: u16) -> f64 {
        let cal = &self.calibration;
        if position <= cal.laser_min {
            return ANGLE_MIN;
        }
        if position >= cal.laser_max {
            return ANGLE_MAX;
        }
        if position <= cal.laser_mid {
            let span = (cal.laser_mid - cal.laser_min) as f64;
            ANGLE_MIN + (ANGLE_MID - ANGLE_MIN) * (position - cal.laser_min) as f64 / span
        } else {
            let span = (cal.laser_max - cal.laser_mid) as f64;
            ANGLE_MID + (ANGLE_MAX - ANGLE_MID) * (position - cal.laser_mid) as f64 / span
        }
    }
}

/// Stateful report decoder. One instance per HID endpoint; reset on read
/// errors so a reopened endpoint starts from a clean table.
#[derive(Debug)]
pub struct Decoder {
    mapper: ArcMapper,
    last_laser: Option<u8>,
    last_nav: Option<u8>,
    last_volume: Option<u8>,
    last_buttons: u8,
    repeats: [u32; BUTTON_NAMES.len()],
}

impl Decoder {
    pub fn new(calibration: Calibration) -> Self {
        Self {
            mapper: ArcMapper::new(calibration),
            last_laser: None,
            last_nav: None,
            last_volume: None,
            last_buttons: 0,
            repeats: [0; BUTTON_NAMES.len()],
        }
    }

    /// Forget all per-axis state. Called after endpoint errors.
    pub fn reset(&mut self) {
        self.last_laser = None;
        self.last_nav = None;
        self.last_volume = None;
        self.last_buttons = 0;
        self.repeats = [0; BUTTON_NAMES.len()];
    }

    /// Decode one report into zero or more semantic events, in axis order
    /// laser, nav, volume, buttons.
    pub fn decode(&mut self, report: &[u8]) -> Vec<InputEvent> {
        let mut events = Vec::new();
        if report.len() < 4 {
            return events;
        }

        // Laser: emit on change only.
        let laser = report[0];
        if self.last_laser != Some(laser) {
            self.last_laser = Some(laser);
            let position = laser as u16;
            events.push(InputEvent::Laser {
                position,
                angle: self.mapper.angle(position),
            });
        }

        // Wheels: wrapping counter deltas.
        if let Some(event) = Self::wheel_event(&mut self.last_nav, report[1], |direction, speed| {
            InputEvent::Nav { direction, speed }
        }) {
            events.push(event);
        }
        if let Some(event) =
            Self::wheel_event(&mut self.last_volume, report[2], |direction, speed| {
                InputEvent::Volume { direction, speed }
            })
        {
            events.push(event);
        }

        // Buttons: 0 -> 1 edges fire, releases reset repeat counters.
        let buttons = report[3];
        for (bit, name) in BUTTON_NAMES.iter().enumerate() {
            let mask = 1u8 << bit;
            let is_down = buttons & mask != 0;
            let was_down = self.last_buttons & mask != 0;
            if is_down && !was_down {
                self.repeats[bit] += 1;
                events.push(InputEvent::Button {
                    button: (*name).to_string(),
                });
            } else if !is_down && was_down {
                self.repeats[bit] = 0;
            }
        }
        self.last_buttons = buttons;

        events
    }

    fn wheel_event(
        last: &mut Option<u8>,
        current: u8,
        build: impl FnOnce(SpinDirection, u32) -> InputEvent,
    ) -> Option<InputEvent> {
        let previous = match last.replace(current) {
            Some(previous) => previous,
            // First report seeds the table without emitting.
            None => return None,
        };
        let delta = current.wrapping_sub(previous) as i8;
        if delta == 0 {
            return None;
        }
        let direction = if delta > 0 {
            SpinDirection::Clock
        } else {
            SpinDirection::Counter
        };
        let speed = (delta.unsigned_abs() as u32).clamp(1, SPEED_MAX);
        Some(build(direction, speed))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::Calibration;

    fn decoder() -> Decoder {
        Decoder::new(Calibration::default())
    }

    #[test]
    fn first_report_emits_laser_only() {
        let mut d = decoder();
        let events = d.decode(&[60, 0, 0, 0]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], InputEvent::Laser { position: 60, .. }));
    }

    #[test]
    fn identical_laser_positions_are_suppressed() {
        let mut d = decoder();
        d.decode(&[60, 0, 0, 0]);
        let events = d.decode(&[60, 0, 0, 0]);
        assert!(events.is_empty());
    }

    #[test]
    fn wheel_delta_becomes_direction_and_speed() {
        let mut d = decoder();
        d.decode(&[60, 10, 10, 0]);
        let events = d.decode(&[60, 13, 8, 0]);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            InputEvent::Nav {
                direction: SpinDirection::Clock,
                speed: 3
            }
        );
        assert_eq!(
            events[1],
            InputEvent::Volume {
                direction: SpinDirection::Counter,
                speed: 2
            }
        );
    }

    #[test]
    fn wheel_counter_wraps_cleanly() {
        let mut d = decoder();
        d.decode(&[60, 254, 0, 0]);
        let events = d.decode(&[60, 1, 0, 0]);
        assert_eq!(
            events[0],
            InputEvent::Nav {
                direction: SpinDirection::Clock,
                speed: 3
            }
        );
    }

    #[test]
    fn wheel_speed_clamps_at_max() {
        let mut d = decoder();
        d.decode(&[60, 0, 0, 0]);
        let events = d.decode(&[60, 100, 0, 0]);
        match &events[0] {
            InputEvent::Nav { speed, .. } => assert_eq!(*speed, SPEED_MAX),
            other => panic!("expected nav, got {:?}", other),
        }
    }

    #[test]
    fn buttons_fire_on_press_edge_only() {
        let mut d = decoder();
        d.decode(&[60, 0, 0, 0]);
        let press = d.decode(&[60, 0, 0, 0b100]);
        assert_eq!(
            press,
            vec![InputEvent::Button {
                button: "go".into()
            }]
        );
        // Held: nothing. Released: nothing.
        assert!(d.decode(&[60, 0, 0, 0b100]).is_empty());
        assert!(d.decode(&[60, 0, 0, 0]).is_empty());
    }

    #[test]
    fn reset_reseeds_the_table() {
        let mut d = decoder();
        d.decode(&[60, 5, 5, 0]);
        d.reset();
        // After reset the same report seeds again: laser emits, wheels don't.
        let events = d.decode(&[60, 9, 5, 0]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], InputEvent::Laser { .. }));
    }

    #[test]
    fn angle_mapping_is_monotone_and_clamped() {
        let mapper = ArcMapper::new(Calibration::default());
        assert_eq!(mapper.angle(3), ANGLE_MIN);
        assert_eq!(mapper.angle(123), ANGLE_MAX);
        assert_eq!(mapper.angle(63), ANGLE_MID);
        // Below/above the calibrated range clamps.
        assert_eq!(mapper.angle(0), ANGLE_MIN);
        assert_eq!(mapper.angle(200), ANGLE_MAX);
        // Monotone nondecreasing across the range.
        let mut previous = f64::NEG_INFINITY;
        for position in 0..=200u16 {
            let angle = mapper.angle(position);
            assert!(angle >= previous, "not monotone at {}", position);
            previous = angle;
        }
    }
}
