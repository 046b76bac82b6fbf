// Differential-drive kinematics
// Converts body velocities (v, w) to left/right wheel speeds and back.

use super::constants::{MotorConstants, WheelSigns};

/// Wheel speeds in m/s, already sign corrected when produced by
/// [`vw_to_wheel_speeds`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelSpeeds {
    pub left: f64,
    pub right: f64,
}

impl WheelSpeeds {
    pub fn new(left: f64, right: f64) -> Self {
        Self { left, right }
    }

    pub fn zero() -> Self {
        Self::default()
    }
}

/// Convert linear / angular velocity to left / right wheel speeds
///
/// # Arguments
/// * `v` - Linear velocity in m/s (positive = forward)
/// * `w` - Angular velocity in rad/s (positive = counter-clockwise)
///
/// Both wheels are scaled down by the same factor when either would exceed
/// `max_wheel_speed`, so the commanded curvature is kept. Speeds under
/// `min_wheel_speed` are zeroed, then the wiring polarity is applied.
pub fn vw_to_wheel_speeds(
    v: f64,
    w: f64,
    constants: &MotorConstants,
    signs: WheelSigns,
) -> WheelSpeeds {
    let half_axle = constants.axle_width / 2.0;
    let mut left = v - half_axle * w;
    let mut right = v + half_axle * w;

    let fastest = left.abs().max(right.abs());
    if fastest > constants.max_wheel_speed {
        let scale = constants.max_wheel_speed / fastest;
        left *= scale;
        right *= scale;
    }

    if left.abs() < constants.min_wheel_speed {
        left = 0.0;
    }
    if right.abs() < constants.min_wheel_speed {
        right = 0.0;
    }

    WheelSpeeds {
        left: left * signs.left as f64,
        right: right * signs.right as f64,
    }
}

/// Convert measured, sign corrected wheel speeds back to (v, w)
pub fn wheel_speeds_to_vw(wheels: WheelSpeeds, axle_width: f64) -> (f64, f64) {
    let v = (wheels.right + wheels.left) / 2.0;
    let w = (wheels.right - wheels.left) / axle_width;
    (v, w)
}
