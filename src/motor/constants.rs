// Motor and wheel constants, plus the values derived from them
//
// `Calibration` is the only way the controller sees constants, so the
// derived pulse conversions can never be out of step with their inputs.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::config::{
    DEFAULT_ACCEL_MAX, DEFAULT_AXLE_WIDTH, DEFAULT_GEAR_RATIO, DEFAULT_LEFT_SIGN,
    DEFAULT_MAX_WHEEL_SPEED, DEFAULT_MIN_WHEEL_SPEED, DEFAULT_PID_D, DEFAULT_PID_I, DEFAULT_PID_P,
    DEFAULT_PID_QPPS, DEFAULT_PULSES_PER_MOTOR_REV, DEFAULT_RIGHT_SIGN, DEFAULT_WHEEL_DIAMETER,
};
use crate::error::ConfigError;

/// Velocity PID gains as the motor controller takes them (raw integers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityPid {
    pub p: u32,
    pub i: u32,
    pub d: u32,
    /// Quad pulses per second when the motor runs at 100%
    pub qpps: u32,
}

impl Default for VelocityPid {
    fn default() -> Self {
        Self {
            p: DEFAULT_PID_P,
            i: DEFAULT_PID_I,
            d: DEFAULT_PID_D,
            qpps: DEFAULT_PID_QPPS,
        }
    }
}

/// Physical constants of the base and its motors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConstants {
    /// Distance between the wheels (m)
    pub axle_width: f64,
    /// Wheel diameter (m)
    pub wheel_diameter: f64,
    /// Wheel speeds below this magnitude are zeroed (m/s)
    pub min_wheel_speed: f64,
    /// Wheel speed limit (m/s)
    pub max_wheel_speed: f64,
    /// Wheel acceleration limit (m/s^2)
    pub accel_max: f64,
    /// Quadrature pulses per motor revolution
    pub pulses_per_motor_rev: f64,
    /// Motor revolutions per wheel revolution
    pub gear_ratio: f64,
    pub pid: VelocityPid,
}

impl Default for MotorConstants {
    fn default() -> Self {
        Self {
            axle_width: DEFAULT_AXLE_WIDTH,
            wheel_diameter: DEFAULT_WHEEL_DIAMETER,
            min_wheel_speed: DEFAULT_MIN_WHEEL_SPEED,
            max_wheel_speed: DEFAULT_MAX_WHEEL_SPEED,
            accel_max: DEFAULT_ACCEL_MAX,
            pulses_per_motor_rev: DEFAULT_PULSES_PER_MOTOR_REV,
            gear_ratio: DEFAULT_GEAR_RATIO,
            pid: VelocityPid::default(),
        }
    }
}

impl MotorConstants {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("axle_width", self.axle_width),
            ("wheel_diameter", self.wheel_diameter),
            ("pulses_per_motor_rev", self.pulses_per_motor_rev),
            ("gear_ratio", self.gear_ratio),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ConfigError::InvalidConstant {
                    name,
                    reason: format!("must be positive and finite, got {}", value),
                });
            }
        }

        if self.accel_max < 0.0 || !self.accel_max.is_finite() {
            return Err(ConfigError::InvalidConstant {
                name: "accel_max",
                reason: format!("must be non-negative, got {}", self.accel_max),
            });
        }

        if !(0.0..=self.max_wheel_speed).contains(&self.min_wheel_speed) {
            return Err(ConfigError::InvalidConstant {
                name: "min_wheel_speed",
                reason: format!(
                    "must be within [0, max_wheel_speed={}], got {}",
                    self.max_wheel_speed, self.min_wheel_speed
                ),
            });
        }

        Ok(())
    }
}

/// Constants together with the pulse conversions computed from them
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    constants: MotorConstants,
    pulses_per_meter: f64,
    accel_max_pulses: u32,
}

impl Calibration {
    pub fn new(constants: MotorConstants) -> Self {
        let motor_rev_per_meter = constants.gear_ratio / (PI * constants.wheel_diameter);
        let pulses_per_meter = constants.pulses_per_motor_rev * motor_rev_per_meter;
        // Saturating float cast, the controller takes an unsigned 32 bit accel
        let accel_max_pulses = (constants.accel_max * pulses_per_meter) as u32;

        Self {
            constants,
            pulses_per_meter,
            accel_max_pulses,
        }
    }

    pub fn constants(&self) -> &MotorConstants {
        &self.constants
    }

    pub fn pulses_per_meter(&self) -> f64 {
        self.pulses_per_meter
    }

    /// Max acceleration in quad pulses per second per second
    pub fn accel_max_pulses(&self) -> u32 {
        self.accel_max_pulses
    }

    /// Wheel speed (m/s) to quad pulses per second
    pub fn to_pulses(&self, speed: f64) -> i32 {
        (speed * self.pulses_per_meter).round() as i32
    }

    /// Quad pulses per second to wheel speed (m/s)
    pub fn to_speed(&self, pulses: i32) -> f64 {
        pulses as f64 / self.pulses_per_meter
    }
}

/// Wiring polarity per wheel: +1 if positive drives forward, -1 if backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WheelSigns {
    #[serde(rename = "left_sign")]
    pub left: i32,
    #[serde(rename = "right_sign")]
    pub right: i32,
}

impl Default for WheelSigns {
    fn default() -> Self {
        Self {
            left: DEFAULT_LEFT_SIGN,
            right: DEFAULT_RIGHT_SIGN,
        }
    }
}

impl WheelSigns {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, sign) in [("left_sign", self.left), ("right_sign", self.right)] {
            if sign != 1 && sign != -1 {
                return Err(ConfigError::InvalidConstant {
                    name,
                    reason: format!("must be 1 or -1, got {}", sign),
                });
            }
        }
        Ok(())
    }
}
