// Motor control for the differential-drive base
//
// Provides:
// - Differential-drive kinematics (body velocity <-> wheel speeds)
// - Motor constants and their derived pulse conversions
// - RoboClaw packet serial protocol implementation
// - High-level motor controller with failure recovery

pub mod constants;
mod controller;
pub mod kinematics;
mod link;
#[cfg(test)]
pub(crate) mod mock;
pub mod roboclaw;

pub use constants::{Calibration, MotorConstants, VelocityPid, WheelSigns};
pub use controller::{MotorController, RetryPolicy};
pub use kinematics::{WheelSpeeds, vw_to_wheel_speeds, wheel_speeds_to_vw};
pub use link::{Channel, MotorLink, SpeedReading};
pub use roboclaw::RoboclawLink;
