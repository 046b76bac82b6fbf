// Message types exchanged with the outside world

use serde::{Deserialize, Serialize};

use crate::motor::MotorConstants;
use crate::odometry::{Pose, Quaternion};

/// Velocity command from teleop/planners -> runtime. Last value wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityCommand {
    /// m/s, positive = forward
    pub linear: f64,
    /// rad/s, positive = counter-clockwise
    pub angular: f64,
}

impl VelocityCommand {
    pub fn new(linear: f64, angular: f64) -> Self {
        Self { linear, angular }
    }
}

/// Pose + velocity estimate, expressed in `frame_id` for the body `child_frame_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Odometry {
    /// Seconds since the unix epoch
    pub stamp: f64,
    pub frame_id: String,
    pub child_frame_id: String,
    pub x: f64,
    pub y: f64,
    pub orientation: Quaternion,
    pub linear: f64,
    pub angular: f64,
}

impl Odometry {
    pub fn new(stamp: f64, frames: &Frames, pose: Pose, v: f64, w: f64) -> Self {
        Self {
            stamp,
            frame_id: frames.odom.clone(),
            child_frame_id: frames.base.clone(),
            x: pose.x,
            y: pose.y,
            orientation: pose.orientation(),
            linear: v,
            angular: w,
        }
    }

    pub fn pose(&self) -> Pose {
        Pose::new(self.x, self.y, self.orientation.yaw())
    }
}

/// Rigid transform from `frame_id` to `child_frame_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStamped {
    pub stamp: f64,
    pub frame_id: String,
    pub child_frame_id: String,
    pub translation: [f64; 3],
    pub rotation: Quaternion,
}

impl TransformStamped {
    /// The odom -> base transform for `pose`, stamped like its odometry
    pub fn from_odometry(odom: &Odometry) -> Self {
        Self {
            stamp: odom.stamp,
            frame_id: odom.frame_id.clone(),
            child_frame_id: odom.child_frame_id.clone(),
            translation: [odom.x, odom.y, 0.0],
            rotation: odom.orientation,
        }
    }
}

/// Stamped pose, used for simulator ground truth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseStamped {
    pub stamp: f64,
    pub frame_id: String,
    pub x: f64,
    pub y: f64,
    pub orientation: Quaternion,
}

/// Absolute pose overwrite, e.g. from a localization system
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseReset {
    pub x: f64,
    pub y: f64,
    pub orientation: Quaternion,
}

impl PoseReset {
    pub fn pose(&self) -> Pose {
        Pose::new(self.x, self.y, self.orientation.yaw())
    }
}

impl From<Pose> for PoseReset {
    fn from(pose: Pose) -> Self {
        Self {
            x: pose.x,
            y: pose.y,
            orientation: pose.orientation(),
        }
    }
}

/// Setpoints and measurements of both motors, refreshed every cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorState {
    /// Commanded linear / angular velocity
    pub v_sp: f64,
    pub w_sp: f64,
    /// Commanded wheel speeds (m/s, sign corrected)
    pub left_sp: f64,
    pub right_sp: f64,
    /// Commanded wheel speeds (quad pulses/s)
    pub left_qpps_sp: i32,
    pub right_qpps_sp: i32,
    /// Measured wheel speeds (quad pulses/s, raw from controller)
    pub left_qpps: i32,
    pub right_qpps: i32,
    /// Measured wheel speeds (m/s)
    pub left: f64,
    pub right: f64,
    /// Measured linear / angular velocity
    pub v: f64,
    pub w: f64,
}

/// Names of the two frames the odometry connects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frames {
    pub odom: String,
    pub base: String,
}

/// Runtime reconfiguration for the drive node. Applied as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconfigure {
    pub odom_frame: String,
    pub base_frame: String,
    /// Loop frequency (Hz)
    pub freq: f64,
    pub constants: MotorConstants,
}

/// Seconds since the unix epoch, for message stamps
pub fn now_stamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
