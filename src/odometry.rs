// Closed-form odometry integration for a differential-drive base
//
// Shared by the hardware drive loop (integrating measured v/w) and the
// kinematic simulator (integrating commanded v/w).

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::ConfigError;

/// Time gaps longer than this are treated as a clock gap and not integrated
pub const STALE_DT_SECS: f64 = 10.0;

/// Value a NaN pose coordinate is reset to
pub const NAN_SENTINEL: f64 = -1.0;

/// Planar pose estimate. Heading is in radians and is never wrapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Self { x, y, heading }
    }

    pub fn orientation(&self) -> Quaternion {
        Quaternion::from_yaw(self.heading)
    }
}

/// Parses the "x y heading" form used for simulator initial poses
impl FromStr for Pose {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values: Vec<f64> = s
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|_| ConfigError::MalformedPose(s.to_string()))?;

        match values.as_slice() {
            [x, y, heading] => Ok(Pose::new(*x, *y, *heading)),
            _ => Err(ConfigError::MalformedPose(s.to_string())),
        }
    }
}

/// Unit quaternion, only ever a rotation about the vertical axis here
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quaternion {
    pub fn from_yaw(yaw: f64) -> Self {
        let half = yaw / 2.0;
        Self {
            x: 0.0,
            y: 0.0,
            z: half.sin(),
            w: half.cos(),
        }
    }

    /// Rotation about z, in (-pi, pi]
    pub fn yaw(&self) -> f64 {
        let siny_cosp = 2.0 * (self.w * self.z + self.x * self.y);
        let cosy_cosp = 1.0 - 2.0 * (self.y * self.y + self.z * self.z);
        siny_cosp.atan2(cosy_cosp)
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::from_yaw(0.0)
    }
}

/// Advance `pose` by driving at `v` m/s and `w` rad/s for `dt` seconds.
///
/// Uses the Taylor expansion of the exact unicycle solution to second order
/// in the turn, which drifts far less than Euler steps at low loop rates.
/// A `dt` beyond [`STALE_DT_SECS`] is a clock gap and leaves the pose as is.
pub fn integrate(pose: Pose, v: f64, w: f64, dt: f64) -> Pose {
    if dt > STALE_DT_SECS {
        return pose;
    }

    let dt2 = dt * dt;
    let dx = v * (dt - w * w * dt2 * dt / 6.0);
    let dy = v * (w * dt2 / 2.0 - w * w * w * dt2 * dt2 / 24.0);
    let dth = w * dt;

    let (sin_th, cos_th) = pose.heading.sin_cos();
    Pose {
        x: pose.x + dx * cos_th - dy * sin_th,
        y: pose.y + dx * sin_th + dy * cos_th,
        heading: pose.heading + dth,
    }
}

/// Reset any NaN coordinate to [`NAN_SENTINEL`], logging which one.
///
/// Returns true if anything was reset. This does not recover the true pose,
/// it only stops NaN from spreading through every later integration.
pub fn sanitize(pose: &mut Pose, who: &str, v: f64, w: f64) -> bool {
    let mut faulted = false;
    for (label, coord) in [
        ("x", &mut pose.x),
        ("y", &mut pose.y),
        ("heading", &mut pose.heading),
    ] {
        if coord.is_nan() {
            error!("[{}] pose {} is NaN (v={}, w={}), resetting to {}", who, label, v, w, NAN_SENTINEL);
            *coord = NAN_SENTINEL;
            faulted = true;
        }
    }
    faulted
}
