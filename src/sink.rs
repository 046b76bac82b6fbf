// Outbound side of the runtime: where odometry, transforms and telemetry go
//
// The control loops only depend on this trait; the zenoh runtime provides
// the real implementation.

use crate::messages::{MotorState, Odometry, PoseStamped, TransformStamped};

pub trait OdometrySink: Send + Sync {
    fn odometry(&self, odom: &Odometry);

    fn transform(&self, tf: &TransformStamped);

    fn motor_state(&self, _state: &MotorState) {}

    fn ground_truth(&self, _pose: &PoseStamped) {}
}

#[cfg(test)]
pub(crate) use recording::RecordingSink;
