// Capability interface to a two-channel motor controller
//
// The controller logic only talks to hardware through this trait, so the
// failure counting and recovery paths can be driven by a fake link in tests.

use crate::error::LinkError;

use super::constants::VelocityPid;

/// Motor channel on the controller. M1 drives the left wheel, M2 the right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    M1,
    M2,
}

impl Channel {
    pub const BOTH: [Channel; 2] = [Channel::M1, Channel::M2];
}

/// One speed reading from a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedReading {
    /// Measured speed in quad pulses per second
    pub pulses_per_sec: i32,
    /// Direction/status byte reported by the controller
    pub status: u8,
    /// False when the reply failed its integrity check
    pub valid: bool,
}

impl SpeedReading {
    /// Status 0 is forward and 1 is backward; anything else is garbage
    pub fn is_usable(&self) -> bool {
        self.valid && self.status <= 1
    }
}

pub trait MotorLink: Send {
    /// Human readable name of the link, for logs
    fn name(&self) -> &str;

    /// Open (or reopen) the link. Fails fast; retrying is the caller's job.
    fn open(&mut self) -> Result<(), LinkError>;

    /// Forcibly drop the link so the next `open` starts from scratch
    fn reset(&mut self);

    fn set_velocity_pid(&mut self, channel: Channel, pid: &VelocityPid) -> Result<(), LinkError>;

    /// Drive `channel` at `speed` pulses/s, ramping at `accel` pulses/s^2
    fn speed_accel(&mut self, channel: Channel, accel: u32, speed: i32) -> Result<(), LinkError>;

    fn read_speed(&mut self, channel: Channel) -> Result<SpeedReading, LinkError>;
}
