// Scriptable in-memory motor link for tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::constants::VelocityPid;
use super::link::{Channel, MotorLink, SpeedReading};
use crate::error::LinkError;

/// Cloneable handle; clones share state so a test can keep one while the
/// controller owns another.
#[derive(Clone, Default)]
pub struct MockLink {
    inner: Arc<Mutex<MockLinkInner>>,
}

#[derive(Default)]
pub struct MockLinkInner {
    pub open: bool,
    pub open_attempts: u32,
    /// Number of upcoming `open` calls that fail
    pub failing_opens: u32,
    pub resets: u32,
    pub pid_writes: Vec<(Channel, VelocityPid)>,
    pub speed_commands: Vec<(Channel, u32, i32)>,
    /// Upcoming read results; when empty, reads return `default_reading`
    pub readings: VecDeque<Result<SpeedReading, ()>>,
    pub default_reading: Option<SpeedReading>,
    /// Fail every write while set
    pub fail_writes: bool,
}

impl MockLink {
    pub fn new() -> Self {
        let link = Self::default();
        link.with(|inner| {
            inner.default_reading = Some(SpeedReading {
                pulses_per_sec: 0,
                status: 0,
                valid: true,
            })
        });
        link
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockLinkInner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner)
    }

    pub fn push_reading(&self, pulses_per_sec: i32, status: u8, valid: bool) {
        self.with(|inner| {
            inner.readings.push_back(Ok(SpeedReading {
                pulses_per_sec,
                status,
                valid,
            }))
        });
    }

    pub fn push_read_error(&self) {
        self.with(|inner| inner.readings.push_back(Err(())));
    }

    pub fn resets(&self) -> u32 {
        self.with(|inner| inner.resets)
    }

    pub fn pid_writes(&self) -> usize {
        self.with(|inner| inner.pid_writes.len())
    }

    pub fn last_speeds(&self) -> Option<(i32, i32)> {
        self.with(|inner| {
            let m1 = inner.speed_commands.iter().rev().find(|c| c.0 == Channel::M1)?;
            let m2 = inner.speed_commands.iter().rev().find(|c| c.0 == Channel::M2)?;
            Some((m1.2, m2.2))
        })
    }
}

fn io_error(what: &str) -> LinkError {
    LinkError::Io(std::io::Error::other(what.to_string()))
}

impl MotorLink for MockLink {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(&mut self) -> Result<(), LinkError> {
        self.with(|inner| {
            inner.open_attempts += 1;
            if inner.failing_opens > 0 {
                inner.failing_opens -= 1;
                return Err(io_error("no such device"));
            }
            inner.open = true;
            Ok(())
        })
    }

    fn reset(&mut self) {
        self.with(|inner| {
            inner.open = false;
            inner.resets += 1;
        });
    }

    fn set_velocity_pid(&mut self, channel: Channel, pid: &VelocityPid) -> Result<(), LinkError> {
        self.with(|inner| {
            if !inner.open || inner.fail_writes {
                return Err(io_error("write failed"));
            }
            inner.pid_writes.push((channel, *pid));
            Ok(())
        })
    }

    fn speed_accel(&mut self, channel: Channel, accel: u32, speed: i32) -> Result<(), LinkError> {
        self.with(|inner| {
            if !inner.open || inner.fail_writes {
                return Err(io_error("write failed"));
            }
            inner.speed_commands.push((channel, accel, speed));
            Ok(())
        })
    }

    fn read_speed(&mut self, _channel: Channel) -> Result<SpeedReading, LinkError> {
        self.with(|inner| {
            if !inner.open {
                return Err(io_error("not open"));
            }
            match inner.readings.pop_front() {
                Some(Ok(reading)) => Ok(reading),
                Some(Err(())) => Err(io_error("read failed")),
                None => inner.default_reading.ok_or_else(|| io_error("no reading")),
            }
        })
    }
}
