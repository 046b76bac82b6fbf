// Defaults, startup configuration and config file loading
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::ConfigError;
use crate::messages::Frames;
use crate::motor::{MotorConstants, WheelSigns};
use crate::odometry::Pose;

// Drive loop frequency (read speeds, integrate, publish)
pub const DEFAULT_LOOP_HZ: f64 = 30.0;

// Simulator rates
pub const DEFAULT_SIM_INTEGRATE_HZ: f64 = 50.0;
pub const DEFAULT_SIM_PUBLISH_HZ: f64 = 10.0;

// Motor controller link
pub const DEFAULT_PORT: &str = "/dev/roboclaw";
pub const DEFAULT_ADDRESS: u8 = 0x80;

// Connect retry: try every 250ms, warn at most every 10s
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);
pub const CONNECT_WARN_INTERVAL: Duration = Duration::from_secs(10);

// Consecutive link failures before the link is reset
pub const FAILURE_THRESHOLD: u32 = 5;

// Wheel & motor defaults
pub const DEFAULT_AXLE_WIDTH: f64 = 0.255;
pub const DEFAULT_WHEEL_DIAMETER: f64 = 0.1;
pub const DEFAULT_MIN_WHEEL_SPEED: f64 = 0.0;
pub const DEFAULT_MAX_WHEEL_SPEED: f64 = 0.8;
pub const DEFAULT_ACCEL_MAX: f64 = 1.0;
pub const DEFAULT_PULSES_PER_MOTOR_REV: f64 = 2000.0;
pub const DEFAULT_GEAR_RATIO: f64 = 40.0;
pub const DEFAULT_PID_P: u32 = 15000;
pub const DEFAULT_PID_I: u32 = 0x0250;
pub const DEFAULT_PID_D: u32 = 500;
pub const DEFAULT_PID_QPPS: u32 = 300_000;
pub const DEFAULT_LEFT_SIGN: i32 = -1;
pub const DEFAULT_RIGHT_SIGN: i32 = 1;

// Frames
pub const DEFAULT_ODOM_FRAME: &str = "odom";
pub const DEFAULT_BASE_FRAME: &str = "base";
pub const DEFAULT_SIM_ODOM_FRAME: &str = "/odom";
pub const DEFAULT_SIM_BASE_FRAME: &str = "/base_link";

// Zenoh key namespace of the drive node
pub const DEFAULT_NAMESPACE: &str = "robot";

/// Startup configuration of the hardware drive node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub port: String,
    pub address: u8,
    pub namespace: String,
    pub odom_frame: String,
    pub base_frame: String,
    pub freq: f64,
    #[serde(flatten)]
    pub signs: WheelSigns,
    pub constants: MotorConstants,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            address: DEFAULT_ADDRESS,
            namespace: DEFAULT_NAMESPACE.to_string(),
            odom_frame: DEFAULT_ODOM_FRAME.to_string(),
            base_frame: DEFAULT_BASE_FRAME.to_string(),
            freq: DEFAULT_LOOP_HZ,
            signs: WheelSigns::default(),
            constants: MotorConstants::default(),
        }
    }
}

impl DriveConfig {
    pub fn frames(&self) -> Frames {
        Frames {
            odom: self.odom_frame.clone(),
            base: self.base_frame.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_freq("freq", self.freq)?;
        self.signs.validate()?;
        self.constants.validate()
    }
}

/// One simulated agent; both fields fall back to index based defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: Option<String>,
    /// Initial pose as "x y heading"
    pub initial: Option<String>,
}

/// Startup configuration of the kinematic simulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub num_agents: usize,
    pub agents: Vec<AgentConfig>,
    pub odom_frame: String,
    pub base_frame: String,
    /// Integration rate (Hz)
    pub freq: f64,
    /// Publish rate (Hz)
    pub publish_freq: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_agents: 0,
            agents: Vec::new(),
            odom_frame: DEFAULT_SIM_ODOM_FRAME.to_string(),
            base_frame: DEFAULT_SIM_BASE_FRAME.to_string(),
            freq: DEFAULT_SIM_INTEGRATE_HZ,
            publish_freq: DEFAULT_SIM_PUBLISH_HZ,
        }
    }
}

/// A fully resolved agent: name, start pose and its own frame names
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSpec {
    pub name: String,
    pub initial: Pose,
    pub frames: Frames,
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_freq("freq", self.freq)?;
        validate_freq("publish_freq", self.publish_freq)
    }

    /// Resolve `num_agents` entries, defaulting to `agent<i>` at the origin
    pub fn agent_specs(&self) -> Result<Vec<AgentSpec>, ConfigError> {
        (0..self.num_agents)
            .map(|i| {
                let entry = self.agents.get(i).cloned().unwrap_or_default();
                let name = entry.name.unwrap_or_else(|| format!("agent{}", i));
                let initial = match entry.initial {
                    Some(text) => text.parse()?,
                    None => Pose::default(),
                };
                let frames = Frames {
                    odom: format!("{}{}", name, with_leading_slash(&self.odom_frame)),
                    base: format!("{}{}", name, with_leading_slash(&self.base_frame)),
                };
                Ok(AgentSpec {
                    name,
                    initial,
                    frames,
                })
            })
            .collect()
    }
}

fn with_leading_slash(frame: &str) -> String {
    if frame.starts_with('/') {
        frame.to_string()
    } else {
        format!("/{}", frame)
    }
}

pub(crate) fn validate_freq(name: &'static str, freq: f64) -> Result<(), ConfigError> {
    if freq > 0.0 && freq.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidConstant {
            name,
            reason: format!("frequency must be positive, got {}", freq),
        })
    }
}

/// Period of a loop running at `freq` Hz
pub fn period(freq: f64) -> Duration {
    Duration::from_secs_f64(1.0 / freq)
}

/// Load a JSON config file; a missing path means all defaults
pub fn load<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T, ConfigError> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}
