// Kinematic simulator: N virtual differential-drive robots, no hardware
//
// Each agent integrates its latest commanded velocity on one thread and
// publishes its pose on another, each at its own rate, so a slow publish
// never throttles integration and a slow agent never stalls the others.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{AgentSpec, SimConfig, period, validate_freq};
use crate::error::ConfigError;
use crate::lock;
use crate::messages::{Frames, Odometry, PoseStamped, TransformStamped, VelocityCommand, now_stamp};
use crate::odometry::{Pose, integrate, sanitize};
use crate::sink::OdometrySink;

struct AgentState {
    pose: Pose,
    last_integration: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rates {
    /// Integration rate (Hz)
    pub integrate: f64,
    /// Publish rate (Hz)
    pub publish: f64,
}

/// One simulated robot
pub struct SimAgent {
    name: String,
    frames: Frames,
    state: Mutex<AgentState>,
    velocity: Mutex<VelocityCommand>,
    rates: Mutex<Rates>,
    sink: Arc<dyn OdometrySink>,
}

impl SimAgent {
    pub fn new(spec: AgentSpec, rates: Rates, sink: Arc<dyn OdometrySink>) -> Self {
        Self {
            name: spec.name,
            frames: spec.frames,
            state: Mutex::new(AgentState {
                pose: spec.initial,
                last_integration: Instant::now(),
            }),
            velocity: Mutex::new(VelocityCommand::default()),
            rates: Mutex::new(rates),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frames(&self) -> &Frames {
        &self.frames
    }

    pub fn pose(&self) -> Pose {
        lock(&self.state).pose
    }

    pub fn velocity(&self) -> VelocityCommand {
        *lock(&self.velocity)
    }

    pub fn rates(&self) -> Rates {
        *lock(&self.rates)
    }

    /// New rates apply from each activity's next tick.
    /// Rejected as a whole if either rate is not positive.
    pub fn set_rates(&self, rates: Rates) -> Result<(), ConfigError> {
        validate_freq("freq", rates.integrate)?;
        validate_freq("publish_freq", rates.publish)?;
        *lock(&self.rates) = rates;
        Ok(())
    }

    pub fn on_velocity(&self, cmd: VelocityCommand) {
        debug!("[{}] Received velocity command: {} {}", self.name, cmd.linear, cmd.angular);
        *lock(&self.velocity) = cmd;
    }

    /// Overwrite the pose, bypassing integration
    pub fn on_pose_reset(&self, pose: Pose) {
        debug!("[{}] Received initial pose: {:?}", self.name, pose);
        lock(&self.state).pose = pose;
    }

    /// Integrate the current command over the time since the previous tick
    pub fn integrate_at(&self, now: Instant) {
        let cmd = self.velocity();

        let mut state = lock(&self.state);
        let dt = now.saturating_duration_since(state.last_integration).as_secs_f64();
        state.last_integration = now;
        state.pose = integrate(state.pose, cmd.linear, cmd.angular, dt);
        sanitize(&mut state.pose, &self.name, cmd.linear, cmd.angular);
    }

    /// Publish odometry, the odom -> base transform and the ground truth pose
    pub fn publish(&self) {
        let cmd = self.velocity();
        let pose = {
            let mut state = lock(&self.state);
            sanitize(&mut state.pose, &self.name, cmd.linear, cmd.angular);
            state.pose
        };

        let odom = Odometry::new(now_stamp(), &self.frames, pose, cmd.linear, cmd.angular);
        self.sink.odometry(&odom);
        self.sink.transform(&TransformStamped::from_odometry(&odom));
        self.sink.ground_truth(&PoseStamped {
            stamp: odom.stamp,
            frame_id: self.frames.odom.clone(),
            x: pose.x,
            y: pose.y,
            orientation: odom.orientation,
        });
    }
}

/// Run `tick` at the rate returned by `freq` until `running` drops
fn spawn_periodic(
    running: Arc<AtomicBool>,
    freq: impl Fn() -> f64 + Send + 'static,
    mut tick: impl FnMut(Instant) + Send + 'static,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            let cycle_start = Instant::now();
            tick(cycle_start);

            let target = period(freq());
            let elapsed = cycle_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }
    })
}

/// Name-keyed set of simulated agents
pub struct SimFleet {
    agents: BTreeMap<String, Arc<SimAgent>>,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl SimFleet {
    /// Build every agent in `config`; `make_sink` gives each its own output
    pub fn new(
        config: &SimConfig,
        running: Arc<AtomicBool>,
        mut make_sink: impl FnMut(&str) -> Arc<dyn OdometrySink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rates = Rates {
            integrate: config.freq,
            publish: config.publish_freq,
        };

        let mut agents = BTreeMap::new();
        for spec in config.agent_specs()? {
            info!(
                "Adding agent: [{}] @ {}, {}, {}",
                spec.name, spec.initial.x, spec.initial.y, spec.initial.heading
            );
            let sink = make_sink(&spec.name);
            let name = spec.name.clone();
            if agents.insert(name.clone(), Arc::new(SimAgent::new(spec, rates, sink))).is_some() {
                warn!("Duplicate agent name [{}], keeping the last one", name);
            }
        }

        Ok(Self {
            agents,
            running,
            handles: Vec::new(),
        })
    }

    /// Start the integration and publish activities of every agent
    pub fn start(&mut self) {
        for agent in self.agents.values() {
            let integrating = Arc::clone(agent);
            let rate_source = Arc::clone(agent);
            self.handles.push(spawn_periodic(
                Arc::clone(&self.running),
                move || rate_source.rates().integrate,
                move |now| integrating.integrate_at(now),
            ));

            let publishing = Arc::clone(agent);
            let rate_source = Arc::clone(agent);
            self.handles.push(spawn_periodic(
                Arc::clone(&self.running),
                move || rate_source.rates().publish,
                move |_| publishing.publish(),
            ));
        }
        info!("Simulating {} agents", self.agents.len());
    }

    /// Stop every activity and wait for all of them to finish
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("A simulator thread panicked");
            }
        }
    }

    pub fn agent(&self, name: &str) -> Option<&Arc<SimAgent>> {
        self.agents.get(name)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<SimAgent>> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Drop for SimFleet {
    fn drop(&mut self) {
        self.stop();
    }
}
