// Hardware-backed drive loop
//
// Two independently locked partitions:
// - the motor controller (link + constants + motor state), taken by
//   velocity commands and briefly by each poll
// - the odometry state (pose, frames, loop rate), taken by each cycle
// so an inbound command only ever waits for a link transaction, never for
// integration or publishing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, info};

use crate::config::{period, validate_freq};
use crate::error::ConfigError;
use crate::lock;
use crate::messages::{Frames, Odometry, Reconfigure, TransformStamped, VelocityCommand, now_stamp};
use crate::motor::{MotorController, MotorLink};
use crate::odometry::{Pose, integrate, sanitize};
use crate::sink::OdometrySink;

struct OdomState {
    pose: Pose,
    last_update: Instant,
    frames: Frames,
    freq: f64,
}

/// Cloneable handle to one robot's drive loop
pub struct DriveLoop<L: MotorLink> {
    motor: Arc<Mutex<MotorController<L>>>,
    odom: Arc<Mutex<OdomState>>,
    sink: Arc<dyn OdometrySink>,
    running: Arc<AtomicBool>,
}

impl<L: MotorLink> Clone for DriveLoop<L> {
    fn clone(&self) -> Self {
        Self {
            motor: Arc::clone(&self.motor),
            odom: Arc::clone(&self.odom),
            sink: Arc::clone(&self.sink),
            running: Arc::clone(&self.running),
        }
    }
}

impl<L: MotorLink + 'static> DriveLoop<L> {
    /// Odometry starts at the origin
    pub fn new(
        motor: MotorController<L>,
        frames: Frames,
        freq: f64,
        sink: Arc<dyn OdometrySink>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            motor: Arc::new(Mutex::new(motor)),
            odom: Arc::new(Mutex::new(OdomState {
                pose: Pose::default(),
                last_update: Instant::now(),
                frames,
                freq,
            })),
            sink,
            running,
        }
    }

    /// Block until the motor link is open and configured.
    /// Returns false if shutdown was requested first.
    pub fn connect(&self) -> bool {
        let state = {
            let mut motor = lock(&self.motor);
            if !motor.connect() {
                return false;
            }
            motor.state()
        };
        self.sink.motor_state(&state);
        true
    }

    /// Apply a velocity command right away, outside the periodic cycle
    pub fn command(&self, cmd: VelocityCommand) {
        debug!("Got cmd_vel: {:.2} {:.2}", cmd.linear, cmd.angular);
        let state = lock(&self.motor).command(cmd.linear, cmd.angular);
        self.sink.motor_state(&state);
    }

    /// One cycle: poll the motors, integrate, publish odometry + transform
    pub fn cycle_at(&self, now: Instant) {
        let mut guard = lock(&self.odom);
        let odom = &mut *guard;

        let (state, stamp) = {
            let mut motor = lock(&self.motor);
            motor.poll();
            (motor.state(), now_stamp())
        };
        self.sink.motor_state(&state);

        let dt = now.saturating_duration_since(odom.last_update).as_secs_f64();
        odom.last_update = now;
        odom.pose = integrate(odom.pose, state.v, state.w, dt);
        sanitize(&mut odom.pose, &odom.frames.base, state.v, state.w);

        let msg = Odometry::new(stamp, &odom.frames, odom.pose, state.v, state.w);
        self.sink.odometry(&msg);
        self.sink.transform(&TransformStamped::from_odometry(&msg));
    }

    /// Run cycles on a dedicated thread until the running flag drops.
    /// Rate changes take effect at the next cycle boundary.
    pub fn spawn(&self) -> JoinHandle<()> {
        let this = self.clone();
        thread::spawn(move || {
            let mut current_freq = this.freq();
            info!("Drive loop started at {:.1}Hz", current_freq);

            while this.running.load(Ordering::SeqCst) {
                let cycle_start = Instant::now();
                let freq = this.freq();
                if freq != current_freq {
                    info!("Updating rate to {:.3}hz", freq);
                    current_freq = freq;
                }

                this.cycle_at(cycle_start);

                let elapsed = cycle_start.elapsed();
                let target = period(current_freq);
                if elapsed < target {
                    thread::sleep(target - elapsed);
                }
            }

            info!("Drive loop stopped");
        })
    }

    /// Apply a reconfiguration as a whole; nothing changes if it is invalid
    pub fn reconfigure(&self, config: Reconfigure) -> Result<(), ConfigError> {
        validate_freq("freq", config.freq)?;
        config.constants.validate()?;

        // Validate all of it before committing any of it. The two commits
        // below take separate locks, so a cycle in between can see the new
        // frames with the old constants.
        {
            let mut odom = lock(&self.odom);
            if odom.frames.odom != config.odom_frame {
                info!("Setting odom_frame to {}", config.odom_frame);
                odom.frames.odom = config.odom_frame;
            }
            if odom.frames.base != config.base_frame {
                info!("Setting base_frame to {}", config.base_frame);
                odom.frames.base = config.base_frame;
            }
            odom.freq = config.freq;
        }

        lock(&self.motor).reconfigure(config.constants)
    }

    pub fn pose(&self) -> Pose {
        lock(&self.odom).pose
    }

    pub fn frames(&self) -> Frames {
        lock(&self.odom).frames.clone()
    }

    pub fn freq(&self) -> f64 {
        lock(&self.odom).freq
    }

    pub fn motor_failures(&self) -> u32 {
        lock(&self.motor).failures()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::mock::MockLink;
    use crate::motor::{MotorConstants, RetryPolicy, SpeedReading, VelocityPid, WheelSigns};
    use crate::odometry::NAN_SENTINEL;
    use crate::sink::RecordingSink;
    use std::time::Duration;

    fn frames() -> Frames {
        Frames {
            odom: "odom".into(),
            base: "base".into(),
        }
    }

    fn drive_loop(link: &MockLink, freq: f64) -> (DriveLoop<MockLink>, Arc<RecordingSink>, Arc<AtomicBool>) {
        let running = Arc::new(AtomicBool::new(true));
        let motor = MotorController::new(
            link.clone(),
            MotorConstants::default(),
            WheelSigns::default(),
            running.clone(),
        )
        .with_retry(RetryPolicy {
            check_every: Duration::from_millis(1),
            notify_every: Duration::from_millis(5),
        });
        let sink = Arc::new(RecordingSink::default());
        let drive = DriveLoop::new(motor, frames(), freq, sink.clone(), running.clone());
        assert!(drive.connect());
        (drive, sink, running)
    }

    /// Queue enough reads of `speed` m/s forward on both wheels for a few cycles
    fn drive_forward_at(link: &MockLink, speed: f64) {
        let ppm = crate::motor::Calibration::new(MotorConstants::default()).pulses_per_meter();
        let pulses = (speed * ppm).round() as i32;
        // Left is wired reversed by default and reads negative
        link.with(|inner| {
            inner.default_reading = None;
            for _ in 0..8 {
                inner.readings.push_back(Ok(SpeedReading {
                    pulses_per_sec: -pulses,
                    status: 0,
                    valid: true,
                }));
                inner.readings.push_back(Ok(SpeedReading {
                    pulses_per_sec: pulses,
                    status: 0,
                    valid: true,
                }));
            }
        });
    }

    #[test]
    fn test_cycle_integrates_measured_speed() {
        let link = MockLink::new();
        let (drive, sink, _) = drive_loop(&link, 30.0);
        drive_forward_at(&link, 0.5);

        // The first cycle sees a >10s gap and only moves the clock
        let start = Instant::now();
        drive.cycle_at(start + Duration::from_secs(11));
        assert_eq!(drive.pose(), Pose::default());

        drive.cycle_at(start + Duration::from_secs(12));
        let pose = drive.pose();
        assert!((pose.x - 0.5).abs() < 1e-3, "x = {}", pose.x);
        assert!(pose.y.abs() < 1e-9);

        let odom = sink.last_odometry().unwrap();
        assert_eq!(odom.frame_id, "odom");
        assert_eq!(odom.child_frame_id, "base");
        assert!((odom.linear - 0.5).abs() < 1e-3);

        let transforms = sink.transforms.lock().unwrap();
        assert_eq!(transforms.len(), 2);
        assert_eq!(transforms[1].stamp, odom.stamp);
    }

    #[test]
    fn test_failed_poll_keeps_last_velocity() {
        let link = MockLink::new();
        let (drive, sink, _) = drive_loop(&link, 30.0);
        drive_forward_at(&link, 0.5);

        let start = Instant::now();
        drive.cycle_at(start + Duration::from_secs(11));
        link.with(|inner| inner.readings.push_front(Err(())));
        drive.cycle_at(start + Duration::from_secs(12));

        assert_eq!(drive.motor_failures(), 1);
        assert!((sink.last_odometry().unwrap().linear - 0.5).abs() < 1e-3);
        assert!((drive.pose().x - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_command_is_applied_immediately() {
        let link = MockLink::new();
        let (drive, sink, _) = drive_loop(&link, 30.0);
        let published = sink.motor_states.lock().unwrap().len();

        drive.command(VelocityCommand::new(0.3, 0.0));
        let (left, right) = link.last_speeds().unwrap();
        assert!(left < 0 && right > 0);
        assert_eq!(left, -right);

        let states = sink.motor_states.lock().unwrap();
        assert_eq!(states.len(), published + 1);
        assert_eq!(states.last().unwrap().v_sp, 0.3);
    }

    #[test]
    fn test_reconfigure_updates_frames_rate_and_pid() {
        let link = MockLink::new();
        let (drive, _, _) = drive_loop(&link, 30.0);
        let pid_before = link.pid_writes();

        drive
            .reconfigure(Reconfigure {
                odom_frame: "world".into(),
                base_frame: "robot".into(),
                freq: 10.0,
                constants: MotorConstants {
                    pid: VelocityPid {
                        i: 0x300,
                        ..VelocityPid::default()
                    },
                    ..MotorConstants::default()
                },
            })
            .unwrap();

        assert_eq!(drive.frames().odom, "world");
        assert_eq!(drive.frames().base, "robot");
        assert_eq!(drive.freq(), 10.0);
        assert_eq!(link.pid_writes(), pid_before + 2);
    }

    #[test]
    fn test_invalid_reconfigure_changes_nothing() {
        let link = MockLink::new();
        let (drive, _, _) = drive_loop(&link, 30.0);

        let result = drive.reconfigure(Reconfigure {
            odom_frame: "world".into(),
            base_frame: "robot".into(),
            freq: 10.0,
            constants: MotorConstants {
                wheel_diameter: 0.0,
                ..MotorConstants::default()
            },
        });
        assert!(result.is_err());
        assert_eq!(drive.frames(), frames());
        assert_eq!(drive.freq(), 30.0);
    }

    #[test]
    fn test_spawned_loop_publishes_until_stopped() {
        let link = MockLink::new();
        let (drive, sink, running) = drive_loop(&link, 200.0);

        let handle = drive.spawn();
        thread::sleep(Duration::from_millis(100));
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        let published = sink.odometry_count();
        assert!(published > 0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sink.odometry_count(), published);
    }

    #[test]
    fn test_nan_pose_is_reset_before_publishing() {
        let link = MockLink::new();
        let (drive, sink, _) = drive_loop(&link, 30.0);
        {
            let mut odom = lock(&drive.odom);
            odom.pose.x = f64::NAN;
            odom.pose.y = f64::NAN;
        }

        drive.cycle_at(Instant::now());

        let odom = sink.last_odometry().unwrap();
        assert_eq!(odom.x, NAN_SENTINEL);
        assert_eq!(odom.y, NAN_SENTINEL);
        assert_eq!(drive.pose().x, NAN_SENTINEL);
        assert_eq!(drive.pose().y, NAN_SENTINEL);

        let tf = sink.transforms.lock().unwrap().last().cloned().unwrap();
        assert_eq!(tf.translation[0], NAN_SENTINEL);
    }

    #[test]
    fn test_reconfigured_rate_slows_spawned_loop() {
        let link = MockLink::new();
        let (drive, sink, running) = drive_loop(&link, 200.0);
        let handle = drive.spawn();

        thread::sleep(Duration::from_millis(200));
        let fast = sink.odometry_count();
        assert!(fast >= 15, "only {} cycles at 200Hz", fast);

        drive
            .reconfigure(Reconfigure {
                odom_frame: "odom".into(),
                base_frame: "base".into(),
                freq: 10.0,
                constants: MotorConstants::default(),
            })
            .unwrap();

        // Let the cycle already sleeping at the old rate finish
        thread::sleep(Duration::from_millis(50));
        let before = sink.odometry_count();
        thread::sleep(Duration::from_millis(300));
        let slow = sink.odometry_count() - before;

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        assert!(slow <= 6, "{} cycles in 300ms at 10Hz", slow);
    }
}
