// Motor controller for the differential-drive base
//
// Combines kinematics, pulse calibration and a `MotorLink` into the
// command / poll API the drive loop uses. Link failures never reach the
// caller: they are counted, and enough of them in a row resets the link.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::constants::{Calibration, MotorConstants, WheelSigns};
use super::kinematics::{WheelSpeeds, vw_to_wheel_speeds, wheel_speeds_to_vw};
use super::link::{Channel, MotorLink};
use crate::config::{CONNECT_RETRY_INTERVAL, CONNECT_WARN_INTERVAL, FAILURE_THRESHOLD};
use crate::error::ConfigError;
use crate::messages::MotorState;

/// How the blocking connect loop paces itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait between open attempts
    pub check_every: Duration,
    /// Minimum spacing of "still not connected" warnings
    pub notify_every: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            check_every: CONNECT_RETRY_INTERVAL,
            notify_every: CONNECT_WARN_INTERVAL,
        }
    }
}

/// Two-channel motor controller driving the left (M1) and right (M2) wheels
pub struct MotorController<L: MotorLink> {
    link: L,
    calibration: Calibration,
    signs: WheelSigns,
    retry: RetryPolicy,
    running: Arc<AtomicBool>,
    connected: bool,
    failures: u32,
    recoveries: u32,
    state: MotorState,
}

impl<L: MotorLink> MotorController<L> {
    /// Create a controller around an unopened link. Nothing is sent until
    /// [`MotorController::connect`].
    pub fn new(
        link: L,
        constants: MotorConstants,
        signs: WheelSigns,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            link,
            calibration: Calibration::new(constants),
            signs,
            retry: RetryPolicy::default(),
            running,
            connected: false,
            failures: 0,
            recoveries: 0,
            state: MotorState::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Open the link (blocking until it opens or shutdown), push the PID
    /// constants and stop the wheels.
    ///
    /// Returns false only if shutdown was requested while connecting.
    pub fn connect(&mut self) -> bool {
        if !self.open_blocking() {
            return false;
        }
        self.configure();
        self.command(0.0, 0.0);
        true
    }

    /// Push PID gains and target pulse rate to both channels
    pub fn configure(&mut self) {
        let pid = self.calibration.constants().pid;
        info!(
            "Setting PID params: P={} I={} D={} QPPS={}",
            pid.p, pid.i, pid.d, pid.qpps
        );
        for channel in Channel::BOTH {
            if let Err(e) = self.link.set_velocity_pid(channel, &pid) {
                warn!("Problem setting PID on {:?} (error={})", channel, e);
                self.record_failure();
            }
        }
    }

    /// Command the base to a linear (m/s) and angular (rad/s) velocity
    pub fn command(&mut self, v: f64, w: f64) -> MotorState {
        let wheels = vw_to_wheel_speeds(v, w, self.calibration.constants(), self.signs);

        self.state.v_sp = v;
        self.state.w_sp = w;
        self.state.left_sp = wheels.left;
        self.state.right_sp = wheels.right;
        self.state.left_qpps_sp = self.calibration.to_pulses(wheels.left);
        self.state.right_qpps_sp = self.calibration.to_pulses(wheels.right);

        let accel = self.calibration.accel_max_pulses();
        let targets = [
            (Channel::M1, self.state.left_qpps_sp),
            (Channel::M2, self.state.right_qpps_sp),
        ];

        let mut all_ok = true;
        for (channel, speed) in targets {
            if let Err(e) = self.link.speed_accel(channel, accel, speed) {
                warn!("Problem with SpeedAccel on {:?} (error={})", channel, e);
                all_ok = false;
                self.record_failure();
            }
        }
        if all_ok {
            self.failures = 0;
        }

        self.state
    }

    /// Read measured wheel speeds and refresh the measured part of the state.
    ///
    /// Returns false if the read failed; the previous measurement is kept.
    pub fn poll(&mut self) -> bool {
        let mut measured = [0i32; 2];
        for (slot, channel) in measured.iter_mut().zip(Channel::BOTH) {
            match self.link.read_speed(channel) {
                Ok(reading) if reading.is_usable() => *slot = reading.pulses_per_sec,
                Ok(reading) => {
                    warn!(
                        "Invalid data from {:?} (status={}, valid={})",
                        channel, reading.status, reading.valid
                    );
                    self.record_failure();
                    return false;
                }
                Err(e) => {
                    warn!("Problem reading {:?} speed (error={})", channel, e);
                    self.record_failure();
                    return false;
                }
            }
        }

        let [left_qpps, right_qpps] = measured;
        let wheels = WheelSpeeds::new(
            self.signs.left as f64 * self.calibration.to_speed(left_qpps),
            self.signs.right as f64 * self.calibration.to_speed(right_qpps),
        );
        let (v, w) = wheel_speeds_to_vw(wheels, self.calibration.constants().axle_width);

        self.state.left_qpps = left_qpps;
        self.state.right_qpps = right_qpps;
        self.state.left = wheels.left;
        self.state.right = wheels.right;
        self.state.v = v;
        self.state.w = w;
        self.failures = 0;
        true
    }

    /// Count one link failure; at the threshold, reset and reopen the link.
    ///
    /// Returns true if a recovery was performed.
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        if self.failures < FAILURE_THRESHOLD {
            return false;
        }

        error!(
            "{} consecutive errors from {}, restarting link",
            self.failures,
            self.link.name()
        );
        self.link.reset();
        self.connected = false;
        if self.open_blocking() {
            // No failure counting in here, a failed push must not recurse
            let pid = self.calibration.constants().pid;
            for channel in Channel::BOTH {
                if let Err(e) = self.link.set_velocity_pid(channel, &pid) {
                    warn!("Problem setting PID on {:?} after restart (error={})", channel, e);
                }
            }
        }
        self.failures = 0;
        self.recoveries += 1;
        true
    }

    /// Replace all constants at once. PID constants are pushed to the
    /// hardware only if they changed.
    pub fn reconfigure(&mut self, constants: MotorConstants) -> Result<(), ConfigError> {
        constants.validate()?;

        let pid_changed = constants.pid != self.calibration.constants().pid;
        info!("Updating wheel & motor params");
        self.calibration = Calibration::new(constants);
        if pid_changed {
            self.configure();
        }
        Ok(())
    }

    /// Send zero speed to both channels without counting failures
    pub fn stop(&mut self) {
        for channel in Channel::BOTH {
            if let Err(e) = self.link.speed_accel(channel, self.calibration.accel_max_pulses(), 0) {
                warn!("Failed to stop {:?}: {}", channel, e);
            }
        }
    }

    /// Keep trying to open the link until it opens or shutdown is requested
    fn open_blocking(&mut self) -> bool {
        let name = self.link.name().to_string();
        info!("Connecting to {}...", name);

        let start = Instant::now();
        let mut last_warn: Option<Instant> = None;
        let mut last_msg = String::new();

        while self.running.load(Ordering::SeqCst) {
            match self.link.open() {
                Ok(()) => {
                    info!("Connected to {}", name);
                    self.connected = true;
                    return true;
                }
                Err(e) => last_msg = e.to_string(),
            }

            thread::sleep(self.retry.check_every);

            let waited = start.elapsed();
            let due = last_warn.is_none_or(|at| at.elapsed() >= self.retry.notify_every);
            if waited > self.retry.notify_every && due {
                warn!(
                    "Haven't connected to {} in {:.2} seconds. Last error={}",
                    name,
                    waited.as_secs_f64(),
                    last_msg
                );
                last_warn = Some(Instant::now());
            }
        }

        warn!("Shutdown requested while connecting to {}", name);
        false
    }

    pub fn state(&self) -> MotorState {
        self.state
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn recoveries(&self) -> u32 {
        self.recoveries
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl<L: MotorLink> Drop for MotorController<L> {
    fn drop(&mut self) {
        // Leave the wheels stopped
        if self.connected {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::constants::VelocityPid;
    use crate::motor::mock::MockLink;

    const FAST: RetryPolicy = RetryPolicy {
        check_every: Duration::from_millis(1),
        notify_every: Duration::from_millis(5),
    };

    fn running() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    fn connected(link: &MockLink) -> MotorController<MockLink> {
        let mut motor = MotorController::new(
            link.clone(),
            MotorConstants::default(),
            WheelSigns::default(),
            running(),
        )
        .with_retry(FAST);
        assert!(motor.connect());
        motor
    }

    #[test]
    fn test_connect_configures_and_stops() {
        let link = MockLink::new();
        let motor = connected(&link);
        assert!(motor.is_connected());
        assert_eq!(link.pid_writes(), 2);
        assert_eq!(link.last_speeds(), Some((0, 0)));
        assert_eq!(motor.failures(), 0);
    }

    #[test]
    fn test_connect_retries_until_open() {
        let link = MockLink::new();
        link.with(|inner| inner.failing_opens = 3);
        let _motor = connected(&link);
        assert_eq!(link.with(|inner| inner.open_attempts), 4);
    }

    #[test]
    fn test_connect_gives_up_on_shutdown() {
        let link = MockLink::new();
        link.with(|inner| inner.failing_opens = u32::MAX);
        let flag = running();
        let mut motor = MotorController::new(
            link.clone(),
            MotorConstants::default(),
            WheelSigns::default(),
            flag.clone(),
        )
        .with_retry(FAST);

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            flag.store(false, Ordering::SeqCst);
        });
        assert!(!motor.connect());
        stopper.join().unwrap();
        assert!(!motor.is_connected());
        assert!(link.with(|inner| inner.open_attempts) > 1);
    }

    #[test]
    fn test_command_converts_to_pulses() {
        let link = MockLink::new();
        let mut motor = connected(&link);
        let state = motor.command(0.4, 0.0);

        let ppm = motor.calibration().pulses_per_meter();
        let expected = (0.4 * ppm).round() as i32;
        // Default wiring: left wheel reversed
        assert!((state.left_sp + 0.4).abs() < 1e-9);
        assert!((state.right_sp - 0.4).abs() < 1e-9);
        assert_eq!(state.left_qpps_sp, -expected);
        assert_eq!(state.right_qpps_sp, expected);
        assert_eq!(link.last_speeds(), Some((-expected, expected)));

        let accel = link.with(|inner| inner.speed_commands.last().map(|c| c.1));
        assert_eq!(accel, Some(motor.calibration().accel_max_pulses()));
    }

    #[test]
    fn test_poll_converts_measured_speeds() {
        let link = MockLink::new();
        let mut motor = connected(&link);
        let ppm = motor.calibration().pulses_per_meter();

        // Left is wired reversed, so both of these mean forward
        let left_raw = -(0.2 * ppm).round() as i32;
        let right_raw = (0.8 * ppm).round() as i32;
        link.push_reading(left_raw, 1, true);
        link.push_reading(right_raw, 0, true);

        assert!(motor.poll());
        let state = motor.state();
        assert_eq!(state.left_qpps, left_raw);
        assert_eq!(state.right_qpps, right_raw);
        assert!((state.left - 0.2).abs() < 1e-4);
        assert!((state.right - 0.8).abs() < 1e-4);
        assert!((state.v - 0.5).abs() < 1e-4);
        assert!((state.w - 0.6 / 0.255).abs() < 1e-3);
    }

    #[test]
    fn test_invalid_reading_counts_as_failure_and_holds_state() {
        let link = MockLink::new();
        let mut motor = connected(&link);
        link.push_reading(1000, 0, true);
        link.push_reading(1000, 0, true);
        assert!(motor.poll());
        let before = motor.state();

        link.push_reading(5000, 7, true);
        assert!(!motor.poll());
        assert_eq!(motor.failures(), 1);
        assert_eq!(motor.state(), before);

        link.push_reading(5000, 0, false);
        assert!(!motor.poll());
        assert_eq!(motor.failures(), 2);
        assert_eq!(motor.state(), before);
    }

    #[test]
    fn test_five_failures_trigger_one_recovery() {
        let link = MockLink::new();
        let mut motor = connected(&link);
        let pid_before = link.pid_writes();

        for _ in 0..4 {
            link.push_read_error();
            assert!(!motor.poll());
        }
        assert_eq!(motor.failures(), 4);
        assert_eq!(link.resets(), 0);

        link.push_read_error();
        assert!(!motor.poll());
        assert_eq!(link.resets(), 1);
        assert_eq!(motor.recoveries(), 1);
        assert_eq!(motor.failures(), 0);
        assert!(motor.is_connected());
        assert_eq!(link.pid_writes(), pid_before + 2);
    }

    #[test]
    fn test_recovery_retries_reopen_until_success() {
        let link = MockLink::new();
        let mut motor = connected(&link);
        let pid_before = link.pid_writes();

        for _ in 0..4 {
            link.push_read_error();
            motor.poll();
        }
        let attempts_before = link.with(|inner| inner.open_attempts);
        link.with(|inner| inner.failing_opens = 3);

        link.push_read_error();
        assert!(!motor.poll());
        assert_eq!(link.with(|inner| inner.open_attempts), attempts_before + 4);
        assert_eq!(link.resets(), 1);
        assert!(motor.is_connected());
        assert_eq!(motor.failures(), 0);
        assert_eq!(link.pid_writes(), pid_before + 2);
    }

    #[test]
    fn test_recovery_gives_up_on_shutdown() {
        let link = MockLink::new();
        let flag = running();
        let mut motor = MotorController::new(
            link.clone(),
            MotorConstants::default(),
            WheelSigns::default(),
            flag.clone(),
        )
        .with_retry(FAST);
        assert!(motor.connect());
        let pid_before = link.pid_writes();

        for _ in 0..4 {
            link.push_read_error();
            motor.poll();
        }
        link.with(|inner| inner.failing_opens = u32::MAX);

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            flag.store(false, Ordering::SeqCst);
        });
        link.push_read_error();
        assert!(!motor.poll());
        stopper.join().unwrap();

        assert!(!motor.is_connected());
        assert_eq!(motor.failures(), 0);
        assert_eq!(link.resets(), 1);
        assert!(link.with(|inner| inner.open_attempts) > 2);
        assert_eq!(link.pid_writes(), pid_before);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let link = MockLink::new();
        let mut motor = connected(&link);

        for _ in 0..4 {
            link.push_read_error();
            motor.poll();
        }
        assert!(motor.poll());
        assert_eq!(motor.failures(), 0);

        for _ in 0..4 {
            link.push_read_error();
            motor.poll();
        }
        assert_eq!(link.resets(), 0);
        assert_eq!(motor.failures(), 4);
    }

    #[test]
    fn test_each_failed_channel_write_counts() {
        let link = MockLink::new();
        let mut motor = connected(&link);
        link.with(|inner| inner.fail_writes = true);

        motor.command(0.1, 0.0);
        assert_eq!(motor.failures(), 2);
        motor.command(0.1, 0.0);
        assert_eq!(motor.failures(), 4);

        // Fifth failure restarts, the sixth starts a fresh count
        motor.command(0.1, 0.0);
        assert_eq!(link.resets(), 1);
        assert_eq!(motor.failures(), 1);
    }

    #[test]
    fn test_reconfigure_pushes_pid_only_when_changed() {
        let link = MockLink::new();
        let mut motor = connected(&link);
        let before = link.pid_writes();
        let old_ppm = motor.calibration().pulses_per_meter();

        let geometry_only = MotorConstants {
            wheel_diameter: 0.2,
            ..MotorConstants::default()
        };
        motor.reconfigure(geometry_only).unwrap();
        assert_eq!(link.pid_writes(), before);
        assert!((motor.calibration().pulses_per_meter() * 2.0 - old_ppm).abs() < 1e-6);

        let new_pid = MotorConstants {
            pid: VelocityPid {
                p: 20000,
                ..VelocityPid::default()
            },
            ..geometry_only
        };
        motor.reconfigure(new_pid).unwrap();
        assert_eq!(link.pid_writes(), before + 2);
        assert_eq!(link.with(|inner| inner.pid_writes.last().map(|w| w.1.p)), Some(20000));
    }

    #[test]
    fn test_reconfigure_rejects_invalid_constants() {
        let link = MockLink::new();
        let mut motor = connected(&link);
        let before = *motor.calibration();
        let bad = MotorConstants {
            axle_width: -1.0,
            ..MotorConstants::default()
        };
        assert!(motor.reconfigure(bad).is_err());
        assert_eq!(*motor.calibration(), before);
    }

    #[test]
    fn test_drop_stops_wheels() {
        let link = MockLink::new();
        let mut motor = connected(&link);
        motor.command(0.3, 0.0);
        drop(motor);
        assert_eq!(link.last_speeds(), Some((0, 0)));
    }
}
