//! Differential-drive motion control runtime
//!
//! Turns (v, w) velocity commands into wheel speeds for a RoboClaw motor
//! controller, integrates measured wheel speeds into odometry, and runs a
//! hardware-free kinematic simulator of many robots on the same math.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod drive;
pub mod error;
pub mod messages;
pub mod motor;
pub mod odometry;
pub mod runtime;
pub mod sim;
pub mod sink;

/// Lock a mutex, carrying on with the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
