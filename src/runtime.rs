// Zenoh wiring for the drive node and the simulator
//
// The control loops run on plain threads and never await. Everything they
// publish goes through an unbounded channel to one async task that puts it
// on zenoh; inbound samples are parsed here and handed to the loops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zenoh::sample::Sample;

use crate::config::{DriveConfig, SimConfig};
use crate::drive::DriveLoop;
use crate::messages::{
    MotorState, Odometry, PoseReset, PoseStamped, Reconfigure, TransformStamped, VelocityCommand,
};
use crate::motor::{MotorController, RoboclawLink};
use crate::sim::SimFleet;
use crate::sink::OdometrySink;

type RuntimeResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A serialized message waiting to be put on `key`
struct Outbound {
    key: String,
    payload: String,
}

/// Publishes under `<namespace>/...` through the outbound channel
struct ZenohSink {
    namespace: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ZenohSink {
    fn new(namespace: &str, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            namespace: namespace.trim_matches('/').to_string(),
            tx,
        }
    }

    fn send<T: Serialize>(&self, leaf: &str, msg: &T) {
        let key = format!("{}/{}", self.namespace, leaf);
        match serde_json::to_string(msg) {
            Ok(payload) => {
                if self.tx.send(Outbound { key, payload }).is_err() {
                    debug!("Publisher gone, dropping message for {}", leaf);
                }
            }
            Err(e) => warn!("Failed to serialize {}: {}", key, e),
        }
    }
}

impl OdometrySink for ZenohSink {
    fn odometry(&self, odom: &Odometry) {
        self.send("odom", odom);
    }

    fn transform(&self, tf: &TransformStamped) {
        self.send("tf", tf);
    }

    fn motor_state(&self, state: &MotorState) {
        self.send("motor_state", state);
    }

    fn ground_truth(&self, pose: &PoseStamped) {
        self.send("gt_pose", pose);
    }
}

fn key(namespace: &str, leaf: &str) -> String {
    format!("{}/{}", namespace.trim_matches('/'), leaf)
}

fn parse<T: DeserializeOwned>(sample: &Sample) -> Option<T> {
    let payload = sample.payload().to_bytes();
    match serde_json::from_slice::<T>(&payload) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!("Failed to parse message on {}: {}", sample.key_expr(), e);
            None
        }
    }
}

async fn forward_outbound(session: zenoh::Session, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(out) = rx.recv().await {
        if let Err(e) = session.put(out.key.as_str(), out.payload).await {
            warn!("Failed to publish on {}: {}", out.key, e);
        }
    }
}

/// Run `f` on the blocking pool. A panic in `f` is logged and yields None
/// so the caller's loop carries on to its normal shutdown.
async fn run_blocking<T, F>(what: &str, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Handling {} failed: {}", what, e);
            None
        }
    }
}

/// Flip `running` on Ctrl-C and report it on the returned channel
fn shutdown_signal(running: Arc<AtomicBool>) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Failed to listen for Ctrl-C, shutting down: {}", e),
        }
        running.store(false, Ordering::SeqCst);
        let _ = tx.send(true);
    });
    rx
}

/// Run the hardware drive node until Ctrl-C
pub async fn run_drive(config: DriveConfig) -> RuntimeResult {
    config.validate()?;
    let running = Arc::new(AtomicBool::new(true));
    let mut shutdown = shutdown_signal(running.clone());

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_outbound(session.clone(), rx));

    let sink = Arc::new(ZenohSink::new(&config.namespace, tx));
    let link = RoboclawLink::new(&config.port, config.address);
    let motor = MotorController::new(link, config.constants, config.signs, running.clone());
    let drive = DriveLoop::new(motor, config.frames(), config.freq, sink, running.clone());

    let connector = drive.clone();
    if !tokio::task::spawn_blocking(move || connector.connect()).await? {
        info!("Shutdown before the motor controller connected");
        forwarder.abort();
        return Ok(());
    }
    let loop_thread = drive.spawn();

    let cmd_key = key(&config.namespace, "cmd_vel");
    let reconfigure_key = key(&config.namespace, "reconfigure");
    let cmd_sub = session.declare_subscriber(cmd_key.as_str()).await?;
    let reconfigure_sub = session.declare_subscriber(reconfigure_key.as_str()).await?;

    info!("Drive node started: {}Hz loop on {}", config.freq, config.port);
    info!("Subscribed to: {}, {}", cmd_key, reconfigure_key);

    loop {
        tokio::select! {
            sample = cmd_sub.recv_async() => {
                let Ok(sample) = sample else { break };
                if let Some(cmd) = parse::<VelocityCommand>(&sample) {
                    let drive = drive.clone();
                    run_blocking("velocity command", move || drive.command(cmd)).await;
                }
            }
            sample = reconfigure_sub.recv_async() => {
                let Ok(sample) = sample else { break };
                if let Some(reconfigure) = parse::<Reconfigure>(&sample) {
                    let drive = drive.clone();
                    let result = run_blocking("reconfigure", move || drive.reconfigure(reconfigure)).await;
                    if let Some(Err(e)) = result {
                        warn!("Rejected reconfiguration: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    running.store(false, Ordering::SeqCst);
    // Joining and the final motor stop both block on the serial link
    tokio::task::spawn_blocking(move || {
        if loop_thread.join().is_err() {
            warn!("Drive loop thread panicked");
        }
        drop(drive);
    })
    .await?;

    forwarder.abort();
    info!("Drive node stopped");
    Ok(())
}

/// Run the kinematic simulator until Ctrl-C
pub async fn run_sim(config: SimConfig) -> RuntimeResult {
    let running = Arc::new(AtomicBool::new(true));
    let mut shutdown = shutdown_signal(running.clone());

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_outbound(session.clone(), rx));

    let mut fleet = SimFleet::new(&config, running.clone(), |name| {
        Arc::new(ZenohSink::new(name, tx.clone())) as Arc<dyn OdometrySink>
    })?;
    drop(tx);

    let mut listeners: Vec<JoinHandle<()>> = Vec::new();
    for agent in fleet.agents() {
        let cmd_sub = session.declare_subscriber(key(agent.name(), "cmd_vel")).await?;
        let commanded = Arc::clone(agent);
        listeners.push(tokio::spawn(async move {
            while let Ok(sample) = cmd_sub.recv_async().await {
                if let Some(cmd) = parse::<VelocityCommand>(&sample) {
                    commanded.on_velocity(cmd);
                }
            }
        }));

        let pose_sub = session.declare_subscriber(key(agent.name(), "initialpose")).await?;
        let localized = Arc::clone(agent);
        listeners.push(tokio::spawn(async move {
            while let Ok(sample) = pose_sub.recv_async().await {
                if let Some(reset) = parse::<PoseReset>(&sample) {
                    localized.on_pose_reset(reset.pose());
                }
            }
        }));
    }

    fleet.start();
    info!(
        "Simulator started: {} agents, integrate {}Hz, publish {}Hz",
        fleet.len(),
        config.freq,
        config.publish_freq
    );

    // An error here means the signal task is gone, which also means stop
    let _ = shutdown.changed().await;

    for listener in &listeners {
        listener.abort();
    }
    tokio::task::spawn_blocking(move || fleet.stop()).await?;

    forwarder.abort();
    info!("Simulator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_blocking_returns_value() {
        assert_eq!(run_blocking("sum", || 2 + 2).await, Some(4));
    }

    #[tokio::test]
    async fn test_run_blocking_survives_panic() {
        let result: Option<()> = run_blocking("panic", || panic!("link exploded")).await;
        assert!(result.is_none());

        // The caller can keep going afterwards
        assert_eq!(run_blocking("after", || "ok").await, Some("ok"));
    }

    #[test]
    fn test_key_trims_slashes() {
        assert_eq!(key("/robot0/", "cmd_vel"), "robot0/cmd_vel");
        assert_eq!(key("robot", "odom"), "robot/odom");
    }
}
