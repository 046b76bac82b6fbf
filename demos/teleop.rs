// Keyboard teleop: W/S drive, A/D turn, R/F speed, Q quit
//
// Usage: cargo run --example teleop -- [namespace]
// Publishes VelocityCommand JSON on <namespace>/cmd_vel (default "robot").
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use diffdrive_zenoh_runtime::messages::VelocityCommand;
use std::time::{Duration, Instant};
use tracing::info;

const SPEEDS: [f64; 3] = [0.1, 0.3, 0.6]; // m/s
const TURN_SPEEDS: [f64; 3] = [0.5, 1.0, 2.0]; // rad/s
const INPUT_TIMEOUT_MS: u64 = 150; // Stop after this long with no input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let namespace = std::env::args().nth(1).unwrap_or_else(|| "robot".to_string());
    let key = format!("{}/cmd_vel", namespace);

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(key.clone()).await?;

    info!("Publishing to {}", key);
    info!("Controls: W/S=drive, A/D=turn, R/F=speed, Q=quit");
    print_speed(0);

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;
    let mut cmd = VelocityCommand::default();
    let mut last_input = Instant::now();

    loop {
        // 20ms poll keeps publishing at ~50Hz
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    KeyCode::Char('w') if pressed => {
                        cmd.linear = SPEEDS[speed_idx];
                        last_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        cmd.linear = -SPEEDS[speed_idx];
                        last_input = Instant::now();
                    }
                    KeyCode::Char('a') if pressed => {
                        cmd.angular = TURN_SPEEDS[speed_idx];
                        last_input = Instant::now();
                    }
                    KeyCode::Char('d') if pressed => {
                        cmd.angular = -TURN_SPEEDS[speed_idx];
                        last_input = Instant::now();
                    }

                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(SPEEDS.len() - 1);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        if last_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            cmd = VelocityCommand::default();
        }

        publisher.put(serde_json::to_string(&cmd)?).await?;
    }

    // Leave the robot stopped
    publisher
        .put(serde_json::to_string(&VelocityCommand::default())?)
        .await?;
    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {} ({} m/s, {} rad/s)", label, SPEEDS[idx], TURN_SPEEDS[idx]);
}
