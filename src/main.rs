use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use strider::gait_config::GaitConfig;
use strider::utilities;
use strider::walk_engine::{LoggingJointSink, MotionController, WalkProvider, WalkVector};

/// Bipedal walk engine
///
/// Runs the gait at the motion frame cadence and reports the resulting
/// odometry. Without hardware attached the joint frames are only logged.
#[derive(Parser)]
#[command(version, author = "David Weis <dweis7@gmail.com>")]
struct Args {
    /// Path to the gait config file (.yaml).
    /// If unset uses built-in defaults.
    #[arg(long)]
    gait_config: Option<String>,
    /// Forward velocity in mm/s
    #[arg(long, default_value_t = 40.0)]
    forward: f32,
    /// Lateral velocity in mm/s, positive to the left
    #[arg(long, default_value_t = 0.0)]
    lateral: f32,
    /// Turn velocity in rad/s, positive counterclockwise
    #[arg(long, default_value_t = 0.0)]
    turn: f32,
    /// How long to walk before stopping, in seconds
    #[arg(long, default_value_t = 5.0)]
    seconds: f32,
    /// Sets the level of verbosity
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    utilities::setup_tracing(args.verbose);
    info!("Started walk engine");

    let gait = match &args.gait_config {
        Some(path) => GaitConfig::load(Path::new(path))?,
        None => GaitConfig::default(),
    };
    gait.validate()?;

    let provider = WalkProvider::new(Arc::new(gait));
    let stance = provider.walk_stance()?;
    info!(angles = ?stance.angles(), "stance pose ready");

    let controller = MotionController::start(provider, Box::new(LoggingJointSink));
    controller.set_command(WalkVector::new(args.forward, args.lateral, args.turn));
    info!(
        forward = args.forward,
        lateral = args.lateral,
        turn = args.turn,
        "walking"
    );

    tokio::time::sleep(Duration::from_secs_f32(args.seconds)).await;
    controller.set_command(WalkVector::ZERO);
    info!("stopping");

    let mut state = controller.state_receiver();
    let settle = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if !state.borrow().active {
                break;
            }
            if state.changed().await.is_err() {
                break;
            }
        }
    });
    if settle.await.is_err() {
        warn!("gait did not settle before the timeout");
    }

    let odometry = controller.state().odometry;
    info!(
        x = odometry.x,
        y = odometry.y,
        theta = odometry.theta,
        "walk finished"
    );
    controller.shutdown().await?;
    Ok(())
}
