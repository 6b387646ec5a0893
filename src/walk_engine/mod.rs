//! The walk engine: command intake, gait orchestration and the motion loop.

pub mod step;
pub mod step_generator;
pub mod walking_leg;

use std::f32::consts::{FRAC_PI_2, PI};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nalgebra::Point3;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{WalkError, WalkResult};
use crate::gait_config::GaitConfig;
use crate::kinematics::{inverse, Leg, HIP_PITCH, LEG_JOINTS};

pub use step::{Step, StepKind, WalkVector};
pub use step_generator::{OdometryDelta, StepGenerator};
pub use walking_leg::{LegJoints, SupportState, WalkingLeg};

/// Cadence of the motion loop.
pub const TICK_DURATION: Duration = Duration::from_millis(20);

pub const ARM_JOINTS: usize = 4;
pub const BODY_JOINTS: usize = 2 * ARM_JOINTS + 2 * LEG_JOINTS;

/// Arms are held in a fixed pose tucked alongside the body while walking.
const LEFT_ARM_POSE: [f32; ARM_JOINTS] = [FRAC_PI_2, PI / 10.0, -FRAC_PI_2, -FRAC_PI_2];
const RIGHT_ARM_POSE: [f32; ARM_JOINTS] = [FRAC_PI_2, -PI / 10.0, FRAC_PI_2, FRAC_PI_2];

/// One motion frame worth of output for every body joint below the head.
#[derive(Debug, Clone, Copy)]
pub struct BodyJoints {
    pub left_arm: [f32; ARM_JOINTS],
    pub left_leg: LegJoints,
    pub right_leg: LegJoints,
    pub right_arm: [f32; ARM_JOINTS],
    pub arm_stiffness: f32,
}

impl BodyJoints {
    /// Joint angles in chain order: left arm, left leg, right leg, right arm.
    pub fn angles(&self) -> [f32; BODY_JOINTS] {
        let mut out = [0.0; BODY_JOINTS];
        out[..ARM_JOINTS].copy_from_slice(&self.left_arm);
        out[ARM_JOINTS..ARM_JOINTS + LEG_JOINTS].copy_from_slice(&self.left_leg.angles);
        out[ARM_JOINTS + LEG_JOINTS..ARM_JOINTS + 2 * LEG_JOINTS]
            .copy_from_slice(&self.right_leg.angles);
        out[ARM_JOINTS + 2 * LEG_JOINTS..].copy_from_slice(&self.right_arm);
        out
    }

    /// Stiffness levels in the same order as [`BodyJoints::angles`].
    pub fn stiffnesses(&self) -> [f32; BODY_JOINTS] {
        let mut out = [self.arm_stiffness; BODY_JOINTS];
        out[ARM_JOINTS..ARM_JOINTS + LEG_JOINTS].copy_from_slice(&self.left_leg.stiffness);
        out[ARM_JOINTS + LEG_JOINTS..ARM_JOINTS + 2 * LEG_JOINTS]
            .copy_from_slice(&self.right_leg.stiffness);
        out
    }
}

/// Single-slot command mailbox, written from any thread, drained by the
/// motion loop at the top of every frame. A newer command replaces an unread
/// older one.
#[derive(Debug, Default)]
pub struct CommandMailbox {
    slot: Mutex<Option<WalkVector>>,
}

impl CommandMailbox {
    pub fn post(&self, command: WalkVector) {
        *self.slot.lock().unwrap() = Some(command);
    }

    pub fn take(&self) -> Option<WalkVector> {
        self.slot.lock().unwrap().take()
    }

    pub fn has_pending(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}

/// A source of joint angles for the motion loop.
pub trait MotionProvider {
    /// Produce the next frame of joint targets. Called once per motion frame.
    fn calculate_next_joints(&mut self) -> BodyJoints;

    /// Whether the provider still wants the loop to keep applying its output.
    fn is_active(&self) -> bool;
}

/// Turns walk commands into per-frame joint targets.
pub struct WalkProvider {
    gait: Arc<GaitConfig>,
    generator: StepGenerator,
    mailbox: Arc<CommandMailbox>,
    active: bool,
}

impl WalkProvider {
    pub fn new(gait: Arc<GaitConfig>) -> WalkProvider {
        WalkProvider {
            generator: StepGenerator::new(gait.clone()),
            gait,
            mailbox: Arc::new(CommandMailbox::default()),
            active: false,
        }
    }

    /// Handle used to post walk commands from outside the motion loop.
    pub fn mailbox(&self) -> Arc<CommandMailbox> {
        self.mailbox.clone()
    }

    pub fn take_odometry(&mut self) -> OdometryDelta {
        self.generator.take_odometry()
    }

    /// Joint targets for standing still at the configured stance, used to
    /// move the robot into position before the gait starts.
    pub fn walk_stance(&self) -> WalkResult<BodyJoints> {
        let stance = &self.gait.stance;
        let mut legs = [LegJoints {
            angles: [0.0; LEG_JOINTS],
            stiffness: [self.gait.stiffness.max; LEG_JOINTS],
        }; 2];
        for (slot, leg) in legs.iter_mut().zip([Leg::Left, Leg::Right]) {
            let goal = Point3::new(
                -stance.hip_offset_x,
                leg.sign() * stance.leg_separation_y * 0.5,
                -stance.body_height,
            );
            let result = inverse::solve_leg(
                leg,
                &goal,
                &[0.0; LEG_JOINTS],
                inverse::DEFAULT_MAX_ERROR_MM,
                inverse::HEEL_MAX_ERROR_MM,
            );
            if result.outcome == inverse::IkOutcome::Stuck {
                return Err(WalkError::InvalidGaitConfig(format!(
                    "stance is not reachable for the {} leg",
                    leg.name()
                )));
            }
            slot.angles = result.angles;
            slot.angles[HIP_PITCH] -= stance.x_angle_offset;
        }
        Ok(BodyJoints {
            left_arm: LEFT_ARM_POSE,
            left_leg: legs[0],
            right_leg: legs[1],
            right_arm: RIGHT_ARM_POSE,
            arm_stiffness: self.gait.stiffness.arm,
        })
    }
}

impl MotionProvider for WalkProvider {
    fn calculate_next_joints(&mut self) -> BodyJoints {
        if let Some(command) = self.mailbox.take() {
            trace!(?command, "walk command accepted");
            self.generator.set_walk_vector(command);
        }
        let (left_leg, right_leg) = self.generator.tick();
        self.active = !self.generator.is_done() || self.mailbox.has_pending();
        BodyJoints {
            left_arm: LEFT_ARM_POSE,
            left_leg,
            right_leg,
            right_arm: RIGHT_ARM_POSE,
            arm_stiffness: self.gait.stiffness.arm,
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

/// Destination for the joint targets produced each motion frame.
#[async_trait]
pub trait JointSink {
    async fn write_joints(&mut self, joints: &BodyJoints) -> WalkResult<()>;
}

/// Sink that only logs, for running the engine without hardware attached.
#[derive(Debug, Default)]
pub struct LoggingJointSink;

#[async_trait]
impl JointSink for LoggingJointSink {
    async fn write_joints(&mut self, joints: &BodyJoints) -> WalkResult<()> {
        trace!(angles = ?joints.angles(), "joint frame");
        Ok(())
    }
}

/// Snapshot of the engine published after every motion frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineState {
    pub active: bool,
    /// Total body displacement since the loop started.
    pub odometry: OdometryDelta,
}

/// Drives a walk provider on the motion frame cadence in a background task.
pub struct MotionController {
    mailbox: Arc<CommandMailbox>,
    stop: Arc<AtomicBool>,
    state_rx: watch::Receiver<EngineState>,
    handle: JoinHandle<WalkResult<()>>,
}

impl MotionController {
    pub fn start(
        mut provider: WalkProvider,
        mut sink: Box<dyn JointSink + Send>,
    ) -> MotionController {
        let mailbox = provider.mailbox();
        let stop = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(EngineState::default());
        let stop_flag = stop.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_DURATION);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut odometry = OdometryDelta::default();
            while !stop_flag.load(Ordering::Relaxed) {
                interval.tick().await;
                let joints = provider.calculate_next_joints();
                sink.write_joints(&joints).await?;
                let delta = provider.take_odometry();
                odometry.x += delta.x;
                odometry.y += delta.y;
                odometry.theta += delta.theta;
                // receivers may come and go, a send failure is not an error
                let _ = state_tx.send(EngineState {
                    active: provider.is_active(),
                    odometry,
                });
            }
            debug!("motion loop stopped");
            Ok(())
        });
        MotionController {
            mailbox,
            stop,
            state_rx,
            handle,
        }
    }

    pub fn set_command(&self, command: WalkVector) {
        self.mailbox.post(command);
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Subscribe to per-frame engine state updates.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub async fn shutdown(self) -> WalkResult<()> {
        self.stop.store(true, Ordering::Relaxed);
        match self.handle.await {
            Ok(result) => result,
            Err(error) => {
                warn!(?error, "motion loop task failed");
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::kinematics::joint_limits;

    fn provider() -> WalkProvider {
        WalkProvider::new(Arc::new(GaitConfig::default()))
    }

    #[test]
    fn mailbox_keeps_only_the_latest_command() {
        let mailbox = CommandMailbox::default();
        mailbox.post(WalkVector::new(10.0, 0.0, 0.0));
        mailbox.post(WalkVector::new(0.0, 20.0, 0.0));
        assert_eq!(mailbox.take(), Some(WalkVector::new(0.0, 20.0, 0.0)));
        assert_eq!(mailbox.take(), None);
        assert!(!mailbox.has_pending());
    }

    #[test]
    fn fresh_provider_is_inactive() {
        let mut provider = provider();
        provider.calculate_next_joints();
        assert!(!provider.is_active());
    }

    #[test]
    fn provider_activates_on_command() {
        let mut provider = provider();
        provider.mailbox().post(WalkVector::new(40.0, 0.0, 0.0));
        provider.calculate_next_joints();
        assert!(provider.is_active());
    }

    #[test]
    fn forward_walk_produces_the_commanded_odometry() {
        let gait = GaitConfig::default();
        let mut provider = provider();
        provider.mailbox().post(WalkVector::new(20.0, 0.0, 0.0));
        // opening weight shift plus four full steps
        let opening = gait.single_support_frames() + 2 * gait.double_support_frames();
        let ticks = opening + 4 * gait.step_duration_frames();
        let mut total = 0.0;
        for _ in 0..ticks {
            provider.calculate_next_joints();
            total += provider.take_odometry().x;
        }
        assert_relative_eq!(total, 20.0 * 4.0 * gait.step.duration, epsilon = 1e-3);
    }

    #[test]
    fn provider_deactivates_after_a_stop_command() {
        let mut provider = provider();
        provider.mailbox().post(WalkVector::new(40.0, 0.0, 0.0));
        for _ in 0..200 {
            provider.calculate_next_joints();
        }
        assert!(provider.is_active());
        provider.mailbox().post(WalkVector::ZERO);
        let mut ticks = 0;
        while provider.is_active() {
            provider.calculate_next_joints();
            ticks += 1;
            assert!(ticks < 1000, "provider never went inactive");
        }
    }

    #[test]
    fn walk_stance_is_reachable_and_within_limits() {
        let provider = provider();
        let stance = provider.walk_stance().unwrap();
        for (leg, joints) in [(Leg::Left, stance.left_leg), (Leg::Right, stance.right_leg)] {
            let (min, max) = joint_limits(leg);
            for joint in 0..LEG_JOINTS {
                assert!(joints.angles[joint] >= min[joint] - 1e-6);
                assert!(joints.angles[joint] <= max[joint] + 1e-6);
            }
        }
        // stance is laterally symmetric
        assert_relative_eq!(
            stance.left_leg.angles[HIP_PITCH],
            stance.right_leg.angles[HIP_PITCH],
            epsilon = 0.05
        );
    }

    #[test]
    fn body_joints_flatten_in_chain_order() {
        let leg = LegJoints {
            angles: [1.0; LEG_JOINTS],
            stiffness: [0.5; LEG_JOINTS],
        };
        let joints = BodyJoints {
            left_arm: [2.0; ARM_JOINTS],
            left_leg: leg,
            right_leg: leg,
            right_arm: [3.0; ARM_JOINTS],
            arm_stiffness: 0.3,
        };
        let angles = joints.angles();
        assert_eq!(&angles[..ARM_JOINTS], &[2.0; ARM_JOINTS]);
        assert_eq!(&angles[ARM_JOINTS..ARM_JOINTS + LEG_JOINTS], &[1.0; LEG_JOINTS]);
        assert_eq!(&angles[BODY_JOINTS - ARM_JOINTS..], &[3.0; ARM_JOINTS]);
        let stiffness = joints.stiffnesses();
        assert_relative_eq!(stiffness[0], 0.3);
        assert_relative_eq!(stiffness[ARM_JOINTS], 0.5);
    }

    #[tokio::test]
    async fn controller_runs_and_shuts_down() {
        let provider = provider();
        let controller = MotionController::start(provider, Box::new(LoggingJointSink));
        controller.set_command(WalkVector::new(40.0, 0.0, 0.0));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(controller.state().active);
        controller.shutdown().await.unwrap();
    }
}
