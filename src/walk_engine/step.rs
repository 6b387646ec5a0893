use crate::gait_config::{GaitConfig, StanceConfig, StepConfig, ZmpConfig};
use crate::kinematics::Leg;
use crate::utilities::{clip, clip_symmetric};

/// External walk command: forward and lateral velocity in mm/s, turn
/// velocity in rad/s. Replaced wholesale on each new command.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WalkVector {
    pub x: f32,
    pub y: f32,
    pub theta: f32,
}

impl WalkVector {
    pub const ZERO: WalkVector = WalkVector {
        x: 0.0,
        y: 0.0,
        theta: 0.0,
    };

    pub fn new(x: f32, y: f32, theta: f32) -> WalkVector {
        WalkVector { x, y, theta }
    }

    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.theta == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Regular,
    /// Closing step of a walk sequence, spent entirely in double support
    /// while the preview window drains.
    End,
}

/// How many motion frames an end step spans.
pub const PREVIEW_FRAMES: u32 = 60;

/// One committed footstep.
///
/// `x`/`y`/`theta` are the body-relative foot target produced from the
/// clipped walk vector; the gait blocks are snapshotted at construction so
/// the step's kinematic envelope is frozen for its whole lifetime.
#[derive(Debug, Clone)]
pub struct Step {
    pub x: f32,
    pub y: f32,
    pub theta: f32,
    pub walk_vector: WalkVector,
    pub step_duration_frames: u32,
    pub double_support_frames: u32,
    pub single_support_frames: u32,
    pub foot: Leg,
    pub kind: StepKind,
    pub step_config: StepConfig,
    pub zmp_config: ZmpConfig,
    pub stance_config: StanceConfig,
    stance_offset_y: f32,
}

impl Step {
    pub fn new(
        target: WalkVector,
        gait: &GaitConfig,
        foot: Leg,
        last: WalkVector,
        kind: StepKind,
    ) -> Step {
        let mut step = Step {
            x: 0.0,
            y: 0.0,
            theta: 0.0,
            walk_vector: WalkVector::ZERO,
            step_duration_frames: 0,
            double_support_frames: 0,
            single_support_frames: 0,
            foot,
            kind,
            step_config: gait.step.clone(),
            zmp_config: gait.zmp.clone(),
            stance_config: gait.stance.clone(),
            stance_offset_y: gait.stance.leg_separation_y * 0.5,
        };

        match kind {
            StepKind::Regular => step.update_frame_lengths(
                gait.step.duration,
                gait.step.double_support_fraction,
                gait.motion_frame_length_s,
            ),
            StepKind::End => {
                // the preview window is already a frame count, no rounding
                // through seconds
                step.step_duration_frames = PREVIEW_FRAMES;
                step.double_support_frames = PREVIEW_FRAMES;
                step.single_support_frames = 0;
            }
        }

        step.set_step_size(target, last);
        step
    }

    /// A resting step at the stance position of `foot`, used to seed the
    /// step window before the first real step and while standing still.
    pub fn stance(gait: &GaitConfig, foot: Leg) -> Step {
        Step::new(
            WalkVector::ZERO,
            gait,
            foot,
            WalkVector::ZERO,
            StepKind::End,
        )
    }

    fn update_frame_lengths(
        &mut self,
        duration: f32,
        double_support_fraction: f32,
        frame_length: f32,
    ) {
        self.step_duration_frames = (duration / frame_length) as u32;
        self.double_support_frames = (duration * double_support_fraction / frame_length) as u32;
        // single support is derived, not rounded independently
        self.single_support_frames = self.step_duration_frames - self.double_support_frames;
    }

    fn set_step_size(&mut self, target: WalkVector, last: WalkVector) {
        let config = &self.step_config;
        let mut new_walk = WalkVector::ZERO;

        // clip velocities against the previous step, unless we are stopping:
        // a full stop is immediate, not ramped
        if !target.is_zero() {
            new_walk.x = clip(
                target.x,
                last.x - config.max_acc_x,
                last.x + config.max_acc_x,
            );
            new_walk.y = clip(
                target.y,
                last.y - config.max_acc_y,
                last.y + config.max_acc_y,
            );
            new_walk.theta = clip(
                target.theta,
                last.theta - config.max_acc_theta,
                last.theta + config.max_acc_theta,
            );
        }

        new_walk.x = clip_symmetric(new_walk.x, config.max_vel_x);
        new_walk.y = clip_symmetric(new_walk.y, config.max_vel_y);
        new_walk.theta = clip_symmetric(new_walk.theta, config.max_vel_theta);

        // a leg may not strafe or turn towards the other leg's side, that
        // would ask the feet to cross under the body
        if new_walk.y > 0.0 && self.foot != Leg::Left {
            new_walk.y = 0.0;
        } else if new_walk.y < 0.0 && self.foot == Leg::Left {
            new_walk.y = 0.0;
        }
        if new_walk.theta > 0.0 && self.foot != Leg::Left {
            new_walk.theta = 0.0;
        } else if new_walk.theta < 0.0 && self.foot == Leg::Left {
            new_walk.theta = 0.0;
        }

        // convert velocities to a displacement over the step. Theta doubles
        // because you can only turn on every other step.
        let step_x = new_walk.x * config.duration;
        let step_y = new_walk.y * config.duration;
        let step_theta = new_walk.theta * config.duration * 2.0;

        // rotate the displacement so turning happens about the body center
        // rather than the stepping foot
        let leg_sign = self.foot.sign();
        self.x = step_x - step_theta.abs().sin() * self.stance_offset_y;
        self.y = step_y + leg_sign * self.stance_offset_y * step_theta.cos();
        self.theta = step_theta;
        self.walk_vector = new_walk;
    }
}
