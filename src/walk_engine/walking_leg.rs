//! Per-leg support state machine.
//!
//! Each motion frame the leg computes a 3-D foot target from the steps it
//! currently references, solves the leg chain with the damped least-squares
//! solver (warm-started from its own last output) and layers the empirical
//! hip corrections and the stiffness schedule on top.

use std::f32::consts::PI;
use std::sync::Arc;

use nalgebra::{Isometry2, Point2, Point3};
use tracing::{debug, trace};

use crate::gait_config::GaitConfig;
use crate::kinematics::{
    inverse, Leg, ANKLE_PITCH, ANKLE_ROLL, HIP_PITCH, HIP_ROLL, HIP_YAW_PITCH, KNEE_PITCH,
    LEG_JOINTS,
};
use crate::walk_engine::step::{Step, StepKind};

/// Joint angles and stiffness levels for one leg, one motion frame.
#[derive(Debug, Clone, Copy)]
pub struct LegJoints {
    pub angles: [f32; LEG_JOINTS],
    pub stiffness: [f32; LEG_JOINTS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportState {
    /// Planted, bearing the full load while the other leg swings
    Supporting,
    /// In the air on the cycloid arc from swing source to destination
    Swinging,
    /// Both feet down, this leg about to become the swinging leg
    DoubleSupport,
    /// Both feet down, this leg about to become the supporting leg
    PersistentDoubleSupport,
}

const GOAL_CONTINUITY_THRESHOLD_MM: f32 = 6.0;

pub struct WalkingLeg {
    state: SupportState,
    frame_counter: u32,
    hip_hack_stage: u8,
    cur_dest: Arc<Step>,
    swing_src: Arc<Step>,
    swing_dest: Arc<Step>,
    support_step: Arc<Step>,
    leg: Leg,
    gait: Arc<GaitConfig>,
    goal: Point3<f32>,
    last_goal: Point3<f32>,
    last_joints: [f32; LEG_JOINTS],
}

impl WalkingLeg {
    pub fn new(leg: Leg, gait: Arc<GaitConfig>) -> WalkingLeg {
        let resting = Arc::new(Step::stance(&gait, leg));
        WalkingLeg {
            state: SupportState::Supporting,
            frame_counter: 0,
            hip_hack_stage: 0,
            cur_dest: resting.clone(),
            swing_src: resting.clone(),
            swing_dest: resting.clone(),
            support_step: resting,
            leg,
            gait,
            goal: Point3::origin(),
            last_goal: Point3::origin(),
            last_joints: [0.0; LEG_JOINTS],
        }
    }

    pub fn state(&self) -> SupportState {
        self.state
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    /// Entry point when the gait starts by swinging the left leg first.
    pub fn start_left(&mut self) {
        match self.leg {
            // this leg swings first, so it waits in plain double support
            Leg::Left => self.set_state(SupportState::DoubleSupport),
            Leg::Right => self.set_state(SupportState::PersistentDoubleSupport),
        }
    }

    /// Entry point when the gait starts by swinging the right leg first.
    pub fn start_right(&mut self) {
        match self.leg {
            Leg::Left => self.set_state(SupportState::PersistentDoubleSupport),
            Leg::Right => self.set_state(SupportState::DoubleSupport),
        }
    }

    /// Pin the leg into load bearing, used when the gait has finished.
    pub fn stand(&mut self) {
        self.set_state(SupportState::Supporting);
    }

    /// Produce a planted target without advancing the state machine.
    pub fn hold(&mut self, step: Arc<Step>, foot_transform: &Isometry2<f32>) -> LegJoints {
        self.cur_dest = step;
        self.supporting(foot_transform)
    }

    pub fn set_steps(
        &mut self,
        swing_src: Arc<Step>,
        swing_dest: Arc<Step>,
        support_step: Arc<Step>,
    ) {
        self.swing_src = swing_src;
        self.swing_dest = swing_dest;
        self.support_step = support_step;
    }

    /// Advance this leg by one motion frame.
    ///
    /// `foot_transform` maps step coordinates into the body frame for the
    /// current planned center-of-mass position.
    pub fn tick(
        &mut self,
        step: Arc<Step>,
        swing_src: Arc<Step>,
        swing_dest: Arc<Step>,
        foot_transform: &Isometry2<f32>,
    ) -> LegJoints {
        self.cur_dest = step;
        self.swing_src = swing_src;
        self.swing_dest = swing_dest;

        let result = match self.state {
            SupportState::Supporting => self.supporting(foot_transform),
            SupportState::Swinging => {
                if self.support_step.kind == StepKind::Regular {
                    self.swinging(foot_transform)
                } else {
                    // irregular step: weight shift only, no lift
                    self.supporting(foot_transform)
                }
            }
            SupportState::DoubleSupport => {
                // the final target after swinging is already committed, so
                // keep holding the swing source position
                self.cur_dest = self.swing_src.clone();
                self.supporting(foot_transform)
            }
            SupportState::PersistentDoubleSupport => self.supporting(foot_transform),
        };

        self.check_goal_continuity();

        self.last_goal = self.goal;
        self.frame_counter += 1;
        if self.should_switch_states() {
            self.switch_to_next_state();
        }
        result
    }

    fn swinging(&mut self, foot_transform: &Isometry2<f32>) -> LegJoints {
        let src_f = Point2::new(self.swing_src.x, self.swing_src.y);
        let dist_to_cover_x = self.cur_dest.x - self.swing_src.x;
        let dist_to_cover_y = self.cur_dest.y - self.swing_src.y;

        // horizontal progress and lift both follow a cycloid, which gives
        // zero velocity at liftoff and touchdown
        let percent_complete =
            self.frame_counter as f32 / self.gait.single_support_frames() as f32;
        let theta = percent_complete * 2.0 * PI;
        let percent_to_dest = cycloid_x(theta) / (2.0 * PI);

        let target_f = Point2::new(
            src_f.x + percent_to_dest * dist_to_cover_x,
            src_f.y + percent_to_dest * dist_to_cover_y,
        );
        let target_c = foot_transform * target_f;

        let radius = self.gait.step.step_height / 2.0;
        let height_off_ground = radius * cycloid_y(theta);

        self.goal = Point3::new(
            target_c.x,
            target_c.y,
            -self.gait.stance.body_height + height_off_ground,
        );

        self.solve_and_correct(SwingSign::Swinging)
    }

    /// Target while on the ground: single support, or either leg during
    /// double support.
    fn supporting(&mut self, foot_transform: &Isometry2<f32>) -> LegJoints {
        let dest_f = Point2::new(self.cur_dest.x, self.cur_dest.y);
        let dest_c = foot_transform * dest_f;

        self.goal = Point3::new(dest_c.x, dest_c.y, -self.gait.stance.body_height);

        self.solve_and_correct(SwingSign::Supporting)
    }

    fn solve_and_correct(&mut self, sign: SwingSign) -> LegJoints {
        // the hip yaw-pitch is not solved for, the mechanism couples it
        // across both legs at half the planned foot rotation
        let hip_yaw_pitch = self.hip_yaw_pitch();
        self.last_joints[HIP_YAW_PITCH] = hip_yaw_pitch;

        let result = inverse::solve_leg(
            self.leg,
            &self.goal,
            &self.last_joints,
            inverse::SWING_MAX_ERROR_MM,
            inverse::HEEL_MAX_ERROR_MM,
        );
        if result.outcome == inverse::IkOutcome::Stuck {
            debug!(
                leg = self.leg.name(),
                goal = ?self.goal,
                "leg solver did not converge, using best-effort angles"
            );
        }

        let (hip_pitch_adjustment, hip_roll_adjustment) = self.hip_hack(hip_yaw_pitch);
        let mut angles = result.angles;
        match sign {
            SwingSign::Swinging => angles[HIP_ROLL] -= hip_roll_adjustment,
            SwingSign::Supporting => angles[HIP_ROLL] += hip_roll_adjustment,
        }
        angles[HIP_PITCH] -= self.gait.stance.x_angle_offset;
        angles[HIP_PITCH] += hip_pitch_adjustment;

        self.last_joints = angles;
        LegJoints {
            angles,
            stiffness: self.stiffnesses(),
        }
    }

    /// Rotation the swinging foot is expected to have relative to the
    /// support foot at the current point in the swing.
    fn foot_rotation(&self) -> f32 {
        if self.state != SupportState::Supporting && self.state != SupportState::Swinging {
            return self.swing_src.theta;
        }
        let percent_complete =
            self.frame_counter as f32 / self.gait.single_support_frames() as f32;
        let theta = percent_complete * 2.0 * PI;
        let percent_to_dest = cycloid_x(theta) / (2.0 * PI);

        let start = self.swing_src.theta;
        let end = self.swing_dest.theta;
        start + (end - start) * percent_to_dest
    }

    fn hip_yaw_pitch(&self) -> f32 {
        -(self.foot_rotation() * 0.5).abs()
    }

    /// Empirical hip correction, a trapezoid over the swing window: rise for
    /// the first third, hold, then decay over the last third. Part of the
    /// magnitude rotates into hip pitch through the hip yaw-pitch angle.
    ///
    /// Suppressed while starting and stopping, when the foot never lifts.
    fn hip_hack(&mut self, current_hip_yaw_pitch: f32) -> (f32, f32) {
        if self.support_step.kind != StepKind::Regular {
            return (0.0, 0.0);
        }

        let hack_leg = match self.state {
            SupportState::Supporting => self.leg,
            SupportState::Swinging => self.leg.other(),
            _ => return (0.0, 0.0),
        };

        let max_hip_angle_offset = match hack_leg {
            Leg::Left => self.gait.left_swing_hip_roll_addition,
            Leg::Right => self.gait.right_swing_hip_roll_addition,
        };

        if self.frame_counter == 0 {
            self.hip_hack_stage = 0;
        }
        let single_support_frames = self.gait.single_support_frames() as f32;
        let frame = self.frame_counter as f32;

        let hip_roll_offset = match self.hip_hack_stage {
            0 => {
                let offset = max_hip_angle_offset * frame / (single_support_frames / 3.0);
                if frame >= single_support_frames / 3.0 {
                    self.hip_hack_stage = 1;
                }
                offset
            }
            1 => {
                if frame >= 2.0 * single_support_frames / 3.0 {
                    self.hip_hack_stage = 2;
                }
                max_hip_angle_offset
            }
            _ => (max_hip_angle_offset * (single_support_frames - frame)
                / (single_support_frames / 3.0))
                .max(0.0),
        };

        let hip_pitch_adjustment = -hip_roll_offset * (-current_hip_yaw_pitch).sin();
        let hip_roll_adjustment =
            hip_roll_offset * self.leg.sign() * (-current_hip_yaw_pitch).cos();
        (hip_pitch_adjustment, hip_roll_adjustment)
    }

    /// Stiffness for every joint at the current point of the gait cycle.
    ///
    /// Ankle and knee soften while swinging and around touchdown and
    /// stiffen for load bearing; the hips always stay at maximum.
    fn stiffnesses(&self) -> [f32; LEG_JOINTS] {
        let max = self.gait.stiffness.max;
        let mut ankle = self.gait.stiffness.ankle;
        let mut knee = self.gait.stiffness.knee;

        match self.state {
            SupportState::DoubleSupport => {
                // ramp down from load bearing over the final third
                let frames = self.gait.double_support_frames();
                ankle = self.stiffness_toward_end(frames, max, ankle);
                knee = self.stiffness_toward_end(frames, max, knee);
            }
            SupportState::PersistentDoubleSupport => {
                // ramp back up over the first third
                let frames = self.gait.double_support_frames();
                ankle = self.stiffness_from_start(frames, ankle, max);
                knee = self.stiffness_from_start(frames, knee, max);
            }
            SupportState::Swinging => {
                // lower legs already at the soft levels
            }
            SupportState::Supporting => {
                ankle = max;
                knee = max;
            }
        }

        let mut stiffness = [max; LEG_JOINTS];
        stiffness[KNEE_PITCH] = knee;
        stiffness[ANKLE_PITCH] = ankle;
        stiffness[ANKLE_ROLL] = ankle;
        stiffness
    }

    /// Interpolate from `start` to `end` over the final third of a state.
    fn stiffness_toward_end(&self, state_length: u32, start: f32, end: f32) -> f32 {
        let transition_start_frame = (0.66 * state_length as f32) as u32;
        let ramp_frames = state_length.saturating_sub(transition_start_frame);
        if ramp_frames == 0 {
            return end;
        }
        if self.frame_counter < transition_start_frame {
            start
        } else {
            let percent_to_goal =
                (self.frame_counter - transition_start_frame) as f32 / ramp_frames as f32;
            start + (end - start) * percent_to_goal.min(1.0)
        }
    }

    /// Interpolate from `start` to `end` over the first third of a state.
    /// The ramp spans at least one frame even for very short states, so the
    /// soft touchdown level is never skipped.
    fn stiffness_from_start(&self, state_length: u32, start: f32, end: f32) -> f32 {
        let transition_end_frame = ((0.33 * state_length as f32) as u32).max(1);
        if self.frame_counter >= transition_end_frame {
            end
        } else {
            let percent_to_goal = self.frame_counter as f32 / transition_end_frame as f32;
            start + (end - start) * percent_to_goal
        }
    }

    fn next_state(&self) -> SupportState {
        match self.state {
            SupportState::Supporting => SupportState::DoubleSupport,
            SupportState::DoubleSupport => SupportState::Swinging,
            SupportState::Swinging => SupportState::PersistentDoubleSupport,
            SupportState::PersistentDoubleSupport => SupportState::Supporting,
        }
    }

    fn should_switch_states(&self) -> bool {
        match self.state {
            SupportState::Supporting | SupportState::Swinging => {
                self.frame_counter >= self.gait.single_support_frames()
            }
            SupportState::DoubleSupport | SupportState::PersistentDoubleSupport => {
                self.frame_counter >= self.gait.double_support_frames()
            }
        }
    }

    fn switch_to_next_state(&mut self) {
        self.set_state(self.next_state());
    }

    fn set_state(&mut self, new_state: SupportState) {
        trace!(
            leg = self.leg.name(),
            from = ?self.state,
            to = ?new_state,
            "support state transition"
        );
        self.state = new_state;
        self.frame_counter = 0;
    }

    fn check_goal_continuity(&self) {
        let jump = self.goal - self.last_goal;
        if jump.x.abs() > GOAL_CONTINUITY_THRESHOLD_MM
            || jump.y.abs() > GOAL_CONTINUITY_THRESHOLD_MM
            || jump.z.abs() > GOAL_CONTINUITY_THRESHOLD_MM
        {
            debug!(
                leg = self.leg.name(),
                from = ?self.last_goal,
                to = ?self.goal,
                "leg target jumped between frames"
            );
        }
    }
}

enum SwingSign {
    Swinging,
    Supporting,
}

pub(crate) fn cycloid_x(theta: f32) -> f32 {
    theta - theta.sin()
}

pub(crate) fn cycloid_y(theta: f32) -> f32 {
    1.0 - theta.cos()
}
