//! Step planning and gait orchestration.
//!
//! The generator owns both legs, commits steps from the current walk
//! command, swaps support legs on a fixed cadence and plans the body sway
//! that keeps the weight over the support foot. All committed steps are
//! behind `Arc` so the legs can hold on to a step for as long as their state
//! machine still references it.

use std::collections::VecDeque;
use std::sync::Arc;

use nalgebra::{Isometry2, Vector2};
use tracing::debug;

use crate::gait_config::GaitConfig;
use crate::kinematics::Leg;
use crate::walk_engine::step::{Step, StepKind, WalkVector};
use crate::walk_engine::walking_leg::{LegJoints, WalkingLeg};

/// Body displacement accumulated since the last poll, in mm and radians.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OdometryDelta {
    pub x: f32,
    pub y: f32,
    pub theta: f32,
}

pub struct StepGenerator {
    gait: Arc<GaitConfig>,
    left_leg: WalkingLeg,
    right_leg: WalkingLeg,
    walk_vector: WalkVector,
    /// Velocity the most recently committed step actually got, after
    /// clipping. New steps accelerate relative to this.
    last_step_vector: WalkVector,
    future_steps: VecDeque<Arc<Step>>,
    /// Where the swinging foot lifts off from.
    swing_src: Arc<Step>,
    /// Where the swinging foot will land.
    swing_dest: Arc<Step>,
    /// The step the planted foot is standing on.
    support_step: Arc<Step>,
    swinging_foot: Leg,
    frame_count: u32,
    frames_until_swap: u32,
    /// Planned body position in the current step window's frame.
    com: Vector2<f32>,
    com_at_window_start: Vector2<f32>,
    odometry: OdometryDelta,
    done: bool,
}

impl StepGenerator {
    pub fn new(gait: Arc<GaitConfig>) -> StepGenerator {
        let swing_src = Arc::new(Step::stance(&gait, Leg::Left));
        let swing_dest = swing_src.clone();
        let support_step = Arc::new(Step::stance(&gait, Leg::Right));
        StepGenerator {
            left_leg: WalkingLeg::new(Leg::Left, gait.clone()),
            right_leg: WalkingLeg::new(Leg::Right, gait.clone()),
            gait,
            walk_vector: WalkVector::ZERO,
            last_step_vector: WalkVector::ZERO,
            future_steps: VecDeque::new(),
            swing_src,
            swing_dest,
            support_step,
            swinging_foot: Leg::Left,
            frame_count: 0,
            frames_until_swap: 0,
            com: Vector2::zeros(),
            com_at_window_start: Vector2::zeros(),
            odometry: OdometryDelta::default(),
            done: true,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Replace the walk command. Takes effect at the next committed step;
    /// restarts the gait if the engine had come to a rest.
    pub fn set_walk_vector(&mut self, walk_vector: WalkVector) {
        if walk_vector == self.walk_vector {
            return;
        }
        self.walk_vector = walk_vector;
        if self.done {
            if !walk_vector.is_zero() {
                self.start_gait();
            }
        } else {
            // steps already planned ahead were made for the old command;
            // the next step accelerates from the step a leg will actually
            // execute, not from the discarded lookahead
            self.future_steps.clear();
            self.last_step_vector = self.swing_dest.walk_vector;
        }
    }

    /// Consume the odometry accumulated since the last call.
    pub fn take_odometry(&mut self) -> OdometryDelta {
        std::mem::take(&mut self.odometry)
    }

    /// Advance the whole gait by one motion frame.
    pub fn tick(&mut self) -> (LegJoints, LegJoints) {
        if !self.done && self.frame_count >= self.frames_until_swap {
            self.swap_support_legs();
        }

        self.tick_controller();
        let foot_transform = self.foot_transform();

        let (left_step, right_step) = match self.swinging_foot {
            Leg::Left => (self.swing_dest.clone(), self.support_step.clone()),
            Leg::Right => (self.support_step.clone(), self.swing_dest.clone()),
        };

        if self.done {
            // standing still, keep the legs planted without cycling their
            // support state machines
            let left = self.left_leg.hold(left_step, &foot_transform);
            let right = self.right_leg.hold(right_step, &foot_transform);
            return (left, right);
        }

        for leg in [&mut self.left_leg, &mut self.right_leg] {
            leg.set_steps(
                self.swing_src.clone(),
                self.swing_dest.clone(),
                self.support_step.clone(),
            );
        }
        let left = self.left_leg.tick(
            left_step,
            self.swing_src.clone(),
            self.swing_dest.clone(),
            &foot_transform,
        );
        let right = self.right_leg.tick(
            right_step,
            self.swing_src.clone(),
            self.swing_dest.clone(),
            &foot_transform,
        );

        self.accumulate_odometry();
        self.frame_count += 1;
        (left, right)
    }

    /// Begin a fresh walk from standstill.
    ///
    /// The first swing leg is chosen so a lateral or turning command is
    /// never asked of the wrong side, which the step clipping would zero.
    fn start_gait(&mut self) {
        self.swinging_foot =
            if self.walk_vector.y < 0.0 || self.walk_vector.theta < 0.0 {
                Leg::Right
            } else {
                Leg::Left
            };
        match self.swinging_foot {
            Leg::Left => {
                self.left_leg.start_left();
                self.right_leg.start_left();
            }
            Leg::Right => {
                self.left_leg.start_right();
                self.right_leg.start_right();
            }
        }

        self.swing_src = Arc::new(Step::stance(&self.gait, self.swinging_foot));
        self.support_step = Arc::new(Step::stance(&self.gait, self.swinging_foot.other()));
        self.last_step_vector = WalkVector::ZERO;
        self.future_steps.clear();
        self.swing_dest = self.generate_step(self.swinging_foot);
        let lookahead = self.generate_step(self.swinging_foot.other());
        self.future_steps.push_back(lookahead);

        self.frame_count = 0;
        // the opening window holds an extra double support phase on each
        // side so the weight shift lines up with both leg state machines
        self.frames_until_swap =
            self.gait.single_support_frames() + 2 * self.gait.double_support_frames();
        self.com = Vector2::zeros();
        self.com_at_window_start = Vector2::zeros();
        self.done = false;
        debug!(first_swing = self.swinging_foot.name(), "gait started");
    }

    fn generate_step(&mut self, foot: Leg) -> Arc<Step> {
        let kind = if self.walk_vector.is_zero() {
            StepKind::End
        } else {
            StepKind::Regular
        };
        let step = Step::new(
            self.walk_vector,
            &self.gait,
            foot,
            self.last_step_vector,
            kind,
        );
        self.last_step_vector = step.walk_vector;
        Arc::new(step)
    }

    fn swap_support_legs(&mut self) {
        let retired = std::mem::replace(&mut self.support_step, self.swing_dest.clone());
        self.swing_src = retired.clone();
        self.swinging_foot = self.swinging_foot.other();
        self.swing_dest = match self.future_steps.pop_front() {
            Some(step) => step,
            None => self.generate_step(self.swinging_foot),
        };
        let lookahead = self.generate_step(self.swinging_foot.other());
        self.future_steps.push_back(lookahead);

        // the step window frame advances by the retired step's displacement,
        // so the planned body position rebases with it
        let advance = Vector2::new(
            retired.walk_vector.x * retired.step_config.duration,
            retired.walk_vector.y * retired.step_config.duration,
        );
        self.com -= advance;
        self.com_at_window_start = self.com;

        self.frames_until_swap = self.support_step.step_duration_frames;
        self.frame_count = 0;

        if self.walk_vector.is_zero()
            && self.support_step.kind == StepKind::End
            && self.swing_dest.kind == StepKind::End
        {
            self.done = true;
            self.left_leg.stand();
            self.right_leg.stand();
            debug!("gait finished, both closing steps committed");
        }
    }

    /// Lateral and forward reference the body should be over at the end of
    /// the current step window.
    fn zmp_reference(&self) -> Vector2<f32> {
        let support = &self.support_step;
        let sign = support.foot.sign();
        let offset_y = match support.kind {
            StepKind::Regular => match support.foot {
                Leg::Left => support.zmp_config.left_swing_offset_y,
                Leg::Right => support.zmp_config.right_swing_offset_y,
            },
            // while stopping the body returns to the centre of the stance
            StepKind::End => self.gait.stance.leg_separation_y * 0.5,
        };
        Vector2::new(support.x, support.y - sign * offset_y)
    }

    /// Move the planned body position towards the reference over the step
    /// window, holding still for the static part of double support.
    fn tick_controller(&mut self) {
        if self.frames_until_swap == 0 {
            return;
        }
        let hold_frames = (self.support_step.double_support_frames as f32
            * self.support_step.zmp_config.static_fraction) as u32;
        let span = self.frames_until_swap.saturating_sub(hold_frames);
        if span == 0 {
            return;
        }
        let progress = (self.frame_count.saturating_sub(hold_frames) as f32 / span as f32)
            .clamp(0.0, 1.0);
        let reference = self.zmp_reference();
        self.com = self.com_at_window_start + (reference - self.com_at_window_start) * progress;
    }

    /// Transform from step coordinates to the body frame for the current
    /// planned body position.
    fn foot_transform(&self) -> Isometry2<f32> {
        Isometry2::new(
            Vector2::new(-(self.com.x + self.gait.stance.hip_offset_x), -self.com.y),
            0.0,
        )
    }

    fn accumulate_odometry(&mut self) {
        let velocity = self.support_step.walk_vector;
        let frame = self.gait.motion_frame_length_s;
        let scales = &self.gait.odometry;
        self.odometry.x += velocity.x * frame * scales.scale_x;
        self.odometry.y += velocity.y * frame * scales.scale_y;
        self.odometry.theta += velocity.theta * frame * scales.scale_theta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn generator() -> StepGenerator {
        StepGenerator::new(Arc::new(GaitConfig::default()))
    }

    fn opening_window(gait: &GaitConfig) -> u32 {
        gait.single_support_frames() + 2 * gait.double_support_frames()
    }

    #[test]
    fn fresh_generator_is_done() {
        let mut generator = generator();
        assert!(generator.is_done());
        assert_eq!(generator.take_odometry(), OdometryDelta::default());
    }

    #[test]
    fn forward_command_swings_the_left_leg_first() {
        let mut generator = generator();
        generator.set_walk_vector(WalkVector::new(40.0, 0.0, 0.0));
        assert!(!generator.is_done());
        assert_eq!(generator.swinging_foot, Leg::Left);
    }

    #[test]
    fn rightward_commands_swing_the_right_leg_first() {
        for vector in [
            WalkVector::new(0.0, -30.0, 0.0),
            WalkVector::new(20.0, 0.0, -0.2),
        ] {
            let mut generator = generator();
            generator.set_walk_vector(vector);
            assert_eq!(generator.swinging_foot, Leg::Right);
        }
    }

    #[test]
    fn opening_window_holds_the_stance_step() {
        let gait = GaitConfig::default();
        let mut generator = generator();
        generator.set_walk_vector(WalkVector::new(20.0, 0.0, 0.0));
        for _ in 0..opening_window(&gait) {
            generator.tick();
            assert_eq!(generator.support_step.kind, StepKind::End);
        }
        generator.tick();
        assert_eq!(generator.support_step.kind, StepKind::Regular);
    }

    #[test]
    fn support_swaps_on_the_step_cadence() {
        let gait = GaitConfig::default();
        let mut generator = generator();
        generator.set_walk_vector(WalkVector::new(20.0, 0.0, 0.0));
        for _ in 0..opening_window(&gait) {
            generator.tick();
        }
        generator.tick();
        let first_support = generator.support_step.foot;
        // the swap tick itself spent the first frame of the window
        for _ in 0..gait.step_duration_frames() - 1 {
            assert_eq!(generator.support_step.foot, first_support);
            generator.tick();
        }
        generator.tick();
        assert_eq!(generator.support_step.foot, first_support.other());
    }

    #[test]
    fn odometry_tracks_forward_velocity() {
        let gait = GaitConfig::default();
        let mut generator = generator();
        generator.set_walk_vector(WalkVector::new(20.0, 0.0, 0.0));
        // the opening window stands on a zero-velocity stance step
        for _ in 0..opening_window(&gait) {
            generator.tick();
        }
        assert_relative_eq!(generator.odometry.x, 0.0);
        // two full regular windows at 20 mm/s
        for _ in 0..2 * gait.step_duration_frames() {
            generator.tick();
        }
        let odometry = generator.take_odometry();
        assert_relative_eq!(
            odometry.x,
            20.0 * 2.0 * gait.step.duration,
            epsilon = 1e-3
        );
        assert_relative_eq!(odometry.y, 0.0);
        // taking the odometry resets the accumulator
        assert_eq!(generator.take_odometry(), OdometryDelta::default());
    }

    #[test]
    fn odometry_scales_apply() {
        let mut gait = GaitConfig::default();
        gait.odometry.scale_x = 0.5;
        let opening = opening_window(&gait);
        let window = gait.step_duration_frames();
        let mut generator = StepGenerator::new(Arc::new(gait.clone()));
        generator.set_walk_vector(WalkVector::new(20.0, 0.0, 0.0));
        for _ in 0..opening + window {
            generator.tick();
        }
        let odometry = generator.take_odometry();
        assert_relative_eq!(odometry.x, 20.0 * gait.step.duration * 0.5, epsilon = 1e-3);
    }

    #[test]
    fn zero_command_brings_the_gait_to_rest() {
        let mut generator = generator();
        generator.set_walk_vector(WalkVector::new(40.0, 0.0, 0.0));
        for _ in 0..200 {
            generator.tick();
        }
        generator.set_walk_vector(WalkVector::ZERO);
        let mut ticks = 0;
        while !generator.is_done() {
            generator.tick();
            ticks += 1;
            assert!(ticks < 1000, "gait never came to rest");
        }
        // at rest no further odometry accrues
        generator.take_odometry();
        generator.tick();
        assert_eq!(generator.take_odometry(), OdometryDelta::default());
    }

    #[test]
    fn command_change_accelerates_from_the_executing_step() {
        let gait = GaitConfig::default();
        let mut generator = generator();
        generator.set_walk_vector(WalkVector::new(40.0, 0.0, 0.0));
        // the first committed step is clipped to the acceleration envelope
        assert_relative_eq!(generator.swing_dest.walk_vector.x, gait.step.max_acc_x);
        generator.set_walk_vector(WalkVector::new(100.0, 0.0, 0.0));
        for _ in 0..opening_window(&gait) + 1 {
            generator.tick();
        }
        // the replacement step accelerates from the step still under way,
        // not from the discarded lookahead step
        assert_relative_eq!(
            generator.swing_dest.walk_vector.x,
            2.0 * gait.step.max_acc_x
        );
    }

    #[test]
    fn new_command_restarts_a_finished_gait() {
        let mut generator = generator();
        generator.set_walk_vector(WalkVector::new(40.0, 0.0, 0.0));
        for _ in 0..200 {
            generator.tick();
        }
        generator.set_walk_vector(WalkVector::ZERO);
        for _ in 0..1000 {
            if generator.is_done() {
                break;
            }
            generator.tick();
        }
        assert!(generator.is_done());
        generator.set_walk_vector(WalkVector::new(0.0, 20.0, 0.0));
        assert!(!generator.is_done());
    }

    #[test]
    fn finished_gait_holds_steady_stiffness() {
        let gait = GaitConfig::default();
        let mut generator = generator();
        generator.set_walk_vector(WalkVector::new(40.0, 0.0, 0.0));
        for _ in 0..200 {
            generator.tick();
        }
        generator.set_walk_vector(WalkVector::ZERO);
        for _ in 0..1000 {
            if generator.is_done() {
                break;
            }
            generator.tick();
        }
        assert!(generator.is_done());
        // standing still the legs stay load bearing, no cadence left over
        for _ in 0..100 {
            let (left, right) = generator.tick();
            for joints in [left, right] {
                for value in joints.stiffness {
                    assert_relative_eq!(value, gait.stiffness.max);
                }
            }
        }
    }

    #[test]
    fn body_plan_stays_within_the_step_envelope() {
        let gait = GaitConfig::default();
        let mut generator = generator();
        generator.set_walk_vector(WalkVector::new(60.0, 0.0, 0.0));
        let max_step_x = gait.step.max_vel_x * gait.step.duration;
        for _ in 0..500 {
            generator.tick();
            assert!(generator.com.x.abs() <= max_step_x + 1e-3);
            assert!(generator.com.y.abs() <= gait.stance.leg_separation_y);
        }
    }
}
