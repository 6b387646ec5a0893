//! Damped least-squares inverse kinematics for the six-joint leg chain.
//!
//! The solver runs in two phases: the ankle phase drives the ankle joint to
//! hover the configured foot height above the requested sole point, then the
//! heel phase rotates the ankle joints until the heel lands at sole level so
//! the foot touches down flat. Failure is soft: the caller always receives
//! the best angles found so far.

use nalgebra::{Matrix3, Point3, SMatrix, SVector, Vector3};

use super::{
    chain_state, clip_leg_angles, heel_position, jacobian_for_point, Leg, ANKLE_PITCH, ANKLE_ROLL,
    FOOT_HEIGHT, HEEL_OFFSET_X, HIP_YAW_PITCH, LEG_JOINTS,
};
use crate::utilities::clip_symmetric;

/// Damping keeps the iteration stable near kinematic singularities.
pub const DAMPING_FACTOR: f32 = 0.4;
/// Largest per-iteration change of a single joint, radians.
pub const MAX_DELTA_THETA: f32 = 0.5;
pub const MAX_ANKLE_ITERATIONS: usize = 60;
pub const MAX_HEEL_ITERATIONS: usize = 20;

// Accuracy levels in mm, how close the solver will get to the target.
pub const COARSE_ERROR_MM: f32 = 1.0;
pub const DEFAULT_MAX_ERROR_MM: f32 = 0.5;
pub const SWING_MAX_ERROR_MM: f32 = 0.1;
pub const HEEL_MAX_ERROR_MM: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkOutcome {
    Stuck,
    Success,
}

#[derive(Debug, Clone, Copy)]
pub struct IkLegResult {
    pub outcome: IkOutcome,
    pub angles: [f32; LEG_JOINTS],
}

/// Solve the leg chain for a sole contact point in the torso frame.
///
/// The hip yaw-pitch angle is taken from `start_angles` and held fixed; the
/// walk engine computes it from the planned foot rotation because the
/// mechanism couples that joint between the legs.
pub fn solve_leg(
    leg: Leg,
    goal: &Point3<f32>,
    start_angles: &[f32; LEG_JOINTS],
    max_error: f32,
    max_heel_error: f32,
) -> IkLegResult {
    let mut angles = *start_angles;
    let ankle_goal = goal + Vector3::new(0.0, 0.0, FOOT_HEIGHT);
    let ankle_ok = adjust_ankle(leg, &ankle_goal, &mut angles, max_error);
    let heel_ok = adjust_heel(leg, &mut angles, max_heel_error);
    let outcome = if ankle_ok && heel_ok {
        IkOutcome::Success
    } else {
        IkOutcome::Stuck
    };
    IkLegResult { outcome, angles }
}

/// One damped least-squares update: `delta = J^T (J J^T + lambda^2 I)^-1 e`.
fn damped_step(
    jacobian: &SMatrix<f32, 3, { LEG_JOINTS }>,
    error: &Vector3<f32>,
) -> Option<SVector<f32, { LEG_JOINTS }>> {
    let damped = jacobian * jacobian.transpose()
        + Matrix3::identity() * (DAMPING_FACTOR * DAMPING_FACTOR);
    let inverse = damped.try_inverse()?;
    Some(jacobian.transpose() * (inverse * error))
}

fn adjust_ankle(
    leg: Leg,
    target: &Point3<f32>,
    angles: &mut [f32; LEG_JOINTS],
    max_error: f32,
) -> bool {
    for _ in 0..MAX_ANKLE_ITERATIONS {
        let state = chain_state(leg, angles);
        let error = target - state.ankle;
        if error.norm() < max_error {
            return true;
        }
        let mut jacobian = jacobian_for_point(&state, &state.ankle);
        jacobian.set_column(HIP_YAW_PITCH, &Vector3::zeros());
        let delta = match damped_step(&jacobian, &error) {
            Some(delta) => delta,
            None => return false,
        };
        for joint in 0..LEG_JOINTS {
            angles[joint] += clip_symmetric(delta[joint], MAX_DELTA_THETA);
        }
        clip_leg_angles(leg, angles);
    }
    false
}

/// Rotate the ankle joints until the heel rests at sole level directly under
/// where a flat foot would put it. Only the two ankle joints move, so the
/// ankle position reached in the first phase cannot drift.
fn adjust_heel(leg: Leg, angles: &mut [f32; LEG_JOINTS], max_error: f32) -> bool {
    let ankle = chain_state(leg, angles).ankle;
    let heel_goal = ankle + Vector3::new(-HEEL_OFFSET_X, 0.0, -FOOT_HEIGHT);
    for _ in 0..MAX_HEEL_ITERATIONS {
        let state = chain_state(leg, angles);
        let heel = heel_position(&state);
        let error = heel_goal - heel;
        if error.norm() < max_error {
            return true;
        }
        let mut jacobian = jacobian_for_point(&state, &heel);
        for joint in 0..LEG_JOINTS {
            if joint != ANKLE_PITCH && joint != ANKLE_ROLL {
                jacobian.set_column(joint, &Vector3::zeros());
            }
        }
        let delta = match damped_step(&jacobian, &error) {
            Some(delta) => delta,
            None => return false,
        };
        angles[ANKLE_PITCH] += clip_symmetric(delta[ANKLE_PITCH], MAX_DELTA_THETA);
        angles[ANKLE_ROLL] += clip_symmetric(delta[ANKLE_ROLL], MAX_DELTA_THETA);
        clip_leg_angles(leg, angles);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::{forward_kinematics, joint_limits};
    use approx::assert_relative_eq;

    fn stance_goal(leg: Leg) -> Point3<f32> {
        Point3::new(-19.0, leg.sign() * 50.0, -310.0)
    }

    #[test]
    fn converges_on_reachable_goal_from_zero_seed() {
        for leg in [Leg::Left, Leg::Right] {
            let goal = stance_goal(leg);
            let result = solve_leg(
                leg,
                &goal,
                &[0.0; LEG_JOINTS],
                DEFAULT_MAX_ERROR_MM,
                HEEL_MAX_ERROR_MM,
            );
            assert_eq!(result.outcome, IkOutcome::Success, "{} leg", leg.name());
            let ankle = forward_kinematics(leg, &result.angles);
            let ankle_goal = goal + Vector3::new(0.0, 0.0, FOOT_HEIGHT);
            assert!((ankle_goal - ankle).norm() < DEFAULT_MAX_ERROR_MM);
        }
    }

    #[test]
    fn stays_within_joint_limits_on_unreachable_goal() {
        let goal = Point3::new(0.0, 50.0, -450.0);
        let result = solve_leg(
            Leg::Left,
            &goal,
            &[0.0; LEG_JOINTS],
            DEFAULT_MAX_ERROR_MM,
            HEEL_MAX_ERROR_MM,
        );
        assert_eq!(result.outcome, IkOutcome::Stuck);
        let (min, max) = joint_limits(Leg::Left);
        for joint in 0..LEG_JOINTS {
            assert!(result.angles[joint] >= min[joint] - 1e-6);
            assert!(result.angles[joint] <= max[joint] + 1e-6);
        }
    }

    #[test]
    fn hip_yaw_pitch_seed_is_held_fixed() {
        let mut seed = [0.0; LEG_JOINTS];
        seed[HIP_YAW_PITCH] = -0.25;
        seed[super::super::KNEE_PITCH] = 0.5;
        let goal = stance_goal(Leg::Left);
        let result = solve_leg(
            Leg::Left,
            &goal,
            &seed,
            DEFAULT_MAX_ERROR_MM,
            HEEL_MAX_ERROR_MM,
        );
        assert_relative_eq!(result.angles[HIP_YAW_PITCH], -0.25, epsilon = 1e-6);
    }

    #[test]
    fn heel_lands_flat_after_refinement() {
        let goal = stance_goal(Leg::Left);
        let result = solve_leg(
            Leg::Left,
            &goal,
            &[0.0; LEG_JOINTS],
            DEFAULT_MAX_ERROR_MM,
            HEEL_MAX_ERROR_MM,
        );
        assert_eq!(result.outcome, IkOutcome::Success);
        let state = crate::kinematics::chain_state(Leg::Left, &result.angles);
        let heel = crate::kinematics::heel_position(&state);
        // heel should sit a full foot height below the ankle
        assert_relative_eq!(heel.z, state.ankle.z - FOOT_HEIGHT, epsilon = 0.1);
    }

    #[test]
    fn warm_start_converges_faster_than_budget() {
        let goal = stance_goal(Leg::Left);
        let cold = solve_leg(
            Leg::Left,
            &goal,
            &[0.0; LEG_JOINTS],
            DEFAULT_MAX_ERROR_MM,
            HEEL_MAX_ERROR_MM,
        );
        // seed the second solve with the first solution for a nearby goal
        let nearby = Point3::new(goal.x + 2.0, goal.y, goal.z);
        let warm = solve_leg(
            Leg::Left,
            &nearby,
            &cold.angles,
            SWING_MAX_ERROR_MM,
            HEEL_MAX_ERROR_MM,
        );
        assert_eq!(warm.outcome, IkOutcome::Success);
    }
}
