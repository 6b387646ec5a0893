pub mod inverse;

use nalgebra::{Isometry3, Point3, SMatrix, Translation3, Unit, UnitQuaternion, Vector3};

pub const LEG_JOINTS: usize = 6;

pub const HIP_YAW_PITCH: usize = 0;
pub const HIP_ROLL: usize = 1;
pub const HIP_PITCH: usize = 2;
pub const KNEE_PITCH: usize = 3;
pub const ANKLE_PITCH: usize = 4;
pub const ANKLE_ROLL: usize = 5;

// Leg chain dimensions in millimeters, measured from the torso origin.
pub const HIP_OFFSET_Y: f32 = 50.0;
pub const HIP_OFFSET_Z: f32 = 85.0;
pub const THIGH_LENGTH: f32 = 100.0;
pub const TIBIA_LENGTH: f32 = 102.9;
pub const FOOT_HEIGHT: f32 = 46.0;
pub const HEEL_OFFSET_X: f32 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Left,
    Right,
}

impl Leg {
    pub fn sign(&self) -> f32 {
        match self {
            Leg::Left => 1.0,
            Leg::Right => -1.0,
        }
    }

    pub fn other(&self) -> Leg {
        match self {
            Leg::Left => Leg::Right,
            Leg::Right => Leg::Left,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Leg::Left => "left",
            Leg::Right => "right",
        }
    }
}

const LEFT_JOINT_MIN: [f32; LEG_JOINTS] = [
    -1.145303, -0.379472, -1.773912, -0.092346, -1.189516, -0.397880,
];
const LEFT_JOINT_MAX: [f32; LEG_JOINTS] = [
    0.740810, 0.790477, 0.484090, 2.112528, 0.922747, 0.769001,
];
const RIGHT_JOINT_MIN: [f32; LEG_JOINTS] = [
    -1.145303, -0.790477, -1.773912, -0.092346, -1.189516, -0.769001,
];
const RIGHT_JOINT_MAX: [f32; LEG_JOINTS] = [
    0.740810, 0.379472, 0.484090, 2.112528, 0.922747, 0.397880,
];

pub fn joint_limits(leg: Leg) -> (&'static [f32; LEG_JOINTS], &'static [f32; LEG_JOINTS]) {
    match leg {
        Leg::Left => (&LEFT_JOINT_MIN, &LEFT_JOINT_MAX),
        Leg::Right => (&RIGHT_JOINT_MIN, &RIGHT_JOINT_MAX),
    }
}

/// Saturate every joint to its mechanical range.
pub fn clip_leg_angles(leg: Leg, angles: &mut [f32; LEG_JOINTS]) {
    let (min, max) = joint_limits(leg);
    for i in 0..LEG_JOINTS {
        angles[i] = crate::utilities::clip(angles[i], min[i], max[i]);
    }
}

/// Rotation axis of a joint in its parent frame.
///
/// The hip yaw-pitch axis sits at 45 degrees between the lateral and
/// vertical axes and is mirrored between the two legs.
fn joint_axis(leg: Leg, joint: usize) -> Vector3<f32> {
    match joint {
        HIP_YAW_PITCH => Vector3::new(0.0, leg.sign(), -1.0),
        HIP_ROLL | ANKLE_ROLL => Vector3::x(),
        HIP_PITCH | KNEE_PITCH | ANKLE_PITCH => Vector3::y(),
        _ => unreachable!("leg chain has exactly six joints"),
    }
}

/// Snapshot of the chain pose for one set of joint angles: world-space joint
/// origins and axes (for the geometric Jacobian), the ankle position and the
/// foot orientation.
pub(crate) struct ChainState {
    pub joint_origins: [Point3<f32>; LEG_JOINTS],
    pub joint_axes: [Vector3<f32>; LEG_JOINTS],
    pub ankle: Point3<f32>,
    pub foot_rotation: UnitQuaternion<f32>,
}

pub(crate) fn chain_state(leg: Leg, angles: &[f32; LEG_JOINTS]) -> ChainState {
    let mut transform: Isometry3<f32> =
        Translation3::new(0.0, leg.sign() * HIP_OFFSET_Y, -HIP_OFFSET_Z).into();
    let mut joint_origins = [Point3::origin(); LEG_JOINTS];
    let mut joint_axes = [Vector3::zeros(); LEG_JOINTS];

    for joint in 0..LEG_JOINTS {
        if joint == KNEE_PITCH {
            transform *= Translation3::new(0.0, 0.0, -THIGH_LENGTH);
        }
        if joint == ANKLE_PITCH {
            transform *= Translation3::new(0.0, 0.0, -TIBIA_LENGTH);
        }
        let axis = Unit::new_normalize(joint_axis(leg, joint));
        joint_origins[joint] = transform * Point3::origin();
        joint_axes[joint] = transform.rotation * axis.into_inner();
        transform *= UnitQuaternion::from_axis_angle(&axis, angles[joint]);
    }

    ChainState {
        joint_origins,
        joint_axes,
        ankle: transform * Point3::origin(),
        foot_rotation: transform.rotation,
    }
}

/// Position of the ankle joint in the torso frame.
pub fn forward_kinematics(leg: Leg, angles: &[f32; LEG_JOINTS]) -> Point3<f32> {
    chain_state(leg, angles).ankle
}

/// Heel contact point, offset from the ankle through the foot geometry.
pub(crate) fn heel_position(state: &ChainState) -> Point3<f32> {
    state.ankle + state.foot_rotation * Vector3::new(-HEEL_OFFSET_X, 0.0, -FOOT_HEIGHT)
}

/// Geometric Jacobian of `point` with respect to the six leg joints.
pub(crate) fn jacobian_for_point(
    state: &ChainState,
    point: &Point3<f32>,
) -> SMatrix<f32, 3, { LEG_JOINTS }> {
    let mut jacobian = SMatrix::<f32, 3, LEG_JOINTS>::zeros();
    for joint in 0..LEG_JOINTS {
        let lever = point - state.joint_origins[joint];
        jacobian.set_column(joint, &state.joint_axes[joint].cross(&lever));
    }
    jacobian
}
