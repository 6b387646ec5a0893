use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::{WalkError, WalkResult};

/// Per-step timing and velocity envelope.
///
/// Velocities are in mm/s and rad/s, accelerations are the maximum change in
/// step velocity between two consecutive steps.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct StepConfig {
    /// Duration of a single step in seconds
    pub duration: f32,
    /// Fraction of a step spent with both feet on the ground
    pub double_support_fraction: f32,
    /// Swing apex height in mm
    pub step_height: f32,
    pub max_vel_x: f32,
    pub max_vel_y: f32,
    pub max_vel_theta: f32,
    pub max_acc_x: f32,
    pub max_acc_y: f32,
    pub max_acc_theta: f32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ZmpConfig {
    /// Fraction of double support during which the reference stays static
    pub static_fraction: f32,
    /// Lateral offset of the ZMP reference towards the body when the left
    /// leg is the support leg, in mm
    pub left_swing_offset_y: f32,
    pub right_swing_offset_y: f32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct StanceConfig {
    /// Height of the body above the ground in mm
    pub body_height: f32,
    /// How far the feet trail the hips in mm
    pub hip_offset_x: f32,
    /// Constant forward lean folded into the hip pitch, radians
    pub x_angle_offset: f32,
    /// Lateral distance between the feet in mm
    pub leg_separation_y: f32,
    /// Length of the foot sole ahead of the ankle in mm
    pub foot_length_x: f32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct StiffnessConfig {
    pub max: f32,
    pub knee: f32,
    pub ankle: f32,
    pub arm: f32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct OdometryConfig {
    pub scale_x: f32,
    pub scale_y: f32,
    pub scale_theta: f32,
}

/// Full gait parameter set for the walk engine.
///
/// Owned by the walk provider for its whole lifetime; steps snapshot the
/// blocks they need at construction so a committed step is not affected by
/// a later reload.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct GaitConfig {
    /// Length of one motion frame in seconds
    pub motion_frame_length_s: f32,
    pub step: StepConfig,
    pub zmp: ZmpConfig,
    pub stance: StanceConfig,
    pub stiffness: StiffnessConfig,
    pub odometry: OdometryConfig,
    /// Empirical hip roll addition while the left leg swings, radians
    pub left_swing_hip_roll_addition: f32,
    pub right_swing_hip_roll_addition: f32,
}

impl GaitConfig {
    pub fn load(path: &Path) -> WalkResult<GaitConfig> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: GaitConfig = serde_yaml::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn step_duration_frames(&self) -> u32 {
        (self.step.duration / self.motion_frame_length_s) as u32
    }

    pub fn double_support_frames(&self) -> u32 {
        (self.step.duration * self.step.double_support_fraction / self.motion_frame_length_s) as u32
    }

    pub fn single_support_frames(&self) -> u32 {
        self.step_duration_frames() - self.double_support_frames()
    }

    /// Reject parameter sets the engine cannot execute before any tick runs.
    pub fn validate(&self) -> WalkResult<()> {
        if self.motion_frame_length_s <= 0.0 {
            return Err(WalkError::InvalidGaitConfig(
                "motion frame length must be positive".to_owned(),
            ));
        }
        if self.step.duration <= 0.0 {
            return Err(WalkError::InvalidGaitConfig(
                "step duration must be positive".to_owned(),
            ));
        }
        if !(0.0..1.0).contains(&self.step.double_support_fraction) {
            return Err(WalkError::InvalidGaitConfig(
                "double support fraction must be in [0, 1)".to_owned(),
            ));
        }
        if self.single_support_frames() == 0 {
            return Err(WalkError::InvalidGaitConfig(
                "step duration leaves no single support frames".to_owned(),
            ));
        }
        if self.stance.body_height <= 0.0 {
            return Err(WalkError::InvalidGaitConfig(
                "body height must be positive".to_owned(),
            ));
        }
        if self.stance.leg_separation_y <= 0.0 {
            return Err(WalkError::InvalidGaitConfig(
                "leg separation must be positive".to_owned(),
            ));
        }
        if self.step.step_height < 0.0 {
            return Err(WalkError::InvalidGaitConfig(
                "step height must not be negative".to_owned(),
            ));
        }
        let velocities = [
            self.step.max_vel_x,
            self.step.max_vel_y,
            self.step.max_vel_theta,
        ];
        if velocities.iter().any(|&v| v <= 0.0) {
            return Err(WalkError::InvalidGaitConfig(
                "velocity limits must be positive".to_owned(),
            ));
        }
        let accelerations = [
            self.step.max_acc_x,
            self.step.max_acc_y,
            self.step.max_acc_theta,
        ];
        if accelerations.iter().any(|&a| a <= 0.0) {
            return Err(WalkError::InvalidGaitConfig(
                "acceleration limits must be positive".to_owned(),
            ));
        }
        for stiffness in [
            self.stiffness.max,
            self.stiffness.knee,
            self.stiffness.ankle,
            self.stiffness.arm,
        ] {
            if !(0.0..=1.0).contains(&stiffness) {
                return Err(WalkError::InvalidGaitConfig(
                    "stiffness levels must be in [0, 1]".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for GaitConfig {
    fn default() -> Self {
        GaitConfig {
            motion_frame_length_s: 0.02,
            step: StepConfig {
                duration: 0.5,
                double_support_fraction: 0.1,
                step_height: 16.5,
                max_vel_x: 100.0,
                max_vel_y: 50.0,
                max_vel_theta: 0.5,
                max_acc_x: 30.0,
                max_acc_y: 20.0,
                max_acc_theta: 0.3,
            },
            zmp: ZmpConfig {
                static_fraction: 0.4,
                left_swing_offset_y: 12.0,
                right_swing_offset_y: 12.0,
            },
            stance: StanceConfig {
                body_height: 310.0,
                hip_offset_x: 19.0,
                x_angle_offset: 0.0,
                leg_separation_y: 100.0,
                foot_length_x: 10.0,
            },
            stiffness: StiffnessConfig {
                max: 0.85,
                knee: 0.70,
                ankle: 0.55,
                arm: 0.30,
            },
            odometry: OdometryConfig {
                scale_x: 1.0,
                scale_y: 1.0,
                scale_theta: 1.0,
            },
            left_swing_hip_roll_addition: 4.0_f32.to_radians(),
            right_swing_hip_roll_addition: 4.0_f32.to_radians(),
        }
    }
}
