pub mod error;
pub mod gait_config;
pub mod kinematics;
pub mod utilities;
pub mod walk_engine;
