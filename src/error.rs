use std::result::Result;
use thiserror::Error;

pub type WalkResult<T> = Result<T, WalkError>;

#[derive(Error, Debug)]
pub enum WalkError {
    #[error("invalid gait configuration: {0}")]
    InvalidGaitConfig(String),
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("Yaml serde error")]
    YamlError(#[from] serde_yaml::Error),
    #[error("actuator write failed: {0}")]
    ActuatorError(String),
    #[error("motion loop join error")]
    JoinError(#[from] tokio::task::JoinError),
}
