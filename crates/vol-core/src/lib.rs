pub mod availability;
pub mod config;
pub mod requirement;
pub mod types;

pub use availability::{AvailabilityEffect, AvailabilityState, IllegalTransition, Transition};
pub use config::{VolgridConfig, parse_duration};
pub use requirement::{GROUP_PREFIX, RequirementError, VolumeRequirement, VolumeSource};
pub use types::*;
