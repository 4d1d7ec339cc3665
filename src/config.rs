//! Resource limits of a VM instance

use std::env;
use std::str::FromStr;

use crate::error::ConfigError;

pub const ENV_MAX_STACK: &str = "NEXUS_MAX_STACK";
pub const ENV_MAX_FRAMES: &str = "NEXUS_MAX_FRAMES";
pub const ENV_MAX_INSTRUCTIONS: &str = "NEXUS_MAX_INSTRUCTIONS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Maximum number of values on the operand stack
    pub max_stack: usize,
    /// Maximum number of call frames, the top-level frame included
    pub max_frames: usize,
    /// Fault after this many executed instructions, unlimited if `None`
    pub max_instructions: Option<u64>,
    /// Also write `PRINT` output to stdout
    pub echo_output: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_stack: 65_536,
            max_frames: 1_024,
            max_instructions: None,
            echo_output: false,
        }
    }
}

impl VmConfig {
    /// Defaults overridden by `NEXUS_MAX_STACK`, `NEXUS_MAX_FRAMES` and
    /// `NEXUS_MAX_INSTRUCTIONS` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = VmConfig::default();
        if let Some(max_stack) = parse_var(&lookup, ENV_MAX_STACK)? {
            config.max_stack = max_stack;
        }
        if let Some(max_frames) = parse_var(&lookup, ENV_MAX_FRAMES)? {
            config.max_frames = max_frames;
        }
        if let Some(max_instructions) = parse_var(&lookup, ENV_MAX_INSTRUCTIONS)? {
            config.max_instructions = Some(max_instructions);
        }
        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(variable) {
        None => Ok(None),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(ConfigError { variable, value }),
        },
    }
}
