//! Capability interface between the VM and external AI services.
//!
//! The VM never embeds model logic. Personality, knowledge and voice
//! operations are forwarded to a [`HostBridge`] supplied by the embedder.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};

use thiserror::Error;
use tracing::info;

/// Failure of a host capability call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("host call timed out")]
    Timeout,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("host call failed: {0}")]
    Failed(String),
}

/// Personality trait values owned by one VM instance, ordered by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraitVector {
    traits: BTreeMap<String, f64>,
}

impl TraitVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: f64) {
        self.traits.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.traits.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.traits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.traits.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

/// Services the VM reaches for AI-native opcodes.
///
/// Implementations own their retry and timeout policy; the VM calls each
/// method once per instruction and never retries.
pub trait HostBridge: Send {
    /// Answer a knowledge query. Failures are pushed as error values.
    fn query_knowledge(&mut self, text: &str) -> Result<String, HostError>;

    /// Speak `text` in the voice described by `traits`. Failures fault the VM.
    fn speak(&mut self, text: &str, traits: &TraitVector) -> Result<(), HostError>;

    /// Return the next transcribed utterance. Failures are pushed as error values.
    fn listen(&mut self) -> Result<String, HostError>;

    /// Look up a trait the program did not set itself.
    fn get_trait(&mut self, name: &str) -> Result<f64, HostError>;

    /// Notified for every `SET_TRAIT`. Failures fault the VM.
    fn set_trait(&mut self, _name: &str, _value: f64) -> Result<(), HostError> {
        Ok(())
    }
}

/// Bridge for running programs from a terminal: speech goes to stdout and
/// listening reads a line from stdin. No knowledge or trait service is attached.
pub struct ConsoleBridge<R, W> {
    input: R,
    output: W,
}

impl ConsoleBridge<io::BufReader<io::Stdin>, io::Stdout> {
    pub fn stdio() -> Self {
        ConsoleBridge::new(io::BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R: BufRead + Send, W: Write + Send> ConsoleBridge<R, W> {
    pub fn new(input: R, output: W) -> Self {
        ConsoleBridge { input, output }
    }
}

impl<R: BufRead + Send, W: Write + Send> HostBridge for ConsoleBridge<R, W> {
    fn query_knowledge(&mut self, text: &str) -> Result<String, HostError> {
        info!(query = text, "knowledge query without a knowledge service");
        Err(HostError::Unavailable("no knowledge service configured".to_string()))
    }

    fn speak(&mut self, text: &str, traits: &TraitVector) -> Result<(), HostError> {
        let io_err = |e: io::Error| HostError::Failed(e.to_string());
        if traits.is_empty() {
            writeln!(self.output, "[voice] {}", text).map_err(io_err)?;
        } else {
            let traits: Vec<String> = traits
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            writeln!(self.output, "[voice {}] {}", traits.join(" "), text).map_err(io_err)?;
        }
        self.output.flush().map_err(io_err)
    }

    fn listen(&mut self) -> Result<String, HostError> {
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) => Err(HostError::Unavailable("input closed".to_string())),
            Ok(_) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(e) => Err(HostError::Failed(e.to_string())),
        }
    }

    fn get_trait(&mut self, name: &str) -> Result<f64, HostError> {
        Err(HostError::Unavailable(format!("trait '{}' is not set", name)))
    }
}
