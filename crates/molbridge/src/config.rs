//! Bridge configuration.
//!
//! Built in code with the `with_*` builder methods, or read from
//! `MOLBRIDGE_*` environment variables for deployments that embed the bridge.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BridgeError;
use crate::supervisor::{CommandSpawner, WorkerSpawner};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Where the worker's stderr goes. It is never part of the protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StderrMode {
    /// Forward each line to tracing under target `molbridge::worker`.
    #[default]
    Log,
    Inherit,
    Discard,
}

impl StderrMode {
    pub(crate) fn stdio(self) -> Stdio {
        match self {
            Self::Log => Stdio::piped(),
            Self::Inherit => Stdio::inherit(),
            Self::Discard => Stdio::null(),
        }
    }
}

/// Executable and arguments for the worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub stderr: StderrMode,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            stderr: StderrMode::default(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_stderr(mut self, stderr: StderrMode) -> Self {
        self.stderr = stderr;
        self
    }

    /// Read `MOLBRIDGE_WORKER` (required) and `MOLBRIDGE_WORKER_ARGS`.
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, BridgeError> {
        let program = lookup("MOLBRIDGE_WORKER")
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| BridgeError::Config("MOLBRIDGE_WORKER is not set".to_string()))?;
        let args = lookup("MOLBRIDGE_WORKER_ARGS").unwrap_or_default();
        Ok(Self::new(program).with_args(args.split_whitespace()))
    }
}

/// Startup verification: the first request sent to a fresh worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub payload: String,
    pub expected: String,
    pub timeout: Duration,
}

impl Handshake {
    pub fn new(payload: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            expected: expected.into(),
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parse `<payload>=<expected>`, e.g. `init=initialized`.
    pub fn parse(spec: &str) -> Result<Self, BridgeError> {
        match spec.split_once('=') {
            Some((payload, expected)) if !payload.is_empty() => Ok(Self::new(payload, expected)),
            _ => Err(BridgeError::Config(format!(
                "handshake must look like <payload>=<expected>, got {spec:?}"
            ))),
        }
    }
}

pub struct BridgeConfig {
    pub request_timeout: Duration,
    pub startup_grace: Duration,
    pub queue_capacity: usize,
    pub max_line_bytes: usize,
    pub handshake: Option<Handshake>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            startup_grace: DEFAULT_STARTUP_GRACE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            handshake: None,
            spawner: Arc::new(CommandSpawner),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Capacity of the outbound queue. Callers wait once it is full.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = Some(handshake);
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Reject settings the bridge cannot run with. The fields are public, so
    /// every constructor checks again.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.queue_capacity == 0 {
            return Err(BridgeError::Config(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(BridgeError::Config(
                "max line bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Defaults overridden by any `MOLBRIDGE_*` tuning variables that are set.
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, BridgeError> {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "MOLBRIDGE_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MOLBRIDGE_STARTUP_GRACE_MS")? {
            config.startup_grace = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "MOLBRIDGE_QUEUE_CAPACITY")? {
            config.queue_capacity = capacity;
        }
        if let Some(max) = parse_var::<usize>(&lookup, "MOLBRIDGE_MAX_LINE_BYTES")? {
            config.max_line_bytes = max;
        }
        if let Some(spec) = lookup("MOLBRIDGE_HANDSHAKE") {
            config.handshake = Some(Handshake::parse(&spec)?);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, BridgeError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| BridgeError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = BridgeConfig::new();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.startup_grace, Duration::from_secs(5));
        assert_eq!(config.queue_capacity, 100);
        assert!(config.handshake.is_none());
    }

    #[test]
    fn env_overrides_tuning() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("MOLBRIDGE_TIMEOUT_MS", "250"),
            ("MOLBRIDGE_STARTUP_GRACE_MS", "10"),
            ("MOLBRIDGE_QUEUE_CAPACITY", "8"),
            ("MOLBRIDGE_HANDSHAKE", "init=initialized"),
        ]))
        .unwrap();

        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.startup_grace, Duration::from_millis(10));
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(
            config.handshake,
            Some(Handshake::new("init", "initialized"))
        );
    }

    #[test]
    fn env_rejects_bad_values() {
        let err = BridgeConfig::from_lookup(lookup(&[("MOLBRIDGE_TIMEOUT_MS", "soon")]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("MOLBRIDGE_TIMEOUT_MS"));

        assert!(BridgeConfig::from_lookup(lookup(&[("MOLBRIDGE_QUEUE_CAPACITY", "0")])).is_err());
        assert!(BridgeConfig::from_lookup(lookup(&[("MOLBRIDGE_HANDSHAKE", "noequals")])).is_err());
    }

    #[test]
    fn worker_command_from_env() {
        let command = WorkerCommand::from_lookup(lookup(&[
            ("MOLBRIDGE_WORKER", "/usr/bin/python3"),
            ("MOLBRIDGE_WORKER_ARGS", "rdkit_tools.py  --quiet"),
        ]))
        .unwrap();

        assert_eq!(command.program, PathBuf::from("/usr/bin/python3"));
        assert_eq!(command.args, vec!["rdkit_tools.py", "--quiet"]);
        assert_eq!(command.stderr, StderrMode::Log);

        assert!(WorkerCommand::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn queue_capacity_is_never_zero() {
        assert_eq!(BridgeConfig::new().with_queue_capacity(0).queue_capacity, 1);
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        assert!(BridgeConfig::new().validate().is_ok());

        let config = BridgeConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        let err = config.validate().err().unwrap();
        assert!(matches!(err, BridgeError::Config(_)));
        assert!(err.to_string().contains("queue capacity"));

        let config = BridgeConfig {
            max_line_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn handshake_allows_empty_expected_reply() {
        let handshake = Handshake::parse("init=").unwrap();
        assert_eq!(handshake.payload, "init");
        assert_eq!(handshake.expected, "");
        assert!(Handshake::parse("=x").is_err());
    }
}
