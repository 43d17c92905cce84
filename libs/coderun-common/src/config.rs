// Engine configuration for coderun
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/engine.json";

/// Room for at least one full UTF-8 character per frame.
pub const MIN_LINE_BYTES: usize = 16;

/// How the stored script is handed to an interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    pub command: String,
    /// Placed before the script path; carries the unbuffered flag.
    pub args: Vec<String>,
    pub file_extension: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        Self {
            command: "python3".to_string(),
            args: vec!["-u".to_string()],
            file_extension: "py".to_string(),
            env,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_source_chars: usize,
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub kill_grace_secs: f64,
    /// Longest single output frame; longer lines are split across frames.
    pub max_line_bytes: usize,
    pub interpreter: InterpreterConfig,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_source_chars: 10_000,
            default_timeout_secs: 30,
            max_timeout_secs: 300,
            kill_grace_secs: 2.0,
            max_line_bytes: 64 * 1024,
            interpreter: InterpreterConfig::default(),
            scratch_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, then apply `CODERUN_*` overrides and validate.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Engine config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let mut config: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load `config/engine.json` if present, otherwise start from defaults.
    pub fn load_default() -> Result<Self> {
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            return Self::load(default_path);
        }

        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CODERUN_MAX_SOURCE_CHARS") {
            self.max_source_chars = v.parse().context("CODERUN_MAX_SOURCE_CHARS must be an integer")?;
        }
        if let Some(v) = lookup("CODERUN_DEFAULT_TIMEOUT_SECS") {
            self.default_timeout_secs = v.parse().context("CODERUN_DEFAULT_TIMEOUT_SECS must be an integer")?;
        }
        if let Some(v) = lookup("CODERUN_MAX_TIMEOUT_SECS") {
            self.max_timeout_secs = v.parse().context("CODERUN_MAX_TIMEOUT_SECS must be an integer")?;
        }
        if let Some(v) = lookup("CODERUN_KILL_GRACE_SECS") {
            self.kill_grace_secs = v.parse().context("CODERUN_KILL_GRACE_SECS must be a number")?;
        }
        if let Some(v) = lookup("CODERUN_MAX_LINE_BYTES") {
            self.max_line_bytes = v.parse().context("CODERUN_MAX_LINE_BYTES must be an integer")?;
        }
        if let Some(v) = lookup("CODERUN_INTERPRETER") {
            self.interpreter.command = v;
        }
        if let Some(v) = lookup("CODERUN_SCRATCH_DIR") {
            self.scratch_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_source_chars == 0 {
            bail!("max_source_chars must be greater than zero");
        }
        if self.default_timeout_secs == 0 || self.max_timeout_secs == 0 {
            bail!("timeouts must be greater than zero");
        }
        if self.default_timeout_secs > self.max_timeout_secs {
            bail!(
                "default_timeout_secs ({}) exceeds max_timeout_secs ({})",
                self.default_timeout_secs,
                self.max_timeout_secs
            );
        }
        if !self.kill_grace_secs.is_finite() || self.kill_grace_secs <= 0.0 {
            bail!("kill_grace_secs must be a positive number");
        }
        if self.max_line_bytes < MIN_LINE_BYTES {
            bail!("max_line_bytes must be at least {}", MIN_LINE_BYTES);
        }
        if self.interpreter.command.trim().is_empty() {
            bail!("interpreter.command cannot be empty");
        }
        Ok(())
    }

    /// Resolve a client-requested timeout: absent or zero uses the default,
    /// anything above the hard bound is clamped to it.
    pub fn resolve_timeout(&self, requested_secs: Option<u64>) -> Duration {
        let secs = match requested_secs {
            None | Some(0) => self.default_timeout_secs,
            Some(s) => s.min(self.max_timeout_secs),
        };
        Duration::from_secs(secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs_f64(self.kill_grace_secs)
    }
}
