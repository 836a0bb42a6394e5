//! jsctx.toml configuration

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use jsctx::IsolateBuilder;
use serde::{Deserialize, Serialize};

/// Looked up in the working directory when no `--config` is given
pub const CONFIG_FILE: &str = "jsctx.toml";

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub engine: EngineConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Passed to V8 before the first isolate is created
    pub v8_flags: Option<String>,
    pub heap_initial_mb: usize,
    /// No limit beyond V8's default when unset
    pub heap_max_mb: Option<usize>,
    pub stack_trace_frames: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            v8_flags: None,
            heap_initial_mb: 0,
            heap_max_mb: None,
            stack_trace_frames: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Terminate a script that runs longer than this
    pub timeout_ms: Option<u64>,
    /// Drain promise reactions after every script
    pub microtask_checkpoint: bool,
    /// Release each script's values once its result is reported
    pub temporary_values: bool,
    pub print_results: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            microtask_checkpoint: true,
            temporary_values: true,
            print_results: true,
        }
    }
}

impl Config {
    /// Load `explicit` if given, otherwise `./jsctx.toml` if it exists,
    /// otherwise the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(CONFIG_FILE);
                if !default.exists() {
                    log::debug!("no {} found, using defaults", CONFIG_FILE);
                    return Ok(Config::default());
                }
                default
            }
        };
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config = Self::parse(&raw).with_context(|| format!("parse config {}", path.display()))?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn isolate_builder(&self) -> IsolateBuilder {
        let mut builder = jsctx::Isolate::builder().stack_trace_frames(self.engine.stack_trace_frames);
        if let Some(max) = self.engine.heap_max_mb {
            builder = builder.heap_limits(self.engine.heap_initial_mb * MIB, max * MIB);
        }
        builder
    }
}
