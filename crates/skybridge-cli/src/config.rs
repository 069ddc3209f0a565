//! Configuration – reads/writes `~/.skybridge/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use skybridge_middleware::EventBus;
use skybridge_supervisor::SupervisorOptions;
use skybridge_workers::{BUILTIN_WORKERS, ScriptSet, WorkerContext};

/// Persisted bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the worker scripts.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// Interpreter the scripts are run with.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Host event bus capacity per channel.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// How long buffered output is still classified after a process exits.
    #[serde(default = "default_exit_drain_ms")]
    pub exit_drain_ms: u64,

    /// Report a non-zero exit of an unreported operation as a failure.
    #[serde(default)]
    pub fail_on_nonzero_exit: bool,

    /// Enabled worker ids.
    #[serde(default = "default_workers")]
    pub workers: Vec<String>,
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("/opt/skybridge/scripts")
}
fn default_shell() -> String {
    "sh".to_string()
}
fn default_bus_capacity() -> usize {
    skybridge_middleware::bus::DEFAULT_CAPACITY
}
fn default_exit_drain_ms() -> u64 {
    250
}
fn default_workers() -> Vec<String> {
    BUILTIN_WORKERS.iter().map(|w| w.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scripts_dir: default_scripts_dir(),
            shell: default_shell(),
            bus_capacity: default_bus_capacity(),
            exit_drain_ms: default_exit_drain_ms(),
            fail_on_nonzero_exit: false,
            workers: default_workers(),
        }
    }
}

impl Config {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.bus_capacity == 0 {
            return Err("bus_capacity must be greater than zero".to_string());
        }
        if self.shell.trim().is_empty() {
            return Err("shell must not be empty".to_string());
        }
        if let Some(unknown) = self
            .workers
            .iter()
            .find(|w| !BUILTIN_WORKERS.contains(&w.as_str()))
        {
            return Err(format!(
                "unknown worker '{unknown}' (available: {})",
                BUILTIN_WORKERS.join(", ")
            ));
        }
        Ok(())
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            exit_drain: Duration::from_millis(self.exit_drain_ms),
        }
    }

    /// Everything the workers need, wired to `bus`.
    pub fn worker_context(&self, bus: EventBus) -> WorkerContext {
        let mut ctx = WorkerContext::new(ScriptSet::new(&self.scripts_dir, &self.shell), bus);
        ctx.supervisor_options = self.supervisor_options();
        ctx.fail_on_nonzero_exit = self.fail_on_nonzero_exit;
        ctx
    }
}

/// Return the path to `~/.skybridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".skybridge").join("config.toml")
}

/// Load the config from `path`, falling back to defaults when the file does
/// not exist.  Environment overrides are applied either way.
pub fn load_or_default(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does not
/// exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `SKYBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SKYBRIDGE_SCRIPTS_DIR` | `scripts_dir` |
/// | `SKYBRIDGE_SHELL` | `shell` |
/// | `SKYBRIDGE_BUS_CAPACITY` | `bus_capacity` |
/// | `SKYBRIDGE_EXIT_DRAIN_MS` | `exit_drain_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Unparseable numbers are ignored.
fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SKYBRIDGE_SCRIPTS_DIR") {
        cfg.scripts_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("SKYBRIDGE_SHELL") {
        cfg.shell = v;
    }
    if let Some(v) = lookup("SKYBRIDGE_BUS_CAPACITY")
        && let Ok(capacity) = v.parse::<usize>()
    {
        cfg.bus_capacity = capacity;
    }
    if let Some(v) = lookup("SKYBRIDGE_EXIT_DRAIN_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.exit_drain_ms = ms;
    }
}

/// Save the config to a specific path, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
