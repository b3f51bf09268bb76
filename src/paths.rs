//! Path resolution for pantry.
//!
//! # Environment Variables
//!
//! - `PANTRY_CONFIG_DIR` - Override config directory
//! - `PANTRY_STATE_DIR` - Override state directory (file cache, reports)
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `PANTRY_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/pantry` (if set)
//! 3. `~/.config/pantry`
//!
//! For state_dir():
//! 1. `PANTRY_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/pantry` (if set)
//! 3. `~/.local/state/pantry`

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "PANTRY_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "PANTRY_STATE_DIR";

const APP_DIR: &str = "pantry";

/// Directory holding `client.toml` and the client key.
pub fn config_dir() -> Result<PathBuf> {
    resolve_dir(ENV_CONFIG_DIR, "XDG_CONFIG_HOME", &[".config"])
}

/// Directory holding the file cache and run reports.
pub fn state_dir() -> Result<PathBuf> {
    resolve_dir(ENV_STATE_DIR, "XDG_STATE_HOME", &[".local", "state"])
}

/// Override variable, then the XDG base, then a path under the home directory.
fn resolve_dir(override_var: &str, xdg_var: &str, home_rel: &[&str]) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(override_var) {
        let path = expand(&dir);
        log::debug!("Using {override_var}: {}", path.display());
        return Ok(path);
    }

    if let Ok(base) = std::env::var(xdg_var)
        && !base.is_empty()
    {
        let path = PathBuf::from(base).join(APP_DIR);
        log::debug!("Using {xdg_var}: {}", path.display());
        return Ok(path);
    }

    let mut path = dirs::home_dir().ok_or_else(|| Error::config("could not determine home directory"))?;
    path.extend(home_rel);
    Ok(path.join(APP_DIR))
}

/// Default location of the client configuration file.
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("client.toml"))
}

/// Expand ~ and environment variables in a path string.
///
/// Unknown variables are left as written.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand("~/cookbooks"), home.join("cookbooks"));
        }
    }

    #[test]
    fn test_resolve_dir_falls_back_to_home() {
        let fallback = resolve_dir("PANTRY_SURELY_UNSET_A", "PANTRY_SURELY_UNSET_B", &[".local", "state"]);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(fallback.unwrap(), home.join(".local/state/pantry"));
        }
    }

    #[test]
    fn test_expand_plain_path() {
        assert_eq!(expand("/var/cache/pantry"), PathBuf::from("/var/cache/pantry"));
    }

    #[test]
    fn test_expand_unknown_variable_is_kept() {
        assert_eq!(
            expand("/srv/$PANTRY_SURELY_UNSET_VAR/x"),
            PathBuf::from("/srv/$PANTRY_SURELY_UNSET_VAR/x")
        );
    }
}
