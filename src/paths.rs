// GateCrash Forms - Path Resolution
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Single source of truth for the config home (~/.gatecrash).
// Cached via OnceLock for zero-overhead repeated access.
// The CLI may pin a different home with --home before first use.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG_HOME_CACHE: OnceLock<PathBuf> = OnceLock::new();

const CONFIG_FILE: &str = "config.json";

/// GateCrash config home.
///
/// Resolution order:
///   1. Value pinned by `set_config_home` (CLI --home)
///   2. GATECRASH_HOME environment variable
///   3. HOME env + /.gatecrash
///   4. ./.gatecrash relative to the working directory
pub fn config_home() -> &'static Path {
    CONFIG_HOME_CACHE.get_or_init(|| {
        if let Ok(home) = std::env::var("GATECRASH_HOME") {
            if !home.is_empty() {
                return PathBuf::from(home);
            }
        }

        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".gatecrash");
        }

        PathBuf::from(".gatecrash")
    })
}

/// Pin the config home. Returns false if it was already resolved.
pub fn set_config_home(path: PathBuf) -> bool {
    CONFIG_HOME_CACHE.set(path).is_ok()
}

/// Global config file inside the config home
pub fn config_file() -> PathBuf {
    config_home().join(CONFIG_FILE)
}

/// Resolve `path` against `base` unless it is already absolute
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

// ============================================================================
// TESTS
// ============================================================================
