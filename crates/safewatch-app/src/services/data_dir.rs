// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data directory resolution.

use std::path::PathBuf;

use safewatch_core::error::Result;

/// Overrides the data directory outright.
pub const DATA_DIR_ENV: &str = "SAFEWATCH_DATA_DIR";

/// Return the service data directory, creating it if needed.
///
/// `SAFEWATCH_DATA_DIR` wins; otherwise `$XDG_DATA_HOME/safewatch`, then
/// `~/.local/share/safewatch`.
pub fn data_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs_fallback().join("safewatch"),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn dirs_fallback() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    // Last resort
    PathBuf::from("/var/lib")
}
