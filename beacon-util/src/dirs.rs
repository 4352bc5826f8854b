//! Default locations of the gateway's files.
//!
//! Both can be overridden from the command line; these are only used when
//! no explicit path was given.

use std::path::PathBuf;

const APP: &str = env!("BEACON_PKG_NAME");

/// Resolve `base/beacon`, or `$HOME/<fallback..>/beacon` on platforms that
/// do not define `base`
fn app_dir(base: Option<PathBuf>, fallback: &[&str]) -> PathBuf {
    base.unwrap_or_else(|| {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        fallback.iter().fold(home, |dir, part| dir.join(part))
    })
    .join(APP)
}

/// Where `controllers.json` and `points.json` are kept
pub fn config_dir() -> PathBuf {
    app_dir(dirs::config_dir(), &[".config"])
}

/// Where the offline queue database is kept
pub fn state_dir() -> PathBuf {
    app_dir(dirs::state_dir(), &[".local", "state"])
}
