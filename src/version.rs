//! Version strings for the fanjoin binary.
//!
//! Packaged builds can set `FANJOIN_GIT_REV` at compile time to stamp the
//! git revision into `--version` output.

use std::sync::LazyLock;

/// The package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git revision baked in at build time (empty string if not set).
pub const GIT_REV: &str = match option_env!("FANJOIN_GIT_REV") {
    Some(rev) => rev,
    None => "",
};

static FULL_VERSION: LazyLock<String> = LazyLock::new(|| {
    if GIT_REV.is_empty() {
        PKG_VERSION.to_string()
    } else {
        format!("{} ({})", PKG_VERSION, GIT_REV)
    }
});

/// Returns `"X.Y.Z (rev)"` when a revision was baked in, else `"X.Y.Z"`.
///
/// # Examples
///
/// ```
/// use fanjoin::version::full_version;
///
/// assert!(full_version().starts_with(env!("CARGO_PKG_VERSION")));
/// ```
pub fn full_version() -> &'static str {
    FULL_VERSION.as_str()
}

/// Short version for `-V`.
pub fn clap_version() -> &'static str {
    PKG_VERSION
}

/// Long version for `--version`.
pub fn long_version() -> &'static str {
    full_version()
}
