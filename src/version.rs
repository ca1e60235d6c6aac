//! Version and build information.

/// Full version string including build metadata.
///
/// Returns format: "driftsync {version} ({commit} {date})"
pub fn version() -> String {
    format!(
        "driftsync {} ({} {})",
        env!("CARGO_PKG_VERSION"),
        build_commit(),
        build_date()
    )
}

/// Build commit SHA, or "unknown" if not built from a git checkout.
pub fn build_commit() -> &'static str {
    option_env!("DRIFTSYNC_COMMIT_SHA").unwrap_or("unknown")
}

/// Build date, or "unknown" if not built with date info.
pub fn build_date() -> &'static str {
    option_env!("DRIFTSYNC_BUILD_DATE").unwrap_or("unknown")
}
