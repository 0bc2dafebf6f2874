//! Build information captured at compile time.

/// Package version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short git commit hash (7 chars).
pub const BUILD_HASH: &str = env!("BUILD_HASH");

const BUILD_DIRTY_STR: &str = env!("BUILD_DIRTY");

fn is_dirty() -> bool {
    BUILD_DIRTY_STR == "true"
}

/// Full version string, e.g. `0.1.0 (abc1234)` or `0.1.0 (abc1234*)` if dirty.
#[must_use]
pub fn version_string() -> String {
    if is_dirty() {
        format!("{VERSION} ({BUILD_HASH}*)")
    } else {
        format!("{VERSION} ({BUILD_HASH})")
    }
}

/// `User-Agent` sent on outbound requests (GitHub requires one).
#[must_use]
pub fn user_agent() -> String {
    format!("onyx-cli/{VERSION}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_package_version() {
        assert!(version_string().starts_with(VERSION));
        assert!(version_string().contains(BUILD_HASH));
    }

    #[test]
    fn user_agent_names_the_cli() {
        assert_eq!(user_agent(), format!("onyx-cli/{VERSION}"));
    }
}
