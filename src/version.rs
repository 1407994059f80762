//! Version calculation utilities.

use std::sync::OnceLock;

shadow_rs::shadow!(build_info);

/// The long version string of the tool: package version, git info, and
/// platform info.
fn long_version() -> String {
    format!(
        "{} ({})\nplatform: {}",
        build_info::PKG_VERSION,
        if build_info::GIT_CLEAN {
            format!(
                "{} {}",
                if build_info::TAG.is_empty() {
                    build_info::SHORT_COMMIT
                } else {
                    build_info::TAG
                },
                build_info::COMMIT_DATE.split(' ').collect::<Vec<_>>()[0],
            )
        } else {
            format!("{}-dirty", build_info::SHORT_COMMIT)
        },
        build_info::BUILD_TARGET,
    )
}

/// Same content as [`long_version`], cached as a `'static str` so it can
/// feed clap's `version` attribute.
pub fn get_long_version() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();
    VERSION.get_or_init(long_version)
}
