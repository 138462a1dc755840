use std::fmt::{self, Display};

use serde::Serialize;

/// Build metadata captured at compile time by the binary's build script.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub build_profile: String,
    pub build_features: String,
    pub version: String,
    pub build_timestamp: String,
    pub rust_version: String,
}

impl Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version: {}\nprofile: {}\nfeatures: {}\nbuilt: {}\nrustc: {}",
            self.version,
            self.build_profile,
            self.build_features,
            self.build_timestamp,
            self.rust_version
        )
    }
}

/// Collect [`BuildInfo`] from the calling crate's build environment.
///
/// The caller must emit `BUILD_PROFILE`, `BUILD_FEATURES`, `REPO_VERSION`,
/// `BUILD_TIMESTAMP` and `RUST_VERSION` from its build script.
#[macro_export]
macro_rules! build_info {
    () => {
        $crate::version::BuildInfo {
            build_profile: env!("BUILD_PROFILE").to_string(),
            build_features: env!("BUILD_FEATURES").to_string(),
            version: env!("REPO_VERSION").to_string(),
            build_timestamp: env!("BUILD_TIMESTAMP").to_string(),
            rust_version: env!("RUST_VERSION").to_string(),
        }
    };
}
