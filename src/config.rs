//! Operator configuration
//!
//! Image coordinates and version tags come from the environment with
//! defaults matching the published images; everything else about a cluster
//! comes from its Jmeter resource.

use tracing::info;

/// Operator version, baked in at build time
pub const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default JMeter image version tag
pub const DEFAULT_JMETER_TAG: &str = "5.4.1";

/// Default nginx front-end image version tag
pub const DEFAULT_NGINX_TAG: &str = "1.24.0-up";

/// Environment variable overriding the default image repository
pub const REPOSITORY_ENV: &str = "JMETER_OPERATOR_DEFAULT_REPOSITORY";

/// Resolved operator configuration
///
/// Constructed once at startup and shared through the controller context.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Image repository prefix for the jmeter and nginx images
    pub image_repository: String,
    /// JMeter image tag
    pub jmeter_tag: String,
    /// nginx image tag
    pub nginx_tag: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl OperatorConfig {
    /// Build the configuration from the environment
    pub fn from_env() -> Self {
        let image_repository = std::env::var(REPOSITORY_ENV)
            .unwrap_or_else(|_| "jmeter".to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            image_repository,
            jmeter_tag: DEFAULT_JMETER_TAG.to_string(),
            nginx_tag: DEFAULT_NGINX_TAG.to_string(),
        }
    }

    /// Full image reference for the JMeter worker container
    pub fn jmeter_image(&self) -> String {
        format!("{}/jmeter:{}", self.image_repository, self.jmeter_tag)
    }

    /// Full image reference for the nginx front-end container
    pub fn nginx_image(&self) -> String {
        format!("{}/nginx:{}", self.image_repository, self.nginx_tag)
    }

    /// Log the effective configuration at startup
    pub fn log_banner(&self) {
        info!(version = OPERATOR_VERSION, "jmeter operator starting");
        info!(repository = %self.image_repository, "image repository");
        info!(jmeter = %self.jmeter_image(), nginx = %self.nginx_image(), "images");
    }
}
