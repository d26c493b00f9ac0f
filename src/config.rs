//! Deployment configuration
//!
//! Composed of focused sub-configs mirroring the resource families the plan
//! builder derives descriptors from. All values arrive via CLI flags or
//! environment variables; nothing here talks to the network.

/// Target project and naming
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    /// Cloud project id
    pub project: String,
    /// Default region for regional resources
    pub region: String,
    /// Naming prefix shared by every resource in the deployment
    pub prefix: String,
}

/// Database instance and schema parameters
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Machine tier for the instance (e.g. db-f1-micro)
    pub tier: String,
    /// Engine version (e.g. POSTGRES_16)
    pub version: String,
    /// Logical database name the application connects to
    pub database: String,
    /// Database user the application connects as
    pub user: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            tier: "db-f1-micro".to_string(),
            version: "POSTGRES_16".to_string(),
            database: "n8n".to_string(),
            user: "n8n".to_string(),
        }
    }
}

/// Startup probe parameters for the service container
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub initial_delay_secs: u32,
    pub timeout_secs: u32,
    pub period_secs: u32,
    pub failure_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 60,
            timeout_secs: 5,
            period_secs: 10,
            failure_threshold: 10,
        }
    }
}

/// Image the official upstream project publishes
pub const OFFICIAL_IMAGE: &str = "docker.n8n.io/n8nio/n8n";

/// Port the official image listens on
pub const OFFICIAL_PORT: u16 = 5678;

/// Port a custom-built image listens on
pub const CUSTOM_IMAGE_PORT: u16 = 443;

/// Path the extension-artifacts bucket is mounted at inside the container
pub const ARTIFACT_MOUNT_PATH: &str = "/home/node/.n8n/nodes";

/// Cloud Run service parameters
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Custom container image; `None` runs the official image
    pub custom_image: Option<String>,
    /// Public base URL the application is reached at
    pub public_url: String,
    /// URL path prefix served by a custom image
    pub path: String,
    /// Proxy hops between the load balancer and the container
    pub proxy_hops: u32,
    pub probe: ProbeConfig,
}

impl ServiceConfig {
    /// Image reference the service runs
    pub fn image(&self) -> &str {
        self.custom_image.as_deref().unwrap_or(OFFICIAL_IMAGE)
    }

    /// Container port, which differs between official and custom images
    pub fn container_port(&self) -> u16 {
        if self.custom_image.is_some() {
            CUSTOM_IMAGE_PORT
        } else {
            OFFICIAL_PORT
        }
    }
}

/// Operator-supplied secret material
#[derive(Debug, Clone, Default)]
pub struct SecretsConfig {
    /// Existing application encryption key to reuse instead of generating
    /// one (validated against the encryption-key policy pre-flight)
    pub encryption_key: Option<String>,
}

/// Everything one deployment needs
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub project: ProjectConfig,
    pub database: DatabaseConfig,
    pub service: ServiceConfig,
    pub secrets: SecretsConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_selection_drives_port() {
        let mut service = ServiceConfig {
            custom_image: None,
            public_url: "https://n8n.example.com".to_string(),
            path: "/".to_string(),
            proxy_hops: 1,
            probe: ProbeConfig::default(),
        };
        assert_eq!(service.image(), OFFICIAL_IMAGE);
        assert_eq!(service.container_port(), OFFICIAL_PORT);

        service.custom_image = Some("europe-docker.pkg.dev/p/repo/n8n:1".to_string());
        assert_eq!(service.container_port(), CUSTOM_IMAGE_PORT);
    }
}
