//! Harness configuration
//!
//! Everything the harness needs from the outside world (credentials, network
//! names, timeout tiers) lives in [`HarnessConfig`], which is built once by the
//! CLI and passed explicitly into every provisioner, driver and verifier.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::wait::WaitConfig;
use crate::{Error, Result};

/// Secret data key for the Keystone URL
pub const SECRET_KEY_AUTH_URL: &str = "authURL";
/// Secret data key for the Keystone domain
pub const SECRET_KEY_DOMAIN_NAME: &str = "domainName";
/// Secret data key for the password
pub const SECRET_KEY_PASSWORD: &str = "password";
/// Secret data key for the region
pub const SECRET_KEY_REGION: &str = "region";
/// Secret data key for the project (tenant)
pub const SECRET_KEY_TENANT_NAME: &str = "tenantName";
/// Secret data key for the user
pub const SECRET_KEY_USER_NAME: &str = "username";

/// Default worker CIDR requested from the reconciler
pub const DEFAULT_WORKERS_CIDR: &str = "10.250.0.0/16";

/// OpenStack password credentials
#[derive(Clone, Default, PartialEq)]
pub struct OpenStackCredentials {
    /// Keystone v3 endpoint, e.g. `https://identity.example.com/v3`
    pub auth_url: String,
    /// User and project domain
    pub domain_name: String,
    /// Password
    pub password: String,
    /// Region used for the service catalog and the object under test
    pub region: String,
    /// Project name
    pub tenant_name: String,
    /// User name
    pub user_name: String,
}

impl std::fmt::Debug for OpenStackCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenStackCredentials")
            .field("auth_url", &self.auth_url)
            .field("domain_name", &self.domain_name)
            .field("password", &"<redacted>")
            .field("region", &self.region)
            .field("tenant_name", &self.tenant_name)
            .field("user_name", &self.user_name)
            .finish()
    }
}

impl OpenStackCredentials {
    /// Data for the `cloudprovider` secret the reconciler reads
    pub fn secret_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (SECRET_KEY_AUTH_URL.to_string(), self.auth_url.clone()),
            (SECRET_KEY_DOMAIN_NAME.to_string(), self.domain_name.clone()),
            (SECRET_KEY_PASSWORD.to_string(), self.password.clone()),
            (SECRET_KEY_REGION.to_string(), self.region.clone()),
            (SECRET_KEY_TENANT_NAME.to_string(), self.tenant_name.clone()),
            (SECRET_KEY_USER_NAME.to_string(), self.user_name.clone()),
        ])
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("--auth-url", &self.auth_url),
            ("--domain-name", &self.domain_name),
            ("--password", &self.password),
            ("--region", &self.region),
            ("--tenant-name", &self.tenant_name),
            ("--user-name", &self.user_name),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(flag, _)| flag)
        .collect()
    }
}

/// Timeout tiers for every convergence wait the harness performs
#[derive(Clone, Debug, PartialEq)]
pub struct WaitTiers {
    /// Waiting for an object to become ready after create or reconcile
    pub creation: WaitConfig,
    /// Waiting for a bastion to become ready (instance boot is slower)
    pub bastion_creation: WaitConfig,
    /// Waiting for the reconciler to pick up the operation annotation
    pub reconcile_trigger: WaitConfig,
    /// Waiting for an object to disappear after delete
    pub deletion: WaitConfig,
    /// Grace window for provider-side existence checks
    pub existence_grace: WaitConfig,
}

impl Default for WaitTiers {
    fn default() -> Self {
        Self {
            creation: WaitConfig::creation(),
            bastion_creation: WaitConfig::bastion_creation(),
            reconcile_trigger: WaitConfig::reconcile_trigger(),
            deletion: WaitConfig::deletion(),
            existence_grace: WaitConfig::existence_grace(),
        }
    }
}

/// Complete harness configuration
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// Provider credentials
    pub credentials: OpenStackCredentials,
    /// Floating pool (external network) used by infrastructure scenarios
    pub floating_pool_name: String,
    /// External network used as router gateway in bastion scenarios
    pub bastion_external_network: String,
    /// Worker CIDR requested from the reconciler
    pub workers_cidr: String,
    /// SSH public key placed into infrastructure objects
    pub ssh_public_key: String,
    /// Timeout tiers
    pub waits: WaitTiers,
    /// Deadline for a single scenario; cleanup still runs when it fires
    pub scenario_deadline: Duration,
}

impl HarnessConfig {
    /// Check that every required value is present, reporting all missing flags at once
    pub fn validate(&self) -> Result<()> {
        let mut missing = self.credentials.missing_fields();
        if self.floating_pool_name.trim().is_empty() {
            missing.push("--floating-pool-name");
        }
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "required flags not specified: {}",
                missing.join(", ")
            )));
        }

        if !self.workers_cidr.contains('/') {
            return Err(Error::config(format!(
                "workers CIDR '{}' is not in address/prefix form",
                self.workers_cidr
            )));
        }

        for (name, tier) in [
            ("creation", &self.waits.creation),
            ("bastion-creation", &self.waits.bastion_creation),
            ("reconcile-trigger", &self.waits.reconcile_trigger),
            ("deletion", &self.waits.deletion),
            ("existence-grace", &self.waits.existence_grace),
        ] {
            tier.validate()
                .map_err(|e| Error::config(format!("{name} wait tier: {e}")))?;
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_config() -> HarnessConfig {
        HarnessConfig {
            credentials: OpenStackCredentials {
                auth_url: "https://keystone.example.com/v3".to_string(),
                domain_name: "example".to_string(),
                password: "hunter2".to_string(),
                region: "eu-de-1".to_string(),
                tenant_name: "harness".to_string(),
                user_name: "ci".to_string(),
            },
            floating_pool_name: "FloatingIP-external".to_string(),
            bastion_external_network: "FloatingIP-external".to_string(),
            workers_cidr: DEFAULT_WORKERS_CIDR.to_string(),
            ssh_public_key: "ssh-rsa AAAA test@example.com".to_string(),
            waits: WaitTiers::default(),
            scenario_deadline: Duration::from_secs(3600),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn every_missing_flag_is_reported_at_once() {
        let mut config = sample_config();
        config.credentials.password = String::new();
        config.credentials.region = "  ".to_string();
        config.floating_pool_name = String::new();

        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("--password"));
        assert!(msg.contains("--region"));
        assert!(msg.contains("--floating-pool-name"));
        assert!(!msg.contains("--auth-url"));
    }

    #[test]
    fn malformed_cidr_is_rejected() {
        let mut config = sample_config();
        config.workers_cidr = "10.250.0.0".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn inverted_wait_tier_is_rejected() {
        let mut config = sample_config();
        config.waits.deletion.timeout = Duration::from_secs(1);
        config.waits.deletion.poll_interval = Duration::from_secs(10);
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("deletion"));
    }

    #[test]
    fn debug_output_redacts_password() {
        let rendered = format!("{:?}", sample_config().credentials);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn secret_data_uses_reconciler_keys() {
        let data = sample_config().credentials.secret_data();
        assert_eq!(data.len(), 6);
        assert_eq!(data[SECRET_KEY_USER_NAME], "ci");
        assert_eq!(data[SECRET_KEY_AUTH_URL], "https://keystone.example.com/v3");
    }
}
