//! External resource provisioner
//!
//! Creates the OpenStack resources a scenario hands to the reconciler as
//! pre-existing inputs, and registers each one's teardown on the scenario's
//! [`CleanupStack`] the moment it exists. Creation failures abort the scenario
//! as [`Error::Setup`]; teardowns are idempotent and retried with backoff.
//!
//! Attaching a subnet to a router swaps the subnet's plain deletion for a
//! "detach, then delete" step registered after the router, so the unwind order
//! is: detach and delete subnet, delete router, delete network.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::cleanup::{CleanupAction, CleanupHandle, CleanupStack};
use crate::provider::{ListFilter, Network, NetworkProvider, SubnetSpec};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// A resource created by the provisioner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Provisioned {
    /// Provider ID
    pub id: String,
    /// Registration of its teardown
    pub handle: CleanupHandle,
}

/// Teardown command for one provisioned resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderTeardown {
    /// Delete a network
    DeleteNetwork(String),
    /// Delete a subnet
    DeleteSubnet(String),
    /// Detach a subnet from a router, then delete it
    DetachAndDeleteSubnet {
        /// Router the subnet is attached to
        router_id: String,
        /// Subnet to detach and delete
        subnet_id: String,
    },
    /// Delete a router
    DeleteRouter(String),
    /// Delete a security group
    DeleteSecurityGroup(String),
}

impl std::fmt::Display for ProviderTeardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeleteNetwork(id) => write!(f, "delete network {id}"),
            Self::DeleteSubnet(id) => write!(f, "delete subnet {id}"),
            Self::DetachAndDeleteSubnet {
                router_id,
                subnet_id,
            } => write!(f, "detach subnet {subnet_id} from router {router_id} and delete it"),
            Self::DeleteRouter(id) => write!(f, "delete router {id}"),
            Self::DeleteSecurityGroup(id) => write!(f, "delete security group {id}"),
        }
    }
}

/// Absence means the step already happened
fn already_done(result: Result<()>, step: &str) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => {
            debug!(step = %step, "Resource already gone");
            Ok(())
        }
        other => other,
    }
}

/// [`CleanupAction`] executing a [`ProviderTeardown`] against a provider
pub struct TeardownStep {
    provider: Arc<dyn NetworkProvider>,
    command: ProviderTeardown,
    retry: RetryConfig,
}

impl TeardownStep {
    /// Bind a command to the provider that executes it
    pub fn new(provider: Arc<dyn NetworkProvider>, command: ProviderTeardown, retry: RetryConfig) -> Self {
        Self {
            provider,
            command,
            retry,
        }
    }
}

#[async_trait]
impl CleanupAction for TeardownStep {
    fn describe(&self) -> String {
        self.command.to_string()
    }

    async fn run(&self) -> Result<()> {
        let provider = &self.provider;
        match &self.command {
            ProviderTeardown::DeleteNetwork(id) => already_done(
                retry_with_backoff(&self.retry, "delete_network", || provider.delete_network(id))
                    .await,
                "delete network",
            ),
            ProviderTeardown::DeleteSubnet(id) => already_done(
                retry_with_backoff(&self.retry, "delete_subnet", || provider.delete_subnet(id))
                    .await,
                "delete subnet",
            ),
            ProviderTeardown::DetachAndDeleteSubnet {
                router_id,
                subnet_id,
            } => {
                already_done(
                    retry_with_backoff(&self.retry, "remove_router_interface", || {
                        provider.remove_router_interface(router_id, subnet_id)
                    })
                    .await,
                    "remove router interface",
                )?;
                already_done(
                    retry_with_backoff(&self.retry, "delete_subnet", || {
                        provider.delete_subnet(subnet_id)
                    })
                    .await,
                    "delete subnet",
                )
            }
            ProviderTeardown::DeleteRouter(id) => already_done(
                retry_with_backoff(&self.retry, "delete_router", || provider.delete_router(id))
                    .await,
                "delete router",
            ),
            ProviderTeardown::DeleteSecurityGroup(id) => already_done(
                retry_with_backoff(&self.retry, "delete_security_group", || {
                    provider.delete_security_group(id)
                })
                .await,
                "delete security group",
            ),
        }
    }
}

/// Creates prerequisite resources and registers their teardown
pub struct Provisioner {
    provider: Arc<dyn NetworkProvider>,
    cleanup: CleanupStack,
    teardown_retry: RetryConfig,
}

impl Provisioner {
    /// Provision through `provider`, registering teardowns on `cleanup`
    pub fn new(provider: Arc<dyn NetworkProvider>, cleanup: CleanupStack) -> Self {
        Self {
            provider,
            cleanup,
            teardown_retry: RetryConfig::teardown(),
        }
    }

    /// Override the retry policy of registered teardowns
    pub fn with_teardown_retry(mut self, retry: RetryConfig) -> Self {
        self.teardown_retry = retry;
        self
    }

    /// The provider this provisioner talks to
    pub fn provider(&self) -> &Arc<dyn NetworkProvider> {
        &self.provider
    }

    fn register(&self, command: ProviderTeardown) -> CleanupHandle {
        self.cleanup.register(TeardownStep::new(
            self.provider.clone(),
            command,
            self.teardown_retry.clone(),
        ))
    }

    /// Create a network
    pub async fn create_network(&self, name: &str) -> Result<Provisioned> {
        let network = self
            .provider
            .create_network(name)
            .await
            .map_err(|e| e.into_setup(&format!("create network {name}")))?;
        let handle = self.register(ProviderTeardown::DeleteNetwork(network.id.clone()));
        info!(network_id = %network.id, name = %name, "Created network");
        Ok(Provisioned {
            id: network.id,
            handle,
        })
    }

    /// Create a subnet inside `network_id`
    pub async fn create_subnet(
        &self,
        name: &str,
        network_id: &str,
        spec: &SubnetSpec,
    ) -> Result<Provisioned> {
        let subnet = self
            .provider
            .create_subnet(name, network_id, spec)
            .await
            .map_err(|e| e.into_setup(&format!("create subnet {name}")))?;
        let handle = self.register(ProviderTeardown::DeleteSubnet(subnet.id.clone()));
        info!(subnet_id = %subnet.id, network_id = %network_id, cidr = %spec.cidr, "Created subnet");
        Ok(Provisioned {
            id: subnet.id,
            handle,
        })
    }

    /// Create a router, optionally with an external gateway and an attached subnet
    ///
    /// On attachment the subnet's teardown is replaced and `attach.handle` is
    /// updated to the new registration.
    pub async fn create_router(
        &self,
        name: &str,
        gateway_network_id: Option<&str>,
        attach: Option<&mut Provisioned>,
    ) -> Result<Provisioned> {
        let router = self
            .provider
            .create_router(name, gateway_network_id.map(str::to_string))
            .await
            .map_err(|e| e.into_setup(&format!("create router {name}")))?;
        let handle = self.register(ProviderTeardown::DeleteRouter(router.id.clone()));
        info!(router_id = %router.id, name = %name, "Created router");

        if let Some(subnet) = attach {
            self.provider
                .add_router_interface(&router.id, &subnet.id)
                .await
                .map_err(|e| {
                    e.into_setup(&format!("attach subnet {} to router {}", subnet.id, router.id))
                })?;
            self.cleanup.remove(subnet.handle);
            subnet.handle = self.register(ProviderTeardown::DetachAndDeleteSubnet {
                router_id: router.id.clone(),
                subnet_id: subnet.id.clone(),
            });
            info!(router_id = %router.id, subnet_id = %subnet.id, "Attached subnet to router");
        }

        Ok(Provisioned {
            id: router.id,
            handle,
        })
    }

    /// Create a security group
    pub async fn create_security_group(&self, name: &str, description: &str) -> Result<Provisioned> {
        let group = self
            .provider
            .create_security_group(name, description)
            .await
            .map_err(|e| e.into_setup(&format!("create security group {name}")))?;
        let handle = self.register(ProviderTeardown::DeleteSecurityGroup(group.id.clone()));
        info!(security_group_id = %group.id, name = %name, "Created security group");
        Ok(Provisioned {
            id: group.id,
            handle,
        })
    }

    /// Look up an external network by name; exactly one match is required
    pub async fn find_external_network(&self, name: &str) -> Result<Network> {
        let mut networks = self
            .provider
            .list_networks(&ListFilter::by_name(name).external(true))
            .await
            .map_err(|e| e.into_setup(&format!("look up external network {name}")))?;
        match networks.len() {
            1 => Ok(networks.remove(0)),
            n => Err(Error::setup(format!(
                "expected exactly one external network named {name}, found {n}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockNetworkProvider, Router, SecurityGroup, Subnet};
    use std::sync::Mutex;
    use std::time::Duration;

    type CallLog = Arc<Mutex<Vec<String>>>;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn log_call(log: &CallLog, call: String) {
        log.lock().unwrap().push(call);
    }

    /// A provider whose creates succeed and whose deletes are recorded
    fn recording_provider(log: &CallLog) -> MockNetworkProvider {
        let mut mock = MockNetworkProvider::new();
        mock.expect_create_network().returning(|name| {
            Ok(Network {
                id: "net-1".to_string(),
                name: name.to_string(),
                ..Default::default()
            })
        });
        mock.expect_create_subnet().returning(|name, network_id, spec| {
            Ok(Subnet {
                id: "subnet-1".to_string(),
                name: name.to_string(),
                network_id: network_id.to_string(),
                cidr: spec.cidr.clone(),
                ..Default::default()
            })
        });
        mock.expect_create_router().returning(|name, _| {
            Ok(Router {
                id: "router-1".to_string(),
                name: name.to_string(),
                ..Default::default()
            })
        });
        mock.expect_add_router_interface().returning(|_, _| Ok(()));

        let l = log.clone();
        mock.expect_remove_router_interface().returning(move |router, subnet| {
            log_call(&l, format!("detach {subnet} from {router}"));
            Ok(())
        });
        let l = log.clone();
        mock.expect_delete_subnet().returning(move |id| {
            log_call(&l, format!("delete subnet {id}"));
            Ok(())
        });
        let l = log.clone();
        mock.expect_delete_router().returning(move |id| {
            log_call(&l, format!("delete router {id}"));
            Ok(())
        });
        let l = log.clone();
        mock.expect_delete_network().returning(move |id| {
            log_call(&l, format!("delete network {id}"));
            Ok(())
        });
        mock
    }

    /// Story: a routed subnet unwinds in dependency order
    ///
    /// The bastion scenario creates a network, a subnet inside it and a router
    /// attached to the subnet. Neutron refuses to delete a subnet that still
    /// has a router port, or a network that still has a subnet, so teardown has
    /// to detach first and delete the network last.
    #[tokio::test]
    async fn story_attached_subnet_unwinds_detach_router_network() {
        let log = CallLog::default();
        let stack = CleanupStack::new();
        let provisioner = Provisioner::new(Arc::new(recording_provider(&log)), stack.clone())
            .with_teardown_retry(fast_retry());

        let network = provisioner.create_network("it").await.unwrap();
        let mut subnet = provisioner
            .create_subnet("it", &network.id, &SubnetSpec::new("10.180.0.0/16"))
            .await
            .unwrap();
        let original_subnet_handle = subnet.handle;
        provisioner
            .create_router("it", Some("ext"), Some(&mut subnet))
            .await
            .unwrap();

        assert_ne!(subnet.handle, original_subnet_handle);
        assert_eq!(stack.len(), 3);

        let report = stack.run_all().await;
        assert!(report.is_clean(), "{:?}", report.failure_messages());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "detach subnet-1 from router-1",
                "delete subnet subnet-1",
                "delete router router-1",
                "delete network net-1",
            ]
        );
    }

    #[tokio::test]
    async fn creation_failure_is_a_setup_error_and_registers_nothing() {
        let mut mock = MockNetworkProvider::new();
        mock.expect_create_network()
            .returning(|_| Err(Error::provider(403, "quota exceeded")));
        let stack = CleanupStack::new();
        let provisioner = Provisioner::new(Arc::new(mock), stack.clone());

        let err = provisioner.create_network("it").await.unwrap_err();
        assert!(matches!(err, Error::Setup(ref msg) if msg.contains("quota exceeded")));
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn failed_attachment_keeps_plain_subnet_teardown() {
        let log = CallLog::default();
        let mut mock = MockNetworkProvider::new();
        mock.expect_create_router().returning(|_, _| {
            Ok(Router {
                id: "router-1".to_string(),
                ..Default::default()
            })
        });
        mock.expect_add_router_interface()
            .returning(|_, _| Err(Error::provider(400, "subnet overlaps")));
        mock.expect_create_subnet().returning(|_, _, _| {
            Ok(Subnet {
                id: "subnet-1".to_string(),
                ..Default::default()
            })
        });
        let l = log.clone();
        mock.expect_delete_subnet().returning(move |id| {
            log_call(&l, format!("delete subnet {id}"));
            Ok(())
        });
        let l = log.clone();
        mock.expect_delete_router().returning(move |id| {
            log_call(&l, format!("delete router {id}"));
            Ok(())
        });

        let stack = CleanupStack::new();
        let provisioner =
            Provisioner::new(Arc::new(mock), stack.clone()).with_teardown_retry(fast_retry());
        let mut subnet = provisioner
            .create_subnet("it", "net-1", &SubnetSpec::new("10.180.0.0/16"))
            .await
            .unwrap();
        let before = subnet.handle;

        let err = provisioner
            .create_router("it", None, Some(&mut subnet))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
        assert_eq!(subnet.handle, before);

        stack.run_all().await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["delete router router-1", "delete subnet subnet-1"]
        );
    }

    #[tokio::test]
    async fn teardown_of_vanished_resource_succeeds() {
        let mut mock = MockNetworkProvider::new();
        mock.expect_create_security_group().returning(|name, description| {
            Ok(SecurityGroup {
                id: "sg-1".to_string(),
                name: name.to_string(),
                description: description.to_string(),
            })
        });
        mock.expect_delete_security_group()
            .times(1)
            .returning(|id| Err(Error::not_found("security group", id)));

        let stack = CleanupStack::new();
        let provisioner = Provisioner::new(Arc::new(mock), stack.clone());
        provisioner.create_security_group("it-sg", "it").await.unwrap();

        assert!(stack.run_all().await.is_clean());
    }

    #[tokio::test]
    async fn teardown_retries_conflicts() {
        let attempts = Arc::new(Mutex::new(0u32));
        let mut mock = MockNetworkProvider::new();
        mock.expect_create_network().returning(|_| {
            Ok(Network {
                id: "net-1".to_string(),
                ..Default::default()
            })
        });
        let a = attempts.clone();
        mock.expect_delete_network().returning(move |_| {
            let mut n = a.lock().unwrap();
            *n += 1;
            if *n < 3 {
                Err(Error::provider(409, "network has ports"))
            } else {
                Ok(())
            }
        });

        let stack = CleanupStack::new();
        let provisioner =
            Provisioner::new(Arc::new(mock), stack.clone()).with_teardown_retry(fast_retry());
        provisioner.create_network("it").await.unwrap();

        assert!(stack.run_all().await.is_clean());
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn external_network_lookup_requires_exactly_one_match() {
        let mut mock = MockNetworkProvider::new();
        mock.expect_list_networks()
            .withf(|f| f.name.as_deref() == Some("FloatingIP-external") && f.external == Some(true))
            .returning(|_| {
                Ok(vec![Network {
                    id: "ext".to_string(),
                    external: true,
                    ..Default::default()
                }])
            });
        mock.expect_list_networks().returning(|_| {
            Ok(vec![Network::default(), Network::default()])
        });

        let provisioner = Provisioner::new(Arc::new(mock), CleanupStack::new());
        assert_eq!(
            provisioner
                .find_external_network("FloatingIP-external")
                .await
                .unwrap()
                .id,
            "ext"
        );
        let err = provisioner.find_external_network("ambiguous").await.unwrap_err();
        assert!(err.to_string().contains("found 2"));
    }
}
