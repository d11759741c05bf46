//! Reconciliation driver
//!
//! Walks one extension object through its lifecycle against a reconciler the
//! harness does not own:
//!
//! ```text
//! Absent -> Created -> AwaitingFirstConvergence -> Converged
//!        Converged -> AwaitingReconcileTrigger -> AwaitingSecondConvergence -> Converged
//!        Converged -> Deleting -> AwaitingDeletionConvergence -> Gone
//! ```
//!
//! Any other transition is rejected. Creating the object registers a safety-net
//! cleanup (delete and wait for deletion) so a scenario that fails halfway
//! still removes what the reconciler built; the driver's own [`Driver::delete`]
//! retires the safety net once deletion converged.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::cleanup::{CleanupHandle, CleanupStack};
use crate::config::{OpenStackCredentials, WaitTiers};
use crate::crd::openstack::{FlowState, InfrastructureStatus};
use crate::crd::{Cluster, ClusterSpec, ExtensionObject, Infrastructure};
use crate::store::{merge_patch_between, ObjectStore};
use crate::wait::{
    extension_ready, object_deleted, operation_annotation_removed, wait_until, Readiness,
    WaitConfig,
};
use crate::{
    Error, Result, CLOUDPROVIDER_SECRET_NAME, CONTROLPLANE_PRIORITY_CLASS,
    CONTROLPLANE_PRIORITY_CLASS_VALUE, OPERATION_ANNOTATION, OPERATION_RECONCILE,
    USE_FLOW_ANNOTATION,
};

// =============================================================================
// Phases
// =============================================================================

/// Lifecycle phase of the driven object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Not created yet
    Absent,
    /// Create request accepted
    Created,
    /// Waiting for the reconciler to finish the first pass
    AwaitingFirstConvergence,
    /// Reconciler reported success for the current generation
    Converged,
    /// Reconcile requested, waiting for the reconciler to pick it up
    AwaitingReconcileTrigger,
    /// Reconcile picked up, waiting for it to finish
    AwaitingSecondConvergence,
    /// Delete request accepted
    Deleting,
    /// Waiting for the object to disappear
    AwaitingDeletionConvergence,
    /// Object no longer exists
    Gone,
}

impl Phase {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Absent, Created)
                | (Created, AwaitingFirstConvergence)
                | (AwaitingFirstConvergence, Converged)
                | (Converged, AwaitingReconcileTrigger)
                | (AwaitingReconcileTrigger, AwaitingSecondConvergence)
                | (AwaitingSecondConvergence, Converged)
                | (Converged, Deleting)
                | (Deleting, AwaitingDeletionConvergence)
                | (AwaitingDeletionConvergence, Gone)
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// Reconcile Strategies
// =============================================================================

/// Reconciler backend selection exercised by a scenario
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum ReconcileStrategy {
    /// Legacy backend throughout
    Terraformer,
    /// Flow backend throughout
    Flow,
    /// Created with the legacy backend, reconciled again with the flow backend
    MigrateToFlow,
    /// Flow backend; persisted state is dropped before the second reconcile
    FlowRecoverState,
}

impl ReconcileStrategy {
    /// Every strategy, in matrix order
    pub const ALL: [ReconcileStrategy; 4] = [
        Self::Flow,
        Self::Terraformer,
        Self::MigrateToFlow,
        Self::FlowRecoverState,
    ];

    fn use_flow() -> BTreeMap<String, String> {
        BTreeMap::from([(USE_FLOW_ANNOTATION.to_string(), "true".to_string())])
    }

    /// Annotations the object is created with
    pub fn creation_annotations(self) -> BTreeMap<String, String> {
        match self {
            Self::Flow | Self::FlowRecoverState => Self::use_flow(),
            Self::Terraformer | Self::MigrateToFlow => BTreeMap::new(),
        }
    }

    /// Annotations added next to the reconcile trigger
    pub fn trigger_annotations(self) -> BTreeMap<String, String> {
        match self {
            Self::MigrateToFlow => Self::use_flow(),
            _ => BTreeMap::new(),
        }
    }

    /// Whether the persisted state is dropped before the second reconcile
    pub fn injects_state_loss(self) -> bool {
        self == Self::FlowRecoverState
    }
}

impl std::fmt::Display for ReconcileStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terraformer => write!(f, "terraformer"),
            Self::Flow => write!(f, "flow"),
            Self::MigrateToFlow => write!(f, "migrate-to-flow"),
            Self::FlowRecoverState => write!(f, "flow-recover-state"),
        }
    }
}

// =============================================================================
// Prerequisites
// =============================================================================

/// Stores for the objects that have to exist before the extension object
pub struct Prerequisites {
    /// Namespaces
    pub namespaces: Arc<dyn ObjectStore<Namespace>>,
    /// Cluster objects
    pub clusters: Arc<dyn ObjectStore<Cluster>>,
    /// Secrets in the scenario namespace
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    /// Priority classes
    pub priority_classes: Arc<dyn ObjectStore<PriorityClass>>,
}

fn named(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn credentials_secret(namespace: &str, credentials: &OpenStackCredentials) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(CLOUDPROVIDER_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            credentials
                .secret_data()
                .into_iter()
                .map(|(k, v)| (k, ByteString(v.into_bytes())))
                .collect(),
        ),
        ..Default::default()
    }
}

fn controlplane_priority_class() -> PriorityClass {
    PriorityClass {
        metadata: named(CONTROLPLANE_PRIORITY_CLASS),
        value: CONTROLPLANE_PRIORITY_CLASS_VALUE,
        ..Default::default()
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Lifecycle driver for one extension object
pub struct Driver<K: ExtensionObject> {
    objects: Arc<dyn ObjectStore<K>>,
    cleanup: CleanupStack,
    waits: WaitTiers,
    readiness: WaitConfig,
    namespace: String,
    name: String,
    phase: Phase,
    safety_net: Option<CleanupHandle>,
}

impl<K: ExtensionObject> Driver<K> {
    /// Driver for the object `namespace/name`, waiting for readiness under the creation tier
    pub fn new(
        objects: Arc<dyn ObjectStore<K>>,
        cleanup: CleanupStack,
        waits: WaitTiers,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let readiness = waits.creation.clone();
        Self {
            objects,
            cleanup,
            waits,
            readiness,
            namespace: namespace.into(),
            name: name.into(),
            phase: Phase::Absent,
            safety_net: None,
        }
    }

    /// Use a different readiness tier (bastions boot an instance)
    pub fn with_readiness(mut self, readiness: WaitConfig) -> Self {
        self.readiness = readiness;
        self
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Namespace of the driven object
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn describe(&self) -> String {
        format!("{} {}/{}", K::kind(&()), self.namespace, self.name)
    }

    fn transition(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::validation(format!(
                "{}: illegal transition {} -> {next}",
                self.describe(),
                self.phase
            )));
        }
        info!(object = %self.describe(), from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
        Ok(())
    }

    async fn wait_for<P>(&self, what: &str, config: &WaitConfig, predicate: P) -> Result<Option<K>>
    where
        P: Fn(Option<&K>) -> Readiness,
    {
        let objects = &self.objects;
        let name = self.name.as_str();
        wait_until(what, config, || objects.get(name), predicate).await
    }

    fn present(&self, observed: Option<K>) -> Result<K> {
        observed.ok_or_else(|| Error::not_found("extension object", self.describe()))
    }

    /// Create the namespace, `Cluster` and credential secret the reconciler expects
    ///
    /// The shared control-plane priority class is ensured as well and left in
    /// place afterwards. Everything else is registered for cleanup.
    #[instrument(skip_all, fields(namespace = %self.namespace))]
    pub async fn create_prerequisites(
        &self,
        stores: &Prerequisites,
        cluster: ClusterSpec,
        credentials: &OpenStackCredentials,
    ) -> Result<()> {
        stores
            .priority_classes
            .create_if_absent(&controlplane_priority_class())
            .await
            .map_err(|e| e.into_setup("ensure priority class"))?;

        let namespace = Namespace {
            metadata: named(&self.namespace),
            ..Default::default()
        };
        stores
            .namespaces
            .create(&namespace)
            .await
            .map_err(|e| e.into_setup("create namespace"))?;
        let namespaces = stores.namespaces.clone();
        let name = self.namespace.clone();
        self.cleanup
            .register_fn(format!("delete namespace {}", self.namespace), move || {
                let namespaces = namespaces.clone();
                let name = name.clone();
                async move { namespaces.delete_ignoring_not_found(&name).await }
            });

        // The reconciler finds the Cluster by the name of the object's namespace
        let cluster = Cluster::new(&self.namespace, cluster);
        stores
            .clusters
            .create(&cluster)
            .await
            .map_err(|e| e.into_setup("create cluster"))?;
        let clusters = stores.clusters.clone();
        let name = self.namespace.clone();
        self.cleanup
            .register_fn(format!("delete cluster {}", self.namespace), move || {
                let clusters = clusters.clone();
                let name = name.clone();
                async move { clusters.delete_ignoring_not_found(&name).await }
            });

        stores
            .secrets
            .create(&credentials_secret(&self.namespace, credentials))
            .await
            .map_err(|e| e.into_setup("create cloudprovider secret"))?;
        let secrets = stores.secrets.clone();
        self.cleanup.register_fn(
            format!("delete secret {}/{CLOUDPROVIDER_SECRET_NAME}", self.namespace),
            move || {
                let secrets = secrets.clone();
                async move { secrets.delete_ignoring_not_found(CLOUDPROVIDER_SECRET_NAME).await }
            },
        );

        info!("Prerequisites created");
        Ok(())
    }

    /// Submit the object; failures abort the scenario without retry
    #[instrument(skip_all, fields(namespace = %self.namespace, name = %self.name))]
    pub async fn create(&mut self, mut obj: K) -> Result<K> {
        if self.phase != Phase::Absent {
            return Err(Error::validation(format!(
                "{} already created (phase {})",
                self.describe(),
                self.phase
            )));
        }
        obj.meta_mut().name = Some(self.name.clone());
        obj.meta_mut().namespace = Some(self.namespace.clone());

        let created = self
            .objects
            .create(&obj)
            .await
            .map_err(|e| e.into_setup(&format!("create {}", self.describe())))?;
        self.transition(Phase::Created)?;

        let objects = self.objects.clone();
        let name = self.name.clone();
        let deletion = self.waits.deletion.clone();
        let what = format!("deletion of {}", self.describe());
        self.safety_net = Some(self.cleanup.register_fn(
            format!("delete {}", self.describe()),
            move || {
                let objects = objects.clone();
                let name = name.clone();
                let deletion = deletion.clone();
                let what = what.clone();
                async move {
                    objects.delete_ignoring_not_found(&name).await?;
                    wait_until(&what, &deletion, || objects.get(&name), object_deleted::<K>())
                        .await?;
                    Ok(())
                }
            },
        ));

        Ok(created)
    }

    /// Wait for the first successful reconcile
    #[instrument(skip_all, fields(namespace = %self.namespace, name = %self.name))]
    pub async fn await_convergence(&mut self) -> Result<K> {
        self.transition(Phase::AwaitingFirstConvergence)?;
        let what = format!("{} to become ready", self.describe());
        let observed = self
            .wait_for(&what, &self.readiness, extension_ready::<K>())
            .await?;
        let obj = self.present(observed)?;
        self.transition(Phase::Converged)?;
        Ok(obj)
    }

    /// Fetch the object as it is now
    pub async fn current(&self) -> Result<K> {
        let observed = self.objects.get(&self.name).await?;
        self.present(observed)
    }

    /// Drop the reconciler's provider status and persisted state
    ///
    /// The only place the harness writes status. The next reconcile has to
    /// rebuild both from the provider.
    #[instrument(skip_all, fields(namespace = %self.namespace, name = %self.name))]
    pub async fn inject_state_loss(&self) -> Result<K> {
        if self.phase != Phase::Converged {
            return Err(Error::validation(format!(
                "{}: state loss can only be injected into a converged object (phase {})",
                self.describe(),
                self.phase
            )));
        }
        let previous_state = self
            .current()
            .await?
            .extension_status()
            .and_then(|s| s.state.clone())
            .unwrap_or_default();
        warn!(
            object = %self.describe(),
            "Injecting fault: dropping status.providerStatus and status.state"
        );
        let patch = json!({
            "status": {
                "providerStatus": null,
                "state": merge_patch_between(&previous_state, &FlowState::empty().to_value()?),
            }
        });
        self.objects.patch_status(&self.name, &patch).await
    }

    /// Ask the reconciler for another pass and wait until it finished
    ///
    /// `extra_annotations` are set together with the operation annotation.
    #[instrument(skip_all, fields(namespace = %self.namespace, name = %self.name))]
    pub async fn trigger_reconcile(
        &mut self,
        extra_annotations: &BTreeMap<String, String>,
    ) -> Result<K> {
        self.transition(Phase::AwaitingReconcileTrigger)?;

        let baseline = self
            .current()
            .await?
            .resource_version()
            .unwrap_or_default();
        let mut annotations = extra_annotations.clone();
        annotations.insert(
            OPERATION_ANNOTATION.to_string(),
            OPERATION_RECONCILE.to_string(),
        );
        self.objects
            .patch(&self.name, &json!({"metadata": {"annotations": annotations}}))
            .await?;
        info!(object = %self.describe(), baseline_resource_version = %baseline, "Reconcile requested");

        let what = format!("{} to pick up the reconcile request", self.describe());
        self.wait_for(
            &what,
            &self.waits.reconcile_trigger,
            operation_annotation_removed::<K>(baseline),
        )
        .await?;
        self.transition(Phase::AwaitingSecondConvergence)?;

        let what = format!("{} to become ready again", self.describe());
        let observed = self
            .wait_for(&what, &self.readiness, extension_ready::<K>())
            .await?;
        let obj = self.present(observed)?;
        self.transition(Phase::Converged)?;
        Ok(obj)
    }

    /// Delete the object and wait until it is gone
    #[instrument(skip_all, fields(namespace = %self.namespace, name = %self.name))]
    pub async fn delete(&mut self) -> Result<()> {
        self.transition(Phase::Deleting)?;
        self.objects.delete_ignoring_not_found(&self.name).await?;
        self.transition(Phase::AwaitingDeletionConvergence)?;

        let what = format!("deletion of {}", self.describe());
        self.wait_for(&what, &self.waits.deletion, object_deleted::<K>())
            .await?;
        self.transition(Phase::Gone)?;

        if let Some(handle) = self.safety_net.take() {
            self.cleanup.remove(handle);
        }
        Ok(())
    }
}

// =============================================================================
// Convergence Record
// =============================================================================

/// What the reconciler persisted after converging, for comparison after recovery
#[derive(Clone, Debug, PartialEq)]
pub struct ConvergenceRecord {
    /// `status.state` as canonical JSON bytes
    pub state: Option<Vec<u8>>,
    /// Decoded `status.providerStatus`
    pub provider_status: InfrastructureStatus,
}

impl ConvergenceRecord {
    /// Capture the persisted state and provider status of a converged object
    pub fn capture(obj: &Infrastructure) -> Result<Self> {
        let status = obj.status.clone().unwrap_or_default();
        let state = status
            .state
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?;
        Ok(Self {
            state,
            provider_status: InfrastructureStatus::from_provider_status(
                status.provider_status.as_ref(),
            )?,
        })
    }

    /// Check that a reconcile after state loss rebuilt exactly what was captured
    pub fn assert_recovered(&self, obj: &Infrastructure) -> Result<()> {
        let now = Self::capture(obj)?;
        if now.state != self.state {
            let render = |s: &Option<Vec<u8>>| {
                s.as_deref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_else(|| "<none>".to_string())
            };
            return Err(Error::mismatch(
                "state-recovery",
                format!(
                    "persisted state differs: expected {}, got {}",
                    render(&self.state),
                    render(&now.state)
                ),
            ));
        }
        if now.provider_status != self.provider_status {
            return Err(Error::mismatch(
                "provider-status-recovery",
                format!(
                    "provider status differs: expected {:?}, got {:?}",
                    self.provider_status, now.provider_status
                ),
            ));
        }
        info!(object = %obj.describe(), "Recovered state matches the original convergence");
        Ok(())
    }
}
