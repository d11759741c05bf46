//! infra-harness - reconciliation-verification harness for Gardener OpenStack extension objects
//!
//! The harness provisions OpenStack resources an extension object is configured to
//! reference, submits the object to a reconciler it does not own, waits for the
//! reconciler to converge, and then cross-checks the converged status against
//! provider reality, both after creation and after deletion.
//!
//! # Architecture
//!
//! Data flows one direction:
//! - The provisioner creates prerequisite resources and registers their teardown
//! - The driver embeds their identifiers in the object and walks it through its lifecycle
//! - The poller observes convergence
//! - The verifier compares the object status with what the provider reports
//! - The cleanup stack unwinds everything in reverse order, whatever the outcome
//!
//! # Modules
//!
//! - [`cleanup`] - LIFO registry of teardown actions
//! - [`provider`] - OpenStack API trait and REST client
//! - [`provisioner`] - Creates prerequisite networks, subnets, routers and security groups
//! - [`wait`] - Tiered readiness poller and convergence predicates
//! - [`driver`] - Extension object lifecycle state machine
//! - [`verify`] - Structural and existential checks of the converged outcome
//! - [`crd`] - Extension object types (Infrastructure, Bastion, Cluster)
//! - [`store`] - Declarative object store over the Kubernetes API
//! - [`scenario`] - Scenario runner and suite report
//! - [`scenarios`] - Infrastructure and bastion scenario bodies
//! - [`config`] - Harness configuration
//! - [`telemetry`] - Tracing subscriber setup
//! - [`retry`] - Backoff for transient provider failures
//! - [`error`] - Error types and failure triage

#![deny(missing_docs)]

pub mod cleanup;
pub mod config;
pub mod crd;
pub mod driver;
pub mod error;
pub mod provider;
pub mod provisioner;
pub mod retry;
pub mod scenario;
pub mod scenarios;
pub mod store;
pub mod telemetry;
pub mod verify;
pub mod wait;

pub use error::{Error, FailureCategory};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Control Annotations
// =============================================================================

/// Annotation the reconciler watches for out-of-band commands
pub const OPERATION_ANNOTATION: &str = "gardener.cloud/operation";

/// Value of [`OPERATION_ANNOTATION`] requesting a reconcile
pub const OPERATION_RECONCILE: &str = "reconcile";

/// Annotation selecting the flow-based reconciler backend
pub const USE_FLOW_ANNOTATION: &str = "openstack.provider.extensions.gardener.cloud/use-flow";

// =============================================================================
// Prerequisite Object Names
// =============================================================================

/// Name of the credential secret the reconciler reads from the object namespace
pub const CLOUDPROVIDER_SECRET_NAME: &str = "cloudprovider";

/// Priority class the reconciler assigns to its control-plane workloads
pub const CONTROLPLANE_PRIORITY_CLASS: &str = "gardener-shoot-controlplane-300";

/// Value of [`CONTROLPLANE_PRIORITY_CLASS`]
pub const CONTROLPLANE_PRIORITY_CLASS_VALUE: i32 = 999_998_300;

/// Provider type written into every extension object spec
pub const PROVIDER_TYPE: &str = "openstack";

/// Alphabet for random name suffixes
const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Random lowercase alphanumeric suffix for uniquely-named resources
///
/// Scenarios running in parallel never share a resource name.
pub fn random_suffix(len: usize) -> String {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_suffix_is_dns_safe() {
        let suffix = random_suffix(5);
        assert_eq!(suffix.len(), 5);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn random_suffixes_differ() {
        let a = random_suffix(12);
        let b = random_suffix(12);
        assert_ne!(a, b);
    }
}
