//! Live scenario suites
//!
//! - `infrastructure`: every network layout and reconciler strategy, one
//!   scenario each
//! - `bastion`: a bastion on a pre-provisioned shoot network, reachable over SSH

mod bastion;
mod helpers;
mod infrastructure;
