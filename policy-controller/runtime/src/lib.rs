#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use sdn_policy_controller_core as core;
pub use sdn_policy_controller_k8s_api as k8s;
pub use sdn_policy_controller_k8s_index as index;

mod args;
mod lease;
pub mod metrics;
pub mod migrate;
pub mod reconcile;
pub mod retry;

#[cfg(test)]
mod test_util;

pub use self::{
    args::Args,
    metrics::EngineMetrics,
    migrate::{Report, Scanner},
    reconcile::{Engine, EngineConfig, Phase},
    retry::{Backoff, RetryEntry, RetryQueue},
};
