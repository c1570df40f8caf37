// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Operator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Replica count used when a ClusterVersion template leaves it unset
    pub default_replicas: i32,
    /// Consecutive configuration failures tolerated before a VirtualCluster enters Error
    pub error_threshold: u32,
    /// Requeue interval for a converged VirtualCluster
    pub resync_interval: Duration,
    /// Requeue interval while a VirtualCluster is provisioning or upgrading
    pub progress_interval: Duration,
    /// Maximum number of VirtualClusters reconciled at the same time
    pub concurrency: u16,
    /// Window in which watch events for the same VirtualCluster are coalesced
    pub debounce: Duration,
    /// Cluster DNS domain used for certificate SANs
    pub cluster_domain: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_replicas: 1,
            error_threshold: 5,
            resync_interval: Duration::from_secs(300),
            progress_interval: Duration::from_secs(5),
            concurrency: 8,
            debounce: Duration::from_millis(500),
            cluster_domain: "cluster.local".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        Ok(Config {
            default_replicas: parse_var("VC_DEFAULT_REPLICAS", env::var("VC_DEFAULT_REPLICAS").ok(), defaults.default_replicas)?,
            error_threshold: parse_var("VC_ERROR_THRESHOLD", env::var("VC_ERROR_THRESHOLD").ok(), defaults.error_threshold)?,
            resync_interval: Duration::from_secs(parse_var(
                "VC_RESYNC_INTERVAL_SECS",
                env::var("VC_RESYNC_INTERVAL_SECS").ok(),
                defaults.resync_interval.as_secs(),
            )?),
            progress_interval: Duration::from_secs(parse_var(
                "VC_PROGRESS_INTERVAL_SECS",
                env::var("VC_PROGRESS_INTERVAL_SECS").ok(),
                defaults.progress_interval.as_secs(),
            )?),
            concurrency: parse_var("VC_RECONCILE_CONCURRENCY", env::var("VC_RECONCILE_CONCURRENCY").ok(), defaults.concurrency)?,
            debounce: Duration::from_millis(parse_var(
                "VC_DEBOUNCE_MILLIS",
                env::var("VC_DEBOUNCE_MILLIS").ok(),
                defaults.debounce.as_millis() as u64,
            )?),
            cluster_domain: env::var("VC_CLUSTER_DOMAIN").unwrap_or(defaults.cluster_domain),
        })
    }
}

fn parse_var<T>(name: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, value)),
        None => Ok(default),
    }
}
