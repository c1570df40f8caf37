// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! CRD availability checking utilities

use crate::constants::crd::{POLL_INTERVAL_SECS, POLL_MAX_INTERVAL_SECS};
use crate::constants::{API_GROUP, API_VERSION};
use crate::error::Result;
use kube::{discovery::Discovery, Client};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Kinds that must be served before the controller can start
pub const REQUIRED_KINDS: [&str; 2] = ["ClusterVersion", "VirtualCluster"];

/// Wait for the ClusterVersion and VirtualCluster CRDs to become available.
/// This uses exponential backoff starting at POLL_INTERVAL_SECS seconds.
pub async fn wait_for_crds(client: &Client) -> Result<()> {
    let mut interval = POLL_INTERVAL_SECS;

    loop {
        match served_kinds(client).await {
            Ok(served) => {
                let missing = missing_kinds(&served);
                if missing.is_empty() {
                    info!("CRDs ({}/{}) are available", API_GROUP, API_VERSION);
                    return Ok(());
                }
                info!(
                    "CRDs {:?} ({}/{}) not yet available, waiting {} seconds...",
                    missing, API_GROUP, API_VERSION, interval
                );
            }
            Err(e) => {
                warn!(
                    "Error checking for CRDs: {}, retrying in {} seconds...",
                    e, interval
                );
            }
        }

        sleep(Duration::from_secs(interval)).await;

        // Exponential backoff with max cap
        interval = (interval * 2).min(POLL_MAX_INTERVAL_SECS);
    }
}

/// Kinds served by the tenancy API group at the expected version
async fn served_kinds(client: &Client) -> Result<Vec<String>> {
    let discovery = Discovery::new(client.clone())
        .filter(&[API_GROUP])
        .run()
        .await?;

    let mut kinds = Vec::new();
    for group in discovery.groups() {
        if group.name() == API_GROUP {
            for (ar, _) in group.recommended_resources() {
                if ar.version == API_VERSION {
                    kinds.push(ar.kind);
                }
            }
        }
    }

    Ok(kinds)
}

fn missing_kinds(served: &[String]) -> Vec<&'static str> {
    REQUIRED_KINDS
        .iter()
        .copied()
        .filter(|kind| !served.iter().any(|s| s == kind))
        .collect()
}
