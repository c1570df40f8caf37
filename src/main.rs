// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{Context, Result};
use kube::Client;
use tracing::{info, warn};

use vc_manager::config::Config;
use vc_manager::kubernetes::wait_for_crds;
use vc_manager::reconcilers::VirtualClusterReconciler;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vc_manager=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    info!("Starting vc-manager");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        "Configuration loaded: default_replicas={}, error_threshold={}, cluster_domain={}",
        config.default_replicas, config.error_threshold, config.cluster_domain
    );

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    // Wait for our CRDs before starting the controller
    info!("Waiting for ClusterVersion and VirtualCluster CRDs to become available...");
    wait_for_crds(&client).await?;

    VirtualClusterReconciler::new(client, config).run().await?;

    warn!("VirtualCluster controller stopped");
    Ok(())
}
