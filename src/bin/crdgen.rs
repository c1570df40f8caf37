// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Prints the ClusterVersion and VirtualCluster CRDs as a multi-document YAML stream.

use kube::CustomResourceExt;
use vc_manager::types::{ClusterVersion, VirtualCluster};

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&ClusterVersion::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&VirtualCluster::crd())?);
    Ok(())
}
