//! A script used to generate the CRD used by this project.
//!
//! Any time the CRD spec changes, this script can be run to ensure that the CRD is up-to-date and
//! ready to be synced with the cluster.

use anyhow::{Context, Result};
use kube::CustomResourceExt;
use quarry_core::crd::QuarryCluster;

fn main() -> Result<()> {
    let canon = std::fs::canonicalize("..").context("error getting canonical path of current dir")?;
    let crds_path = canon.join("k8s").join("crds");
    std::fs::create_dir_all(&crds_path).with_context(|| format!("error creating {:?}", &crds_path))?;

    let cluster = QuarryCluster::crd();
    let cluster_yaml = serde_yaml::to_string(&cluster).context("error serializing QuarryCluster CRD to yaml")?;
    std::fs::write(crds_path.join("quarrycluster.yaml"), &cluster_yaml).with_context(|| format!("error writing QuarryCluster CRD to {:?}", &crds_path))?;
    println!("QuarryCluster CRD written to {:?}", &crds_path);

    Ok(())
}
