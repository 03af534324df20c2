//! # CRD Generator
//!
//! Prints the CRDs the background controller reads and writes as a multi-document
//! YAML stream.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/background.yaml
//! ```

use kube::CustomResourceExt;
use kyverno_background_controller::crd::{ClusterPolicy, GeneratingPolicy, Policy, UpdateRequest};

fn main() -> anyhow::Result<()> {
    let crds = [
        UpdateRequest::crd(),
        ClusterPolicy::crd(),
        Policy::crd(),
        GeneratingPolicy::crd(),
    ];
    let documents = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", documents.join("---\n"));
    Ok(())
}
