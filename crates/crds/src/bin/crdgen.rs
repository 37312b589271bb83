//! Prints every CRD as a multi-document YAML stream.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/all.yaml`

use crds::{IPAMBlock, IPAMHandle, IPPool, VxNetPool};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        IPPool::crd(),
        IPAMBlock::crd(),
        IPAMHandle::crd(),
        VxNetPool::crd(),
    ];

    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }

    Ok(())
}
