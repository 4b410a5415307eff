use es_keystore_k8s::crd::Elasticsearch;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Elasticsearch::crd())?);
    Ok(())
}
