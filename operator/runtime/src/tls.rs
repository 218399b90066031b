use crate::{
    http::CertificateMaterial,
    k8s::{self, Secret},
};
use anyhow::{Context, Result};

const CERT_KEY: &str = "tls.crt";
const PRIVATE_KEY_KEY: &str = "tls.key";

/// Reads the API server's certificate and key from a `kubernetes.io/tls` Secret.
pub async fn load(client: k8s::Client, ns: &str, name: &str) -> Result<CertificateMaterial> {
    let secret = k8s::Api::<Secret>::namespaced(client, ns)
        .get(name)
        .await
        .with_context(|| format!("failed to get secret {ns}/{name}"))?;
    material(&secret).with_context(|| format!("invalid secret {ns}/{name}"))
}

fn material(secret: &Secret) -> Result<CertificateMaterial> {
    let data = secret.data.as_ref();
    let get = |key: &str| data.and_then(|d| d.get(key)).map(|bytes| bytes.0.clone());
    CertificateMaterial::from_parts(get(CERT_KEY), get(PRIVATE_KEY_KEY))?
        .with_context(|| format!("missing {CERT_KEY} and {PRIVATE_KEY_KEY}"))
}
