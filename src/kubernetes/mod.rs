pub mod event;
pub mod netdef;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use rand::Rng;

use crate::config::NetConf;
use crate::error::Error;
use netdef::NetworkAttachmentDefinition;

/// A workload as the resolver needs it: identity plus annotations.
#[derive(Debug, Clone, Default)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

/// Directory of workloads keyed by (namespace, name).
#[async_trait]
pub trait WorkloadDirectory: Send + Sync {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Workload, Error>;
}

/// Key→value mapping of network definitions over the cluster API; returns
/// the raw delegate JSON.
#[async_trait]
pub trait NetworkDefRegistry: Send + Sync {
    async fn get_config(&self, namespace: &str, name: &str) -> Result<Vec<u8>, Error>;
}

/// Backoff applied to transient cluster-API failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base: Duration::from_millis(250),
            factor: 2.0,
            cap: Duration::from_secs(4),
            budget: Duration::from_secs(30),
        }
    }
}

/// Retries `op` on transient errors with exponential backoff and jitter
/// until the policy's total budget runs out. Terminal errors (including
/// not-found) return immediately.
pub async fn retry_lookup<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let started = tokio::time::Instant::now();
    let mut delay = policy.base;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                if started.elapsed() + delay > policy.budget {
                    tracing::warn!(what, error = %e, "lookup retry budget exhausted");
                    return Err(e);
                }
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                tracing::debug!(what, error = %e, delay_ms = delay.as_millis() as u64, "retrying lookup");
                tokio::time::sleep(Duration::from_secs_f64(delay.as_secs_f64() * jitter)).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * policy.factor).min(policy.cap.as_secs_f64()),
                );
            }
            Err(e) => return Err(e),
        }
    }
}

/// Cluster-backed implementation of the directory, registry and event
/// sink. Constructed once per invocation; absent entirely when the node
/// has no cluster credentials.
pub struct KubeClientInfo {
    pub(crate) client: Client,
    retry: RetryPolicy,
}

impl KubeClientInfo {
    pub async fn new(conf: &NetConf) -> Result<Option<KubeClientInfo>, Error> {
        let client = match &conf.kubeconfig {
            Some(path) => {
                let kubeconfig = kube::config::Kubeconfig::read_from(path)
                    .map_err(|e| Error::Kube(format!("{path}: {e}")))?;
                let config = kube::Config::from_custom_kubeconfig(
                    kubeconfig,
                    &kube::config::KubeConfigOptions::default(),
                )
                .await
                .map_err(|e| Error::Kube(format!("{path}: {e}")))?;
                Client::try_from(config).map_err(|e| Error::Kube(e.to_string()))?
            }
            None => match Client::try_default().await {
                Ok(client) => client,
                Err(e) => {
                    tracing::debug!(error = %e, "no cluster client available, continuing without one");
                    return Ok(None);
                }
            },
        };
        Ok(Some(KubeClientInfo {
            client,
            retry: RetryPolicy::default(),
        }))
    }
}

// HTTP 429/503 and transport failures are worth retrying; everything else,
// not-found included, is terminal.
fn transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => ae.code == 429 || ae.code == 503,
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

fn not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl WorkloadDirectory for KubeClientInfo {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Workload, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let what = format!("pod {namespace}/{name}");
        let pod = retry_lookup(&self.retry, &what, || {
            let api = api.clone();
            let name = name.to_string();
            let what = what.clone();
            async move {
                api.get(&name).await.map_err(|e| {
                    if not_found(&e) {
                        Error::WorkloadLookupTerminal(format!("{what} not found"))
                    } else if transient(&e) {
                        Error::WorkloadLookupTransient(format!("{what}: {e}"))
                    } else {
                        Error::WorkloadLookupTerminal(format!("{what}: {e}"))
                    }
                })
            }
        })
        .await?;
        Ok(Workload {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: pod.metadata.uid,
            annotations: pod.metadata.annotations.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl NetworkDefRegistry for KubeClientInfo {
    async fn get_config(&self, namespace: &str, name: &str) -> Result<Vec<u8>, Error> {
        let api: Api<NetworkAttachmentDefinition> =
            Api::namespaced(self.client.clone(), namespace);
        let what = format!("network definition {namespace}/{name}");
        let netdef = retry_lookup(&self.retry, &what, || {
            let api = api.clone();
            let name = name.to_string();
            let namespace = namespace.to_string();
            let what = what.clone();
            async move {
                api.get(&name).await.map_err(|e| {
                    if not_found(&e) {
                        Error::NoSuchNetworkDef(format!("{namespace}/{name}"))
                    } else if transient(&e) {
                        Error::WorkloadLookupTransient(format!("{what}: {e}"))
                    } else {
                        Error::WorkloadLookupTerminal(format!("{what}: {e}"))
                    }
                })
            }
        })
        .await?;
        let config = netdef.spec.config.filter(|c| !c.is_empty()).ok_or_else(|| {
            Error::MalformedConfig(format!("network definition {namespace}/{name} has no config"))
        })?;
        Ok(config.into_bytes())
    }
}
