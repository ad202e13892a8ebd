use std::time::Duration;

use crate::error::Error;

// CNI_ARGS is a semicolon-separated key=value list, e.g.
// IgnoreUnknown=1;K8S_POD_NAMESPACE=kube-system;K8S_POD_NAME=coredns-5dd5756b68-br76z
const K8S_POD_NAME: &str = "K8S_POD_NAME";
const K8S_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";
const K8S_POD_UID: &str = "K8S_POD_UID";

/// Workload identity recovered from CNI_ARGS. Absent entirely when the
/// runtime did not hand us pod coordinates; that is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
}

impl PodRef {
    pub fn from_cni_args(s: &str) -> Option<PodRef> {
        let mut name = String::new();
        let mut namespace = String::new();
        let mut uid = None;
        for kv in s.split(';') {
            let mut split = kv.splitn(2, '=');
            let (Some(key), Some(value)) = (split.next(), split.next()) else {
                continue;
            };
            match key {
                K8S_POD_NAME => name = value.to_string(),
                K8S_POD_NAMESPACE => namespace = value.to_string(),
                K8S_POD_UID => uid = Some(value.to_string()),
                _ => {}
            }
        }
        if name.is_empty() || namespace.is_empty() {
            return None;
        }
        Some(PodRef {
            name,
            namespace,
            uid,
        })
    }
}

/// One invocation's runtime context, assembled from the CNI environment
/// and stdin.
#[derive(Debug, Clone)]
pub struct CmdArgs {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: Vec<String>,
    pub stdin: Vec<u8>,
    pub pod: Option<PodRef>,
    pub timeout: Option<Duration>,
}

impl CmdArgs {
    pub fn new(
        container_id: &str,
        netns: &str,
        ifname: &str,
        cni_args: &str,
        path: &[&str],
        stdin: &[u8],
    ) -> CmdArgs {
        CmdArgs {
            container_id: container_id.to_string(),
            netns: netns.to_string(),
            ifname: ifname.to_string(),
            args: cni_args.to_string(),
            path: path.iter().map(|p| p.to_string()).collect(),
            stdin: stdin.to_vec(),
            pod: PodRef::from_cni_args(cni_args),
            timeout: None,
        }
    }

    pub fn from_env(stdin: Vec<u8>) -> Result<CmdArgs, Error> {
        let container_id = std::env::var("CNI_CONTAINERID")
            .map_err(|_| Error::InvalidEnv("CNI_CONTAINERID must be set".to_string()))?;
        if container_id.is_empty() {
            return Err(Error::InvalidEnv("CNI_CONTAINERID must be set".to_string()));
        }
        let netns = std::env::var("CNI_NETNS").unwrap_or_default();
        let ifname = match std::env::var("CNI_IFNAME") {
            Ok(i) if !i.is_empty() => i,
            _ => "eth0".to_string(),
        };
        let args = std::env::var("CNI_ARGS").unwrap_or_default();
        let path = std::env::var("CNI_PATH")
            .unwrap_or_default()
            .split(':')
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string())
            .collect();
        let timeout = std::env::var("CNI_TIMEOUT")
            .ok()
            .and_then(|t| t.parse::<u64>().ok())
            .map(Duration::from_secs);
        let pod = PodRef::from_cni_args(&args);
        Ok(CmdArgs {
            container_id,
            netns,
            ifname,
            args,
            path,
            stdin,
            pod,
            timeout,
        })
    }

    /// Returns a copy whose search path leads with the configured binDir,
    /// so delegate lookup (and the CNI_PATH handed to delegates) covers it.
    pub fn with_bin_dir(&self, bin_dir: &str) -> CmdArgs {
        let mut args = self.clone();
        if !bin_dir.is_empty() && !args.path.iter().any(|p| p == bin_dir) {
            args.path.insert(0, bin_dir.to_string());
        }
        args
    }

    /// `<namespace>/<name>` of the workload, or `/` when unknown. Used in
    /// user-visible delegate error messages.
    pub fn workload_ref(&self) -> String {
        match &self.pod {
            Some(p) => format!("{}/{}", p.namespace, p.name),
            None => "/".to_string(),
        }
    }
}
