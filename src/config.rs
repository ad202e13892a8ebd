use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::delegate::DelegateConf;
use crate::error::Error;
use crate::version;

/// The `type` field this plugin answers to; anything else on stdin is
/// somebody else's config.
pub const PLUGIN_TYPE: &str = "weft-cni";

pub const DEFAULT_CNI_DIR: &str = "/var/lib/cni/weft";
pub const DEFAULT_BIN_DIR: &str = "/opt/cni/bin";

fn default_cni_dir() -> String {
    DEFAULT_CNI_DIR.to_string()
}

fn default_bin_dir() -> String {
    DEFAULT_BIN_DIR.to_string()
}

fn default_system_namespaces() -> Vec<String> {
    vec!["kube-system".to_string()]
}

fn default_multus_namespace() -> String {
    "kube-system".to_string()
}

/// The meta-plugin's own network config, as handed over stdin by the
/// container runtime. Unrecognized fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(default)]
    pub delegates: Vec<Value>,
    #[serde(default)]
    pub cluster_network: Option<String>,
    #[serde(default)]
    pub default_networks: Vec<String>,
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default = "default_cni_dir")]
    pub cni_dir: String,
    #[serde(default = "default_bin_dir")]
    pub bin_dir: String,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub namespace_isolation: bool,
    #[serde(default)]
    pub global_namespaces: Vec<String>,
    #[serde(default)]
    pub readiness_indicator_file: Option<String>,
    #[serde(default = "default_system_namespaces")]
    pub system_namespaces: Vec<String>,
    // Namespace searched for network definitions named without one in
    // clusterNetwork/defaultNetworks.
    #[serde(default = "default_multus_namespace")]
    pub multus_namespace: String,
    #[serde(default)]
    pub retry_delete_on_error: bool,
    #[serde(default)]
    pub runtime_config: Option<RuntimeConfig>,
}

impl NetConf {
    /// Parses and validates the meta-config and normalizes its inline
    /// delegates. Delegates with a missing name are accepted here and
    /// rejected at ADD time, before any side effect.
    pub fn parse(data: &[u8]) -> Result<(NetConf, Vec<DelegateConf>), Error> {
        let mut conf: NetConf =
            serde_json::from_slice(data).map_err(|e| Error::MalformedConfig(e.to_string()))?;
        if conf.cni_version.is_empty() {
            conf.cni_version = "0.1.0".to_string();
        }
        if !version::is_supported(&conf.cni_version) {
            return Err(Error::UnsupportedVersion(conf.cni_version));
        }
        if conf.plugin_type != PLUGIN_TYPE {
            return Err(Error::UnsupportedType(conf.plugin_type));
        }
        if conf.delegates.is_empty()
            && conf.cluster_network.is_none()
            && conf.default_networks.is_empty()
        {
            return Err(Error::MissingDelegates);
        }
        let delegates = conf
            .delegates
            .drain(..)
            .map(|raw| DelegateConf::normalize(raw, &conf.cni_version))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((conf, delegates))
    }
}

/// Runtime config bag. Only the subset a delegate declares capabilities
/// for is ever forwarded to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_mappings: Option<Vec<PortMapping>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<Bandwidth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl RuntimeConfig {
    pub fn is_empty(&self) -> bool {
        self.port_mappings.is_none()
            && self.bandwidth.is_none()
            && self.ips.is_none()
            && self.mac.is_none()
    }

    /// Keeps only the keys named in `caps`.
    pub fn filtered(&self, caps: &std::collections::BTreeSet<String>) -> RuntimeConfig {
        RuntimeConfig {
            port_mappings: caps
                .contains("portMappings")
                .then(|| self.port_mappings.clone())
                .flatten(),
            bandwidth: caps.contains("bandwidth").then(|| self.bandwidth.clone()).flatten(),
            ips: caps.contains("ips").then(|| self.ips.clone()).flatten(),
            mac: caps.contains("mac").then(|| self.mac.clone()).flatten(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bandwidth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_rate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_burst: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_rate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_burst: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::DelegateKind;

    #[test]
    fn parse_full_meta_config() {
        let data = br#"{
            "name": "node-cni-network",
            "type": "weft-cni",
            "cniVersion": "0.2.0",
            "kubeconfig": "/etc/kubernetes/node-kubeconfig.yaml",
            "cniDir": "/var/lib/cni/weft-test",
            "binDir": "/home/cni/bin",
            "logLevel": "debug",
            "namespaceIsolation": true,
            "globalNamespaces": ["default"],
            "multusNamespace": "net-defs",
            "retryDeleteOnError": true,
            "delegates": [{
                "name": "weave1",
                "cniVersion": "0.2.0",
                "type": "weave-net"
            }]
        }"#;
        let (conf, delegates) = NetConf::parse(data).unwrap();
        assert_eq!(conf.name, "node-cni-network");
        assert_eq!(conf.cni_version, "0.2.0");
        assert_eq!(conf.cni_dir, "/var/lib/cni/weft-test");
        assert_eq!(conf.bin_dir, "/home/cni/bin");
        assert!(conf.namespace_isolation);
        assert!(conf.retry_delete_on_error);
        assert_eq!(conf.multus_namespace, "net-defs");
        assert_eq!(conf.system_namespaces, vec!["kube-system".to_string()]);
        assert_eq!(delegates.len(), 1);
        assert_eq!(delegates[0].name, "weave1");
        assert_eq!(delegates[0].kind, DelegateKind::Single);
    }

    #[test]
    fn reject_foreign_type() {
        let data = br#"{"name": "x", "type": "bridge", "cniVersion": "0.2.0", "delegates": [{"name": "a", "type": "b"}]}"#;
        match NetConf::parse(data) {
            Err(Error::UnsupportedType(t)) => assert_eq!(t, "bridge"),
            other => panic!("expected UnsupportedType, got {other:?}"),
        }
    }

    #[test]
    fn reject_missing_delegates_and_defaults() {
        let data = br#"{"name": "x", "type": "weft-cni", "cniVersion": "0.2.0"}"#;
        assert!(matches!(NetConf::parse(data), Err(Error::MissingDelegates)));
    }

    #[test]
    fn cluster_network_alone_is_enough() {
        let data = br#"{"name": "x", "type": "weft-cni", "cniVersion": "0.4.0", "clusterNetwork": "default-net"}"#;
        let (conf, delegates) = NetConf::parse(data).unwrap();
        assert!(delegates.is_empty());
        assert_eq!(conf.cluster_network.as_deref(), Some("default-net"));
    }

    #[test]
    fn reject_malformed_json() {
        assert!(matches!(
            NetConf::parse(b"{not json"),
            Err(Error::MalformedConfig(_))
        ));
    }

    #[test]
    fn reject_unsupported_version() {
        let data = br#"{"name": "x", "type": "weft-cni", "cniVersion": "9.9.9", "clusterNetwork": "d"}"#;
        assert!(matches!(
            NetConf::parse(data),
            Err(Error::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn runtime_config_filtering() {
        let rc = RuntimeConfig {
            port_mappings: Some(vec![PortMapping {
                host_port: 8080,
                container_port: 80,
                protocol: Some("tcp".to_string()),
            }]),
            bandwidth: Some(Bandwidth::default()),
            ips: Some(vec!["10.0.0.1/24".to_string()]),
            mac: Some("c2:11:22:33:44:66".to_string()),
        };
        let caps = ["ips".to_string(), "mac".to_string()].into_iter().collect();
        let filtered = rc.filtered(&caps);
        assert!(filtered.port_mappings.is_none());
        assert!(filtered.bandwidth.is_none());
        assert_eq!(filtered.ips, rc.ips);
        assert_eq!(filtered.mac, rc.mac);
    }
}
