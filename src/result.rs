use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::version;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_none()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// 0.1.0 / 0.2.0 result shape: at most one address per family, routes
/// nested under the address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyResult {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<LegacyIp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6: Option<LegacyIp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyIp {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// 0.3.0+ result shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullResult {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// A delegate result, parsed against the schema family of its declared
/// version. Translation between families is explicit; impossible
/// translations fail rather than silently downgrade.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CniResult {
    Legacy(LegacyResult),
    Full(FullResult),
}

impl CniResult {
    pub fn parse(cni_version: &str, data: &[u8]) -> Result<CniResult, Error> {
        if !version::is_supported(cni_version) {
            return Err(Error::UnsupportedVersion(cni_version.to_string()));
        }
        if version::is_legacy(cni_version) {
            let mut r: LegacyResult =
                serde_json::from_slice(data).map_err(|e| Error::DecodeFailure(e.to_string()))?;
            r.cni_version = cni_version.to_string();
            Ok(CniResult::Legacy(r))
        } else {
            let mut r: FullResult =
                serde_json::from_slice(data).map_err(|e| Error::DecodeFailure(e.to_string()))?;
            r.cni_version = cni_version.to_string();
            Ok(CniResult::Full(r))
        }
    }

    pub fn cni_version(&self) -> &str {
        match self {
            CniResult::Legacy(r) => &r.cni_version,
            CniResult::Full(r) => &r.cni_version,
        }
    }

    pub fn convert_to(&self, target: &str) -> Result<CniResult, Error> {
        if !version::is_supported(target) {
            return Err(Error::VersionMismatch {
                from: self.cni_version().to_string(),
                to: target.to_string(),
            });
        }
        match (self, version::is_legacy(target)) {
            (CniResult::Legacy(r), true) => {
                let mut r = r.clone();
                r.cni_version = target.to_string();
                Ok(CniResult::Legacy(r))
            }
            (CniResult::Full(r), false) => {
                let mut r = r.clone();
                r.cni_version = target.to_string();
                Ok(CniResult::Full(r))
            }
            (CniResult::Full(r), true) => Ok(CniResult::Legacy(downgrade(r, target))),
            (CniResult::Legacy(r), false) => Ok(CniResult::Full(upgrade(r, target))),
        }
    }

    pub fn to_value(&self) -> Result<Value, Error> {
        serde_json::to_value(self).map_err(|e| Error::DecodeFailure(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::DecodeFailure(e.to_string()))
    }

    /// Addresses for the user-visible attachment event, e.g.
    /// `["1.1.1.2/24"]`.
    pub fn ip_strings(&self) -> Vec<String> {
        match self {
            CniResult::Legacy(r) => [&r.ip4, &r.ip6]
                .into_iter()
                .flatten()
                .map(|ip| ip.ip.clone())
                .collect(),
            CniResult::Full(r) => r.ips.iter().map(|ip| ip.address.clone()).collect(),
        }
    }

    /// Sandbox id of the first reported interface, recorded in the device
    /// binding.
    pub fn sandbox(&self) -> Option<String> {
        match self {
            CniResult::Legacy(_) => None,
            CniResult::Full(r) => r.interfaces.iter().find_map(|i| i.sandbox.clone()),
        }
    }
}

fn is_v4(address: &str) -> bool {
    address
        .split('/')
        .next()
        .map(|a| a.parse::<Ipv4Addr>().is_ok())
        .unwrap_or(false)
}

fn downgrade(full: &FullResult, target: &str) -> LegacyResult {
    let mut legacy = LegacyResult {
        cni_version: target.to_string(),
        ip4: None,
        ip6: None,
        dns: full.dns.clone().filter(|d| !d.is_empty()),
    };
    for ip in &full.ips {
        let slot = if is_v4(&ip.address) {
            &mut legacy.ip4
        } else {
            &mut legacy.ip6
        };
        if slot.is_none() {
            *slot = Some(LegacyIp {
                ip: ip.address.clone(),
                gateway: ip.gateway.clone(),
                routes: Vec::new(),
            });
        }
    }
    for route in &full.routes {
        let slot = if is_v4(&route.dst) {
            &mut legacy.ip4
        } else {
            &mut legacy.ip6
        };
        if let Some(ip) = slot {
            ip.routes.push(route.clone());
        }
    }
    legacy
}

fn upgrade(legacy: &LegacyResult, target: &str) -> FullResult {
    let mut full = FullResult {
        cni_version: target.to_string(),
        interfaces: Vec::new(),
        ips: Vec::new(),
        routes: Vec::new(),
        dns: legacy.dns.clone().filter(|d| !d.is_empty()),
    };
    for (ip, family) in [(&legacy.ip4, "4"), (&legacy.ip6, "6")] {
        if let Some(ip) = ip {
            full.ips.push(IpConfig {
                version: Some(family.to_string()),
                address: ip.ip.clone(),
                gateway: ip.gateway.clone(),
                interface: None,
            });
            full.routes.extend(ip.routes.iter().cloned());
        }
    }
    full
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_020() -> CniResult {
        CniResult::parse(
            "0.2.0",
            br#"{"cniVersion": "0.2.0", "ip4": {"ip": "1.1.1.2/24", "gateway": "1.1.1.1", "routes": [{"dst": "0.0.0.0/0"}]}}"#,
        )
        .unwrap()
    }

    #[test]
    fn parse_by_family() {
        let r = legacy_020();
        assert_eq!(r.cni_version(), "0.2.0");
        assert_eq!(r.ip_strings(), vec!["1.1.1.2/24".to_string()]);

        let full = CniResult::parse(
            "0.4.0",
            br#"{
                "cniVersion": "0.4.0",
                "interfaces": [{"name": "eth0", "mac": "c2:11:22:33:44:55", "sandbox": "/var/run/netns/x"}],
                "ips": [{"version": "4", "address": "10.1.0.5/16", "gateway": "10.1.0.1", "interface": 0}]
            }"#,
        )
        .unwrap();
        assert_eq!(full.ip_strings(), vec!["10.1.0.5/16".to_string()]);
        assert_eq!(full.sandbox().as_deref(), Some("/var/run/netns/x"));
    }

    #[test]
    fn parse_rejects_unknown_version() {
        assert!(matches!(
            CniResult::parse("1.0.0", b"{}"),
            Err(Error::UnsupportedVersion(_))
        ));
        assert!(matches!(
            CniResult::parse("0.4.0", b"not json"),
            Err(Error::DecodeFailure(_))
        ));
    }

    #[test]
    fn upgrade_legacy_to_full() {
        let up = legacy_020().convert_to("0.4.0").unwrap();
        let CniResult::Full(full) = up else {
            panic!("expected full result");
        };
        assert_eq!(full.cni_version, "0.4.0");
        assert_eq!(full.ips.len(), 1);
        assert_eq!(full.ips[0].version.as_deref(), Some("4"));
        assert_eq!(full.ips[0].address, "1.1.1.2/24");
        assert_eq!(full.routes.len(), 1);
    }

    #[test]
    fn downgrade_full_to_legacy() {
        let full = CniResult::parse(
            "0.3.1",
            br#"{
                "cniVersion": "0.3.1",
                "ips": [
                    {"version": "4", "address": "10.1.0.5/16", "gateway": "10.1.0.1"},
                    {"version": "6", "address": "fd00::5/64"}
                ],
                "routes": [{"dst": "0.0.0.0/0", "gw": "10.1.0.1"}]
            }"#,
        )
        .unwrap();
        let CniResult::Legacy(legacy) = full.convert_to("0.2.0").unwrap() else {
            panic!("expected legacy result");
        };
        assert_eq!(legacy.cni_version, "0.2.0");
        assert_eq!(legacy.ip4.as_ref().unwrap().ip, "10.1.0.5/16");
        assert_eq!(legacy.ip4.as_ref().unwrap().routes.len(), 1);
        assert_eq!(legacy.ip6.as_ref().unwrap().ip, "fd00::5/64");
    }

    #[test]
    fn same_family_rewrites_version() {
        let r = legacy_020().convert_to("0.1.0").unwrap();
        assert_eq!(r.cni_version(), "0.1.0");
    }

    #[test]
    fn convert_to_unknown_version_fails() {
        assert!(matches!(
            legacy_020().convert_to("2.0.0"),
            Err(Error::VersionMismatch { .. })
        ));
    }
}
