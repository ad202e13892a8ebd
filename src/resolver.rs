use std::collections::HashSet;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::args::CmdArgs;
use crate::config::{Bandwidth, NetConf, PortMapping};
use crate::delegate::DelegateConf;
use crate::error::Error;
use crate::kubernetes::{NetworkDefRegistry, Workload, WorkloadDirectory};

pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";
pub const DEFAULT_NETWORK_ANNOTATION: &str = "k8s.v1.cni.cncf.io/default-network";

/// One entry of the attachment annotation, long (JSON) or short
/// (`ns/name@ifname`) form.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct NetworkSelectionElement {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default, rename = "interface")]
    pub interface_request: Option<String>,
    #[serde(default)]
    pub ips: Option<Vec<String>>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub bandwidth: Option<Bandwidth>,
    #[serde(default, rename = "portMappings")]
    pub port_mappings: Option<Vec<PortMapping>>,
    #[serde(default, rename = "default-route")]
    pub default_route: Vec<String>,
    #[serde(default, rename = "cni-args")]
    pub cni_args: Option<Map<String, Value>>,
}

#[derive(Debug, Default)]
pub struct ResolvedAttachments {
    pub delegates: Vec<DelegateConf>,
    pub workload: Option<Workload>,
}

/// Builds the full ordered delegate list for one invocation: inline
/// delegates, then the cluster default (when inline is empty), then
/// configured default networks, then annotation-selected attachments.
/// Delegate 0 is the master and uses the caller's CNI_IFNAME.
pub async fn resolve(
    conf: &NetConf,
    inline: &[DelegateConf],
    args: &CmdArgs,
    registry: Option<&dyn NetworkDefRegistry>,
    workloads: Option<&dyn WorkloadDirectory>,
) -> Result<ResolvedAttachments, Error> {
    let mut delegates: Vec<DelegateConf> = inline.to_vec();

    let workload = match (&args.pod, workloads) {
        (Some(pod), Some(dir)) => Some(dir.get_workload(&pod.namespace, &pod.name).await?),
        _ => None,
    };

    // Cluster-wide default network; a per-workload override annotation
    // replaces it. Inline delegates win over both.
    if delegates.is_empty() {
        let mut master = None;
        if let Some(w) = &workload {
            if let Some(annotation) = w.annotations.get(DEFAULT_NETWORK_ANNOTATION) {
                let mut elements = parse_selector_annotation(annotation, &w.namespace)?;
                if elements.len() != 1 {
                    return Err(Error::BadAttachmentRequest(format!(
                        "default-network annotation must name exactly one network, got {}",
                        elements.len()
                    )));
                }
                let element = elements.remove(0);
                master = Some(resolve_element(conf, &element, &w.namespace, registry).await?);
            }
        }
        if master.is_none() {
            if let Some(selector) = &conf.cluster_network {
                master = Some(resolve_named(conf, selector, registry).await?);
            }
        }
        if let Some(m) = master {
            delegates.push(m);
        }
    }

    for selector in &conf.default_networks {
        delegates.push(resolve_named(conf, selector, registry).await?);
    }

    // Annotation-driven attachments. Workloads in system namespaces only
    // get the defaults.
    if let Some(w) = &workload {
        if !conf.system_namespaces.contains(&w.namespace) {
            if let Some(annotation) = w.annotations.get(NETWORKS_ANNOTATION) {
                for element in parse_selector_annotation(annotation, &w.namespace)? {
                    let namespace = element
                        .namespace
                        .clone()
                        .unwrap_or_else(|| w.namespace.clone());
                    check_namespace_isolation(conf, &w.namespace, &namespace)?;
                    let mut delegate =
                        resolve_element(conf, &element, &w.namespace, registry).await?;
                    delegate.provenance = Some(format!("{namespace}/{}", element.name));
                    delegate.ifname = element.interface_request.clone();
                    delegate.apply_runtime_config(conf.runtime_config.as_ref(), Some(&element));
                    delegate.merge_cni_args(element.cni_args.as_ref());
                    delegate.default_route = element.default_route.clone();
                    delegates.push(delegate);
                }
            }
        }
    }

    for delegate in delegates
        .iter_mut()
        .filter(|d| d.provenance.is_none())
    {
        delegate.apply_runtime_config(conf.runtime_config.as_ref(), None);
    }

    assign_interface_names(&mut delegates, &args.ifname)?;

    Ok(ResolvedAttachments {
        delegates,
        workload,
    })
}

/// Gives every delegate its interface name: the master gets the caller's,
/// explicit selector requests are honored after collision checks, and the
/// rest get synthesized `netN` names.
pub fn assign_interface_names(
    delegates: &mut [DelegateConf],
    master_ifname: &str,
) -> Result<(), Error> {
    let mut used: HashSet<String> = HashSet::new();
    used.insert(master_ifname.to_string());
    for delegate in delegates.iter().skip(1) {
        if let Some(ifname) = &delegate.ifname {
            if !used.insert(ifname.clone()) {
                return Err(Error::BadAttachmentRequest(format!(
                    "interface name {ifname:?} requested more than once"
                )));
            }
        }
    }
    let mut n = 1usize;
    for delegate in delegates.iter_mut().skip(1) {
        if delegate.ifname.is_none() {
            loop {
                let candidate = format!("net{n}");
                n += 1;
                if used.insert(candidate.clone()) {
                    delegate.ifname = Some(candidate);
                    break;
                }
            }
        }
    }
    if let Some(master) = delegates.first_mut() {
        master.ifname = Some(master_ifname.to_string());
    }
    Ok(())
}

fn check_namespace_isolation(
    conf: &NetConf,
    workload_ns: &str,
    selector_ns: &str,
) -> Result<(), Error> {
    if conf.namespace_isolation
        && selector_ns != workload_ns
        && !conf.global_namespaces.iter().any(|ns| ns == selector_ns)
    {
        return Err(Error::BadAttachmentRequest(format!(
            "attachment to namespace {selector_ns:?} is not permitted from {workload_ns:?}"
        )));
    }
    Ok(())
}

// clusterNetwork / defaultNetworks selectors: a name, `namespace/name`, or
// an absolute path to a config file on disk.
async fn resolve_named(
    conf: &NetConf,
    selector: &str,
    registry: Option<&dyn NetworkDefRegistry>,
) -> Result<DelegateConf, Error> {
    let element = parse_one_short(selector)?;
    if element.interface_request.is_some() {
        return Err(Error::BadAttachmentRequest(format!(
            "default network selector {selector:?} must not request an interface"
        )));
    }
    resolve_element(conf, &element, &conf.multus_namespace, registry).await
}

async fn resolve_element(
    conf: &NetConf,
    element: &NetworkSelectionElement,
    fallback_namespace: &str,
    registry: Option<&dyn NetworkDefRegistry>,
) -> Result<DelegateConf, Error> {
    let raw = if element.name.starts_with('/') {
        tokio::fs::read(&element.name)
            .await
            .map_err(|e| Error::NoSuchNetworkDef(format!("{}: {e}", element.name)))?
    } else {
        let namespace = element.namespace.as_deref().unwrap_or(fallback_namespace);
        let registry = registry.ok_or_else(|| {
            Error::Kube(format!(
                "resolving network {namespace}/{} requires a cluster client",
                element.name
            ))
        })?;
        registry.get_config(namespace, &element.name).await?
    };
    let value: Value =
        serde_json::from_slice(&raw).map_err(|e| Error::MalformedConfig(e.to_string()))?;
    DelegateConf::normalize(value, &conf.cni_version)
}

/// Parses an attachment annotation: a JSON array in long form, otherwise
/// the comma-separated `[<namespace>/]<name>[@<interface>]` short form.
pub fn parse_selector_annotation(
    annotation: &str,
    _workload_ns: &str,
) -> Result<Vec<NetworkSelectionElement>, Error> {
    let trimmed = annotation.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        let elements: Vec<NetworkSelectionElement> = serde_json::from_str(trimmed)
            .map_err(|e| Error::BadAttachmentRequest(e.to_string()))?;
        for element in &elements {
            if element.name.is_empty() {
                return Err(Error::BadAttachmentRequest(
                    "network selection entry has no name".to_string(),
                ));
            }
        }
        return Ok(elements);
    }
    trimmed.split(',').map(parse_one_short).collect()
}

fn parse_one_short(item: &str) -> Result<NetworkSelectionElement, Error> {
    let item = item.trim();
    if item.is_empty() {
        return Err(Error::BadAttachmentRequest(
            "empty network selection entry".to_string(),
        ));
    }
    let (rest, interface) = match item.split('@').collect::<Vec<_>>()[..] {
        [rest] => (rest, None),
        [rest, ifname] => {
            let ifname = ifname.trim();
            if ifname.is_empty() || !valid_interface_name(ifname) {
                return Err(Error::BadAttachmentRequest(format!(
                    "invalid interface name in {item:?}"
                )));
            }
            (rest, Some(ifname.to_string()))
        }
        _ => {
            return Err(Error::BadAttachmentRequest(format!(
                "more than one '@' in {item:?}"
            )))
        }
    };
    let rest = rest.trim();
    // Absolute paths name a config file on disk; no namespace applies.
    let (namespace, name) = if rest.starts_with('/') {
        (None, rest.to_string())
    } else {
        match rest.split('/').collect::<Vec<_>>()[..] {
            [name] => (None, name.to_string()),
            [namespace, name] => (Some(namespace.to_string()), name.to_string()),
            _ => {
                return Err(Error::BadAttachmentRequest(format!(
                    "more than one '/' in {item:?}"
                )))
            }
        }
    };
    if !name.starts_with('/') && !valid_dns_name(&name) {
        return Err(Error::BadAttachmentRequest(format!(
            "invalid network name {name:?}"
        )));
    }
    if let Some(ns) = &namespace {
        if !valid_dns_name(ns) {
            return Err(Error::BadAttachmentRequest(format!(
                "invalid namespace {ns:?}"
            )));
        }
    }
    Ok(NetworkSelectionElement {
        name,
        namespace,
        interface_request: interface,
        ..Default::default()
    })
}

fn valid_dns_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && s.starts_with(|c: char| c.is_ascii_alphanumeric())
        && s.ends_with(|c: char| c.is_ascii_alphanumeric())
}

fn valid_interface_name(s: &str) -> bool {
    !s.is_empty() && s.len() < 16 && !s.contains(['/', ':', ' '])
}
