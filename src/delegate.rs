use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::resolver::NetworkSelectionElement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegateKind {
    Single,
    List,
}

/// One normalized delegate: the (possibly rewritten) config JSON that will
/// be streamed to the child verbatim, plus everything resolution attached
/// to it. Serializable so the scratch cache can replay DEL/CHECK from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateConf {
    pub raw: Value,
    pub kind: DelegateKind,
    pub name: String,
    pub cni_version: String,
    pub capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_config: Option<RuntimeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_route: Vec<String>,
}

impl DelegateConf {
    /// Classifies a raw delegate config as single-plugin or plugin-list and
    /// fills inherited defaults (cniVersion, list-level name propagation).
    /// A missing delegate name is tolerated here; ADD rejects it before any
    /// side effect.
    pub fn normalize(mut raw: Value, fallback_version: &str) -> Result<DelegateConf, Error> {
        let Some(obj) = raw.as_object_mut() else {
            return Err(Error::MalformedConfig(
                "delegate config must be a JSON object".to_string(),
            ));
        };
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let cni_version = match obj.get("cniVersion").and_then(Value::as_str) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => {
                obj.insert(
                    "cniVersion".to_string(),
                    Value::String(fallback_version.to_string()),
                );
                fallback_version.to_string()
            }
        };

        let mut capabilities = BTreeSet::new();
        let kind = if obj.contains_key("plugins") {
            let display = if name.is_empty() {
                "<unnamed>".to_string()
            } else {
                name.clone()
            };
            let plugins = obj
                .get_mut("plugins")
                .and_then(Value::as_array_mut)
                .filter(|p| !p.is_empty())
                .ok_or(Error::UnsupportedListShape(display))?;
            for plugin in plugins.iter_mut() {
                let entry = plugin.as_object_mut().ok_or_else(|| {
                    Error::MalformedConfig("plugin list entry must be a JSON object".to_string())
                })?;
                if entry
                    .get("type")
                    .and_then(Value::as_str)
                    .map_or(true, str::is_empty)
                {
                    return Err(Error::MalformedConfig(
                        "plugin list entry has no type".to_string(),
                    ));
                }
                if !entry.contains_key("cniVersion") {
                    entry.insert(
                        "cniVersion".to_string(),
                        Value::String(cni_version.clone()),
                    );
                }
                if !entry.contains_key("name") && !name.is_empty() {
                    entry.insert("name".to_string(), Value::String(name.clone()));
                }
                capabilities.extend(capabilities_of(entry.get("capabilities")));
            }
            DelegateKind::List
        } else {
            if obj
                .get("type")
                .and_then(Value::as_str)
                .map_or(true, str::is_empty)
            {
                return Err(Error::MalformedConfig(format!(
                    "delegate {name:?} has no type"
                )));
            }
            capabilities = capabilities_of(obj.get("capabilities"));
            DelegateKind::Single
        };

        Ok(DelegateConf {
            raw,
            kind,
            name,
            cni_version,
            capabilities,
            ifname: None,
            runtime_config: None,
            provenance: None,
            default_route: Vec::new(),
        })
    }

    pub fn plugin_type(&self) -> Result<&str, Error> {
        self.raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedConfig(format!("delegate {:?} has no type", self.name)))
    }

    pub fn plugins(&self) -> Result<&Vec<Value>, Error> {
        self.raw
            .get("plugins")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::UnsupportedListShape(self.name.clone()))
    }

    /// The runtimeConfig forwarded to this delegate is exactly the
    /// capability-declared subset of what the meta-config and the selector
    /// supplied, the selector winning on overlap.
    pub fn apply_runtime_config(
        &mut self,
        inline: Option<&RuntimeConfig>,
        selector: Option<&NetworkSelectionElement>,
    ) {
        let caps = &self.capabilities;
        let mut rc = RuntimeConfig::default();
        if caps.contains("ips") {
            rc.ips = selector
                .and_then(|s| s.ips.clone())
                .or_else(|| inline.and_then(|i| i.ips.clone()));
        }
        if caps.contains("mac") {
            rc.mac = selector
                .and_then(|s| s.mac.clone())
                .or_else(|| inline.and_then(|i| i.mac.clone()));
        }
        if caps.contains("bandwidth") {
            rc.bandwidth = selector
                .and_then(|s| s.bandwidth.clone())
                .or_else(|| inline.and_then(|i| i.bandwidth.clone()));
        }
        if caps.contains("portMappings") {
            rc.port_mappings = selector
                .and_then(|s| s.port_mappings.clone())
                .or_else(|| inline.and_then(|i| i.port_mappings.clone()));
        }
        self.runtime_config = (!rc.is_empty()).then_some(rc);
    }

    /// Merges selector-supplied `cni-args` into the config's `args.cni`
    /// object (each chained plugin for a list).
    pub fn merge_cni_args(&mut self, extra: Option<&Map<String, Value>>) {
        let Some(extra) = extra else { return };
        if extra.is_empty() {
            return;
        }
        match self.kind {
            DelegateKind::Single => {
                if let Some(obj) = self.raw.as_object_mut() {
                    merge_args_into(obj, extra);
                }
            }
            DelegateKind::List => {
                if let Some(plugins) = self
                    .raw
                    .get_mut("plugins")
                    .and_then(Value::as_array_mut)
                {
                    for plugin in plugins.iter_mut() {
                        if let Some(obj) = plugin.as_object_mut() {
                            merge_args_into(obj, extra);
                        }
                    }
                }
            }
        }
    }

    /// Stdin bytes for a single-plugin delegate.
    pub fn single_conf(&self, prev_result: Option<&Value>) -> Result<Vec<u8>, Error> {
        let mut conf = self.raw.clone();
        let obj = conf.as_object_mut().ok_or_else(|| {
            Error::MalformedConfig("delegate config must be a JSON object".to_string())
        })?;
        inject_runtime_config(obj, self.runtime_config.as_ref())?;
        if let Some(prev) = prev_result {
            obj.insert("prevResult".to_string(), prev.clone());
        }
        serde_json::to_vec(&conf).map_err(|e| Error::MalformedConfig(e.to_string()))
    }

    /// Stdin bytes for one entry of a plugin-list delegate. The entry gets
    /// only the runtimeConfig keys it declares capabilities for itself.
    pub fn plugin_conf(
        &self,
        plugin: &Value,
        prev_result: Option<&Value>,
    ) -> Result<Vec<u8>, Error> {
        let mut conf = plugin.clone();
        let obj = conf.as_object_mut().ok_or_else(|| {
            Error::MalformedConfig("plugin list entry must be a JSON object".to_string())
        })?;
        let caps = capabilities_of(obj.get("capabilities"));
        let rc = self
            .runtime_config
            .as_ref()
            .map(|rc| rc.filtered(&caps))
            .filter(|rc| !rc.is_empty());
        inject_runtime_config(obj, rc.as_ref())?;
        if let Some(prev) = prev_result {
            obj.insert("prevResult".to_string(), prev.clone());
        }
        serde_json::to_vec(&conf).map_err(|e| Error::MalformedConfig(e.to_string()))
    }
}

fn inject_runtime_config(
    obj: &mut Map<String, Value>,
    rc: Option<&RuntimeConfig>,
) -> Result<(), Error> {
    if let Some(rc) = rc.filter(|rc| !rc.is_empty()) {
        let value = serde_json::to_value(rc).map_err(|e| Error::MalformedConfig(e.to_string()))?;
        obj.insert("runtimeConfig".to_string(), value);
    }
    Ok(())
}

fn merge_args_into(obj: &mut Map<String, Value>, extra: &Map<String, Value>) {
    let args = obj
        .entry("args".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !args.is_object() {
        *args = Value::Object(Map::new());
    }
    let cni = args
        .as_object_mut()
        .expect("args replaced with object above")
        .entry("cni".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !cni.is_object() {
        *cni = Value::Object(Map::new());
    }
    let cni = cni.as_object_mut().expect("cni replaced with object above");
    for (k, v) in extra {
        cni.insert(k.clone(), v.clone());
    }
}

fn capabilities_of(value: Option<&Value>) -> BTreeSet<String> {
    value
        .and_then(Value::as_object)
        .map(|caps| {
            caps.iter()
                .filter(|(_, enabled)| enabled.as_bool() == Some(true))
                .map(|(k, _)| k.clone())
                .collect()
        })
        .unwrap_or_default()
}
