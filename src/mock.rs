use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Error;
use crate::exec::Exec;
use crate::kubernetes::{NetworkDefRegistry, Workload, WorkloadDirectory};

/// One expected delegate invocation. ADD consumes entries in registration
/// order, DEL in reverse, CHECK in order again, mirroring how the real
/// pipeline drives its children.
pub(crate) struct FakePlugin {
    pub expected_conf: Option<Value>,
    pub expected_ifname: Option<String>,
    pub expected_env: Vec<(String, String)>,
    pub expected_prev: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Default)]
struct FakeExecState {
    add_index: usize,
    del_index: usize,
    check_index: usize,
}

#[derive(Default)]
pub(crate) struct FakeExec {
    plugins: Vec<FakePlugin>,
    state: Mutex<FakeExecState>,
}

impl FakeExec {
    pub fn new() -> FakeExec {
        FakeExec::default()
    }

    pub fn add_plugin(
        &mut self,
        expected_conf: Option<&str>,
        expected_ifname: Option<&str>,
        result: Option<Value>,
        error: Option<&str>,
    ) {
        self.plugins.push(FakePlugin {
            expected_conf: expected_conf
                .map(|c| serde_json::from_str(c).expect("expected conf must be valid JSON")),
            expected_ifname: expected_ifname.map(|i| i.to_string()),
            expected_env: Vec::new(),
            expected_prev: None,
            result,
            error: error.map(|e| e.to_string()),
        });
    }

    pub fn expect_env(&mut self, index: usize, env: &[(&str, &str)]) {
        self.plugins[index].expected_env = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    pub fn expect_prev(&mut self, index: usize, prev: Value) {
        self.plugins[index].expected_prev = Some(prev);
    }

    pub fn add_count(&self) -> usize {
        self.state.lock().unwrap().add_index
    }

    pub fn del_count(&self) -> usize {
        self.state.lock().unwrap().del_index
    }

    pub fn check_count(&self) -> usize {
        self.state.lock().unwrap().check_index
    }
}

#[async_trait]
impl Exec for FakeExec {
    async fn exec_plugin(
        &self,
        _path: &Path,
        stdin: &[u8],
        env: &[(String, String)],
        _timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        let lookup = |key: &str| -> Option<&str> {
            env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
        };
        let command = lookup("CNI_COMMAND").expect("CNI_COMMAND must be set");
        let index = {
            let mut state = self.state.lock().unwrap();
            match command {
                "ADD" => {
                    assert!(state.add_index < self.plugins.len(), "unexpected extra ADD");
                    state.add_index += 1;
                    state.add_index - 1
                }
                "DEL" => {
                    assert!(state.del_index < self.plugins.len(), "unexpected extra DEL");
                    state.del_index += 1;
                    self.plugins.len() - state.del_index
                }
                "CHECK" => {
                    state.check_index += 1;
                    state.check_index - 1
                }
                other => panic!("unexpected CNI_COMMAND {other:?}"),
            }
        };
        let plugin = &self.plugins[index];

        if plugin.expected_conf.is_some() || plugin.expected_prev.is_some() {
            let mut got: Value = serde_json::from_slice(stdin).expect("stdin must be JSON");
            if let Some(expected) = &plugin.expected_prev {
                assert_eq!(
                    got.get("prevResult"),
                    Some(expected),
                    "delegate {index} prevResult mismatch ({command})"
                );
            }
            if let Some(obj) = got.as_object_mut() {
                obj.remove("prevResult");
            }
            if let Some(expected) = &plugin.expected_conf {
                assert_eq!(&got, expected, "delegate {index} stdin mismatch ({command})");
            }
        }
        if let Some(expected) = &plugin.expected_ifname {
            assert_eq!(
                lookup("CNI_IFNAME"),
                Some(expected.as_str()),
                "delegate {index} ifname mismatch ({command})"
            );
        }
        for (key, value) in &plugin.expected_env {
            assert_eq!(
                lookup(key),
                Some(value.as_str()),
                "delegate {index} env {key} mismatch"
            );
        }

        if let Some(error) = &plugin.error {
            return Err(Error::Plugin {
                code: 999,
                msg: error.clone(),
                details: String::new(),
            });
        }
        let result = plugin.result.clone().unwrap_or(Value::Null);
        Ok(serde_json::to_vec(&result).expect("result must serialize"))
    }

    fn find_in_path(&self, plugin: &str, paths: &[String]) -> Result<PathBuf, Error> {
        assert!(!paths.is_empty(), "CNI_PATH must not be empty");
        Ok(Path::new(&paths[0]).join(plugin))
    }
}

/// In-memory network definition registry.
#[derive(Default)]
pub(crate) struct MemoryRegistry {
    configs: HashMap<(String, String), String>,
}

impl MemoryRegistry {
    pub fn new() -> MemoryRegistry {
        MemoryRegistry::default()
    }

    pub fn with(mut self, namespace: &str, name: &str, config: &str) -> MemoryRegistry {
        self.configs
            .insert((namespace.to_string(), name.to_string()), config.to_string());
        self
    }
}

#[async_trait]
impl NetworkDefRegistry for MemoryRegistry {
    async fn get_config(&self, namespace: &str, name: &str) -> Result<Vec<u8>, Error> {
        self.configs
            .get(&(namespace.to_string(), name.to_string()))
            .map(|c| c.clone().into_bytes())
            .ok_or_else(|| Error::NoSuchNetworkDef(format!("{namespace}/{name}")))
    }
}

/// In-memory workload directory; pods can be removed mid-test and the
/// whole directory can be marked unavailable to simulate an apiserver
/// outage.
#[derive(Default)]
pub(crate) struct MemoryDirectory {
    pods: Mutex<HashMap<(String, String), Workload>>,
    unavailable: bool,
}

impl MemoryDirectory {
    pub fn new() -> MemoryDirectory {
        MemoryDirectory::default()
    }

    pub fn with_pod(
        self,
        namespace: &str,
        name: &str,
        uid: &str,
        annotations: &[(&str, &str)],
    ) -> MemoryDirectory {
        let workload = Workload {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: Some(uid.to_string()),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.pods
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), workload);
        self
    }

    pub fn unavailable() -> MemoryDirectory {
        MemoryDirectory {
            pods: Mutex::new(HashMap::new()),
            unavailable: true,
        }
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[async_trait]
impl WorkloadDirectory for MemoryDirectory {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Workload, Error> {
        if self.unavailable {
            return Err(Error::WorkloadLookupTransient(
                "apiserver unavailable".to_string(),
            ));
        }
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::WorkloadLookupTerminal(format!("pod {namespace}/{name} not found"))
            })
    }
}

/// Event sink that records notes instead of talking to a cluster.
#[derive(Default)]
pub(crate) struct CollectingSink {
    notes: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn new() -> CollectingSink {
        CollectingSink::default()
    }

    pub fn notes(&self) -> Vec<String> {
        self.notes.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::kubernetes::event::EventSink for CollectingSink {
    async fn added_interface(&self, _workload: &Workload, note: String) {
        self.notes.lock().unwrap().push(note);
    }
}
