use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::args::CmdArgs;
use crate::delegate::{DelegateConf, DelegateKind};
use crate::error::{CniErrorPayload, Error};
use crate::result::CniResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    Add,
    Del,
    Check,
}

impl CniCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            CniCommand::Add => "ADD",
            CniCommand::Del => "DEL",
            CniCommand::Check => "CHECK",
        }
    }
}

/// Child-process capability. The orchestrator only ever talks to delegates
/// through this, so tests can substitute an in-memory fake that asserts
/// per-call env, stdin and ordering.
#[async_trait]
pub trait Exec: Send + Sync {
    async fn exec_plugin(
        &self,
        path: &Path,
        stdin: &[u8],
        env: &[(String, String)],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error>;

    fn find_in_path(&self, plugin: &str, paths: &[String]) -> Result<PathBuf, Error>;
}

/// The real thing: spawns the delegate binary, streams its config over
/// stdin, and interprets its exit status per the CNI contract.
#[derive(Debug, Default)]
pub struct RawExec;

#[async_trait]
impl Exec for RawExec {
    async fn exec_plugin(
        &self,
        path: &Path,
        stdin: &[u8],
        env: &[(String, String)],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        let mut cmd = Command::new(path);
        cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Exec(format!("{}: {e}", path.display())))?;
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Exec(format!("{}: stdin unavailable", path.display())))?;
        child_stdin
            .write_all(stdin)
            .await
            .map_err(|e| Error::Exec(format!("{}: {e}", path.display())))?;
        drop(child_stdin);

        let wait = child.wait_with_output();
        let output = match timeout {
            Some(t) => tokio::time::timeout(t, wait)
                .await
                .map_err(|_| Error::Deadline(path.display().to_string()))?,
            None => wait.await,
        }
        .map_err(|e| Error::Exec(format!("{}: {e}", path.display())))?;

        if !output.status.success() {
            return Err(plugin_error(&output.stdout, &output.stderr));
        }
        Ok(output.stdout)
    }

    fn find_in_path(&self, plugin: &str, paths: &[String]) -> Result<PathBuf, Error> {
        for dir in paths {
            let candidate = Path::new(dir).join(plugin);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(Error::NoSuchBinary(plugin.to_string()))
    }
}

// A failing delegate reports a structured error object on stdout; anything
// else is surfaced raw.
fn plugin_error(stdout: &[u8], stderr: &[u8]) -> Error {
    if let Ok(payload) = serde_json::from_slice::<CniErrorPayload>(stdout) {
        return Error::Plugin {
            code: payload.code,
            msg: payload.msg,
            details: payload.details,
        };
    }
    let msg = if stderr.is_empty() { stdout } else { stderr };
    Error::Plugin {
        code: 106,
        msg: String::from_utf8_lossy(msg).trim().to_string(),
        details: String::new(),
    }
}

fn build_env(command: CniCommand, args: &CmdArgs, ifname: &str) -> Vec<(String, String)> {
    vec![
        ("CNI_COMMAND".to_string(), command.as_str().to_string()),
        ("CNI_CONTAINERID".to_string(), args.container_id.clone()),
        ("CNI_NETNS".to_string(), args.netns.clone()),
        ("CNI_IFNAME".to_string(), ifname.to_string()),
        ("CNI_ARGS".to_string(), args.args.clone()),
        ("CNI_PATH".to_string(), args.path.join(":")),
    ]
}

async fn invoke(
    exec: &dyn Exec,
    args: &CmdArgs,
    plugin_type: &str,
    stdin: &[u8],
    command: CniCommand,
    ifname: &str,
    timeout: Option<Duration>,
) -> Result<Vec<u8>, Error> {
    let bin = exec.find_in_path(plugin_type, &args.path)?;
    let env = build_env(command, args, ifname);
    exec.exec_plugin(&bin, stdin, &env, timeout).await
}

fn plugin_type_of(plugin: &Value) -> Result<&str, Error> {
    plugin
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedConfig("plugin list entry has no type".to_string()))
}

/// Runs ADD for one delegate and hands back its result translated to the
/// meta-config's schema version.
pub async fn delegate_add(
    exec: &dyn Exec,
    args: &CmdArgs,
    delegate: &DelegateConf,
    ifname: &str,
    meta_version: &str,
    timeout: Option<Duration>,
) -> Result<CniResult, Error> {
    let result = match delegate.kind {
        DelegateKind::Single => {
            let stdin = delegate.single_conf(None)?;
            let data = invoke(
                exec,
                args,
                delegate.plugin_type()?,
                &stdin,
                CniCommand::Add,
                ifname,
                timeout,
            )
            .await?;
            CniResult::parse(&delegate.cni_version, &data)?
        }
        DelegateKind::List => chain_add(exec, args, delegate, ifname, timeout).await?,
    };
    result.convert_to(meta_version)
}

pub async fn delegate_del(
    exec: &dyn Exec,
    args: &CmdArgs,
    delegate: &DelegateConf,
    ifname: &str,
    timeout: Option<Duration>,
) -> Result<(), Error> {
    match delegate.kind {
        DelegateKind::Single => {
            let stdin = delegate.single_conf(None)?;
            invoke(
                exec,
                args,
                delegate.plugin_type()?,
                &stdin,
                CniCommand::Del,
                ifname,
                timeout,
            )
            .await?;
            Ok(())
        }
        DelegateKind::List => chain_del(exec, args, delegate, ifname, timeout).await,
    }
}

pub async fn delegate_check(
    exec: &dyn Exec,
    args: &CmdArgs,
    delegate: &DelegateConf,
    ifname: &str,
    timeout: Option<Duration>,
) -> Result<(), Error> {
    match delegate.kind {
        DelegateKind::Single => {
            let stdin = delegate.single_conf(None)?;
            invoke(
                exec,
                args,
                delegate.plugin_type()?,
                &stdin,
                CniCommand::Check,
                ifname,
                timeout,
            )
            .await?;
            Ok(())
        }
        DelegateKind::List => chain_check(exec, args, delegate, ifname, timeout).await,
    }
}

// Like ADD, CHECK pipes each chained plugin's result into the next
// plugin's stdin as prevResult. A plugin that prints nothing leaves the
// previous result in place.
async fn chain_check(
    exec: &dyn Exec,
    args: &CmdArgs,
    delegate: &DelegateConf,
    ifname: &str,
    timeout: Option<Duration>,
) -> Result<(), Error> {
    let mut prev: Option<Value> = None;
    for plugin in delegate.plugins()? {
        let stdin = delegate.plugin_conf(plugin, prev.as_ref())?;
        let data = invoke(
            exec,
            args,
            plugin_type_of(plugin)?,
            &stdin,
            CniCommand::Check,
            ifname,
            timeout,
        )
        .await?;
        if !data.iter().all(u8::is_ascii_whitespace) {
            let result = CniResult::parse(&delegate.cni_version, &data)?;
            prev = Some(result.to_value()?);
        }
    }
    Ok(())
}

// Plugin lists run in declared order for ADD, piping each result into the
// next plugin's stdin as prevResult. A mid-chain failure reverse-deletes
// the entries already run before surfacing the error.
async fn chain_add(
    exec: &dyn Exec,
    args: &CmdArgs,
    delegate: &DelegateConf,
    ifname: &str,
    timeout: Option<Duration>,
) -> Result<CniResult, Error> {
    let plugins = delegate.plugins()?;
    let mut prev: Option<Value> = None;
    let mut last: Option<CniResult> = None;
    for (i, plugin) in plugins.iter().enumerate() {
        let stdin = delegate.plugin_conf(plugin, prev.as_ref())?;
        let outcome = match invoke(
            exec,
            args,
            plugin_type_of(plugin)?,
            &stdin,
            CniCommand::Add,
            ifname,
            timeout,
        )
        .await
        {
            Ok(data) => CniResult::parse(&delegate.cni_version, &data),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(result) => {
                prev = Some(result.to_value()?);
                last = Some(result);
            }
            Err(e) => {
                for j in (0..=i).rev() {
                    let plugin = &plugins[j];
                    let del_stdin = match delegate.plugin_conf(plugin, None) {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    let Ok(ptype) = plugin_type_of(plugin) else {
                        continue;
                    };
                    if let Err(derr) = invoke(
                        exec,
                        args,
                        ptype,
                        &del_stdin,
                        CniCommand::Del,
                        ifname,
                        timeout,
                    )
                    .await
                    {
                        tracing::warn!(
                            list = %delegate.name,
                            plugin = j,
                            error = %derr,
                            "cleanup of chained plugin failed"
                        );
                    }
                }
                return Err(e);
            }
        }
    }
    last.ok_or_else(|| Error::UnsupportedListShape(delegate.name.clone()))
}

async fn chain_del(
    exec: &dyn Exec,
    args: &CmdArgs,
    delegate: &DelegateConf,
    ifname: &str,
    timeout: Option<Duration>,
) -> Result<(), Error> {
    let plugins = delegate.plugins()?;
    let mut first_err = None;
    for plugin in plugins.iter().rev() {
        let stdin = delegate.plugin_conf(plugin, None)?;
        if let Err(e) = invoke(
            exec,
            args,
            plugin_type_of(plugin)?,
            &stdin,
            CniCommand::Del,
            ifname,
            timeout,
        )
        .await
        {
            tracing::warn!(list = %delegate.name, error = %e, "chained plugin delete failed");
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
