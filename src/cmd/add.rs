use std::time::Duration;

use crate::args::CmdArgs;
use crate::cache::{CacheEntry, DeviceBinding, ScratchCache};
use crate::config::NetConf;
use crate::delegate::DelegateConf;
use crate::error::Error;
use crate::exec::{self, Exec};
use crate::kubernetes::event::EventSink;
use crate::kubernetes::{NetworkDefRegistry, WorkloadDirectory};
use crate::resolver;
use crate::result::CniResult;

// Rollback deletes run on their own small budget; the caller's deadline
// may already be gone by the time ADD fails.
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(10);

const READINESS_POLL: Duration = Duration::from_secs(1);
const READINESS_TIMEOUT: Duration = Duration::from_secs(10);

/// ADD: resolve the delegate set, drive every delegate in order, persist
/// the scratch cache, emit attachment events, and return the master
/// delegate's result at the meta-config's schema version. Any failure
/// reverse-deletes whatever already succeeded.
pub async fn add(
    args: &CmdArgs,
    exec: &dyn Exec,
    registry: Option<&dyn NetworkDefRegistry>,
    workloads: Option<&dyn WorkloadDirectory>,
    events: Option<&dyn EventSink>,
) -> Result<CniResult, Error> {
    let (conf, inline) = NetConf::parse(&args.stdin)?;
    let args = &args.with_bin_dir(&conf.bin_dir);
    if let Some(file) = &conf.readiness_indicator_file {
        wait_for_readiness(file).await?;
    }

    let resolved = resolver::resolve(&conf, &inline, args, registry, workloads).await?;
    let delegates = resolved.delegates;
    if delegates.is_empty() {
        return Err(Error::MissingDelegates);
    }
    // No side effect may happen before every delegate has a usable name.
    for (i, delegate) in delegates.iter().enumerate() {
        if delegate.name.is_empty() {
            return Err(Error::MissingDelegateName(i));
        }
    }

    let mut results: Vec<CniResult> = Vec::with_capacity(delegates.len());
    let mut bindings: Vec<DeviceBinding> = Vec::with_capacity(delegates.len());
    for (i, delegate) in delegates.iter().enumerate() {
        let ifname = delegate
            .ifname
            .clone()
            .unwrap_or_else(|| args.ifname.clone());
        match exec::delegate_add(exec, args, delegate, &ifname, &conf.cni_version, args.timeout)
            .await
        {
            Ok(result) => {
                bindings.push(DeviceBinding {
                    index: i,
                    ifname,
                    netns: args.netns.clone(),
                    sandbox: result.sandbox(),
                });
                results.push(result);
            }
            Err(e) => {
                tracing::error!(delegate = %delegate.name, error = %e, "delegate add failed");
                rollback(exec, args, &delegates[..=i]).await;
                return Err(Error::DelegateAddFailed {
                    index: i,
                    name: delegate.name.clone(),
                    pod: args.workload_ref(),
                    message: e.to_string(),
                });
            }
        }
    }

    let cache = ScratchCache::new(&conf.cni_dir);
    let entry = CacheEntry {
        cni_version: conf.cni_version.clone(),
        container_id: args.container_id.clone(),
        ifname: args.ifname.clone(),
        delegates: delegates.clone(),
        bindings,
    };
    if let Err(e) = cache.put(&entry).await {
        tracing::error!(error = %e, "failed to persist scratch cache, undoing attachments");
        rollback(exec, args, &delegates).await;
        return Err(e);
    }

    if let (Some(sink), Some(workload)) = (events, resolved.workload.as_ref()) {
        for (delegate, result) in delegates.iter().zip(results.iter()) {
            let ifname = delegate.ifname.as_deref().unwrap_or(&args.ifname);
            let mut note = format!("Add {} [{}]", ifname, result.ip_strings().join(","));
            if let Some(provenance) = &delegate.provenance {
                note.push_str(&format!(" from {provenance}"));
            }
            sink.added_interface(workload, note).await;
        }
    }

    Ok(results.swap_remove(0))
}

// Best-effort compensation, newest first. The delegate that just failed is
// included: a failed child ADD can still have left partial state behind.
async fn rollback(exec: &dyn Exec, args: &CmdArgs, delegates: &[DelegateConf]) {
    for delegate in delegates.iter().rev() {
        let ifname = delegate
            .ifname
            .clone()
            .unwrap_or_else(|| args.ifname.clone());
        if let Err(e) =
            exec::delegate_del(exec, args, delegate, &ifname, Some(ROLLBACK_TIMEOUT)).await
        {
            tracing::warn!(delegate = %delegate.name, error = %e, "rollback delete failed");
        }
    }
}

async fn wait_for_readiness(file: &str) -> Result<(), Error> {
    let deadline = tokio::time::Instant::now() + READINESS_TIMEOUT;
    loop {
        if std::path::Path::new(file).exists() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::NotReady(file.to_string()));
        }
        tokio::time::sleep(READINESS_POLL).await;
    }
}
