use crate::args::CmdArgs;
use crate::cache::ScratchCache;
use crate::config::NetConf;
use crate::error::Error;
use crate::exec::{self, Exec};
use crate::kubernetes::{NetworkDefRegistry, WorkloadDirectory};
use crate::resolver;

/// DEL: replay the scratch cache (ground truth when present) in reverse
/// delegate order. Without a cache entry the delegate set is re-resolved
/// best-effort; a vanished workload degrades to the inline delegates.
/// Per-delegate errors do not short-circuit; the first one is reported at
/// the end unless `retryDeleteOnError` asks for success regardless.
pub async fn del(
    args: &CmdArgs,
    exec: &dyn Exec,
    registry: Option<&dyn NetworkDefRegistry>,
    workloads: Option<&dyn WorkloadDirectory>,
) -> Result<(), Error> {
    let (conf, inline) = NetConf::parse(&args.stdin)?;
    let args = &args.with_bin_dir(&conf.bin_dir);
    let cache = ScratchCache::new(&conf.cni_dir);

    let (delegates, bindings) = match cache.get(&args.container_id).await {
        Some(entry) => (entry.delegates, entry.bindings),
        None => {
            let delegates =
                match resolver::resolve(&conf, &inline, args, registry, workloads).await {
                    Ok(resolved) => resolved.delegates,
                    Err(
                        e @ (Error::WorkloadLookupTerminal(_)
                        | Error::WorkloadLookupTransient(_)
                        | Error::NoSuchNetworkDef(_)
                        | Error::BadAttachmentRequest(_)),
                    ) => {
                        tracing::warn!(
                            error = %e,
                            "workload context unavailable, deleting inline delegates only"
                        );
                        let mut fallback = inline.clone();
                        for delegate in fallback.iter_mut() {
                            delegate.apply_runtime_config(conf.runtime_config.as_ref(), None);
                        }
                        resolver::assign_interface_names(&mut fallback, &args.ifname)?;
                        fallback
                    }
                    Err(e) => return Err(e),
                };
            (delegates, Vec::new())
        }
    };

    let mut first_err: Option<Error> = None;
    for (i, delegate) in delegates.iter().enumerate().rev() {
        let ifname = bindings
            .iter()
            .find(|b| b.index == i)
            .map(|b| b.ifname.clone())
            .or_else(|| delegate.ifname.clone())
            .unwrap_or_else(|| args.ifname.clone());
        match exec::delegate_del(exec, args, delegate, &ifname, args.timeout).await {
            Ok(()) => {}
            Err(Error::NoSuchBinary(bin)) => {
                tracing::warn!(
                    delegate = %delegate.name,
                    binary = %bin,
                    "delegate binary not found, skipping delete"
                );
            }
            Err(e) => {
                tracing::error!(delegate = %delegate.name, error = %e, "delegate delete failed");
                if first_err.is_none() {
                    first_err = Some(Error::DelegateDelFailed {
                        index: i,
                        name: delegate.name.clone(),
                        pod: args.workload_ref(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    if let Some(e) = first_err {
        if !conf.retry_delete_on_error {
            return Err(e);
        }
        tracing::warn!(error = %e, "ignoring delegate delete errors");
    }

    if let Err(e) = cache.delete(&args.container_id).await {
        tracing::warn!(error = %e, "failed to remove scratch cache entry");
    }
    Ok(())
}
