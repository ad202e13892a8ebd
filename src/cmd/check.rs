use crate::args::CmdArgs;
use crate::cache::ScratchCache;
use crate::config::NetConf;
use crate::error::Error;
use crate::exec::{self, Exec};
use crate::kubernetes::{NetworkDefRegistry, WorkloadDirectory};
use crate::resolver;
use crate::version;

/// CHECK: gated on the config's schema version before anything else, then
/// every delegate in original order. The first failure short-circuits.
pub async fn check(
    args: &CmdArgs,
    exec: &dyn Exec,
    registry: Option<&dyn NetworkDefRegistry>,
    workloads: Option<&dyn WorkloadDirectory>,
) -> Result<(), Error> {
    let (conf, inline) = NetConf::parse(&args.stdin)?;
    if !version::supports_check(&conf.cni_version) {
        return Err(Error::CheckNotSupported(conf.cni_version));
    }
    let args = &args.with_bin_dir(&conf.bin_dir);

    let cache = ScratchCache::new(&conf.cni_dir);
    let (delegates, bindings) = match cache.get(&args.container_id).await {
        Some(entry) => (entry.delegates, entry.bindings),
        None => {
            let resolved = resolver::resolve(&conf, &inline, args, registry, workloads).await?;
            (resolved.delegates, Vec::new())
        }
    };

    for (i, delegate) in delegates.iter().enumerate() {
        let ifname = bindings
            .iter()
            .find(|b| b.index == i)
            .map(|b| b.ifname.clone())
            .or_else(|| delegate.ifname.clone())
            .unwrap_or_else(|| args.ifname.clone());
        exec::delegate_check(exec, args, delegate, &ifname, args.timeout)
            .await
            .map_err(|e| Error::DelegateCheckFailed {
                index: i,
                name: delegate.name.clone(),
                pod: args.workload_ref(),
                message: e.to_string(),
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FakeExec;

    fn conf_at(version: &str, cni_dir: &std::path::Path) -> Vec<u8> {
        format!(
            r#"{{
                "name": "node-cni-network",
                "type": "weft-cni",
                "cniVersion": "{version}",
                "cniDir": "{}",
                "delegates": [
                    {{"name": "weave1", "cniVersion": "{version}", "type": "weave-net"}},
                    {{"name": "other1", "cniVersion": "{version}", "type": "other-plugin"}}
                ]
            }}"#,
            cni_dir.display()
        )
        .into_bytes()
    }

    fn args_for(stdin: &[u8]) -> CmdArgs {
        CmdArgs::new(
            "123456789",
            "/var/run/netns/test",
            "eth0",
            "",
            &["/some/path"],
            stdin,
        )
    }

    #[tokio::test]
    async fn check_is_version_gated_without_invoking_delegates() {
        let dir = tempfile::tempdir().unwrap();
        let stdin = conf_at("0.2.0", dir.path());
        let args = args_for(&stdin);
        let fexec = FakeExec::new();

        let err = check(&args, &fexec, None, None).await.unwrap_err();
        match err {
            Error::CheckNotSupported(v) => assert_eq!(v, "0.2.0"),
            other => panic!("expected CheckNotSupported, got {other:?}"),
        }
        assert_eq!(fexec.check_count(), 0);
    }

    #[tokio::test]
    async fn check_walks_delegates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let stdin = conf_at("0.4.0", dir.path());
        let args = args_for(&stdin);

        let mut fexec = FakeExec::new();
        fexec.add_plugin(None, Some("eth0"), None, None);
        fexec.add_plugin(None, Some("net1"), None, None);

        check(&args, &fexec, None, None).await.unwrap();
        assert_eq!(fexec.check_count(), 2);
    }

    #[tokio::test]
    async fn first_check_failure_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let stdin = conf_at("0.4.0", dir.path());
        let args = args_for(&stdin);

        let mut fexec = FakeExec::new();
        fexec.add_plugin(None, None, None, Some("check failed"));
        fexec.add_plugin(None, None, None, None);

        let err = check(&args, &fexec, None, None).await.unwrap_err();
        assert_eq!(fexec.check_count(), 1);
        match err {
            Error::DelegateCheckFailed { name, .. } => assert_eq!(name, "weave1"),
            other => panic!("expected DelegateCheckFailed, got {other:?}"),
        }
    }
}
