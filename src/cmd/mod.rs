pub mod add;
pub mod check;
pub mod del;

use tokio::io::AsyncReadExt;

use crate::args::CmdArgs;
use crate::config::NetConf;
use crate::error::Error;
use crate::exec::RawExec;
use crate::kubernetes::event::EventSink;
use crate::kubernetes::{KubeClientInfo, NetworkDefRegistry, WorkloadDirectory};
use crate::version;

/// Top-level driver behind `main`: reads the CNI environment and stdin,
/// dispatches, and speaks the result/error protocol on stdout.
pub async fn run() -> i32 {
    let command = std::env::var("CNI_COMMAND").unwrap_or_default();
    let mut stdin = Vec::new();
    if let Err(e) = tokio::io::stdin().read_to_end(&mut stdin).await {
        return fail(&stdin, &Error::InvalidEnv(format!("failed to read stdin: {e}")));
    }
    if command == "VERSION" {
        println!("{}", version_payload(&stdin));
        return 0;
    }
    match dispatch(&command, &stdin).await {
        Ok(Some(output)) => {
            println!("{output}");
            0
        }
        Ok(None) => 0,
        Err(e) => fail(&stdin, &e),
    }
}

async fn dispatch(command: &str, stdin: &[u8]) -> Result<Option<String>, Error> {
    if !matches!(command, "ADD" | "DEL" | "CHECK") {
        return Err(Error::InvalidEnv(format!(
            "unknown CNI_COMMAND {command:?}"
        )));
    }
    let args = CmdArgs::from_env(stdin.to_vec())?;
    let (conf, _) = NetConf::parse(&args.stdin)?;
    crate::trace::init(conf.log_level.as_deref(), conf.log_file.as_deref());

    let kube = KubeClientInfo::new(&conf).await?;
    let registry = kube.as_ref().map(|k| k as &dyn NetworkDefRegistry);
    let workloads = kube.as_ref().map(|k| k as &dyn WorkloadDirectory);
    let events = kube.as_ref().map(|k| k as &dyn EventSink);
    let exec = RawExec;

    match command {
        "ADD" => {
            let result = add::add(&args, &exec, registry, workloads, events).await?;
            Ok(Some(result.to_json()?))
        }
        "DEL" => {
            del::del(&args, &exec, registry, workloads).await?;
            Ok(None)
        }
        "CHECK" => {
            check::check(&args, &exec, registry, workloads).await?;
            Ok(None)
        }
        _ => unreachable!("gated above"),
    }
}

// Errors ride stdout as a structured CNI error object; stderr gets the
// human-readable line.
fn fail(stdin: &[u8], err: &Error) -> i32 {
    let cni_version = stdin_version(stdin);
    let payload = err.to_cni_error(&cni_version);
    match serde_json::to_string(&payload) {
        Ok(s) => println!("{s}"),
        Err(_) => println!("{{}}"),
    }
    eprintln!("{err}");
    1
}

fn stdin_version(stdin: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(stdin)
        .ok()
        .and_then(|v| {
            v.get("cniVersion")
                .and_then(|v| v.as_str())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| version::DEFAULT_VERSION.to_string())
}

fn version_payload(stdin: &[u8]) -> String {
    serde_json::json!({
        "cniVersion": stdin_version(stdin),
        "supportedVersions": version::SUPPORTED_VERSIONS,
    })
    .to_string()
}
