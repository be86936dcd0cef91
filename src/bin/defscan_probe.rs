//! defscan-probe: standalone probe worker speaking line-delimited JSON
//! over stdio.
//!
//! The protocol channel is stdout; all logging goes to stderr. If
//! `DEFSCAN_PROBE_RSH` is set, the process re-executes itself through the
//! given shell command first (for collection on a remote host).

use std::sync::Arc;
use std::sync::mpsc::channel;

use miette::{IntoDiagnostic, Result};

use defscan::error::ProbeError;
use defscan::model::{EntityValue, Object, ObjectContent, SubtypeId};
use defscan::syschar::{Item, Sysinfo};
use defscan::worker::ipc::{pump_requests, pump_responses};
use defscan::worker::{self, WorkerEndpoint, WorkerOptions, WorkerProbe};

/// Environment variable holding a remote-shell wrapper command.
const PROBE_RSH_ENV: &str = "DEFSCAN_PROBE_RSH";

/// Environment variable listing entity names exempt from
/// variable-reference handling, colon-separated.
const PROBE_EXCLUDE_ENV: &str = "DEFSCAN_PROBE_EXCLUDE";

/// Host-side collection backend for the file object family.
struct HostProbe;

impl WorkerProbe for HostProbe {
    fn evaluate(&self, subtype: SubtypeId, object: &Object) -> Result<Vec<Item>, ProbeError> {
        let mut items = Vec::new();
        for content in &object.contents {
            let ObjectContent::Entity(entity) = content else {
                continue;
            };
            let EntityValue::Literal(value) = &entity.value else {
                continue;
            };
            match (subtype.0, entity.name.as_str()) {
                // file objects: stat the named path.
                (30, "path") => {
                    let meta = std::fs::metadata(value).map_err(|e| ProbeError::Collect {
                        message: format!("cannot stat {value}: {e}"),
                    })?;
                    items.push(Item::new(vec![
                        ("path".into(), value.clone()),
                        ("size".into(), meta.len().to_string()),
                    ]));
                }
                // environment variable objects: read from this process.
                (12, "name") => {
                    if let Ok(found) = std::env::var(value) {
                        items.push(Item::new(vec![
                            ("name".into(), value.clone()),
                            ("value".into(), found),
                        ]));
                    }
                }
                _ => {
                    return Err(ProbeError::Collect {
                        message: format!(
                            "no collection backend for subtype {subtype} entity {}",
                            entity.name
                        ),
                    });
                }
            }
        }
        Ok(items)
    }

    fn sysinfo(&self) -> Result<Sysinfo, ProbeError> {
        let host = std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "localhost".into());
        Ok(Sysinfo {
            os_name: std::env::consts::OS.into(),
            os_version: String::new(),
            architecture: std::env::consts::ARCH.into(),
            primary_host_name: host,
        })
    }
}

/// Wrapper command line: the configured remote shell followed by this
/// program's own path, so the wrapped invocation runs the same binary.
fn rsh_command(rsh: &std::ffi::OsStr, program: &std::ffi::OsStr) -> std::ffi::OsString {
    let mut command = rsh.to_os_string();
    command.push(" ");
    command.push(program);
    command
}

/// Replace this process with the wrapper command, if one is configured.
fn maybe_reexec() -> std::io::Result<()> {
    let Some(rsh) = std::env::var_os(PROBE_RSH_ENV) else {
        return Ok(());
    };
    let program = std::env::args_os()
        .next()
        .unwrap_or_else(|| "defscan-probe".into());
    let command = rsh_command(&rsh, &program);
    // Clear the variable so the re-executed process does not loop.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .env_remove(PROBE_RSH_ENV)
            .exec();
        // exec only returns on failure.
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = command;
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    maybe_reexec().into_diagnostic()?;

    let excluded: Vec<String> = std::env::var(PROBE_EXCLUDE_ENV)
        .map(|raw| raw.split(':').map(str::to_string).collect())
        .unwrap_or_default();
    let options = WorkerOptions::with_exclusions(excluded);

    let (request_tx, request_rx) = channel();
    let (response_tx, response_rx) = channel();
    let endpoint = WorkerEndpoint {
        requests: request_rx,
        responses: response_tx,
    };

    // stdin → request channel; response channel → stdout.
    std::thread::spawn(move || {
        let stdin = std::io::stdin().lock();
        if let Err(e) = pump_requests(stdin, &request_tx) {
            tracing::error!(error = %e, "request pump failed");
        }
    });
    let writer = std::thread::spawn(move || {
        let stdout = std::io::stdout().lock();
        pump_responses(&response_rx, stdout)
    });

    let code = worker::run(endpoint, Arc::new(HostProbe), options).into_diagnostic()?;

    // run() dropped the last response sender; the writer drains and stops.
    match writer.join() {
        Ok(result) => result.into_diagnostic()?,
        Err(_) => miette::bail!("response writer panicked"),
    }

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn rsh_command_carries_own_program_path() {
        let command = rsh_command(
            OsStr::new("ssh scanned-host"),
            OsStr::new("/usr/libexec/defscan/defscan-probe"),
        );
        assert_eq!(command, "ssh scanned-host /usr/libexec/defscan/defscan-probe");
    }
}
