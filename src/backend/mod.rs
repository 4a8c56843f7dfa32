//! Backend adapters (C3/C4/C5): a single capability surface implemented by three different
//! execution substrates. The router returns a value of this trait; callers never know which
//! backend actually ran.

pub mod lxc;
pub mod oci_lib;
pub mod vm;

use crate::error::RuntimeError;
use async_trait::async_trait;
use serde::Serialize;

/// Possible container states, normalized across all three backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Creating,
    Created,
    Running,
    Paused,
    Stopped,
    Unknown,
}

/// Container resource statistics, generalized across every backend's underlying tool (`runc
/// events`, `pct`, the Proxmox API) since all three can report it and the CLI surface already
/// lists an `events` subcommand.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ContainerStats {
    pub cpu_usage_usec: Option<u64>,
    pub memory_usage_bytes: Option<u64>,
    pub pids_current: Option<u64>,
}

/// Which optional OCI features a backend supports, for the `features` subcommand.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Features {
    pub checkpoint_restore: bool,
    pub hooks: bool,
    pub cgroup_v2: bool,
}

/// A snapshot of a container's observable state, as reported by `state`/`list`.
#[derive(Debug, Clone)]
pub struct StateInfo {
    pub status: ContainerState,
    pub pid: i64,
}

/// The capability surface every backend adapter implements uniformly.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Creates the container's execution substrate resources, without starting it.
    async fn create(&self, bundle: &crate::bundle::Bundle, id: &str) -> Result<(), RuntimeError>;

    /// Executes the user-defined process in a created container.
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Sends the given (already-validated) signal name to the container's init process.
    async fn kill(&self, id: &str, signal: &str) -> Result<(), RuntimeError>;

    /// Deletes any resources held by the container.
    async fn delete(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Suspends all processes inside the container.
    async fn pause(&self, id: &str) -> Result<(), RuntimeError>;

    /// Resumes all processes that have been previously paused.
    async fn resume(&self, id: &str) -> Result<(), RuntimeError>;

    /// Retrieves the normalized state of a container.
    async fn state(&self, id: &str) -> Result<StateInfo, RuntimeError>;

    /// Lists containers known to this backend.
    async fn list(&self) -> Result<Vec<String>, RuntimeError>;

    /// Retrieves resource usage statistics for a container.
    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError>;

    /// Reports which optional OCI features this backend supports.
    fn features(&self) -> Features;
}
