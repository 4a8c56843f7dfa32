//! Proxmox VM Backend (C5): drives both LXC containers and full VMs on a remote Proxmox
//! cluster over its HTTPS API, via [`crate::remote::RemoteClient`] (C6). Unlike C4, nothing
//! here touches the local host; every operation is a round-trip to the cluster.

use crate::backend::{Backend, ContainerState, ContainerStats, Features, StateInfo};
use crate::bundle::Bundle;
use crate::error::RuntimeError;
use crate::remote::RemoteClient;
use crate::translate;
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

/// Which Proxmox resource kind a vmid refers to; the REST path segment differs (`lxc` vs `qemu`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Lxc,
    Vm,
}

impl ResourceKind {
    fn path_segment(self) -> &'static str {
        match self {
            ResourceKind::Lxc => "lxc",
            ResourceKind::Vm => "qemu",
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    pid: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    vmid: u64,
}

/// Annotation key carrying a local path to an OCI-image-derived template tarball the operator
/// wants uploaded to the node's storage before `create_lxc` references it. Absent for the
/// common case where the ostemplate is already present on the node.
const TEMPLATE_ARCHIVE_ANNOTATION: &str = "io.containrs.proxmox/template-archive-path";

/// A Proxmox cluster node's hardware/version summary, as reported by `node_info`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub cpu: f64,
    pub memory: NodeMemory,
    pub uptime: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeMemory {
    pub total: u64,
    pub used: u64,
}

/// A storage pool available on a node, as reported by `list_storage`.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageEntry {
    pub storage: String,
    #[serde(default)]
    pub content: String,
}

/// A content item (template, backup, ISO, ...) available in a storage pool, as reported by
/// `list_templates`.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateEntry {
    pub volid: String,
    #[serde(default)]
    pub size: u64,
}

pub struct VmBackend {
    client: RemoteClient,
    node: String,
    kind: ResourceKind,
    storage: String,
    ostemplate: String,
}

impl VmBackend {
    pub fn new(client: RemoteClient, node: impl Into<String>, kind: ResourceKind, storage: impl Into<String>, ostemplate: impl Into<String>) -> Self {
        Self {
            client,
            node: node.into(),
            kind,
            storage: storage.into(),
            ostemplate: ostemplate.into(),
        }
    }

    fn resource_path(&self, vmid: u64) -> String {
        format!("/nodes/{}/{}/{}", self.node, self.kind.path_segment(), vmid)
    }

    fn status_path(&self, vmid: u64, action: &str) -> String {
        format!("{}/status/{}", self.resource_path(vmid), action)
    }

    async fn existing_vmids(&self) -> Vec<u64> {
        let path = format!("/nodes/{}/{}", self.node, self.kind.path_segment());
        self.client
            .request::<Vec<ListItem>>(Method::GET, &path, None)
            .await
            .map(|items| items.into_iter().map(|i| i.vmid).collect())
            .unwrap_or_default()
    }

    async fn vmid_for(&self, id: &str) -> Result<u64, RuntimeError> {
        let existing = self.existing_vmids().await;
        translate::vmid_for(id, |candidate| existing.contains(&candidate))
    }

    /// Reports the node's hardware/version summary.
    pub async fn node_info(&self) -> Result<NodeInfo, RuntimeError> {
        let path = format!("/nodes/{}/status", self.node);
        self.client.request(Method::GET, &path, None).await
    }

    /// Lists the storage pools configured on the node.
    pub async fn list_storage(&self) -> Result<Vec<StorageEntry>, RuntimeError> {
        let path = format!("/nodes/{}/storage", self.node);
        self.client.request(Method::GET, &path, None).await
    }

    /// Lists the content (templates, backups, ISOs) held in `storage`.
    pub async fn list_templates(&self, storage: &str) -> Result<Vec<TemplateEntry>, RuntimeError> {
        let path = format!("/nodes/{}/storage/{}/content", self.node, storage);
        self.client.request(Method::GET, &path, None).await
    }

    /// Uploads a template archive to this backend's storage pool in 4-16 KiB chunks, so a large
    /// OCI-image-derived tarball survives TLS-terminating proxies that reset long single-body
    /// uploads.
    async fn upload_template_archive(&self, data: Vec<u8>) -> Result<(), RuntimeError> {
        let path = format!("/nodes/{}/storage/{}/upload", self.node, self.storage);
        self.client.send_chunked(&path, &data).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for VmBackend {
    async fn create(&self, bundle: &Bundle, id: &str) -> Result<(), RuntimeError> {
        let vmid = self.vmid_for(id).await?;
        match self.kind {
            ResourceKind::Lxc => {
                if let Some(archive_path) = bundle.annotations().get(TEMPLATE_ARCHIVE_ANNOTATION) {
                    let data = std::fs::read(archive_path)
                        .map_err(|e| RuntimeError::Internal(anyhow::anyhow!(e)))?;
                    self.upload_template_archive(data).await?;
                }

                let params = translate::lxc_params(bundle, id);
                let path = format!("/nodes/{}/lxc", self.node);
                let vmid_s = vmid.to_string();
                let memory_s = params.memory_mb().to_string();
                let cores_s = params.cores().to_string();
                let rootfs = format!("{}:8", self.storage);
                let form: Vec<(&str, String)> = vec![
                    ("vmid", vmid_s),
                    ("hostname", params.hostname().clone()),
                    ("ostemplate", self.ostemplate.clone()),
                    ("storage", self.storage.clone()),
                    ("memory", memory_s),
                    ("cores", cores_s),
                    ("rootfs", rootfs),
                    ("unprivileged", if *params.unprivileged() { "1".to_string() } else { "0".to_string() }),
                ];
                self.client.request::<Value>(Method::POST, &path, Some(&form)).await?;
            }
            ResourceKind::Vm => {
                let params = translate::vm_params(bundle, id);
                let path = format!("/nodes/{}/qemu", self.node);
                let vmid_s = vmid.to_string();
                let memory_s = params.memory_mb().to_string();
                let cores_s = params.cores().to_string();
                let form: Vec<(&str, String)> = vec![
                    ("vmid", vmid_s),
                    ("name", params.name().clone()),
                    ("memory", memory_s),
                    ("cores", cores_s),
                ];
                self.client.request::<Value>(Method::POST, &path, Some(&form)).await?;
            }
        }
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let vmid = self.vmid_for(id).await?;
        let path = self.status_path(vmid, "start");
        self.client.request::<Value>(Method::POST, &path, None).await?;
        Ok(())
    }

    async fn kill(&self, id: &str, signal: &str) -> Result<(), RuntimeError> {
        let vmid = self.vmid_for(id).await?;
        let action = if signal == "KILL" { "stop" } else { "shutdown" };
        let path = self.status_path(vmid, action);
        self.client.request::<Value>(Method::POST, &path, None).await?;
        Ok(())
    }

    async fn delete(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let vmid = self.vmid_for(id).await?;
        if force {
            let _ = self
                .client
                .request::<Value>(Method::POST, &self.status_path(vmid, "stop"), None)
                .await;
        }
        self.client
            .request::<Value>(Method::DELETE, &self.resource_path(vmid), None)
            .await?;
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<(), RuntimeError> {
        let vmid = self.vmid_for(id).await?;
        let path = self.status_path(vmid, "suspend");
        self.client.request::<Value>(Method::POST, &path, None).await?;
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<(), RuntimeError> {
        let vmid = self.vmid_for(id).await?;
        let path = self.status_path(vmid, "resume");
        self.client.request::<Value>(Method::POST, &path, None).await?;
        Ok(())
    }

    async fn state(&self, id: &str) -> Result<StateInfo, RuntimeError> {
        let vmid = self.vmid_for(id).await?;
        let path = self.status_path(vmid, "current");
        let resp: StatusResponse = self.client.request(Method::GET, &path, None).await?;
        let status = match resp.status.as_str() {
            "running" => ContainerState::Running,
            "stopped" => ContainerState::Stopped,
            "paused" => ContainerState::Paused,
            _ => ContainerState::Unknown,
        };
        Ok(StateInfo {
            status,
            pid: resp.pid.unwrap_or(0),
        })
    }

    async fn list(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.existing_vmids().await.into_iter().map(|v| v.to_string()).collect())
    }

    async fn stats(&self, _id: &str) -> Result<ContainerStats, RuntimeError> {
        Ok(ContainerStats::default())
    }

    fn features(&self) -> Features {
        Features {
            checkpoint_restore: false,
            hooks: false,
            cgroup_v2: self.kind == ResourceKind::Lxc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_kind_path_segments() {
        assert_eq!(ResourceKind::Lxc.path_segment(), "lxc");
        assert_eq!(ResourceKind::Vm.path_segment(), "qemu");
    }
}
