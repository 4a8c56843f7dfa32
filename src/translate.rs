//! Backend Translator (C2): turns a parsed [`Bundle`] into the parameters each non-oci-lib
//! backend needs to create its equivalent substrate. The oci-lib backend consumes a [`Bundle`]
//! directly (it speaks OCI natively); LXC and VM do not, so their config shapes are derived here.

use crate::bundle::Bundle;
use crate::error::{BackendError, RuntimeError};
use getset::Getters;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// VMIDs live in this range on a Proxmox node; below it is reserved for the host/cluster itself.
const VMID_MIN: u64 = 100;
const VMID_MAX: u64 = 999_999_999;
const VMID_COLLISION_ATTEMPTS: u32 = 100;

/// Derives a stable, low-collision VMID from a container id. `taken` reports whether a
/// candidate is already in use; on collision the id is re-salted and retried up to
/// [`VMID_COLLISION_ATTEMPTS`] times before giving up.
pub fn vmid_for(id: &str, mut taken: impl FnMut(u64) -> bool) -> Result<u64, RuntimeError> {
    for salt in 0..VMID_COLLISION_ATTEMPTS {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        salt.hash(&mut hasher);
        let candidate = VMID_MIN + (hasher.finish() % (VMID_MAX - VMID_MIN));
        if !taken(candidate) {
            return Ok(candidate);
        }
    }
    Err(RuntimeError::Backend(BackendError::RemoteFailed(format!(
        "could not allocate a free vmid for {id} after {VMID_COLLISION_ATTEMPTS} attempts"
    ))))
}

/// `cores = ceil(cpu.shares / 1024)`, floored at 1: 1024 shares is defined as one core
/// elsewhere in the spec's resource model, so this keeps LXC/VM core counts proportionate to
/// the OCI cpu-shares value instead of requiring a second, backend-specific knob.
pub fn cores_from_shares(shares: Option<u64>) -> u32 {
    let shares = shares.unwrap_or(1024);
    (((shares + 1023) / 1024) as u32).max(1)
}

/// Converts an OCI memory limit (bytes, `None`/`0` meaning unlimited) to whole megabytes,
/// substituting a conservative default when unlimited since both LXC and Proxmox VMs require a
/// concrete value at creation time.
pub fn memory_mb_from_limit(limit: Option<i64>) -> u64 {
    match limit {
        Some(bytes) if bytes > 0 => (bytes as u64 / (1024 * 1024)).max(16),
        _ => 512,
    }
}

#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
/// Parameters for `pct create` / Proxmox LXC creation, derived from a bundle.
pub struct LxcParams {
    hostname: String,
    memory_mb: u64,
    cores: u32,
    rootfs_path: std::path::PathBuf,
    unprivileged: bool,
}

/// Translates a bundle into the parameters an LXC-flavored backend needs to create its
/// container. `Root.readonly`/namespace data is not representable in `pct create`'s flag
/// surface and is intentionally dropped here; the oci-lib path is unaffected since it consumes
/// the bundle directly.
pub fn lxc_params(bundle: &Bundle, id: &str) -> LxcParams {
    let resources = bundle.spec().linux().as_ref().and_then(|l| l.resources().as_ref());
    let memory_mb = memory_mb_from_limit(resources.and_then(|r| r.memory().as_ref()).and_then(|m| *m.limit()));
    let cores = cores_from_shares(resources.and_then(|r| r.cpu().as_ref()).and_then(|c| *c.shares()));
    let unprivileged = bundle
        .spec()
        .linux()
        .as_ref()
        .and_then(|l| l.namespaces().as_ref())
        .map(|ns| ns.iter().any(|n| n.typ() == crate::bundle::spec::LinuxNamespaceType::User))
        .unwrap_or(false);

    LxcParams {
        hostname: bundle.spec().hostname().clone().unwrap_or_else(|| id.to_string()),
        memory_mb,
        cores,
        rootfs_path: bundle.rootfs_path().clone(),
        unprivileged,
    }
}

#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
/// Parameters for a Proxmox VM's creation call, derived from a bundle.
pub struct VmParams {
    name: String,
    memory_mb: u64,
    cores: u32,
}

pub fn vm_params(bundle: &Bundle, id: &str) -> VmParams {
    let resources = bundle.spec().linux().as_ref().and_then(|l| l.resources().as_ref());
    VmParams {
        name: bundle.spec().hostname().clone().unwrap_or_else(|| id.to_string()),
        memory_mb: memory_mb_from_limit(resources.and_then(|r| r.memory().as_ref()).and_then(|m| *m.limit())),
        cores: cores_from_shares(resources.and_then(|r| r.cpu().as_ref()).and_then(|c| *c.shares())),
    }
}

/// Re-emits a bundle's config as a fresh `config.json` under `scratch_dir`, with a `rootfs`
/// symlink back to the original rootfs, so the oci-lib backend always sees a stable, validated
/// document instead of the caller's own (possibly-mutable) bundle directory.
pub fn emit_scratch_bundle(bundle: &Bundle, scratch_dir: &Path) -> Result<PathBuf, RuntimeError> {
    std::fs::create_dir_all(scratch_dir)
        .map_err(|e| RuntimeError::Internal(anyhow::anyhow!("creating scratch bundle dir: {e}")))?;

    bundle
        .spec()
        .save(&scratch_dir.join("config.json"))
        .map_err(RuntimeError::Internal)?;

    let rootfs_link = scratch_dir.join("rootfs");
    if !rootfs_link.exists() {
        #[cfg(unix)]
        std::os::unix::fs::symlink(bundle.rootfs_path(), &rootfs_link)
            .map_err(|e| RuntimeError::Internal(anyhow::anyhow!("linking scratch rootfs: {e}")))?;
    }

    Ok(scratch_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cores_rounds_up() {
        assert_eq!(cores_from_shares(Some(1024)), 1);
        assert_eq!(cores_from_shares(Some(1025)), 2);
        assert_eq!(cores_from_shares(Some(2048)), 2);
        assert_eq!(cores_from_shares(None), 1);
    }

    #[test]
    fn memory_defaults_when_unlimited() {
        assert_eq!(memory_mb_from_limit(None), 512);
        assert_eq!(memory_mb_from_limit(Some(0)), 512);
        assert_eq!(memory_mb_from_limit(Some(256 * 1024 * 1024)), 256);
    }

    #[test]
    fn vmid_retries_past_collisions() {
        let taken = |v: u64| v % 2 == 0;
        let vmid = vmid_for("container-a", taken).unwrap();
        assert!(vmid % 2 != 0);
        assert!(vmid >= VMID_MIN);
    }

    #[test]
    fn vmid_exhaustion_errors() {
        let result = vmid_for("container-b", |_| true);
        assert!(result.is_err());
    }

    #[test]
    fn emit_scratch_bundle_writes_config_and_rootfs_link() {
        let src_dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            src_dir.path().join("config.json"),
            br#"{"ociVersion":"1.0.0"}"#,
        )
        .unwrap();
        std::fs::create_dir(src_dir.path().join("rootfs")).unwrap();
        let bundle = crate::bundle::parse(src_dir.path()).unwrap();

        let scratch = tempfile::TempDir::new().unwrap();
        let scratch_dir = scratch.path().join("c1").join("bundle");
        let result = emit_scratch_bundle(&bundle, &scratch_dir).unwrap();

        assert!(result.join("config.json").is_file());
        assert!(result.join("rootfs").symlink_metadata().unwrap().file_type().is_symlink());
    }
}
