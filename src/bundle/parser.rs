//! OCI Bundle Parser (C1): reads and validates an OCI runtime bundle
//! (`config.json` + `rootfs/`), yielding a normalized internal bundle spec.

use crate::bundle::spec::{fold_unknown_top_level_keys, Spec};
use crate::error::{BundleError, ValidationError};
use crate::validation;
use getset::Getters;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

/// A validated, canonical view of an OCI bundle. Independent of the source document's key
/// ordering: constructing two `Bundle`s from a semantically-equal `config.json` yields equal
/// values.
#[derive(Debug, Clone, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct Bundle {
    /// Absolute, canonicalized path to the bundle directory.
    bundle_path: PathBuf,
    /// Absolute, canonicalized path to the resolved rootfs.
    rootfs_path: PathBuf,
    /// The parsed and validated OCI runtime spec.
    spec: Spec,
    /// Annotations, including any unknown top-level keys folded in by the parser.
    annotations: HashMap<String, String>,
}

/// Parses and validates the bundle rooted at `bundle_path`.
pub fn parse(bundle_path: &Path) -> Result<Bundle, BundleError> {
    let bundle_path = fs::canonicalize(bundle_path)
        .map_err(|_| BundleError::NotFound(bundle_path.to_path_buf()))?;

    if !bundle_path.is_dir() {
        return Err(BundleError::NotFound(bundle_path));
    }

    let config_path = bundle_path.join("config.json");
    let canonical_config = fs::canonicalize(&config_path)
        .map_err(|_| BundleError::ConfigMissing(bundle_path.clone()))?;
    if !canonical_config.starts_with(&bundle_path) {
        return Err(BundleError::ConfigMissing(bundle_path));
    }

    let raw = fs::read_to_string(&canonical_config)
        .map_err(|e| BundleError::ConfigMalformed(e.to_string()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| BundleError::ConfigMalformed(e.to_string()))?;
    let mut spec: Spec = serde_json::from_value(value.clone())
        .map_err(|e| BundleError::ConfigMalformed(e.to_string()))?;
    fold_unknown_top_level_keys(&mut spec, &value);

    if !is_supported_version(spec.version()) {
        return Err(BundleError::UnsupportedSpecVersion(spec.version().clone()));
    }

    validate_numeric_ranges(&spec).map_err(|e| BundleError::ValidationFailed(e.reason))?;
    validate_spec_contracts(&spec, &bundle_path).map_err(|e| BundleError::ValidationFailed(e.reason))?;

    let root = spec
        .root()
        .as_ref()
        .ok_or_else(|| BundleError::ValidationFailed("root is required".into()))?;

    let rootfs_path = if root.path().is_absolute() {
        root.path().clone()
    } else {
        bundle_path.join(root.path())
    };

    let rootfs_path = fs::canonicalize(&rootfs_path)
        .map_err(|_| BundleError::RootfsMissing(rootfs_path.clone()))?;

    if !rootfs_path.is_dir() {
        return Err(BundleError::RootfsMissing(rootfs_path));
    }

    if !rootfs_path.starts_with(&bundle_path) {
        return Err(BundleError::ValidationFailed(format!(
            "root.path {} escapes bundle directory {}",
            rootfs_path.display(),
            bundle_path.display()
        )));
    }

    let annotations = spec.annotations().clone().unwrap_or_default();

    Ok(Bundle {
        bundle_path,
        rootfs_path,
        spec,
        annotations,
    })
}

fn is_supported_version(version: &str) -> bool {
    version
        .split('.')
        .next()
        .and_then(|major| major.parse::<u32>().ok())
        .map(|major| major >= 1)
        .unwrap_or(false)
}

fn validate_numeric_ranges(spec: &Spec) -> Result<(), ValidationError> {
    let resources = match spec.linux().as_ref().and_then(|l| l.resources().as_ref()) {
        Some(r) => r,
        None => return Ok(()),
    };

    if let Some(memory) = resources.memory() {
        if let Some(limit) = memory.limit() {
            validation::validate_memory(*limit)
                .map_err(|e| ValidationError::new("linux.resources.memory.limit", e.reason))?;
        }
    }

    if let Some(cpu) = resources.cpu() {
        if let Some(shares) = cpu.shares() {
            validation::validate_cpu_shares(*shares)
                .map_err(|e| ValidationError::new("linux.resources.cpu.shares", e.reason))?;
        }
    }

    if let Some(pids) = resources.pids() {
        validation::validate_pids(pids.limit())
            .map_err(|e| ValidationError::new("linux.resources.pids.limit", e.reason))?;
    }

    Ok(())
}

/// Validates the capability strings and rootfs/mount paths named in an already
/// version-and-range-checked spec, ahead of handing the bundle to a backend.
fn validate_spec_contracts(spec: &Spec, bundle_path: &Path) -> Result<(), ValidationError> {
    if let Some(caps) = spec.process().as_ref().and_then(|p| p.capabilities().as_ref()) {
        let sets = [
            caps.bounding(),
            caps.effective(),
            caps.inheritable(),
            caps.permitted(),
            caps.ambient(),
        ];
        for set in sets.into_iter().flatten() {
            for cap in set {
                validation::validate_capability(cap)
                    .map_err(|e| ValidationError::new("process.capabilities", e.reason))?;
            }
        }
    }

    if let Some(mounts) = spec.mounts() {
        for mount in mounts {
            if let Some(source) = mount.source() {
                if source.is_relative() {
                    validation::validate_contained_path(source, bundle_path)
                        .map_err(|e| ValidationError::new("mounts[].source", e.reason))?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_bundle(config: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.json"), config).unwrap();
        fs::create_dir(dir.path().join("rootfs")).unwrap();
        dir
    }

    fn minimal_config() -> String {
        r#"{
            "ociVersion": "1.0.0",
            "process": {"user": {"uid": 0, "gid": 0}, "cwd": "/"},
            "root": {"path": "rootfs"}
        }"#
        .to_string()
    }

    #[test]
    fn parses_minimal_bundle() {
        let dir = write_bundle(&minimal_config());
        let bundle = parse(dir.path()).expect("bundle should parse");
        assert_eq!(bundle.spec().version(), "1.0.0");
        assert!(bundle.rootfs_path().ends_with("rootfs"));
    }

    #[test]
    fn rejects_missing_bundle_dir() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(matches!(parse(&missing), Err(BundleError::NotFound(_))));
    }

    #[test]
    fn rejects_missing_config() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("rootfs")).unwrap();
        assert!(matches!(
            parse(dir.path()),
            Err(BundleError::ConfigMissing(_))
        ));
    }

    #[test]
    fn rejects_old_spec_version() {
        let dir = write_bundle(
            r#"{
                "ociVersion": "0.9.0",
                "process": {"user": {"uid": 0, "gid": 0}, "cwd": "/"},
                "root": {"path": "rootfs"}
            }"#,
        );
        assert!(matches!(
            parse(dir.path()),
            Err(BundleError::UnsupportedSpecVersion(_))
        ));
    }

    #[test]
    fn rejects_cpu_shares_out_of_range() {
        let dir = write_bundle(
            r#"{
                "ociVersion": "1.0.0",
                "process": {"user": {"uid": 0, "gid": 0}, "cwd": "/"},
                "root": {"path": "rootfs"},
                "linux": {"resources": {"cpu": {"shares": 1}}}
            }"#,
        );
        assert!(matches!(
            parse(dir.path()),
            Err(BundleError::ValidationFailed(_))
        ));
    }

    #[test]
    fn accepts_cpu_shares_at_extremes() {
        for shares in [2, 262_144] {
            let dir = write_bundle(&format!(
                r#"{{
                    "ociVersion": "1.0.0",
                    "process": {{"user": {{"uid": 0, "gid": 0}}, "cwd": "/"}},
                    "root": {{"path": "rootfs"}},
                    "linux": {{"resources": {{"cpu": {{"shares": {shares}}}}}}}
                }}"#
            ));
            assert!(parse(dir.path()).is_ok(), "shares={shares} should be accepted");
        }
    }

    #[test]
    fn rejects_root_path_escaping_bundle() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{
                "ociVersion": "1.0.0",
                "process": {"user": {"uid": 0, "gid": 0}, "cwd": "/"},
                "root": {"path": "/etc"}
            }"#,
        )
        .unwrap();

        let err = parse(dir.path()).unwrap_err();
        assert!(matches!(err, BundleError::ValidationFailed(_)));
    }

    #[test]
    fn preserves_unknown_top_level_keys_as_annotations() {
        let dir = write_bundle(
            r#"{
                "ociVersion": "1.0.0",
                "process": {"user": {"uid": 0, "gid": 0}, "cwd": "/"},
                "root": {"path": "rootfs"},
                "com.example/custom": "value"
            }"#,
        );
        let bundle = parse(dir.path()).unwrap();
        assert_eq!(
            bundle.annotations().get("com.example/custom"),
            Some(&"value".to_string())
        );
    }

    #[test]
    fn rejects_unknown_capability() {
        let dir = write_bundle(
            r#"{
                "ociVersion": "1.0.0",
                "process": {
                    "user": {"uid": 0, "gid": 0},
                    "cwd": "/",
                    "capabilities": {"bounding": ["CAP_NOT_REAL"]}
                },
                "root": {"path": "rootfs"}
            }"#,
        );
        assert!(matches!(
            parse(dir.path()),
            Err(BundleError::ValidationFailed(_))
        ));
    }

    #[test]
    fn accepts_known_capability() {
        let dir = write_bundle(
            r#"{
                "ociVersion": "1.0.0",
                "process": {
                    "user": {"uid": 0, "gid": 0},
                    "cwd": "/",
                    "capabilities": {"bounding": ["CAP_SYS_ADMIN"]}
                },
                "root": {"path": "rootfs"}
            }"#,
        );
        assert!(parse(dir.path()).is_ok());
    }

    #[test]
    fn rejects_mount_source_escaping_bundle() {
        let dir = write_bundle(
            r#"{
                "ociVersion": "1.0.0",
                "process": {"user": {"uid": 0, "gid": 0}, "cwd": "/"},
                "root": {"path": "rootfs"},
                "mounts": [{"destination": "/data", "source": "../../etc"}]
            }"#,
        );
        assert!(matches!(
            parse(dir.path()),
            Err(BundleError::ValidationFailed(_))
        ));
    }
}
