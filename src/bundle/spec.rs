//! OCI runtime spec (config.json), trimmed to the Linux-only surface this
//! runtime dispatches to library, LXC and Proxmox VM backends.

use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
};

#[derive(PartialEq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Spec is the base configuration for the container.
pub struct Spec {
    #[getset(get = "pub")]
    #[serde(rename = "ociVersion")]
    /// Version of the Open Container Initiative Runtime Specification with which the bundle
    /// complies.
    version: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Process configures the container process.
    process: Option<Process>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Root configures the container's root filesystem.
    root: Option<Root>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Hostname configures the container's hostname.
    hostname: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Mounts configures additional mounts (on top of Root).
    mounts: Option<Vec<Mount>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Hooks configures callbacks for container lifecycle events.
    hooks: Option<Hooks>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Annotations contains arbitrary metadata for the container. Unknown top-level keys found
    /// in the source document are folded into this map by the parser so nothing is dropped.
    annotations: Option<HashMap<String, String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Linux is platform-specific configuration for Linux based containers.
    linux: Option<Linux>,
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            version: "1.0.0".into(),
            process: None,
            root: None,
            hostname: None,
            mounts: None,
            hooks: None,
            annotations: None,
            linux: None,
        }
    }
}

/// Top-level `config.json` keys this runtime understands; anything else found alongside them
/// is folded into `annotations` instead of being silently dropped.
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "ociVersion",
    "process",
    "root",
    "hostname",
    "mounts",
    "hooks",
    "annotations",
    "linux",
];

/// Folds any top-level JSON object key not in [`KNOWN_TOP_LEVEL_KEYS`] into `spec`'s
/// annotations, so producers that stash vendor metadata at the document root don't lose it. A
/// key that collides with a declared annotation is not overwritten.
pub(crate) fn fold_unknown_top_level_keys(spec: &mut Spec, value: &Value) {
    let Value::Object(map) = value else { return };

    let extra: HashMap<String, String> = map
        .iter()
        .filter(|(key, _)| !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()))
        .map(|(key, val)| {
            let rendered = match val {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect();

    if extra.is_empty() {
        return;
    }

    let annotations = spec.annotations.get_or_insert_with(HashMap::new);
    for (key, val) in extra {
        annotations.entry(key).or_insert(val);
    }
}

impl Spec {
    /// Load a new spec from the provided file `Path`.
    pub fn from(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open file {}", path.display()))?;
        let value: Value = serde_json::from_reader(file)
            .with_context(|| format!("parse JSON from file {}", path.display()))?;
        let mut spec: Spec = serde_json::from_value(value.clone())
            .with_context(|| format!("deserialize OCI spec from file {}", path.display()))?;
        fold_unknown_top_level_keys(&mut spec, &value);
        Ok(spec)
    }

    /// Save the loaded spec into the provided file `Path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file =
            File::create(path).with_context(|| format!("create file {}", path.display()))?;
        serde_json::to_writer(&mut file, self)
            .with_context(|| format!("serialize OCI spec to file {}", path.display()))
    }
}

#[derive(PartialEq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Process contains information to start a specific application inside the container.
pub struct Process {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Terminal creates an interactive terminal for the container.
    terminal: Option<bool>,

    /// User specifies user information for the process.
    #[getset(get = "pub")]
    user: User,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Args specifies the binary and arguments for the application to execute.
    args: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Env populates the process environment for the process.
    env: Option<Vec<String>>,

    #[getset(get = "pub")]
    /// Cwd is the current working directory for the process and must be relative to the
    /// container's root.
    cwd: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Capabilities are Linux capabilities that are kept for the process.
    capabilities: Option<LinuxCapabilities>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Rlimits specifies rlimit options to apply to the process.
    rlimits: Option<Vec<POSIXRlimit>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "noNewPrivileges"
    )]
    /// NoNewPrivileges controls whether additional privileges could be gained by processes in
    /// the container.
    no_new_privileges: Option<bool>,
}

#[derive(PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxCapabilities specifies the list of allowed capabilities that are kept for a process.
/// http://man7.org/linux/man-pages/man7/capabilities.7.html
pub struct LinuxCapabilities {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Bounding is the set of capabilities checked by the kernel.
    bounding: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Effective is the set of capabilities checked by the kernel.
    effective: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Inheritable is the capabilities preserved across execve.
    inheritable: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Permitted is the limiting superset for effective capabilities.
    permitted: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Ambient is the ambient set of capabilities that are kept.
    ambient: Option<Vec<String>>,
}

/// User specifies specific user (and group) information for the container process.
#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
pub struct User {
    #[getset(get_copy = "pub")]
    /// UID is the user id.
    uid: u32,

    #[getset(get_copy = "pub")]
    /// GID is the group id.
    gid: u32,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "additionalGids"
    )]
    /// AdditionalGids are additional group ids set for the container's process.
    additional_gids: Option<Vec<u32>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Root contains information about the container's root filesystem on the host.
pub struct Root {
    #[getset(get = "pub")]
    /// Path is the path to the container's root filesystem, relative to the bundle unless
    /// already absolute.
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Readonly makes the root filesystem for the container readonly before the process is
    /// executed.
    readonly: Option<bool>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Mount specifies a mount for a container.
pub struct Mount {
    #[getset(get = "pub")]
    /// Destination is the absolute path where the mount will be placed in the container.
    destination: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    /// Type specifies the mount kind.
    typ: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Source specifies the source path of the mount.
    source: Option<PathBuf>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Options are fstab style mount options.
    options: Option<Vec<String>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Hook specifies a command that is run at a particular event in the lifecycle of a container.
pub struct Hook {
    #[getset(get = "pub")]
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    env: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<i64>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Hooks specifies commands run at particular events in the lifecycle of a container.
pub struct Hooks {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Prestart is a list of hooks to be run before the container process is executed.
    prestart: Option<Vec<Hook>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Poststart is a list of hooks to be run after the container process is started.
    poststart: Option<Vec<Hook>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Poststop is a list of hooks to be run after the container process exits.
    poststop: Option<Vec<Hook>>,
}

#[derive(PartialEq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Linux contains platform-specific configuration for Linux based containers.
pub struct Linux {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Sysctl are a set of key value pairs that are set for the container on start.
    sysctl: Option<HashMap<String, String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Resources contain cgroup information for handling resource constraints for the container.
    resources: Option<LinuxResources>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "cgroupsPath"
    )]
    /// CgroupsPath specifies the path to cgroups that are created and/or joined by the container.
    cgroups_path: Option<PathBuf>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Namespaces contains the namespaces that are created and/or joined by the container.
    namespaces: Option<Vec<LinuxNamespace>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Capabilities is kept here too for parity with config.json producers that place the
    /// capability set at `linux.capabilities` rather than `process.capabilities`.
    capabilities: Option<LinuxCapabilities>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Seccomp is passed opaquely to backends that support it (oci-lib only); this runtime
    /// never interprets its contents.
    seccomp: Option<Value>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// LinuxNamespace is the configuration for a Linux namespace.
pub struct LinuxNamespace {
    #[getset(get_copy = "pub")]
    #[serde(rename = "type")]
    /// Type is the type of namespace.
    typ: LinuxNamespaceType,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Path is a path to an existing namespace persisted on disk that can be joined.
    path: Option<PathBuf>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone, Copy)]
pub enum LinuxNamespaceType {
    #[serde(rename = "pid")]
    /// For isolating process IDs.
    Pid,

    #[serde(rename = "network")]
    /// For isolating network devices, stacks, ports, etc..
    Network,

    #[serde(rename = "mount")]
    /// For isolating mount points.
    Mount,

    #[serde(rename = "ipc")]
    /// For isolating System V IPC, POSIX message queues.
    Ipc,

    #[serde(rename = "uts")]
    /// For isolating hostname and NIS domain name.
    Uts,

    #[serde(rename = "user")]
    /// For isolating user and group IDs.
    User,

    #[serde(rename = "cgroup")]
    /// For isolating cgroup hierarchies.
    Cgroup,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// POSIXRlimit type and restrictions.
pub struct POSIXRlimit {
    #[getset(get = "pub")]
    #[serde(rename = "type")]
    /// Type of the rlimit to set.
    typ: String,

    #[getset(get_copy = "pub")]
    /// Hard is the hard limit for the specified type.
    hard: u64,

    #[getset(get_copy = "pub")]
    /// Soft is the soft limit for the specified type.
    soft: u64,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxMemory for Linux cgroup 'memory' resource management.
pub struct LinuxMemory {
    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Memory limit (in bytes). Zero means "unlimited".
    limit: Option<i64>,

    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Total memory limit (memory + swap).
    swap: Option<i64>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxCPU for Linux cgroup 'cpu' resource management.
pub struct LinuxCPU {
    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CPU shares (relative weight (ratio) vs. other cgroups with cpu shares). 1024 = 1 core.
    shares: Option<u64>,

    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CPU hardcap limit (in usecs). Allowed cpu time in a given period.
    quota: Option<i64>,

    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CPU period to be used for hardcapping (in usecs).
    period: Option<u64>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// LinuxPids for Linux cgroup 'pids' resource management.
pub struct LinuxPids {
    #[getset(get_copy = "pub")]
    /// Maximum number of PIDs. Default is "no limit".
    limit: i64,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxBlockIO for Linux cgroup 'blkio' resource management.
pub struct LinuxBlockIO {
    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Specifies per cgroup weight.
    weight: Option<u16>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxResources has container runtime resource constraints.
pub struct LinuxResources {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Memory restriction configuration.
    memory: Option<LinuxMemory>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// CPU resource restriction configuration.
    cpu: Option<LinuxCPU>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Task resource restriction configuration.
    pids: Option<LinuxPids>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "blockIO")]
    /// BlockIO restriction configuration.
    block_io: Option<LinuxBlockIO>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Write};
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn build_spec() -> Result<()> {
        let version = "1.0.0";
        let hostname = "some-hostname";
        let cgroups_path = "/some/path";

        let spec = SpecBuilder::default()
            .version(version)
            .hostname(hostname)
            .linux(LinuxBuilder::default().cgroups_path(cgroups_path).build()?)
            .build()?;

        assert_eq!(spec.version(), version);
        assert_eq!(
            spec.hostname().as_ref().context("hostname is none")?,
            hostname
        );
        assert_eq!(
            spec.linux()
                .as_ref()
                .context("linux is none")?
                .cgroups_path()
                .as_ref()
                .context("cgroups path is none")?
                .to_str()
                .context("path is not displayable")?,
            cgroups_path
        );

        Ok(())
    }

    #[test]
    fn save_success() -> Result<()> {
        let spec = Spec::default();
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("spec.json");

        spec.save(&file)?;

        let content = fs::read_to_string(&file)?;
        assert!(content.contains("ociVersion"));
        Ok(())
    }

    #[test]
    fn from_file_success() -> Result<()> {
        let temp_file = NamedTempFile::new()?;

        temp_file
            .as_file()
            .write_all(br#"{"ociVersion": "1.0.0"}"#)?;

        let spec = Spec::from(temp_file.path())?;
        assert_eq!(spec.version(), "1.0.0");
        Ok(())
    }

    #[test]
    fn from_file_fail_not_exist() -> Result<()> {
        let path = PathBuf::from("should/not/exist");
        assert!(Spec::from(&path).is_err());
        Ok(())
    }

    #[test]
    fn from_file_fail_deserialize() -> Result<()> {
        let temp_file = NamedTempFile::new()?;

        temp_file.as_file().write_all(b"wrong")?;

        assert!(Spec::from(temp_file.path()).is_err());
        Ok(())
    }

    #[test]
    fn unknown_top_level_keys_fold_into_annotations() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        temp_file.as_file().write_all(
            br#"{"ociVersion": "1.0.0", "com.example.vendor": "acme", "com.example.build": 42}"#,
        )?;

        let spec = Spec::from(temp_file.path())?;
        let annotations = spec.annotations().as_ref().context("annotations")?;
        assert_eq!(annotations.get("com.example.vendor"), Some(&"acme".to_string()));
        assert_eq!(annotations.get("com.example.build"), Some(&"42".to_string()));
        Ok(())
    }

    #[test]
    fn unknown_top_level_keys_do_not_override_declared_annotations() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        temp_file.as_file().write_all(
            br#"{"ociVersion": "1.0.0", "annotations": {"a": "b"}, "stray": "ignored-if-conflicting"}"#,
        )?;

        let spec = Spec::from(temp_file.path())?;
        let annotations = spec.annotations().as_ref().context("annotations")?;
        assert_eq!(annotations.get("a"), Some(&"b".to_string()));
        assert_eq!(annotations.get("stray"), Some(&"ignored-if-conflicting".to_string()));
        Ok(())
    }
}
