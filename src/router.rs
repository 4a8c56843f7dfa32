//! Runtime Router (C7): decides which backend handles a given invocation.
//!
//! Precedence: an explicit `--runtime` flag normalizes to a [`crate::state::BackendTag`] and
//! wins outright; failing that, the configured default runtime applies; failing that, an
//! id-prefix heuristic (`lxc-*`, `vm-*`) is consulted; failing that, oci-lib is the baseline.
//! Once a container is created the choice is recorded in its [`crate::state::Record`] and is
//! sticky for the container's lifetime regardless of any `--runtime` flag on later commands.

use crate::state::BackendTag;

/// Normalizes a user-supplied `--runtime` value (or config `default_runtime`) to a backend tag.
/// Returns `None` for a value this runtime does not recognize, so callers can fall through to
/// the next precedence tier instead of erroring outright.
pub fn normalize_runtime_name(name: &str) -> Option<BackendTag> {
    match name {
        "crun" | "runc" | "oci" | "oci-lib" => Some(BackendTag::OciLib),
        "lxc" | "proxmox-lxc" => Some(BackendTag::Lxc),
        "vm" | "proxmox-vm" | "qemu" => Some(BackendTag::Vm),
        _ => None,
    }
}

/// Guesses a backend from a container id's prefix, for callers that never pass `--runtime`.
fn tag_from_id_prefix(id: &str) -> Option<BackendTag> {
    if id.starts_with("lxc-") || id.starts_with("db-") {
        Some(BackendTag::Lxc)
    } else if id.starts_with("vm-") {
        Some(BackendTag::Vm)
    } else {
        None
    }
}

/// Resolves which backend a *new* container should be created against. Existing containers
/// instead look up their recorded [`BackendTag`] directly and never call this.
pub fn resolve_for_create(
    explicit_runtime: Option<&str>,
    default_runtime: Option<&str>,
    id: &str,
) -> BackendTag {
    explicit_runtime
        .and_then(normalize_runtime_name)
        .or_else(|| default_runtime.and_then(normalize_runtime_name))
        .or_else(|| tag_from_id_prefix(id))
        .unwrap_or(BackendTag::OciLib)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_runtime_wins_over_everything() {
        assert_eq!(
            resolve_for_create(Some("lxc"), Some("vm"), "vm-foo"),
            BackendTag::Lxc
        );
    }

    #[test]
    fn default_runtime_wins_over_id_prefix() {
        assert_eq!(resolve_for_create(None, Some("vm"), "lxc-foo"), BackendTag::Vm);
    }

    #[test]
    fn id_prefix_used_as_last_resort() {
        assert_eq!(resolve_for_create(None, None, "lxc-foo"), BackendTag::Lxc);
        assert_eq!(resolve_for_create(None, None, "db-foo"), BackendTag::Lxc);
        assert_eq!(resolve_for_create(None, None, "vm-foo"), BackendTag::Vm);
    }

    #[test]
    fn falls_back_to_oci_lib() {
        assert_eq!(resolve_for_create(None, None, "my-container"), BackendTag::OciLib);
    }

    #[test]
    fn unrecognized_explicit_runtime_falls_through() {
        assert_eq!(
            resolve_for_create(Some("bogus"), None, "lxc-foo"),
            BackendTag::Lxc
        );
    }
}
