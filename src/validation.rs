//! Validation Layer (C9): path, identifier, signal and capability-string validators guarding
//! every external input before backend dispatch.

use crate::capability::Capability;
use crate::error::ValidationError;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::str::FromStr;

lazy_static! {
    static ref CONTAINER_ID_RE: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,252}$").unwrap();
}

/// Symbolic signal names accepted by `kill`. Numeric signals are rejected outright so the
/// operator sees which symbolic name to use instead of a silent translation.
pub const ALLOWED_SIGNALS: &[&str] = &["TERM", "KILL", "HUP", "INT", "USR1", "USR2"];

/// Validates a container identifier against the id grammar in the data model.
pub fn validate_container_id(id: &str) -> Result<(), ValidationError> {
    if id.len() > 253 {
        return Err(ValidationError::new(
            "id",
            format!("length {} exceeds maximum of 253", id.len()),
        ));
    }
    if !CONTAINER_ID_RE.is_match(id) {
        return Err(ValidationError::new(
            "id",
            "must match ^[A-Za-z0-9][A-Za-z0-9._-]{0,252}$",
        ));
    }
    Ok(())
}

/// Validates that `path`, once canonicalized, remains within `allowed_root` and contains no NUL
/// bytes. `allowed_root` need not exist; only its lexical prefix is checked against the
/// canonicalized candidate when the candidate exists, otherwise a lexical containment check is
/// used.
pub fn validate_contained_path(path: &Path, allowed_root: &Path) -> Result<PathBuf, ValidationError> {
    let path_str = path.to_string_lossy();
    if path_str.contains('\0') {
        return Err(ValidationError::new("path", "must not contain NUL"));
    }

    let resolved = if path.exists() {
        std::fs::canonicalize(path).map_err(|e| ValidationError::new("path", e.to_string()))?
    } else if path.is_absolute() {
        path.to_path_buf()
    } else {
        allowed_root.join(path)
    };

    let root = if allowed_root.exists() {
        std::fs::canonicalize(allowed_root)
            .map_err(|e| ValidationError::new("path", e.to_string()))?
    } else {
        allowed_root.to_path_buf()
    };

    if !resolved.starts_with(&root) {
        return Err(ValidationError::new(
            "path",
            format!(
                "{} escapes allowed root {}",
                resolved.display(),
                root.display()
            ),
        ));
    }

    Ok(resolved)
}

/// Validates a signal name against the symbolic whitelist. Rejects numeric signals explicitly.
pub fn validate_signal_name(signal: &str) -> Result<String, ValidationError> {
    if signal.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::new(
            "signal",
            format!(
                "numeric signals are rejected; use one of {}",
                ALLOWED_SIGNALS.join(", ")
            ),
        ));
    }

    let upper = signal.trim_start_matches("SIG").to_uppercase();
    if !ALLOWED_SIGNALS.contains(&upper.as_str()) {
        return Err(ValidationError::new(
            "signal",
            format!(
                "{} is not one of the allowed signals: {}",
                signal,
                ALLOWED_SIGNALS.join(", ")
            ),
        ));
    }
    Ok(upper)
}

/// Validates a capability string. Accepts an optional `CAP_` prefix, case-insensitively for the
/// prefix only; the capability name itself must be a known capability.
pub fn validate_capability(cap: &str) -> Result<Capability, ValidationError> {
    let upper = cap.to_uppercase();
    let canonical = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    };

    Capability::from_str(&canonical)
        .map_err(|_| ValidationError::new("capability", format!("unknown capability {cap}")))
}

/// Validates memory limit in bytes (`>= 0`).
pub fn validate_memory(limit: i64) -> Result<(), ValidationError> {
    if limit < 0 {
        return Err(ValidationError::new("memory", "must be >= 0"));
    }
    Ok(())
}

/// Validates cpu.shares (`[2, 262144]`).
pub fn validate_cpu_shares(shares: u64) -> Result<(), ValidationError> {
    if !(2..=262_144).contains(&shares) {
        return Err(ValidationError::new("cpu.shares", "must be in [2, 262144]"));
    }
    Ok(())
}

/// Validates a pids limit (`>= 0`).
pub fn validate_pids(limit: i64) -> Result<(), ValidationError> {
    if limit < 0 {
        return Err(ValidationError::new("pids", "must be >= 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_length_boundary() {
        assert!(validate_container_id(&"a".repeat(253)).is_ok());
        assert!(validate_container_id(&"a".repeat(254)).is_err());
    }

    #[test]
    fn container_id_rejects_leading_dot() {
        assert!(validate_container_id(".hidden").is_err());
    }

    #[test]
    fn container_id_rejects_path_separator() {
        assert!(validate_container_id("a/b").is_err());
    }

    #[test]
    fn signal_whitelist() {
        assert!(validate_signal_name("KILL").is_ok());
        assert!(validate_signal_name("SIGKILL").is_ok());
        assert!(validate_signal_name("9").is_err());
        assert!(validate_signal_name("BOGUS").is_err());
    }

    #[test]
    fn capability_accepts_optional_prefix() {
        assert_eq!(
            validate_capability("CAP_SYS_ADMIN").unwrap(),
            validate_capability("SYS_ADMIN").unwrap()
        );
    }

    #[test]
    fn capability_rejects_unknown() {
        assert!(validate_capability("NOT_REAL").is_err());
    }

    #[test]
    fn cpu_shares_extremes() {
        assert!(validate_cpu_shares(2).is_ok());
        assert!(validate_cpu_shares(262_144).is_ok());
        assert!(validate_cpu_shares(1).is_err());
        assert!(validate_cpu_shares(262_145).is_err());
    }

    #[test]
    fn path_traversal_rejected() {
        let root = std::env::temp_dir();
        let escaping = PathBuf::from("/etc/passwd");
        assert!(validate_contained_path(&escaping, &root).is_err());
    }
}
