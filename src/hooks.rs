//! Lifecycle hook execution: runs the `prestart`/`poststart`/`poststop` commands a bundle's
//! `config.json` declares, shared by every backend that advertises `hooks: true` in its
//! [`crate::backend::Features`].

use crate::bundle::spec::Hook;
use crate::error::{BackendError, RuntimeError};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs each hook in `hooks` in order, failing on the first non-zero exit, timeout, or spawn
/// error. An absent hook list is a no-op.
pub async fn run(hooks: Option<&Vec<Hook>>) -> Result<(), RuntimeError> {
    let Some(hooks) = hooks else { return Ok(()) };

    for hook in hooks {
        run_one(hook).await?;
    }
    Ok(())
}

async fn run_one(hook: &Hook) -> Result<(), RuntimeError> {
    let mut cmd = Command::new(hook.path());
    if let Some(args) = hook.args() {
        cmd.args(args.iter().skip(1));
    }
    if let Some(env) = hook.env() {
        cmd.env_clear();
        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
    }
    cmd.kill_on_drop(true);

    let hook_timeout = hook
        .timeout()
        .map(|secs| Duration::from_secs(secs.max(0) as u64))
        .unwrap_or(DEFAULT_HOOK_TIMEOUT);

    let path = hook.path().display().to_string();
    let output = timeout(hook_timeout, cmd.output())
        .await
        .map_err(|_| {
            RuntimeError::Backend(BackendError::HookFailed {
                path: path.clone(),
                reason: "timed out".to_string(),
            })
        })?
        .map_err(|e| {
            RuntimeError::Backend(BackendError::HookFailed {
                path: path.clone(),
                reason: e.to_string(),
            })
        })?;

    if !output.status.success() {
        return Err(RuntimeError::Backend(BackendError::HookFailed {
            path,
            reason: format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr)
            ),
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::spec::HookBuilder;

    #[tokio::test]
    async fn empty_hook_list_is_a_no_op() {
        assert!(run(None).await.is_ok());
    }

    #[tokio::test]
    async fn successful_hook_runs_to_completion() {
        let hook = HookBuilder::default()
            .path("/bin/true")
            .build()
            .unwrap();
        assert!(run(Some(&vec![hook])).await.is_ok());
    }

    #[tokio::test]
    async fn failing_hook_surfaces_as_hook_failed() {
        let hook = HookBuilder::default()
            .path("/bin/false")
            .build()
            .unwrap();
        assert!(matches!(
            run(Some(&vec![hook])).await,
            Err(RuntimeError::Backend(BackendError::HookFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn missing_binary_surfaces_as_hook_failed() {
        let hook = HookBuilder::default()
            .path("/nonexistent/binary-that-should-not-exist")
            .build()
            .unwrap();
        assert!(matches!(
            run(Some(&vec![hook])).await,
            Err(RuntimeError::Backend(BackendError::HookFailed { .. }))
        ));
    }
}
