//! OCI-Runtime Backend (C3): the default backend, wrapping a dynamically-linked OCI runtime
//! library (e.g. `libcrun`) via FFI, with an automatic fallback to invoking the equivalent CLI
//! (`crun`/`runc`) when the library cannot be loaded. The fallback is chosen transparently at
//! construction time; callers never see which path a given instance uses.

use crate::backend::{Backend, ContainerState, ContainerStats, Features, StateInfo};
use crate::bundle::Bundle;
use crate::error::{BackendError, RuntimeError};
use crate::translate;
use async_trait::async_trait;
use dyn_clone::{clone_trait_object, DynClone};
use libloading::{Library, Symbol};
use log::warn;
use std::{
    ffi::{CStr, CString},
    fmt::Debug,
    os::raw::{c_char, c_int},
    path::{Path, PathBuf},
    process::Output,
    sync::Mutex,
};
use strum::{AsRefStr, Display};
use tokio::process::Command;

/// Caps captured stdout/stderr from a CLI invocation, so a runaway child process cannot exhaust
/// memory of the short-lived invocation process.
const MAX_CAPTURED_OUTPUT: usize = 1024 * 1024;

type ContextHandle = *mut std::ffi::c_void;

/// Raw symbols resolved from the OCI runtime library. Every function follows the convention of
/// returning 0 on success and a negative errno-style code on failure, with the context's last
/// error retrievable via `context_last_error`.
struct LibrarySymbols {
    context_new: unsafe extern "C" fn() -> ContextHandle,
    context_free: unsafe extern "C" fn(ContextHandle),
    context_last_error: unsafe extern "C" fn(ContextHandle) -> *const c_char,
    container_load_from_file: unsafe extern "C" fn(ContextHandle, *const c_char) -> c_int,
    container_create: unsafe extern "C" fn(ContextHandle, *const c_char, *const c_char) -> c_int,
    container_start: unsafe extern "C" fn(ContextHandle, *const c_char) -> c_int,
    container_kill: unsafe extern "C" fn(ContextHandle, *const c_char, c_int) -> c_int,
    container_delete: unsafe extern "C" fn(ContextHandle, *const c_char, c_int) -> c_int,
    container_pause: unsafe extern "C" fn(ContextHandle, *const c_char) -> c_int,
    container_resume: unsafe extern "C" fn(ContextHandle, *const c_char) -> c_int,
    container_state: unsafe extern "C" fn(ContextHandle, *const c_char, *mut c_int, *mut i64) -> c_int,
}

/// Holds the loaded library alongside the symbols resolved from it. The `Library` must outlive
/// every `Symbol` borrowed from it, so the two are kept together and the symbols are
/// transmuted to a `'static` lifetime tied to this struct's own lifetime instead.
struct LoadedLibrary {
    // Kept alive for as long as `symbols` is in use; never read directly again.
    _library: Library,
    symbols: LibrarySymbols,
    context: Mutex<ContextHandle>,
}

impl LoadedLibrary {
    /// # Safety
    /// The caller attests that `path` refers to a library implementing the ABI documented on
    /// [`LibrarySymbols`]. Mismatched signatures are undefined behavior.
    unsafe fn open(path: &Path) -> Result<Self, libloading::Error> {
        let library = Library::new(path)?;
        // Function-pointer symbols are `Copy`; dereferencing out of the borrowed `Symbol` and
        // keeping `library` alongside in this struct is the standard way to use them past the
        // borrow's nominal scope.
        macro_rules! sym {
            ($name:literal) => {{
                let s: Symbol<'_, _> = library.get($name)?;
                *s
            }};
        }
        let symbols = LibrarySymbols {
            context_new: sym!(b"container_context_new\0"),
            context_free: sym!(b"container_context_free\0"),
            context_last_error: sym!(b"container_context_last_error\0"),
            container_load_from_file: sym!(b"container_load_from_file\0"),
            container_create: sym!(b"container_create\0"),
            container_start: sym!(b"container_start\0"),
            container_kill: sym!(b"container_kill\0"),
            container_delete: sym!(b"container_delete\0"),
            container_pause: sym!(b"container_pause\0"),
            container_resume: sym!(b"container_resume\0"),
            container_state: sym!(b"container_state\0"),
        };
        let context = (symbols.context_new)();
        Ok(Self {
            _library: library,
            symbols,
            context: Mutex::new(context),
        })
    }

    fn last_error(&self, ctx: ContextHandle) -> String {
        unsafe {
            let ptr = (self.symbols.context_last_error)(ctx);
            if ptr.is_null() {
                "unknown library error".to_string()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        }
    }

    fn call(&self, op: &str, f: impl FnOnce(ContextHandle) -> c_int) -> Result<(), BackendError> {
        let ctx = self.context.lock().expect("library context mutex poisoned");
        let rc = f(*ctx);
        if rc == 0 {
            Ok(())
        } else {
            Err(BackendError::LibraryError {
                op: op.to_string(),
                message: self.last_error(*ctx),
            })
        }
    }
}

impl Drop for LoadedLibrary {
    fn drop(&mut self) {
        let ctx = self.context.lock().expect("library context mutex poisoned");
        unsafe { (self.symbols.context_free)(*ctx) };
    }
}

fn cstring(s: &str) -> CString {
    CString::new(s).unwrap_or_else(|_| CString::new("").unwrap())
}

/// The CLI subcommands this backend drives when no library is loaded, mirroring the runtime
/// binary's own surface.
#[derive(AsRefStr, Clone, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
enum Subcommand {
    Create,
    Start,
    Kill,
    Delete,
    Pause,
    Resume,
    State,
    List,
    Events,
}

#[async_trait]
trait ExecCommand: Debug + DynClone + Send + Sync {
    async fn run(&self, binary: &Path, args: &[String]) -> anyhow::Result<Output> {
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

/// The C3 backend: either calls into a dynamically-loaded OCI runtime library, or shells out to
/// its CLI equivalent. Which path is active is decided once, at construction.
pub struct OciLibBackend {
    binary: PathBuf,
    root: PathBuf,
    library: Option<LoadedLibrary>,
    exec: Box<dyn ExecCommand>,
}

impl OciLibBackend {
    /// Attempts to load `library_path` (if given); on any failure, logs a warning and falls
    /// back to driving `binary` as a subprocess rooted at `root`.
    pub fn new(library_path: Option<&Path>, binary: PathBuf, root: PathBuf) -> Self {
        let library = library_path.and_then(|path| match unsafe { LoadedLibrary::open(path) } {
            Ok(lib) => Some(lib),
            Err(e) => {
                warn!(
                    "failed to load OCI runtime library at {}: {e}; falling back to CLI",
                    path.display()
                );
                None
            }
        });
        Self {
            binary,
            root,
            library,
            exec: Box::new(DefaultExecCommand),
        }
    }

    fn global_args(&self) -> Vec<String> {
        vec!["--root".to_string(), self.root.display().to_string()]
    }

    async fn run_cli(&self, subcommand: Subcommand, args: &[String]) -> Result<Output, RuntimeError> {
        let mut cmd = self.global_args();
        cmd.push(subcommand.to_string());
        cmd.extend_from_slice(args);
        self.exec
            .run(&self.binary, &cmd)
            .await
            .map_err(|e| RuntimeError::Backend(BackendError::LibraryError {
                op: subcommand.to_string(),
                message: e.to_string(),
            }))
    }

    fn interpret(&self, subcommand: Subcommand, output: Output) -> Result<Output, RuntimeError> {
        match output.status.code() {
            Some(0) => Ok(output),
            Some(127) => Err(RuntimeError::Backend(BackendError::NotInstalled)),
            Some(code) => Err(RuntimeError::Backend(BackendError::CliFailed {
                stderr: truncate(output.stderr),
                exit: code,
            })),
            None => Err(RuntimeError::Backend(BackendError::CliFailed {
                stderr: format!("{subcommand} terminated by signal"),
                exit: -1,
            })),
        }
    }
}

#[async_trait]
impl Backend for OciLibBackend {
    async fn create(&self, bundle: &Bundle, id: &str) -> Result<(), RuntimeError> {
        let scratch_dir = self.root.join(id).join("bundle");
        let scratch_bundle = translate::emit_scratch_bundle(bundle, &scratch_dir)?;

        if let Some(lib) = &self.library {
            let id_c = cstring(id);
            let bundle_c = cstring(&scratch_bundle.display().to_string());
            lib.call("create", |ctx| unsafe {
                (lib.symbols.container_create)(ctx, id_c.as_ptr(), bundle_c.as_ptr())
            })
            .map_err(RuntimeError::Backend)
        } else {
            let args = vec![
                "--bundle".to_string(),
                scratch_bundle.display().to_string(),
                id.to_string(),
            ];
            let output = self.run_cli(Subcommand::Create, &args).await?;
            self.interpret(Subcommand::Create, output).map(|_| ())
        }
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        if let Some(lib) = &self.library {
            let id_c = cstring(id);
            lib.call("start", |ctx| unsafe { (lib.symbols.container_start)(ctx, id_c.as_ptr()) })
                .map_err(RuntimeError::Backend)
        } else {
            let output = self.run_cli(Subcommand::Start, &[id.to_string()]).await?;
            self.interpret(Subcommand::Start, output).map(|_| ())
        }
    }

    async fn kill(&self, id: &str, signal: &str) -> Result<(), RuntimeError> {
        if let Some(lib) = &self.library {
            let id_c = cstring(id);
            let signum = signal_number(signal);
            lib.call("kill", |ctx| unsafe {
                (lib.symbols.container_kill)(ctx, id_c.as_ptr(), signum)
            })
            .map_err(RuntimeError::Backend)
        } else {
            let output = self
                .run_cli(Subcommand::Kill, &[id.to_string(), signal.to_string()])
                .await?;
            self.interpret(Subcommand::Kill, output).map(|_| ())
        }
    }

    async fn delete(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        if let Some(lib) = &self.library {
            let id_c = cstring(id);
            lib.call("delete", |ctx| unsafe {
                (lib.symbols.container_delete)(ctx, id_c.as_ptr(), force as c_int)
            })
            .map_err(RuntimeError::Backend)
        } else {
            let mut args = vec![id.to_string()];
            if force {
                args.push("--force".to_string());
            }
            let output = self.run_cli(Subcommand::Delete, &args).await?;
            self.interpret(Subcommand::Delete, output).map(|_| ())
        }
    }

    async fn pause(&self, id: &str) -> Result<(), RuntimeError> {
        if let Some(lib) = &self.library {
            let id_c = cstring(id);
            lib.call("pause", |ctx| unsafe { (lib.symbols.container_pause)(ctx, id_c.as_ptr()) })
                .map_err(RuntimeError::Backend)
        } else {
            let output = self.run_cli(Subcommand::Pause, &[id.to_string()]).await?;
            self.interpret(Subcommand::Pause, output).map(|_| ())
        }
    }

    async fn resume(&self, id: &str) -> Result<(), RuntimeError> {
        if let Some(lib) = &self.library {
            let id_c = cstring(id);
            lib.call("resume", |ctx| unsafe { (lib.symbols.container_resume)(ctx, id_c.as_ptr()) })
                .map_err(RuntimeError::Backend)
        } else {
            let output = self.run_cli(Subcommand::Resume, &[id.to_string()]).await?;
            self.interpret(Subcommand::Resume, output).map(|_| ())
        }
    }

    async fn state(&self, id: &str) -> Result<StateInfo, RuntimeError> {
        if let Some(lib) = &self.library {
            let id_c = cstring(id);
            let mut status_code: c_int = -1;
            let mut pid: i64 = 0;
            let ctx_guard = lib.context.lock().expect("library context mutex poisoned");
            let rc = unsafe {
                (lib.symbols.container_state)(*ctx_guard, id_c.as_ptr(), &mut status_code, &mut pid)
            };
            if rc != 0 {
                return Err(RuntimeError::Backend(BackendError::LibraryError {
                    op: "state".to_string(),
                    message: lib.last_error(*ctx_guard),
                }));
            }
            Ok(StateInfo {
                status: status_from_code(status_code),
                pid,
            })
        } else {
            let output = self.run_cli(Subcommand::State, &[id.to_string()]).await?;
            let output = self.interpret(Subcommand::State, output)?;
            parse_cli_state(&truncate(output.stdout))
        }
    }

    async fn list(&self) -> Result<Vec<String>, RuntimeError> {
        let output = self
            .run_cli(Subcommand::List, &["--quiet".to_string()])
            .await?;
        let output = self.interpret(Subcommand::List, output)?;
        Ok(truncate(output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
        // The library ABI exposes no stats symbol; go through the CLI's `events --stats`
        // regardless of which path this instance otherwise uses.
        let output = self
            .run_cli(Subcommand::Events, &["--stats".to_string(), id.to_string()])
            .await?;
        let output = self.interpret(Subcommand::Events, output)?;
        parse_cli_stats(&truncate(output.stdout))
    }

    fn features(&self) -> Features {
        Features {
            checkpoint_restore: true,
            hooks: true,
            cgroup_v2: true,
        }
    }
}

fn signal_number(name: &str) -> c_int {
    match name {
        "TERM" => 15,
        "KILL" => 9,
        "HUP" => 1,
        "INT" => 2,
        "USR1" => 10,
        "USR2" => 12,
        _ => 15,
    }
}

fn status_from_code(code: c_int) -> ContainerState {
    match code {
        0 => ContainerState::Creating,
        1 => ContainerState::Created,
        2 => ContainerState::Running,
        3 => ContainerState::Paused,
        4 => ContainerState::Stopped,
        _ => ContainerState::Unknown,
    }
}

fn parse_cli_state(stdout: &str) -> Result<StateInfo, RuntimeError> {
    let value: serde_json::Value = serde_json::from_str(stdout)
        .map_err(|e| RuntimeError::Internal(anyhow::anyhow!("parsing state output: {e}")))?;
    let status = match value.get("status").and_then(|v| v.as_str()).unwrap_or("unknown") {
        "creating" => ContainerState::Creating,
        "created" => ContainerState::Created,
        "running" => ContainerState::Running,
        "paused" => ContainerState::Paused,
        "stopped" => ContainerState::Stopped,
        _ => ContainerState::Unknown,
    };
    let pid = value.get("pid").and_then(|v| v.as_i64()).unwrap_or(0);
    Ok(StateInfo { status, pid })
}

fn parse_cli_stats(stdout: &str) -> Result<ContainerStats, RuntimeError> {
    let value: serde_json::Value = serde_json::from_str(stdout)
        .map_err(|e| RuntimeError::Internal(anyhow::anyhow!("parsing stats output: {e}")))?;
    let data = value.get("data").unwrap_or(&value);
    Ok(ContainerStats {
        cpu_usage_usec: data.pointer("/cpu/usage/total").and_then(|v| v.as_u64()),
        memory_usage_bytes: data.pointer("/memory/usage/usage").and_then(|v| v.as_u64()),
        pids_current: data.pointer("/pids/current").and_then(|v| v.as_u64()),
    })
}
