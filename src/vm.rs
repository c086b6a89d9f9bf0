//! Execution handles: the caller-facing unit of script execution.
//!
//! A [`Vm`] is one isolated JavaScript context inside a session's
//! worker process. It is created ready (creation is itself the remote
//! call that establishes worker-side state) and stays usable until
//! [`Vm::destroy`] or session shutdown.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, VmError};
use crate::permissions::PermissionSet;
use crate::session::Session;

/// What happens to `console.*` output produced by scripts in this VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleMode {
    /// Console events are discarded.
    #[default]
    Off,
    /// Console events accumulate in the VM's event queue, retrievable
    /// via [`Vm::drain_events`].
    Redirect,
    /// Console events are written to the host's own stdout/stderr.
    Inherit,
}

/// Options for [`Vm::create`].
#[derive(Debug, Clone, Default)]
pub struct VmOptions {
    /// Code run right after creation, before `create` returns. Useful
    /// to define functions for later [`Vm::call`]s.
    pub bootstrap: Option<String>,
    /// Narrower permission set for this VM's worker. Must be a subset
    /// of the session's set; `None` means no permissions at all.
    pub permissions: Option<PermissionSet>,
    pub console: ConsoleMode,
}

/// One isolated execution context, bound to exactly one [`Session`].
pub struct Vm {
    session: Session,
    /// Worker-assigned handle id; also keys the event queue.
    id: u64,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl Vm {
    /// Creates a new VM inside the session's worker.
    ///
    /// The requested permission set is checked against the session's
    /// before any I/O: a handle may only narrow, never widen. Remote
    /// failures surface as [`VmError::Initialization`].
    pub async fn create(session: &Session, options: VmOptions) -> Result<Vm> {
        if let Some(perms) = &options.permissions {
            perms.validate()?;
            if let Some(reason) = perms.first_escalation(session.permissions()) {
                return Err(VmError::PermissionEscalation(reason));
            }
        }

        let payload = json!({
            "permissions": options.permissions.unwrap_or_default(),
        });
        let result = async {
            session.send("create", payload).await?.wait().await
        };
        let result = result
            .await
            .map_err(|e| VmError::Initialization(format!("create failed: {e}")))?;
        let id = result
            .as_u64()
            .ok_or_else(|| VmError::Initialization(format!("malformed handle id: {result}")))?;

        session.register_events(id, options.console);
        let vm = Vm {
            session: session.clone(),
            id,
            destroyed: AtomicBool::new(false),
        };

        if let Some(code) = options.bootstrap {
            if let Err(e) = vm.run(&code).await {
                vm.destroy().await;
                return Err(VmError::Initialization(format!("bootstrap code failed: {e}")));
            }
        }
        Ok(vm)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Evaluates `code` and returns its value.
    ///
    /// Suspends until the worker responds; concurrent `run`s on other
    /// tasks proceed independently. A throwing script surfaces as
    /// [`VmError::Script`] and leaves the VM usable.
    pub async fn run(&self, code: &str) -> Result<Value> {
        self.ensure_ready()?;
        self.session
            .send("run", json!({"handle": self.id, "code": code}))
            .await?
            .wait()
            .await
    }

    /// Calls a function previously defined in this VM (dotted paths
    /// reach into objects). If the function returns a promise, the
    /// worker defers its response until the promise settles, so this
    /// returns the resolved value — or the rejection as a script error.
    pub async fn call(&self, function_name: &str, args: Vec<Value>) -> Result<Value> {
        self.ensure_ready()?;
        self.session
            .send(
                "call",
                json!({"handle": self.id, "name": function_name, "args": args}),
            )
            .await?
            .wait()
            .await
    }

    /// Removes and returns the events currently queued for this VM
    /// (console output in [`ConsoleMode::Redirect`], plus any other
    /// out-of-band notifications). Each call drains what it returns;
    /// subsequent events start a new batch.
    pub fn drain_events(&self) -> Vec<Value> {
        self.session.drain_events(self.id)
    }

    /// Destroys the VM's worker-side state.
    ///
    /// Safe to call repeatedly, and safe after the session has already
    /// closed: teardown errors are logged and swallowed so they never
    /// mask a caller's own result.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.deregister_events(self.id);
        let result = async {
            self.session
                .send("destroy", json!({"handle": self.id}))
                .await?
                .wait()
                .await
        };
        if let Err(e) = result.await {
            debug!(handle = self.id, "destroy ignored: {e}");
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(VmError::State("execution handle is destroyed".into()));
        }
        Ok(())
    }
}
