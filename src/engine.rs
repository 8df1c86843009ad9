//! One-time asynchronous bootstrap of the patch engine.
//!
//! The engine is expensive to prove ready (its bootstrap round-trips a probe
//! workbook through the whole container toolchain), so a provisioner
//! coalesces concurrent callers onto a single in-flight bootstrap and shares
//! the resulting engine for the rest of the process lifetime. The bootstrap
//! runs on a spawned task: a caller that abandons its invocation leaves the
//! initialization running for the next caller.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use futures::future::{BoxFuture, FutureExt, Shared};
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::column::LabelOptions;
use crate::editor::{verify_container, CellValue, WorkbookEditor};
use crate::minimal::{minimal_workbook, SheetSpec};
use crate::{PatchError, Result};

/// Upper bound on one bootstrap attempt.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Ready-to-use workbook patch engine, shared process-wide once bootstrapped.
#[derive(Debug)]
pub struct PatchEngine {
    pub(crate) labels: LabelOptions,
}

impl PatchEngine {
    pub fn new() -> Self {
        Self {
            labels: LabelOptions::default(),
        }
    }

    pub fn with_label_options(labels: LabelOptions) -> Self {
        Self { labels }
    }
}

impl Default for PatchEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Constructor the provisioner runs exactly once per successful bootstrap.
pub type BootstrapFn =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<PatchEngine>> + Send + Sync>;

type SharedBootstrap = Shared<BoxFuture<'static, std::result::Result<Arc<PatchEngine>, String>>>;

enum State {
    Uninitialized,
    Initializing(SharedBootstrap),
    Ready(Arc<PatchEngine>),
}

struct Inner {
    state: Mutex<State>,
    bootstrap: BootstrapFn,
    attempts: AtomicU32,
}

/// Single-flight provisioner for the shared [`PatchEngine`].
///
/// The first caller of [`initialize`](Self::initialize) starts the bootstrap;
/// every concurrent caller awaits the same in-flight future. A failed attempt
/// resets the state so a later call can retry instead of being stuck.
pub struct EngineProvisioner {
    inner: Arc<Inner>,
}

static GLOBAL: Lazy<EngineProvisioner> = Lazy::new(EngineProvisioner::new);

impl EngineProvisioner {
    pub fn new() -> Self {
        Self::with_bootstrap(Arc::new(|| default_bootstrap().boxed()))
    }

    pub fn with_bootstrap(bootstrap: BootstrapFn) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Uninitialized),
                bootstrap,
                attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Process-wide provisioner for callers that do not inject their own.
    pub fn global() -> &'static EngineProvisioner {
        &GLOBAL
    }

    /// Returns the shared engine, bootstrapping it on first use.
    pub async fn initialize(&self) -> Result<Arc<PatchEngine>> {
        let pending = {
            let mut state = self.inner.state.lock().unwrap();
            match &*state {
                State::Ready(engine) => return Ok(engine.clone()),
                State::Initializing(fut) => fut.clone(),
                State::Uninitialized => {
                    let fut = start_bootstrap(&self.inner);
                    *state = State::Initializing(fut.clone());
                    fut
                }
            }
        };
        pending.await.map_err(PatchError::RuntimeBootstrap)
    }

    /// Kicks off the bootstrap without waiting for it. Must be called from
    /// within a tokio runtime.
    pub fn preload(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if matches!(&*state, State::Uninitialized) {
            *state = State::Initializing(start_bootstrap(&self.inner));
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), State::Ready(_))
    }

    pub fn is_initializing(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), State::Initializing(_))
    }

    /// How many bootstraps have been started over this provisioner's life.
    pub fn bootstrap_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Default for EngineProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns one bootstrap attempt. The spawned task owns the state
/// transitions: `Ready` on success, back to `Uninitialized` on failure, so
/// the outcome lands even if every waiter has been dropped.
fn start_bootstrap(inner: &Arc<Inner>) -> SharedBootstrap {
    let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    let bootstrap = inner.bootstrap.clone();
    let task_inner = inner.clone();

    let handle = tokio::spawn(async move {
        info!(attempt, "bootstrapping workbook patch engine");
        let outcome = match tokio::time::timeout(BOOTSTRAP_TIMEOUT, bootstrap()).await {
            Ok(Ok(engine)) => Ok(Arc::new(engine)),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(_) => Err(format!(
                "engine bootstrap timed out after {BOOTSTRAP_TIMEOUT:?}"
            )),
        };

        let mut state = task_inner.state.lock().unwrap();
        match &outcome {
            Ok(engine) => {
                debug!(attempt, "patch engine ready");
                *state = State::Ready(engine.clone());
            }
            Err(err) => {
                warn!(attempt, error = %err, "engine bootstrap failed; state reset for retry");
                *state = State::Uninitialized;
            }
        }
        outcome
    });

    async move {
        handle
            .await
            .unwrap_or_else(|err| Err(format!("engine bootstrap task panicked: {err}")))
    }
    .boxed()
    .shared()
}

/// Proves the container toolchain works end to end before any real workbook
/// is patched: generate a probe workbook, edit a cell, re-serialize, check
/// the magic.
async fn default_bootstrap() -> anyhow::Result<PatchEngine> {
    let engine = tokio::task::spawn_blocking(|| -> anyhow::Result<PatchEngine> {
        let probe = minimal_workbook(&[SheetSpec {
            name: "Probe",
            banner: "probe",
            header: &["Check"],
            rows: &[&["1"]],
        }])?;
        let mut editor = WorkbookEditor::from_bytes(probe)?;
        editor.select_sheet("Probe")?;
        editor.set_cell(3, 0, CellValue::Number(2.0), None)?;
        let bytes = editor.into_bytes()?;
        anyhow::ensure!(
            verify_container(&bytes),
            "probe round-trip lost the container magic"
        );
        Ok(PatchEngine::new())
    })
    .await
    .context("engine bootstrap worker crashed")??;
    Ok(engine)
}
