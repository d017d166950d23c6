//! Cancellable background fetch for popups that pull remote content.
//!
//! The worker runs on a dedicated tokio runtime and publishes a monotonic
//! progress fraction the owning popup polls once per frame. Cancellation is
//! synchronous and unconditional: the flag flips, the task is aborted, and
//! every later observation reads Cancelled, so a racing completion can never
//! flip a dismissed popup into a "content available" state.
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
        Arc,
    },
};

use bevy::{
    ecs::{lifecycle::HookContext, world::DeferredWorld},
    prelude::*,
};
use tokio::task::AbortHandle;

pub struct FetchPlugin;

impl Plugin for FetchPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<FetchRuntime>();
    }
}

#[derive(Resource)]
pub struct FetchRuntime {
    runtime: tokio::runtime::Runtime,
}

impl Default for FetchRuntime {
    fn default() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("easel-fetch")
            .enable_all()
            .build()
            .expect("fetch runtime failed to start");
        Self { runtime }
    }
}

impl FetchRuntime {
    pub fn handle(&self) -> &tokio::runtime::Handle {
        self.runtime.handle()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchState {
    Running,
    Complete,
    Failed,
    Cancelled,
}

const STATE_RUNNING: u8 = 0;
const STATE_COMPLETE: u8 = 1;
const STATE_FAILED: u8 = 2;

/// Returned by the progress sink once the fetch has been cancelled; workers
/// propagate it with `?` and unwind quietly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCancelled;

impl fmt::Display for FetchCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch cancelled")
    }
}

impl std::error::Error for FetchCancelled {}

#[derive(Debug, Clone)]
pub enum FetchError {
    Cancelled,
    Transport(String),
}

impl From<FetchCancelled> for FetchError {
    fn from(_: FetchCancelled) -> Self {
        FetchError::Cancelled
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Cancelled => write!(f, "fetch cancelled"),
            FetchError::Transport(message) => write!(f, "fetch transport error: {message}"),
        }
    }
}

impl std::error::Error for FetchError {}

struct FetchInner {
    progress: AtomicU32,
    state: AtomicU8,
    cancelled: AtomicBool,
}

/// Shared view of one fetch, cloneable across the worker and the frame loop.
#[derive(Clone)]
pub struct FetchHandle {
    inner: Arc<FetchInner>,
}

impl Default for FetchHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FetchInner {
                progress: AtomicU32::new(0.0_f32.to_bits()),
                state: AtomicU8::new(STATE_RUNNING),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.inner.progress.load(Ordering::Acquire))
    }

    /// The cancelled flag always wins: a completion that raced the cancel is
    /// reported as Cancelled and never acted on.
    pub fn state(&self) -> FetchState {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return FetchState::Cancelled;
        }
        match self.inner.state.load(Ordering::Acquire) {
            STATE_COMPLETE => FetchState::Complete,
            STATE_FAILED => FetchState::Failed,
            _ => FetchState::Running,
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Worker-side progress report. Progress only ever increases; a report
    /// after cancellation writes nothing and tells the worker to stop.
    pub fn report_progress(&self, fraction: f32) -> Result<(), FetchCancelled> {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return Err(FetchCancelled);
        }
        let bits = fraction.clamp(0.0, 1.0).to_bits();
        self.inner.progress.fetch_max(bits, Ordering::AcqRel);
        Ok(())
    }

    /// Worker-side completion; refused after cancellation.
    pub fn complete(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return false;
        }
        self.inner.progress.store(1.0_f32.to_bits(), Ordering::Release);
        self.inner
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_COMPLETE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn fail(&self) {
        let _ = self.inner.state.compare_exchange(
            STATE_RUNNING,
            STATE_FAILED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Fetch owned by a popup entity. Removing the component (the popup being
/// despawned for any reason) cancels the task unconditionally.
#[derive(Component)]
#[component(on_remove = SketchFetch::on_remove)]
pub struct SketchFetch {
    pub handle: FetchHandle,
    abort: Option<AbortHandle>,
}

impl SketchFetch {
    /// Spawns the worker the collaborator supplies; the worker reports
    /// through the handle it is given and aborts on the first cancelled
    /// report.
    pub fn spawn<MakeWorker, Worker>(runtime: &FetchRuntime, make_worker: MakeWorker) -> Self
    where
        MakeWorker: FnOnce(FetchHandle) -> Worker,
        Worker: Future<Output = Result<(), FetchError>> + Send + 'static,
    {
        let handle = FetchHandle::new();
        let worker = make_worker(handle.clone());
        let worker_handle = handle.clone();
        let join = runtime.handle().spawn(async move {
            match worker.await {
                Ok(()) => {
                    worker_handle.complete();
                }
                Err(FetchError::Cancelled) => {}
                Err(error) => {
                    log::warn!("fetch failed: {error}");
                    worker_handle.fail();
                }
            }
        });
        Self {
            handle,
            abort: Some(join.abort_handle()),
        }
    }

    pub fn cancel(&self) {
        self.handle.cancel();
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    fn on_remove(world: DeferredWorld, HookContext { entity, .. }: HookContext) {
        if let Some(fetch) = world.entity(entity).get::<SketchFetch>() {
            fetch.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn progress_is_monotonic() {
        let handle = FetchHandle::new();
        handle.report_progress(0.5).unwrap();
        handle.report_progress(0.3).unwrap();
        assert_eq!(handle.progress(), 0.5);
        handle.report_progress(0.9).unwrap();
        assert_eq!(handle.progress(), 0.9);
    }

    #[test]
    fn late_progress_after_cancel_is_ignored() {
        let handle = FetchHandle::new();
        handle.report_progress(0.4).unwrap();
        handle.cancel();

        assert_eq!(handle.report_progress(0.9), Err(FetchCancelled));
        assert_eq!(handle.progress(), 0.4);
        assert!(!handle.complete());
        assert_eq!(handle.state(), FetchState::Cancelled);
    }

    #[test]
    fn completion_that_raced_a_cancel_is_still_reported_cancelled() {
        let handle = FetchHandle::new();
        // Worker finished an instant before the cancel flag was read back.
        assert!(handle.complete());
        handle.cancel();
        assert_eq!(handle.state(), FetchState::Cancelled);
    }

    #[test]
    fn spawned_worker_completes_through_the_handle() {
        let runtime = FetchRuntime::default();
        let fetch = SketchFetch::spawn(&runtime, |progress| async move {
            for step in 1..=4 {
                progress.report_progress(step as f32 / 4.0)?;
            }
            Ok(())
        });

        for _ in 0..2000 {
            if fetch.handle.state() != FetchState::Running {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(fetch.handle.state(), FetchState::Complete);
        assert_eq!(fetch.handle.progress(), 1.0);
    }

    #[test]
    fn transport_error_lands_in_failed_not_complete() {
        let runtime = FetchRuntime::default();
        let fetch = SketchFetch::spawn(&runtime, |progress| async move {
            progress.report_progress(0.2)?;
            Err(FetchError::Transport("remote closed the stream".to_string()))
        });

        for _ in 0..2000 {
            if fetch.handle.state() != FetchState::Running {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(fetch.handle.state(), FetchState::Failed);
        assert!(fetch.handle.progress() < 1.0);
    }

    #[test]
    fn despawning_the_owner_cancels_the_fetch() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_plugins(FetchPlugin);

        let fetch = {
            let runtime = app.world().resource::<FetchRuntime>();
            SketchFetch::spawn(runtime, |progress| async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    progress.report_progress(0.1)?;
                }
            })
        };
        let handle = fetch.handle.clone();
        let entity = app.world_mut().spawn(fetch).id();

        app.update();
        assert_ne!(handle.state(), FetchState::Cancelled);

        app.world_mut().entity_mut(entity).despawn();
        assert_eq!(handle.state(), FetchState::Cancelled);

        // Even if the worker had produced more progress in flight, nothing
        // is observed past the cancellation point.
        std::thread::sleep(Duration::from_millis(20));
        let frozen = handle.progress();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(handle.progress(), frozen);
    }
}
