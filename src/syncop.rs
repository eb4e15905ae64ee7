//! The synchronous-task (syncop) concurrency shim (§4.5).
//!
//! The source translator runs multi-step work (self-heal, migration checks) on a
//! cooperative coroutine layered over an event loop, with explicit yield/resume at every
//! blocking call. Rust's `async`/`await` already gives a plain function this shape, so a
//! "synctask" here is just an `async fn`, and a "syncop" is just an `.await`'d call —
//! this module supplies the two things that don't fall out of `async` for free: an
//! explicit spawn/join handle matching the source's submit-with-callback model, and the
//! scoped root-identity elevation used by privileged rebalancer operations.

use std::future::Future;

use tokio::task::JoinHandle;

/// A unit of background work, submitted to the runtime and joined for its result —
/// the `async` analogue of the source's synctask-with-completion-callback.
pub struct SyncTask<T> {
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> SyncTask<T> {
    /// Runs `task` to completion; from the caller's perspective this reads as a plain
    /// function call once `.join()` is awaited, even though it runs on a separate tokio
    /// task (§4.5 "From the caller's perspective the call returns a plain pair").
    pub fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        SyncTask { handle: tokio::spawn(task) }
    }

    /// Waits for the task to finish. Panics propagate — a synctask has no cancellation
    /// and no timeout of its own (§4.5 "Cancellation").
    pub async fn join(self) -> T {
        self.handle.await.expect("synctask panicked")
    }
}

/// Effective identity a syncop runs under: `(uid, gid)`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub const ROOT: Identity = Identity { uid: 0, gid: 0 };
}

tokio::task_local! {
    static CURRENT_IDENTITY: std::cell::Cell<Identity>;
}

/// Runs `fut` with `identity` as the ambient caller identity for any nested
/// [`elevate_to_root`] calls to save and restore against.
pub async fn with_identity<F>(identity: Identity, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_IDENTITY.scope(std::cell::Cell::new(identity), fut).await
}

/// Temporarily elevates the effective identity to root, for operations — like reopening
/// an fd after migration — that must bypass normal access checks because they run on
/// behalf of the rebalancer (§4.5 "Identity switching").
///
/// Every elevation is paired with a restore on drop, including on early return or panic
/// unwinding (the scoped-acquisition pattern the spec requires): callers never need to
/// remember to undo this by hand.
pub fn elevate_to_root() -> RootIdentityGuard {
    let saved = CURRENT_IDENTITY
        .try_with(|c| c.get())
        .unwrap_or(Identity { uid: u32::MAX, gid: u32::MAX });
    let _ = CURRENT_IDENTITY.try_with(|c| c.set(Identity::ROOT));
    RootIdentityGuard { saved }
}

/// Restores the pre-elevation identity when dropped.
#[must_use = "dropping this immediately restores the prior identity"]
pub struct RootIdentityGuard {
    saved: Identity,
}

impl Drop for RootIdentityGuard {
    fn drop(&mut self) {
        let _ = CURRENT_IDENTITY.try_with(|c| c.set(self.saved));
    }
}

/// Reads the current ambient identity, or `None` if called outside a [`with_identity`]
/// scope.
pub fn current_identity() -> Option<Identity> {
    CURRENT_IDENTITY.try_with(|c| c.get()).ok()
}
