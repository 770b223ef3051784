//! Marks futures whose panics are caught by their owner.
//!
//! A process-wide panic hook cannot tell a panic that a `JoinHandle` will
//! observe from one that nothing handles. Work run through [`contain_panics`]
//! carries a task-local scope name that the hook reads with
//! [`contained_panic_scope`] while the panicking task is still being polled.

use std::future::Future;

tokio::task_local! {
    static CONTAINED_SCOPE: &'static str;
}

/// Runs `future` inside a named containment scope. The scope does not carry
/// over into tasks spawned from `future`.
pub async fn contain_panics<F>(scope: &'static str, future: F) -> F::Output
where
    F: Future,
{
    CONTAINED_SCOPE.scope(scope, future).await
}

/// Name of the containment scope of the task currently being polled, if any.
pub fn contained_panic_scope() -> Option<&'static str> {
    CONTAINED_SCOPE.try_with(|scope| *scope).ok()
}
