//! Compensating steps for multi-step operations.
//!
//! A [`Saga`] runs steps in order and remembers how to undo each completed
//! one. When a step fails, the recorded compensations run in reverse order.
//! Each compensation runs at most once; its failure is logged and swallowed.

use std::fmt;

use futures::future::BoxFuture;

/// Deferred undo action. Futures are lazy, so nothing runs until the saga
/// compensates.
pub type Compensation<'a> = BoxFuture<'a, anyhow::Result<()>>;

/// Ordered steps with their compensations.
pub struct Saga<'a> {
    name: &'static str,
    completed: Vec<(&'static str, Compensation<'a>)>,
}

impl fmt::Debug for Saga<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saga")
            .field("name", &self.name)
            .field(
                "completed",
                &self.completed.iter().map(|(label, _)| *label).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<'a> Saga<'a> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            completed: Vec::new(),
        }
    }

    /// Remember how to undo a step that already succeeded.
    pub fn record(&mut self, label: &'static str, compensation: Compensation<'a>) {
        self.completed.push((label, compensation));
    }

    /// Run a step. On failure every recorded compensation runs, newest first.
    pub async fn step<T, E: fmt::Display>(
        &mut self,
        label: &'static str,
        action: impl Future<Output = Result<T, E>>,
    ) -> Result<T, E> {
        match action.await {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(saga = self.name, step = label, error = %e, "Saga step failed; compensating");
                self.compensate().await;
                Err(e)
            }
        }
    }

    /// Run every recorded compensation, newest first.
    pub async fn compensate(&mut self) {
        while let Some((label, compensation)) = self.completed.pop() {
            self.undo(label, compensation).await;
        }
    }

    async fn undo(&mut self, label: &'static str, compensation: Compensation<'a>) {
        match compensation.await {
            Ok(()) => tracing::info!(saga = self.name, step = label, "Compensation applied"),
            Err(e) => tracing::error!(
                saga = self.name,
                step = label,
                error = %e,
                "Compensation failed"
            ),
        }
    }
}
