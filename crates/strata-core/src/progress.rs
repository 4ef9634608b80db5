//! Three-valued-plus-success outcome for long operations.

/// Outcome of a long operation (import, export, render).
///
/// Only [`Progress::Success`] lets a pipeline continue to its next
/// stage; every other value suppresses subsequent stages. Output
/// already written when a cancellation is observed is left on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The user (or a cancel token) asked the operation to stop.
    Cancelled = 0,
    Success,
    Failed,
    /// Stopped early, keeping partial output as a valid result.
    Stopped,
}

impl Progress {
    pub fn is_success(&self) -> bool {
        matches!(self, Progress::Success)
    }
}
