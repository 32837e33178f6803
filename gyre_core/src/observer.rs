use crate::executor::RunResult;

/// An `Observer` monitors a single execution of the harness.
///
/// Observers are invoked by an `Executor` before (`pre_exec`) and after (`post_exec`) every
/// run. `pre_exec` must discard everything recorded by the previous run, including a run that
/// was abandoned halfway through by a timeout, so that no observation is ever attributed to
/// the wrong execution.
pub trait Observer {
    /// Returns a static name identifying the observer in logs.
    fn name(&self) -> &'static str;

    /// Called immediately before the harness runs.
    fn pre_exec(&mut self);

    /// Called immediately after the harness finished, timed out, or panicked.
    fn post_exec(&mut self, result: &RunResult);
}
