//! Progress notifications for long-running operations.

use tracing::{info, warn};

/// Receives `(fraction, description)` milestones.
///
/// Implementations may fail; callers log the failure and carry on.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, fraction: f32, description: &str) -> anyhow::Result<()>;
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _fraction: f32, _description: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Forwards notifications to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn report(&self, fraction: f32, description: &str) -> anyhow::Result<()> {
        info!(progress = format!("{:.0}%", fraction * 100.0), "{description}");
        Ok(())
    }
}

impl<F> ProgressReporter for F
where
    F: Fn(f32, &str) -> anyhow::Result<()> + Send + Sync,
{
    fn report(&self, fraction: f32, description: &str) -> anyhow::Result<()> {
        self(fraction, description)
    }
}

/// Clamp and deliver one milestone. Reporter errors never reach the caller.
pub(crate) fn notify(progress: &dyn ProgressReporter, fraction: f32, description: &str) {
    let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
    if let Err(e) = progress.report(fraction, description) {
        warn!(error = %e, fraction, description, "progress reporter failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn fractions_are_clamped() {
        let seen = Mutex::new(Vec::new());
        let recorder = |f: f32, _: &str| -> anyhow::Result<()> {
            seen.lock().unwrap().push(f);
            Ok(())
        };
        notify(&recorder, -0.5, "a");
        notify(&recorder, 0.25, "b");
        notify(&recorder, 7.0, "c");
        notify(&recorder, f32::NAN, "d");
        assert_eq!(*seen.lock().unwrap(), vec![0.0, 0.25, 1.0, 0.0]);
    }

    #[test]
    fn reporter_errors_are_swallowed() {
        let failing = |_: f32, _: &str| -> anyhow::Result<()> { anyhow::bail!("ui closed") };
        notify(&failing, 0.5, "still running");
        notify(&NoProgress, 1.0, "done");
        notify(&LogProgress, 1.0, "done");
    }
}
