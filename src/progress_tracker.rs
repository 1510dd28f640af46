use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};

use crate::errors::{Result, SpriteCullError};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

/// Progress bar in the style every batch command shares.
pub fn progress_bar(len: u64, message: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar.set_message(message.to_string());
    bar
}

/// Shared cancellation switch for long-running batch work. Clones observe
/// the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Cancels this flag on Ctrl-C. A process can install only one handler.
    pub fn cancel_on_interrupt(&self) -> Result<()> {
        let flag = self.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("interrupted, stopping after the current frame");
            flag.cancel();
        })
        .map_err(|e| SpriteCullError::Configuration {
            message: format!("cannot install Ctrl-C handler: {}", e),
        })
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SpriteCullError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(flag.check().is_ok());

        other.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(SpriteCullError::Cancelled)));

        flag.reset();
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_interrupt_handler_installs_once() {
        let flag = CancelFlag::new();
        assert!(flag.cancel_on_interrupt().is_ok());
        assert!(matches!(
            CancelFlag::new().cancel_on_interrupt(),
            Err(SpriteCullError::Configuration { .. })
        ));
        assert!(!flag.is_cancelled());
    }

    #[test]
    fn test_progress_bar_length() {
        let bar = progress_bar(12, "frames");
        assert_eq!(bar.length(), Some(12));
        assert_eq!(bar.message(), "frames");
    }
}
