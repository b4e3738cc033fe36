//! Diagnostic output gated by a single level knob.
//!
//! Level 0 is silent, 1 adds informational lines and warnings, 2 adds solver
//! reports. Text goes through the `log` facade, so nothing is printed unless
//! the application installs a logger.

use std::fmt;

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};

pub const MAX_DIAGNOSTIC_LEVEL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Diagnostics {
    level: u8,
}

impl Diagnostics {
    /// Levels above 2 are clamped
    pub fn new(level: u8) -> Diagnostics {
        Diagnostics {
            level: level.min(MAX_DIAGNOSTIC_LEVEL),
        }
    }

    pub fn silent() -> Diagnostics {
        Diagnostics::new(0)
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn enabled(&self) -> bool {
        self.level >= 1
    }

    pub fn solver_reports(&self) -> bool {
        self.level >= 2
    }

    pub fn info(&self, message: fmt::Arguments<'_>) {
        if self.enabled() {
            info!("info: {message}");
        }
    }

    /// Warning about one part of the fit, e.g. `warning [projection]: ...`
    pub fn warning(&self, scope: &str, message: fmt::Arguments<'_>) {
        if self.enabled() {
            warn!("warning [{scope}]: {message}");
        }
    }

    pub fn report(&self, message: fmt::Arguments<'_>) {
        if self.solver_reports() {
            info!(target: "scaffit::solver", "{message}");
        }
    }

    /// Progress bar over `len` steps, hidden when diagnostics are off
    pub fn progress_bar(&self, len: u64, message: &str) -> ProgressBar {
        if !self.enabled() {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len}") {
            bar.set_style(style);
        }
        bar.set_message(message.to_owned());
        bar
    }
}
