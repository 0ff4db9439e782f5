//! Progress reporting for long migrations.

use std::sync::Arc;

use tracing::info;

/// Receives progress events. All methods default to doing nothing.
pub trait ProgressListener: Send + Sync {
    /// A section started with `max` units of work.
    fn section_started(&self, _section: &str, _max: u64) {}
    /// A named phase began inside a section.
    fn phase(&self, _section: &str, _phase: &str) {}
    /// `done` of `max` units are complete.
    fn progressed(&self, _section: &str, _done: u64, _max: u64) {}
    /// The section finished.
    fn section_completed(&self, _section: &str) {}
}

/// Listener that drops every event.
pub struct SilentListener;

impl ProgressListener for SilentListener {}

/// Listener that forwards events to `tracing` at info level.
pub struct LoggingListener;

impl ProgressListener for LoggingListener {
    fn section_started(&self, section: &str, max: u64) {
        info!(section, max, "migration.section_started");
    }

    fn phase(&self, section: &str, phase: &str) {
        info!(section, phase, "migration.phase");
    }

    fn progressed(&self, section: &str, done: u64, max: u64) {
        let percent = if max == 0 { 100 } else { done * 100 / max };
        info!(section, done, max, percent, "migration.progress");
    }

    fn section_completed(&self, section: &str) {
        info!(section, "migration.section_completed");
    }
}

/// Hands out [`SectionHandle`]s that report to one listener.
#[derive(Clone)]
pub struct MigrationProgressMonitor {
    listener: Arc<dyn ProgressListener>,
}

impl MigrationProgressMonitor {
    /// Monitor that reports nothing.
    pub fn silent() -> Self {
        Self::with_listener(Arc::new(SilentListener))
    }

    /// Monitor that logs through `tracing`.
    pub fn logging() -> Self {
        Self::with_listener(Arc::new(LoggingListener))
    }

    /// Monitor reporting to `listener`.
    pub fn with_listener(listener: Arc<dyn ProgressListener>) -> Self {
        Self { listener }
    }

    /// Opens a named section.
    pub fn start_section(&self, name: &str) -> SectionHandle {
        SectionHandle {
            name: name.to_owned(),
            listener: Arc::clone(&self.listener),
            max: 0,
            done: 0,
            completed: false,
        }
    }
}

impl Default for MigrationProgressMonitor {
    fn default() -> Self {
        Self::silent()
    }
}

/// Progress reporter for one section of work.
pub struct SectionHandle {
    name: String,
    listener: Arc<dyn ProgressListener>,
    max: u64,
    done: u64,
    completed: bool,
}

impl SectionHandle {
    /// Section name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares the amount of work and reports the start.
    pub fn start(&mut self, max: u64) {
        self.max = max;
        self.done = 0;
        self.listener.section_started(&self.name, max);
    }

    /// Reports a named phase.
    pub fn phase(&self, phase: &str) {
        self.listener.phase(&self.name, phase);
    }

    /// Adds `units` of completed work, capped at the declared maximum.
    pub fn progress(&mut self, units: u64) {
        self.done = self.done.saturating_add(units).min(self.max.max(self.done));
        self.listener.progressed(&self.name, self.done, self.max);
    }

    /// Reports completion once.
    pub fn completed(&mut self) {
        if !self.completed {
            self.completed = true;
            self.listener.section_completed(&self.name);
        }
    }
}
