//! Upgrade-on-startup driver: check, migrate, promote, record the outcome.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::{
    MigrationProgressMonitor, MigrationReport, NoIndexImport, PromotionReport, StoreMigrator,
};
use crate::dbms::{DatabaseStates, OperatorState};
use crate::format::{MigrationOutcome, StoreVersion, StoreVersionCheck};
use crate::log::tail::LogTailMetadata;
use crate::store::layout::DatabaseLayout;
use crate::types::{Result, StoreError};

/// What [`StoreUpgrader::upgrade_if_needed`] did.
#[derive(Clone, Debug, Serialize)]
pub enum UpgradeOutcome {
    /// The store was already at the target version.
    AlreadyCurrent(StoreVersion),
    /// The store was migrated and promoted.
    Upgraded {
        /// Staging summary.
        migration: MigrationReport,
        /// Promotion summary.
        promotion: PromotionReport,
    },
}

/// Brings a database to the configured format before it is started.
pub struct StoreUpgrader {
    migrator: StoreMigrator,
    states: Arc<DatabaseStates>,
    progress: MigrationProgressMonitor,
    target: Option<StoreVersion>,
}

impl StoreUpgrader {
    /// Upgrader recording outcomes in `states`. The target is the latest
    /// version of the migrator's configured family.
    pub fn new(migrator: StoreMigrator, states: Arc<DatabaseStates>) -> Self {
        Self {
            migrator,
            states,
            progress: MigrationProgressMonitor::logging(),
            target: None,
        }
    }

    /// Reports progress to `progress` instead of the log.
    pub fn with_progress(mut self, progress: MigrationProgressMonitor) -> Self {
        self.progress = progress;
        self
    }

    /// Upgrades to `target` instead of the family's latest version.
    pub fn with_target(mut self, target: StoreVersion) -> Self {
        self.target = Some(target);
        self
    }

    /// Migrates `database` in `layout` when its format is behind the target.
    ///
    /// `log_tail` must describe the database's current transaction log. The
    /// database is marked [`OperatorState::Upgrading`] while work runs and
    /// [`OperatorState::Stopped`] afterwards, with the error recorded as the
    /// failure cause when the upgrade fails.
    pub fn upgrade_if_needed(
        &self,
        database: &str,
        layout: &DatabaseLayout,
        log_tail: &LogTailMetadata,
    ) -> Result<UpgradeOutcome> {
        let check = StoreVersionCheck::new(layout, self.migrator.config())
            .check_migration_target(self.target)?;
        if check.outcome == MigrationOutcome::NoOperationNeeded {
            if let Some(current) = check.version_to_migrate_to {
                self.finish_interrupted_promotion(database, layout, current)?;
                info!(database, version = current.marker(), "upgrade.not_needed");
                return Ok(UpgradeOutcome::AlreadyCurrent(current));
            }
        }
        let (from, to) = match check.require_possible() {
            Ok(pair) => pair,
            Err(err) => {
                self.states
                    .fail(database, OperatorState::Stopped, err.to_string());
                return Err(err);
            }
        };
        if log_tail.recovery_required {
            let err = StoreError::InvalidOwned(format!(
                "transaction log of {database} needs recovery before upgrading to {to}"
            ));
            self.states
                .fail(database, OperatorState::Stopped, err.to_string());
            return Err(err);
        }

        self.states.set_state(database, OperatorState::Upgrading);
        info!(database, from = from.marker(), to = to.marker(), "upgrade.started");
        match self.run(layout, from, to, log_tail) {
            Ok(outcome) => {
                self.states.set_state(database, OperatorState::Stopped);
                info!(database, to = to.marker(), "upgrade.completed");
                Ok(outcome)
            }
            Err(err) => {
                self.states
                    .fail(database, OperatorState::Stopped, err.to_string());
                Err(err)
            }
        }
    }

    fn run(
        &self,
        layout: &DatabaseLayout,
        from: StoreVersion,
        to: StoreVersion,
        log_tail: &LogTailMetadata,
    ) -> Result<UpgradeOutcome> {
        let staging = layout.migration_layout();
        let mut section = self.progress.start_section("store migration");
        let migration = self.migrator.migrate(
            layout,
            &staging,
            &mut section,
            from,
            to,
            &NoIndexImport,
            log_tail,
        )?;
        let promotion = self
            .migrator
            .move_migrated_files(&staging, layout, from, to)?;
        Ok(UpgradeOutcome::Upgraded {
            migration,
            promotion,
        })
    }

    /// A crash after the metadata was promoted leaves the target current
    /// with staging still present; redo the promotion to clean it up.
    fn finish_interrupted_promotion(
        &self,
        database: &str,
        layout: &DatabaseLayout,
        current: StoreVersion,
    ) -> Result<()> {
        let staging = layout.migration_layout();
        if !staging.database_directory().exists() {
            return Ok(());
        }
        warn!(database, "upgrade.finishing_interrupted_promotion");
        self.migrator
            .move_migrated_files(&staging, layout, current, current)?;
        Ok(())
    }
}
