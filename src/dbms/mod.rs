//! Per-database operator state as seen by the upgrade path.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error};

/// Lifecycle state an operator can observe for one database.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorState {
    /// Nothing is known about the database.
    #[default]
    Unknown,
    /// Known but never started.
    Initial,
    /// A store upgrade is running.
    Upgrading,
    /// Not running.
    Stopped,
    /// Running.
    Started,
}

impl fmt::Display for OperatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorState::Unknown => "unknown",
            OperatorState::Initial => "initial",
            OperatorState::Upgrading => "upgrading",
            OperatorState::Stopped => "stopped",
            OperatorState::Started => "started",
        };
        f.write_str(name)
    }
}

/// Current state of one database plus the failure that put it there, if any.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct DatabaseState {
    /// Operator-visible state.
    pub operator_state: OperatorState,
    /// Description of the last failure.
    pub failure: Option<String>,
}

impl DatabaseState {
    /// Whether the last transition failed.
    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Read access to database states.
pub trait DatabaseStateService: Send + Sync {
    /// State of `database`; [`OperatorState::Unknown`] when never recorded.
    fn state_of_database(&self, database: &str) -> OperatorState;

    /// Failure recorded for `database`, if any.
    fn cause_of_failure(&self, database: &str) -> Option<String>;
}

/// In-memory state table shared by the upgrader and its callers.
#[derive(Debug, Default)]
pub struct DatabaseStates {
    states: RwLock<HashMap<String, DatabaseState>>,
}

impl DatabaseStates {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful transition to `state`, clearing any failure.
    pub fn set_state(&self, database: &str, state: OperatorState) {
        debug!(database, state = %state, "dbms.state_changed");
        self.states.write().insert(
            database.to_owned(),
            DatabaseState {
                operator_state: state,
                failure: None,
            },
        );
    }

    /// Records that `database` ended in `state` because of `cause`.
    pub fn fail(&self, database: &str, state: OperatorState, cause: impl Into<String>) {
        let cause = cause.into();
        error!(database, state = %state, cause = %cause, "dbms.state_failed");
        self.states.write().insert(
            database.to_owned(),
            DatabaseState {
                operator_state: state,
                failure: Some(cause),
            },
        );
    }

    /// Full state for `database`.
    pub fn get(&self, database: &str) -> DatabaseState {
        self.states.read().get(database).cloned().unwrap_or_default()
    }
}

impl DatabaseStateService for DatabaseStates {
    fn state_of_database(&self, database: &str) -> OperatorState {
        self.get(database).operator_state
    }

    fn cause_of_failure(&self, database: &str) -> Option<String> {
        self.get(database).failure
    }
}

/// Fixed answers for tests: every database is in the same state.
#[derive(Clone, Debug, Default)]
pub struct StubDatabaseStateService {
    state: OperatorState,
    failure: Option<String>,
}

impl StubDatabaseStateService {
    /// Reports `state` with no failure for every database.
    pub fn new(state: OperatorState) -> Self {
        Self {
            state,
            failure: None,
        }
    }

    /// Reports `state` and `failure` for every database.
    pub fn failed(state: OperatorState, failure: impl Into<String>) -> Self {
        Self {
            state,
            failure: Some(failure.into()),
        }
    }
}

impl DatabaseStateService for StubDatabaseStateService {
    fn state_of_database(&self, _database: &str) -> OperatorState {
        self.state
    }

    fn cause_of_failure(&self, _database: &str) -> Option<String> {
        self.failure.clone()
    }
}
