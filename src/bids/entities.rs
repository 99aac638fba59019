//! Run identity entities.
//!
//! A functional acquisition is identified by the tuple
//! (subject, session?, task, acquisition?, run). The tuple is immutable after
//! manifest creation and is the key for derivative path composition, wildcard
//! step ids, and manifest ordering.

use serde::{Deserialize, Serialize};

/// The identity tuple of one functional acquisition.
///
/// Entity values carry their prefixed form where the convention uses one
/// (`sub-01`, `ses-02`) for subject and session, and the bare label for task,
/// acquisition, and run (`rest`, `01`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityTuple {
    /// Subject identifier, e.g. `sub-01`.
    pub sub: String,
    /// Session identifier, e.g. `ses-02`.
    pub ses: Option<String>,
    /// Task label, e.g. `rest`.
    pub task: String,
    /// Acquisition label, e.g. `ax`.
    pub acq: Option<String>,
    /// Run label, e.g. `01`.
    pub run: String,
}

impl EntityTuple {
    /// Creates a tuple with only the required entities.
    pub fn new(sub: impl Into<String>, task: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            ses: None,
            task: task.into(),
            acq: None,
            run: run.into(),
        }
    }

    /// Adds a session entity.
    pub fn with_ses(mut self, ses: impl Into<String>) -> Self {
        self.ses = Some(ses.into());
        self
    }

    /// Adds an acquisition entity.
    pub fn with_acq(mut self, acq: impl Into<String>) -> Self {
        self.acq = Some(acq.into());
        self
    }

    /// The underscore-joined base name without a suffix,
    /// e.g. `sub-01_ses-02_task-rest_acq-ax_run-01`.
    pub fn base_name(&self) -> String {
        let mut parts = vec![self.sub.clone()];
        if let Some(ses) = &self.ses {
            parts.push(ses.clone());
        }
        parts.push(format!("task-{}", self.task));
        if let Some(acq) = &self.acq {
            parts.push(format!("acq-{acq}"));
        }
        parts.push(format!("run-{}", self.run));
        parts.join("_")
    }

    /// A key safe for step ids and wildcard rule instantiation.
    pub fn run_key(&self) -> String {
        self.base_name()
    }

    /// Sort key implementing the manifest ordering invariant
    /// (subject, session, task, run).
    pub fn order_key(&self) -> (String, String, String, String) {
        (
            self.sub.clone(),
            self.ses.clone().unwrap_or_default(),
            self.task.clone(),
            self.run.clone(),
        )
    }
}

impl std::fmt::Display for EntityTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base_name())
    }
}
