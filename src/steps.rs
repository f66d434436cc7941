//! Ordered record of the side effects a multi-step operation performed.
//! Nothing here is transactional: a failed step stays failed and is listed
//! in the summary so it can be repaired by hand.

use std::fmt;

use log::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    PrimaryCreate(String),
    PrimaryExtend(String),
    MirrorCreate(String),
    MirrorExtend(String),
    RemoveClient(String),
    PersistSubscription,
    RecordPayment,
    MarkTrialUsed,
    MarkBonusApplied,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::PrimaryCreate(p) => write!(f, "create on {}", p),
            Step::PrimaryExtend(p) => write!(f, "extend on {}", p),
            Step::MirrorCreate(p) => write!(f, "mirror create on {}", p),
            Step::MirrorExtend(p) => write!(f, "mirror extend on {}", p),
            Step::RemoveClient(p) => write!(f, "remove from {}", p),
            Step::PersistSubscription => write!(f, "persist subscription"),
            Step::RecordPayment => write!(f, "record payment"),
            Step::MarkTrialUsed => write!(f, "mark trial used"),
            Step::MarkBonusApplied => write!(f, "mark bonus applied"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Skipped(String),
    Failed(String),
}

pub struct StepLog {
    subject: String,
    entries: Vec<(Step, Outcome)>,
}

impl StepLog {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, step: Step, outcome: Outcome) {
        match &outcome {
            Outcome::Done => info!("[{}] {}: done", self.subject, step),
            Outcome::Skipped(why) => info!("[{}] {}: skipped ({})", self.subject, step, why),
            Outcome::Failed(why) => warn!("[{}] {}: FAILED ({})", self.subject, step, why),
        }
        self.entries.push((step, outcome));
    }

    /// Record `result` as `Done` or `Failed` and hand it back.
    pub fn track<T, E: fmt::Display>(&mut self, step: Step, result: Result<T, E>) -> Result<T, E> {
        let outcome = match &result {
            Ok(_) => Outcome::Done,
            Err(e) => Outcome::Failed(e.to_string()),
        };
        self.record(step, outcome);
        result
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[(Step, Outcome)] {
        &self.entries
    }

    pub fn failed(&self) -> Vec<&Step> {
        self.entries
            .iter()
            .filter(|(_, outcome)| matches!(outcome, Outcome::Failed(_)))
            .map(|(step, _)| step)
            .collect()
    }

    pub fn finish(&self) {
        let failed = self.failed();
        if failed.is_empty() {
            info!("[{}] {} steps completed", self.subject, self.entries.len());
        } else {
            let list: Vec<String> = failed.iter().map(|s| s.to_string()).collect();
            warn!(
                "[{}] partial failure, steps needing repair: {}",
                self.subject,
                list.join(", ")
            );
        }
    }
}
