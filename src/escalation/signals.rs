//! Heuristic signal classification.
//!
//! Which sub-task is "planning", which is "implementation", and what in a
//! session's output means the worker left plan mode are heuristics. They
//! live behind [`SignalDetector`] so deployments can swap them.

use regex::Regex;

use crate::{AppError, Result};

/// Classifies tracker titles and worker output.
pub trait SignalDetector: Send + Sync {
    /// Whether a sub-task title names planning work.
    fn is_planning_task(&self, title: &str) -> bool;

    /// Whether a sub-task title names implementation work.
    fn is_implementation_task(&self, title: &str) -> bool;

    /// Whether recent output shows the worker leaving plan mode.
    fn has_plan_exit(&self, output: &str) -> bool;
}

const PLANNING_KEYWORDS: &[&str] = &[
    "plan",
    "planning",
    "design",
    "research",
    "investigate",
    "spec",
    "architecture",
    "scope",
];

const IMPLEMENTATION_KEYWORDS: &[&str] = &[
    "implement",
    "implementation",
    "build",
    "code",
    "develop",
    "fix",
    "refactor",
    "wire",
];

const PLAN_EXIT_PATTERNS: &[&str] = &[
    r"ExitPlanMode",
    r"exit(ing|ed)? plan mode",
    r"plan (approved|complete|completed|finalized)",
    r"ready to implement",
];

/// Word-boundary keyword matcher.
#[derive(Debug, Clone)]
pub struct KeywordSignalDetector {
    planning: Regex,
    implementation: Regex,
    plan_exit: Regex,
}

impl KeywordSignalDetector {
    /// Build a detector from keyword lists and plan-exit regex fragments.
    ///
    /// Keywords match case-insensitively on word boundaries.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a plan-exit fragment is not a valid
    /// regular expression.
    pub fn new(planning: &[&str], implementation: &[&str], plan_exit: &[&str]) -> Result<Self> {
        Ok(Self {
            planning: keyword_regex(planning)?,
            implementation: keyword_regex(implementation)?,
            plan_exit: alternation(plan_exit)?,
        })
    }

    /// Detector with the built-in keyword lists.
    ///
    /// # Errors
    ///
    /// Only fails if the built-in patterns are invalid.
    pub fn with_defaults() -> Result<Self> {
        Self::new(PLANNING_KEYWORDS, IMPLEMENTATION_KEYWORDS, PLAN_EXIT_PATTERNS)
    }
}

fn keyword_regex(words: &[&str]) -> Result<Regex> {
    let escaped: Vec<String> = words.iter().map(|w| regex::escape(w)).collect();
    compile(&format!(r"(?i)\b({})\b", escaped.join("|")))
}

fn alternation(fragments: &[&str]) -> Result<Regex> {
    compile(&format!("(?i)({})", fragments.join("|")))
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| AppError::Config(format!("invalid signal pattern: {err}")))
}

impl SignalDetector for KeywordSignalDetector {
    fn is_planning_task(&self, title: &str) -> bool {
        self.planning.is_match(title)
    }

    fn is_implementation_task(&self, title: &str) -> bool {
        self.implementation.is_match(title)
    }

    fn has_plan_exit(&self, output: &str) -> bool {
        self.plan_exit.is_match(output)
    }
}
