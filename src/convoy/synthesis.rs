//! Prompt text built by the scheduler: per-issue instructions and the
//! convoy synthesis prompt. The scheduler never runs synthesis itself.

use std::fmt::Write as _;

use crate::models::convoy::{Convoy, JobStatus};

/// Initial instruction for a worker assigned to one convoy issue.
#[must_use]
pub fn issue_prompt(convoy_name: &str, issue_id: &str, worker_id: &str) -> String {
    format!(
        "You are working on issue {issue_id} as part of convoy \"{convoy_name}\". \
         Resolve the issue completely in this workspace. When you are done, run \
         `agent-fleet-ctl worker-complete {worker_id}` with a short summary of the result."
    )
}

/// Combine every job's outcome into one synthesis prompt, in issue order.
///
/// Completed jobs contribute their captured output; failed jobs are listed
/// with their error so mixed outcomes stay visible.
#[must_use]
pub fn build_synthesis_prompt(convoy: &Convoy) -> String {
    let completed = convoy
        .jobs
        .iter()
        .filter(|job| job.status == JobStatus::Completed)
        .count();

    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Convoy synthesis: {}", convoy.name);
    let _ = writeln!(prompt);
    let _ = writeln!(
        prompt,
        "{completed} of {} issues completed. Combine the results below into a single \
         summary of what changed, what failed, and what remains.",
        convoy.jobs.len()
    );

    for job in &convoy.jobs {
        let _ = writeln!(prompt);
        match job.status {
            JobStatus::Completed => {
                let _ = writeln!(prompt, "## Issue {} (completed)", job.issue_id);
                let output = job
                    .output
                    .as_deref()
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .unwrap_or("(no output captured)");
                let _ = writeln!(prompt, "{output}");
            }
            status => {
                let _ = writeln!(prompt, "## Issue {} ({})", job.issue_id, status.as_str());
                let _ = writeln!(
                    prompt,
                    "Error: {}",
                    job.error.as_deref().unwrap_or("(no error recorded)")
                );
            }
        }
    }

    prompt
}
