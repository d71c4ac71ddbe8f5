//! Instruction payloads sent to the executor.

use crate::core::task::{CheckpointType, TaskNode};

/// Extra context for a repeated dispatch.
#[derive(Debug, Clone, Copy)]
pub enum Followup<'a> {
    /// Minor failure: same task, previous error attached.
    Retry { attempt: u32, previous_error: &'a str },
    /// Moderate failure or failed checkpoint: rendered remediation plan.
    Rework { attempt: u32, plan: &'a str },
}

/// Build the prompt for one dispatch of `node`.
///
/// `original` is the task a checkpoint node verifies, when there is one.
pub fn build(node: &TaskNode, original: Option<&TaskNode>, followup: Option<Followup<'_>>) -> String {
    let mut prompt = match node.checkpoint_type {
        None => standard(node),
        Some(kind) => checkpoint(node, kind, original),
    };

    match followup {
        Some(Followup::Retry {
            attempt,
            previous_error,
        }) => {
            let excerpt: String = previous_error.chars().take(2000).collect();
            prompt.push_str(&format!(
                "\n\nRETRY (attempt {}):\nThe previous attempt failed with:\n{}\nAddress this failure before continuing.\n",
                attempt,
                excerpt.trim()
            ));
        }
        Some(Followup::Rework { attempt, plan }) => {
            prompt.push_str(&format!("\n\nREWORK (attempt {}):\n{}", attempt, plan));
        }
        None => {}
    }
    prompt
}

fn skills(node: &TaskNode) -> String {
    if node.required_skills.is_empty() {
        "none declared".to_string()
    } else {
        node.required_skills
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn standard(node: &TaskNode) -> String {
    format!(
        r#"Complete the following task.

TASK: {}
PRIORITY: {:?}
SKILLS: {}

DESCRIPTION:
{}

When finished, summarise what you changed and report a self-assessed
quality_score between 0 and 1."#,
        node.title,
        node.priority,
        skills(node),
        node.description
    )
}

fn checkpoint(node: &TaskNode, kind: CheckpointType, original: Option<&TaskNode>) -> String {
    let subject = original
        .map(|t| format!("TASK UNDER REVIEW: {}\n\n{}", t.title, t.description))
        .unwrap_or_else(|| "SCOPE: the whole project".to_string());

    let instructions = match kind {
        CheckpointType::CodeReview => {
            "Review the implementation of the task above for correctness, readability and security."
        }
        CheckpointType::QaTesting => {
            "Test the implementation of the task above. Run the existing tests and add missing ones."
        }
        CheckpointType::FinalCodeReview => {
            "Review the complete project for consistency across tasks and any remaining defects."
        }
        CheckpointType::FinalQa => {
            "Run the full test suite for the project and verify the integrated result end to end."
        }
    };

    format!(
        r#"{}

{}

{}

Report your findings in this format:
quality_score: <0..1>
issues: <number of outstanding issues>
tests passed | tests failed
coverage: <percent>%"#,
        node.title, subject, instructions
    )
}
