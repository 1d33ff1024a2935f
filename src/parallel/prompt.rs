//! Prompts for unit sessions and the commit-message convention the
//! completion analyzer relies on.

use std::fmt::Write;

use super::unit::UnitOfWork;

/// Commit subject the agent must use for the `n`th (1-based) task of a unit.
pub fn task_commit_subject(owner_id: &str, n: usize, title: &str) -> String {
    format!("[{}] Task {}: {}", owner_id, n, title)
}

/// Builds the single prompt sent to the agent for a whole unit.
pub trait UnitPromptBuilder: Send + Sync {
    fn build(&self, unit: &UnitOfWork) -> String;
}

/// Plain-text prompt listing every task with its commit instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPromptBuilder;

impl UnitPromptBuilder for DefaultPromptBuilder {
    fn build(&self, unit: &UnitOfWork) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "# Work unit {}: {}", unit.owner_id, unit.title);

        if let Some(issue) = &unit.issue {
            if !issue.symptom.is_empty() {
                let _ = writeln!(prompt, "\n## Issue\n\n{}", issue.symptom.trim());
            }
        }

        let _ = writeln!(
            prompt,
            "\nComplete the tasks below in order. After finishing each task, \
             commit its changes before starting the next one, using exactly the \
             commit subject given for that task."
        );

        for (i, task) in unit.tasks.iter().enumerate() {
            let n = i + 1;
            let _ = writeln!(prompt, "\n## Task {}: {}", n, task.title);
            if !task.description.is_empty() {
                let _ = writeln!(prompt, "\n{}", task.description.trim());
            }
            write_list(&mut prompt, "Files", &task.files);
            write_list(&mut prompt, "Acceptance criteria", &task.acceptance_criteria);
            write_list(&mut prompt, "Checks to run", &task.checks);
            let _ = writeln!(
                prompt,
                "\nCommit subject: `{}`",
                task_commit_subject(&unit.owner_id, n, &task.title)
            );
        }

        prompt
    }
}

fn write_list(prompt: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(prompt, "\n{}:", heading);
    for item in items {
        let _ = writeln!(prompt, "- {}", item);
    }
}

/// Prompt asking the agent to resolve conflicts in the listed files.
pub fn conflict_resolution_prompt(branch: &str, target: &str, files: &[String]) -> String {
    let mut prompt = format!(
        "Branch `{}` conflicts with `{}`. Resolve the merge conflicts in these files, \
         keeping the intent of both sides:\n",
        branch, target
    );
    for file in files {
        let _ = writeln!(prompt, "- {}", file);
    }
    prompt.push_str(
        "\nRemove every conflict marker, make sure the result builds, then stage the \
         resolved files with `git add`. Do not commit and do not continue the rebase or merge.\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Issue, Severity, Task};

    #[test]
    fn test_commit_subject_format() {
        assert_eq!(
            task_commit_subject("ISS-1", 2, "add regression test"),
            "[ISS-1] Task 2: add regression test"
        );
    }

    #[test]
    fn test_prompt_lists_every_task_with_subject() {
        let mut task = Task::new("t1", "fix parser");
        task.acceptance_criteria = vec!["empty input returns error".into()];
        let unit = UnitOfWork::new(
            "ISS-1",
            "Parser crash",
            vec![task, Task::new("t2", "add test").with_files(["tests/parser.rs"])],
        )
        .with_issue(Issue::new("ISS-1", Severity::High).with_symptom("parser panics"));

        let prompt = DefaultPromptBuilder.build(&unit);
        assert!(prompt.contains("parser panics"));
        assert!(prompt.contains("`[ISS-1] Task 1: fix parser`"));
        assert!(prompt.contains("`[ISS-1] Task 2: add test`"));
        assert!(prompt.contains("- tests/parser.rs"));
        assert!(prompt.contains("- empty input returns error"));
    }

    #[test]
    fn test_conflict_prompt_lists_files() {
        let prompt = conflict_resolution_prompt("b", "main", &["a.ts".into(), "b.ts".into()]);
        assert!(prompt.contains("- a.ts\n- b.ts\n"));
        assert!(prompt.contains("Do not commit"));
    }
}
