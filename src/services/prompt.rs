//! Prompt construction and response text utilities.

use regex::Regex;

use crate::domain::models::{Interaction, InteractionKind, Task};

/// Build the initial user turn for a task.
///
/// Concatenates the description, one paragraph per attached project separated
/// by `---`, and the task-level context. The workspace is referenced only in
/// the abstract: the absolute worktree path must never appear here, or the
/// assistant could address the main checkout directly and break isolation.
pub fn initial_prompt(task: &Task) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(format!(
        "I need you to implement the following task.\n\nTask Description:\n{}",
        task.description
    ));

    if !task.projects.is_empty() {
        let blocks: Vec<String> = task
            .projects
            .iter()
            .map(|project| {
                let mut block = format!("Project: {}\nPath: {}", project.name, project.path);
                if let Some(context) = &project.context {
                    block.push('\n');
                    block.push_str(context);
                }
                block
            })
            .collect();
        sections.push(format!("Projects:\n{}", blocks.join("\n---\n")));
    }

    if let Some(context) = &task.project_context {
        sections.push(format!("Project Context:\n{context}"));
    }

    sections.push("Working directory: current directory (isolated branch)".to_string());

    sections.push(
        "Please implement this task step by step. Generate clean, production-ready code. \
         When you complete the implementation, provide a summary of what you've done."
            .to_string(),
    );

    sections.join("\n\n")
}

/// Build the recovery turn injected after a session is discarded: a
/// role-tagged digest of the most recent interactions so a fresh assistant
/// session can pick up where the old one left off.
pub fn recovery_message(interactions: &[Interaction]) -> String {
    const TAIL: usize = 10;
    const MAX_CONTENT: usize = 500;

    let tail: Vec<String> = interactions
        .iter()
        .rev()
        .take(TAIL)
        .rev()
        .map(|interaction| {
            let role = match interaction.kind {
                InteractionKind::UserRequest | InteractionKind::SimulatedHuman => "User",
                InteractionKind::AssistantResponse => "Assistant",
                _ => "System",
            };
            let content: String = if interaction.content.len() > MAX_CONTENT {
                let mut end = MAX_CONTENT;
                while !interaction.content.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}...", &interaction.content[..end])
            } else {
                interaction.content.clone()
            };
            format!("[{role}]: {content}")
        })
        .collect();

    format!(
        "=== RECOVERY MODE ===\n\
         The previous session was interrupted. Here is a summary of the conversation so far:\n\n\
         {}\n\n\
         === END OF RECOVERY CONTEXT ===\n\n\
         Please continue from where we left off. If you were in the middle of a task, resume it.",
        tail.join("\n\n")
    )
}

/// Pull a short summary out of a final assistant response: a labelled summary
/// section when one exists, otherwise the leading text.
pub fn extract_summary(response: &str) -> String {
    const SECTION_CAP: usize = 500;
    const FALLBACK_CAP: usize = 300;

    let patterns = [
        r"(?is)implementation summary:?\s*(.+?)(?:\n\n|\z)",
        r"(?is)summary:?\s*(.+?)(?:\n\n|\z)",
        r"(?is)what (?:i've|i have) done:?\s*(.+?)(?:\n\n|\z)",
    ];

    for pattern in patterns {
        let re = Regex::new(pattern).expect("static pattern");
        if let Some(captures) = re.captures(response) {
            let section = captures[1].trim();
            return truncate_on_boundary(section, SECTION_CAP).to_string();
        }
    }

    if response.len() > FALLBACK_CAP {
        format!("{}...", truncate_on_boundary(response, FALLBACK_CAP))
    } else {
        response.to_string()
    }
}

fn truncate_on_boundary(text: &str, cap: usize) -> &str {
    if text.len() <= cap {
        return text;
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ProjectAccess, ProjectAttachment};
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn test_initial_prompt_never_leaks_worktree_path() {
        let mut task = Task::new("demo", "user-1", "Add a login button");
        task.worktree_path = Some("/repos/web/.isolated/demo".to_string());
        task.root_path = Some("/repos/web".to_string());

        let prompt = initial_prompt(&task);
        assert!(prompt.contains("Add a login button"));
        assert!(prompt.contains("Working directory: current directory (isolated branch)"));
        assert!(!prompt.contains(".isolated"));
        assert!(!prompt.contains("/repos/web"));
    }

    #[test]
    fn test_initial_prompt_project_blocks_are_delimited() {
        let mut task = Task::new("demo", "user-1", "Wire the SDK to the API");
        task.projects = vec![
            ProjectAttachment {
                name: "api".to_string(),
                path: "/repos/api".to_string(),
                access: ProjectAccess::Write,
                context: Some("REST backend".to_string()),
                extra: HashMap::new(),
            },
            ProjectAttachment {
                name: "sdk".to_string(),
                path: "/repos/sdk".to_string(),
                access: ProjectAccess::Read,
                context: None,
                extra: HashMap::new(),
            },
        ];
        task.project_context = Some("Shared auth layer".to_string());

        let prompt = initial_prompt(&task);
        assert!(prompt.contains("Project: api"));
        assert!(prompt.contains("Project: sdk"));
        assert!(prompt.contains("\n---\n"));
        assert!(prompt.contains("Shared auth layer"));
    }

    #[test]
    fn test_recovery_message_tags_roles_and_truncates() {
        let task_id = Uuid::new_v4();
        let long_content = "x".repeat(600);
        let interactions = vec![
            Interaction::user_request(task_id, "start"),
            Interaction::assistant_response(task_id, long_content),
        ];
        let message = recovery_message(&interactions);
        assert!(message.contains("[User]: start"));
        assert!(message.contains("[Assistant]: "));
        assert!(message.contains("..."));
        assert!(message.starts_with("=== RECOVERY MODE ==="));
    }

    #[test]
    fn test_extract_summary_prefers_labelled_section() {
        let response = "Lots of detail here.\n\nSummary: Added greet.py with a hi printer.\n\nMore text.";
        assert_eq!(extract_summary(response), "Added greet.py with a hi printer.");
    }

    #[test]
    fn test_extract_summary_falls_back_to_leading_text() {
        let response = "Short response without a labelled section.";
        assert_eq!(extract_summary(response), response);

        let long = "y".repeat(400);
        let summary = extract_summary(&long);
        assert!(summary.ends_with("..."));
        assert!(summary.len() <= 303);
    }
}
