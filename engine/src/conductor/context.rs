//! Context Assembler
//!
//! Packs what an agent needs for one plan task into the message list it is
//! dispatched with: a system message describing the task and the plan,
//! followed by as much recent conversation as fits the character budget.

use sdk::types::{Message, MessageRole};

use crate::plan::{Plan, PlanTask, TaskStatus};

/// Default character budget for replayed conversation
pub const DEFAULT_HISTORY_BUDGET: usize = 8_000;

/// Longest dependency note carried into a prompt
const MAX_DEPENDENCY_NOTE: usize = 1_000;

pub struct ContextAssembler {
    history_budget: usize,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_BUDGET)
    }
}

impl ContextAssembler {
    pub fn new(history_budget: usize) -> Self {
        Self { history_budget }
    }

    /// Build the messages for dispatching `task`
    pub fn assemble(
        &self,
        plan: &Plan,
        task: &PlanTask,
        goal: &str,
        conversation: &[Message],
    ) -> Vec<Message> {
        let mut sys_prompt = format!("Goal: {}\n\nYour task ({}): {}\n", goal, task.id, task.description);

        if let Some(deliverable) = &task.deliverable {
            sys_prompt.push_str(&format!("Deliverable: {}\n", deliverable));
        }
        if !task.success_criteria.is_empty() {
            sys_prompt.push_str("Success criteria:\n");
            for criterion in &task.success_criteria {
                sys_prompt.push_str(&format!("- {}\n", criterion));
            }
        }

        let dependency_notes: Vec<(&str, &str)> = task
            .dependencies
            .iter()
            .filter_map(|id| plan.task(id))
            .filter(|dep| dep.status == TaskStatus::Completed)
            .flat_map(|dep| dep.notes.iter().map(move |n| (dep.id.as_str(), n.as_str())))
            .collect();
        if !dependency_notes.is_empty() {
            sys_prompt.push_str("\n--- Completed Dependencies ---\n");
            for (id, note) in dependency_notes {
                sys_prompt.push_str(&format!("[{}] {}\n", id, truncate(note, MAX_DEPENDENCY_NOTE)));
            }
        }

        // Handoff tasks carry the previous agent's result in their own notes
        if !task.notes.is_empty() {
            sys_prompt.push_str("\n--- Task Notes ---\n");
            for note in &task.notes {
                sys_prompt.push_str(note);
                sys_prompt.push('\n');
            }
        }

        sys_prompt.push_str("\n--- Plan ---\n");
        sys_prompt.push_str(&plan.outline());

        let mut final_messages = vec![Message::system(sys_prompt)];

        // Newest to oldest until the budget runs out
        let mut used = 0;
        let mut history_to_add = Vec::new();
        for msg in conversation
            .iter()
            .rev()
            .filter(|m| m.role != MessageRole::System)
        {
            let cost = msg.content.len();
            if used + cost > self.history_budget {
                break;
            }
            used += cost;
            history_to_add.push(msg.clone());
        }
        history_to_add.reverse();
        final_messages.extend(history_to_add);

        if final_messages.len() == 1 {
            final_messages.push(Message::user(task.description.clone()));
        }
        final_messages
    }
}

/// Cut `text` to at most `max` characters, marking the cut
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}
