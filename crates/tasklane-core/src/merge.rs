//! Sequence rewrites shared by the mutation client and the reconciler.

use tasklane_types::Task;

/// Puts `task` first and drops any other record carrying its id.
pub fn prepend_dedup(tasks: &[Task], task: Task) -> Vec<Task> {
    let mut next = Vec::with_capacity(tasks.len() + 1);
    let id = task.id.clone();
    next.push(task);
    next.extend(tasks.iter().filter(|t| t.id != id).cloned());
    next
}

/// Swaps the record with `task.id` in place. Unknown ids leave the sequence
/// unchanged, so a record removed locally is never brought back.
pub fn replace_by_id(tasks: &[Task], task: &Task) -> Vec<Task> {
    tasks
        .iter()
        .map(|t| if t.id == task.id { task.clone() } else { t.clone() })
        .collect()
}

pub fn remove_by_id(tasks: &[Task], task_id: &str) -> Vec<Task> {
    tasks.iter().filter(|t| t.id != task_id).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, label: &str) -> Task {
        Task {
            id: id.to_string(),
            label: label.to_string(),
            done: false,
            image: None,
            owner_id: "u1".to_string(),
        }
    }

    #[test]
    fn prepend_dedup_moves_existing_id_to_front() {
        let tasks = vec![task("a", "a"), task("b", "b"), task("c", "c")];
        let next = prepend_dedup(&tasks, task("b", "b2"));
        let ids: Vec<&str> = next.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(next[0].label, "b2");
    }

    #[test]
    fn replace_by_id_keeps_position() {
        let tasks = vec![task("a", "a"), task("b", "b"), task("c", "c")];
        let mut updated = task("b", "b");
        updated.done = true;
        let next = replace_by_id(&tasks, &updated);
        assert!(next[1].done);
        assert_eq!(next.len(), 3);
    }

    #[test]
    fn replace_by_id_ignores_unknown_id() {
        let tasks = vec![task("a", "a")];
        let next = replace_by_id(&tasks, &task("zz", "ghost"));
        assert_eq!(next, tasks);
    }

    #[test]
    fn remove_by_id_is_noop_for_missing_id() {
        let tasks = vec![task("a", "a")];
        assert_eq!(remove_by_id(&tasks, "missing"), tasks);
        assert!(remove_by_id(&tasks, "a").is_empty());
    }
}
