//! Task registry - last reported progress of every in-flight download

use std::collections::{BTreeMap, HashMap};

use crate::types::{TaskId, TaskKind};

/// Progress of one task as seen by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskProgress {
    pub kind: TaskKind,
    /// 0.0 - 100.0
    pub percent: f32,
}

/// Read-only merged copy of both progress maps
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    entries: BTreeMap<TaskId, TaskProgress>,
}

impl ProgressSnapshot {
    pub fn get(&self, id: TaskId) -> Option<TaskProgress> {
        self.entries.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaskId, TaskProgress)> + '_ {
        self.entries.iter().map(|(id, p)| (*id, *p))
    }

    /// Task of `kind` that is furthest along, if any.
    pub fn fastest(&self, kind: TaskKind) -> Option<(TaskId, f32)> {
        self.iter()
            .filter(|(_, p)| p.kind == kind)
            .map(|(id, p)| (id, p.percent))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Two independent progress maps keyed by task id.
///
/// An update for an id that is not registered is dropped, so a late progress
/// report can never resurrect a task that was already removed.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    view: HashMap<TaskId, f32>,
    export: HashMap<TaskId, f32>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_mut(&mut self, kind: TaskKind) -> &mut HashMap<TaskId, f32> {
        match kind {
            TaskKind::View => &mut self.view,
            TaskKind::Export => &mut self.export,
        }
    }

    pub fn register(&mut self, id: TaskId, kind: TaskKind) {
        self.map_mut(kind).insert(id, 0.0);
    }

    /// Record the latest progress. Returns false if `id` is unknown.
    pub fn update(&mut self, id: TaskId, percent: f32) -> bool {
        let percent = percent.clamp(0.0, 100.0);
        if let Some(slot) = self.view.get_mut(&id).or_else(|| self.export.get_mut(&id)) {
            *slot = percent;
            true
        } else {
            false
        }
    }

    /// Remove a task. Removing an absent id is a no-op.
    pub fn remove(&mut self, id: TaskId) -> Option<TaskKind> {
        if self.view.remove(&id).is_some() {
            Some(TaskKind::View)
        } else if self.export.remove(&id).is_some() {
            Some(TaskKind::Export)
        } else {
            None
        }
    }

    pub fn count(&self, kind: TaskKind) -> usize {
        match kind {
            TaskKind::View => self.view.len(),
            TaskKind::Export => self.export.len(),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let view = self
            .view
            .iter()
            .map(|(id, p)| (*id, TaskProgress { kind: TaskKind::View, percent: *p }));
        let export = self
            .export
            .iter()
            .map(|(id, p)| (*id, TaskProgress { kind: TaskKind::Export, percent: *p }));
        ProgressSnapshot {
            entries: view.chain(export).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_is_last_write_wins() {
        let mut registry = TaskRegistry::new();
        registry.register(TaskId(1), TaskKind::View);
        assert!(registry.update(TaskId(1), 40.0));
        assert!(registry.update(TaskId(1), 25.0));
        assert_eq!(registry.snapshot().get(TaskId(1)).unwrap().percent, 25.0);
        assert!(registry.update(TaskId(1), 250.0));
        assert_eq!(registry.snapshot().get(TaskId(1)).unwrap().percent, 100.0);
    }

    #[test]
    fn test_remove_is_idempotent_and_wins() {
        let mut registry = TaskRegistry::new();
        registry.register(TaskId(1), TaskKind::Export);
        assert_eq!(registry.remove(TaskId(1)), Some(TaskKind::Export));
        assert_eq!(registry.remove(TaskId(1)), None);
        assert_eq!(registry.remove(TaskId(99)), None);

        assert!(!registry.update(TaskId(1), 50.0));
        assert_eq!(registry.count(TaskKind::Export), 0);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_merges_both_maps() {
        let mut registry = TaskRegistry::new();
        registry.register(TaskId(1), TaskKind::View);
        registry.register(TaskId(2), TaskKind::View);
        registry.register(TaskId(3), TaskKind::Export);
        registry.update(TaskId(2), 80.0);
        registry.update(TaskId(3), 90.0);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(registry.count(TaskKind::View), 2);
        assert_eq!(registry.count(TaskKind::Export), 1);
        assert_eq!(snapshot.fastest(TaskKind::View), Some((TaskId(2), 80.0)));
        assert_eq!(snapshot.get(TaskId(3)).unwrap().kind, TaskKind::Export);
    }
}
