use crate::errors::TaskError;
use crate::model::{Task, TaskType};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Anything a [`TaskGroup`] can index by id and type.
pub trait Tracked {
    fn id(&self) -> &str;
    fn task_type(&self) -> TaskType;
}

impl Tracked for Task {
    fn id(&self) -> &str {
        Task::id(self)
    }

    fn task_type(&self) -> TaskType {
        Task::task_type(self)
    }
}

/// Tasks keyed by id and partitioned by type. Ids are unique across partitions.
///
/// Not synchronized; owners wrap it in their own lock.
#[derive(Debug, Clone)]
pub struct TaskGroup<T> {
    items: HashMap<String, T>,
    partitions: BTreeMap<TaskType, BTreeSet<String>>,
}

impl<T> Default for TaskGroup<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            partitions: BTreeMap::new(),
        }
    }
}

impl<T: Tracked> TaskGroup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: T) -> Result<(), TaskError> {
        if self.items.contains_key(item.id()) {
            return Err(TaskError::Duplicate(item.id().to_string()));
        }
        let id = item.id().to_string();
        self.partitions
            .entry(item.task_type())
            .or_default()
            .insert(id.clone());
        self.items.insert(id, item);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let item = self.items.remove(id)?;
        if let Some(partition) = self.partitions.get_mut(&item.task_type()) {
            partition.remove(id);
        }
        Some(item)
    }

    /// Removes every item matching `pred`, returning them by type, then id.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let doomed: Vec<String> = self
            .partitions
            .values()
            .flatten()
            .filter(|id| self.items.get(id.as_str()).is_some_and(&mut pred))
            .cloned()
            .collect();
        doomed.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.items.get_mut(id)
    }

    pub fn of_type(&self, task_type: TaskType) -> impl Iterator<Item = &T> {
        self.partitions
            .get(&task_type)
            .into_iter()
            .flatten()
            .filter_map(|id| self.items.get(id))
    }

    pub fn count_of(&self, task_type: TaskType) -> usize {
        self.partitions.get(&task_type).map_or(0, BTreeSet::len)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Build, JobCommand};

    fn single(id: &str) -> Task {
        let mut task = Task::new(id, "sn", "vsn").expect("task");
        task.bind(JobCommand::Single(Build::new(vec!["true".to_string()], "./out")));
        task.transform().expect("transform")
    }

    #[test]
    fn ids_are_unique_across_types() {
        let mut group = TaskGroup::new();
        group.add(single("a")).expect("add single");
        group
            .add(Task::new("b", "sn", "vsn").expect("task"))
            .expect("add bare");

        let error = group
            .add(Task::new("a", "sn", "vsn").expect("task"))
            .expect_err("duplicate id");
        assert_eq!(error, TaskError::Duplicate("a".to_string()));
        assert_eq!(group.len(), 2);
        assert_eq!(group.count_of(TaskType::Single), 1);
        assert_eq!(group.count_of(TaskType::Bare), 1);
    }

    #[test]
    fn remove_updates_partitions_and_index() {
        let mut group = TaskGroup::new();
        for id in ["a", "b", "c"] {
            group.add(single(id)).expect("add");
        }

        assert_eq!(group.remove("b").map(|t| t.id().to_string()), Some("b".to_string()));
        assert!(group.remove("b").is_none());
        assert!(!group.contains("b"));

        let gone = group.remove_where(|task| task.id() == "c");
        assert_eq!(gone.len(), 1);
        assert_eq!(group.len(), 1);
        assert!(group.get("a").is_some());
        assert_eq!(group.of_type(TaskType::Super).count(), 0);
    }

    #[test]
    fn get_mut_reaches_stored_item() {
        let mut group = TaskGroup::new();
        group.add(single("a")).expect("add");
        group
            .get_mut("a")
            .expect("stored")
            .to_proc_state()
            .expect("to proc");
        assert_eq!(
            group.get("a").map(Task::state),
            Some(crate::model::TaskState::InProc)
        );
    }

    #[test]
    fn lookups_follow_removal_across_many_items() {
        let mut group = TaskGroup::new();
        for idx in 0..500 {
            group.add(single(&format!("t{idx}"))).expect("add");
        }
        group
            .add(Task::new("bare", "sn", "vsn").expect("task"))
            .expect("add bare");

        assert_eq!(group.count_of(TaskType::Single), 500);
        assert!(group.remove("t250").is_some());
        assert!(group.get("t250").is_none());
        assert_eq!(group.get("t499").map(|t| t.id()), Some("t499"));
        assert_eq!(group.count_of(TaskType::Single), 499);

        let odd = group.remove_where(|task| task.id().ends_with('1'));
        assert_eq!(odd.len(), 50);
        assert!(odd.iter().all(|task| task.task_type() == TaskType::Single));
        assert_eq!(group.len(), 450);
        assert_eq!(group.of_type(TaskType::Bare).map(|t| t.id()).collect::<Vec<_>>(), vec!["bare"]);
    }
}
