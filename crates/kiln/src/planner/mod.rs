//! Task graph. Dependencies in `after` name a task id or a provide token; a
//! trailing `?` makes the dependency optional (dropped when nothing provides it).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    pub after: Vec<String>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::config(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Drops tasks `keep` rejects. Optional dependencies on them fall away;
    /// required ones surface on the next `validate`.
    pub fn retain(&mut self, keep: impl Fn(&Task) -> bool) {
        self.tasks.retain(|_, t| keep(t));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::config(format!(
                        "provide token '{p}' is produced by both '{existing}' and '{id}'"
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Resolved `(dependency, dependent)` pairs, deduplicated.
    fn edges(&self) -> Result<BTreeSet<(&str, &str)>> {
        let provides = self.provides_index()?;
        let mut out = BTreeSet::new();
        for (id, task) in &self.tasks {
            for dep in &task.after {
                let (name, optional) = match dep.strip_suffix('?') {
                    Some(d) => (d, true),
                    None => (dep.as_str(), false),
                };
                let resolved = match self.tasks.get_key_value(name) {
                    Some((k, _)) => Some(k.as_str()),
                    None => provides.get(name).copied(),
                };
                match resolved {
                    Some(dep_id) if dep_id == id => {
                        return Err(Error::config(format!("task '{id}' depends on itself")));
                    }
                    Some(dep_id) => {
                        out.insert((dep_id, id.as_str()));
                    }
                    None if optional => {}
                    None => {
                        return Err(Error::config(format!(
                            "task '{id}' has unknown dependency '{dep}'"
                        )));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Checks every dependency resolves and the graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        self.ordered().map(|_| ())
    }

    /// Topological order; ties break by task id so the order is stable.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let edges = self.edges()?;
        let mut incoming: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for &(from, to) in &edges {
            outgoing.entry(from).or_default().push(to);
            if let Some(n) = incoming.get_mut(to) {
                *n += 1;
            }
        }

        let mut ready: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out = Vec::with_capacity(self.tasks.len());
        while let Some(id) = ready.pop_front() {
            if let Some(task) = self.tasks.get(id) {
                out.push(task);
            }
            for &next in outgoing.get(id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(n) = incoming.get_mut(next) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push_back(next);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let stuck: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::config(format!(
                "task graph contains a cycle through: {}",
                stuck.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let edges = self.edges()?;
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (from, to) in edges {
            out.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
        }
        out.push_str("}\n");
        Ok(out)
    }
}
