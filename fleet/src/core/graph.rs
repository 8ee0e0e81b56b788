//! Dependency graph readiness and cycle detection over work items.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::model::{Violation, WorkItem, WorkItemStatus};

/// Index work items by id.
pub fn index_items(items: &[WorkItem]) -> HashMap<&str, &WorkItem> {
    items.iter().map(|item| (item.id.as_str(), item)).collect()
}

/// True iff every dependency of `item` is `done`. Empty dependencies are
/// always ready.
///
/// Dependency ids that do not resolve are reported as violations instead of
/// being treated as satisfied.
pub fn is_ready(item: &WorkItem, all_items: &[WorkItem]) -> Result<bool, Vec<Violation>> {
    let index = index_items(all_items);
    let missing = missing_dependencies(item, &index);
    if !missing.is_empty() {
        return Err(missing);
    }
    Ok(item.dependencies.iter().all(|dep| {
        index
            .get(dep.as_str())
            .is_some_and(|found| found.status == WorkItemStatus::Done)
    }))
}

/// Walk dependency edges from `item_id` and report whether the walk re-enters
/// a node on the current path.
///
/// A self-dependency is a one-node cycle. Unknown ids are skipped here; they
/// are reported by [`validate_dependencies`].
pub fn detect_cycle(item_id: &str, all_items: &[WorkItem]) -> bool {
    let index = index_items(all_items);
    let mut on_stack = HashSet::new();
    let mut visited = HashSet::new();
    walk_for_cycle(item_id, &index, &mut on_stack, &mut visited)
}

fn walk_for_cycle<'a>(
    id: &'a str,
    index: &HashMap<&'a str, &'a WorkItem>,
    on_stack: &mut HashSet<&'a str>,
    visited: &mut HashSet<&'a str>,
) -> bool {
    if on_stack.contains(id) {
        return true;
    }
    if visited.contains(id) {
        return false;
    }
    let Some(&item) = index.get(id) else {
        return false;
    };

    on_stack.insert(id);
    for dep in &item.dependencies {
        if walk_for_cycle(dep.as_str(), index, on_stack, visited) {
            return true;
        }
    }
    on_stack.remove(id);
    visited.insert(id);
    false
}

/// Every elementary cycle, each reported once.
///
/// Cycles are enumerated from each start id in sorted order, walking only
/// through ids greater than the start, so every cycle comes out rotated to
/// its smallest id. No node is pruned across starts: a cycle that re-enters
/// an already explored node through a second parent is still found.
pub fn find_cycles(all_items: &[WorkItem]) -> Vec<Vec<String>> {
    let index = index_items(all_items);
    let mut starts: Vec<&str> = index.keys().copied().collect();
    starts.sort_unstable();

    let mut found = BTreeSet::new();
    for start in starts {
        let mut path = vec![start];
        collect_cycles(start, start, &index, &mut path, &mut found);
    }
    found.into_iter().collect()
}

fn collect_cycles<'a>(
    start: &'a str,
    id: &'a str,
    index: &HashMap<&'a str, &'a WorkItem>,
    path: &mut Vec<&'a str>,
    found: &mut BTreeSet<Vec<String>>,
) {
    let Some(&item) = index.get(id) else {
        return;
    };
    for dep in &item.dependencies {
        let dep = dep.as_str();
        if dep == start {
            found.insert(path.iter().map(|on_path| (*on_path).to_string()).collect());
            continue;
        }
        if dep < start || path.contains(&dep) {
            continue;
        }
        path.push(dep);
        collect_cycles(start, dep, index, path, found);
        path.pop();
    }
}

/// Validate the dependency edges of a set of work items in a single pass.
///
/// Reports every missing dependency and every cycle; never stops at the first
/// problem.
pub fn validate_dependencies(all_items: &[WorkItem]) -> Vec<Violation> {
    let index = index_items(all_items);
    let mut violations = Vec::new();
    for item in all_items {
        violations.extend(missing_dependencies(item, &index));
    }
    for cycle in find_cycles(all_items) {
        let mut rendered = cycle.clone();
        rendered.push(cycle[0].clone());
        violations.push(Violation::new(
            dependency_field(&cycle[0]),
            format!("circular dependency: {}", rendered.join(" -> ")),
        ));
    }
    violations
}

fn missing_dependencies(item: &WorkItem, index: &HashMap<&str, &WorkItem>) -> Vec<Violation> {
    item.dependencies
        .iter()
        .filter(|dep| !index.contains_key(dep.as_str()))
        .map(|dep| {
            Violation::new(
                dependency_field(&item.id),
                format!("dependency '{}' does not exist", dep),
            )
        })
        .collect()
}

fn dependency_field(item_id: &str) -> String {
    format!("work_items[{}].dependencies", item_id)
}

/// Items that list `item_id` as a dependency, sorted by id.
pub fn dependents_of<'a>(item_id: &str, all_items: &'a [WorkItem]) -> Vec<&'a WorkItem> {
    let mut dependents: Vec<&WorkItem> = all_items
        .iter()
        .filter(|item| item.dependencies.contains(item_id))
        .collect();
    dependents.sort_by(|a, b| a.id.cmp(&b.id));
    dependents
}

/// Recompute the informational `blocks` edges from `dependencies`.
pub fn derive_blocks(items: &mut [WorkItem]) {
    let mut inverse: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for item in &*items {
        for dep in &item.dependencies {
            inverse
                .entry(dep.clone())
                .or_default()
                .insert(item.id.clone());
        }
    }
    for item in items {
        item.blocks = inverse.remove(&item.id).unwrap_or_default();
    }
}
