use std::collections::{HashMap, HashSet};

use crate::{BoxStep, DagError};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Checks a step list for duplicate ids, unknown dependencies and cycles.
///
/// Runs once, synchronously, before any scheduling; O(V+E) and never
/// mutates the step definitions.
pub fn validate(steps: &[BoxStep]) -> Result<(), DagError> {
    let mut ids = HashSet::new();
    for step in steps {
        let id = step.id();
        if id.is_empty() {
            return Err(DagError::EmptyStepId);
        }
        if !ids.insert(id.to_string()) {
            return Err(DagError::DuplicateStepId(id.to_string()));
        }
    }

    let deps_by_id: HashMap<String, Vec<String>> = steps
        .iter()
        .map(|s| (s.id().to_string(), s.deps()))
        .collect();

    for step in steps {
        for dep in step.deps() {
            if !deps_by_id.contains_key(&dep) {
                return Err(DagError::UnknownDependency {
                    step: step.id().to_string(),
                    dep,
                });
            }
        }
    }

    // DFS coloring: a back-edge to a gray node is a cycle.
    fn visit(
        id: &str,
        deps_by_id: &HashMap<String, Vec<String>>,
        colors: &mut HashMap<String, Color>,
    ) -> Result<(), DagError> {
        match colors.get(id).copied().unwrap_or(Color::White) {
            Color::Gray => return Err(DagError::CycleDetected(id.to_string())),
            Color::Black => return Ok(()),
            Color::White => {}
        }

        colors.insert(id.to_string(), Color::Gray);
        if let Some(deps) = deps_by_id.get(id) {
            for dep in deps {
                visit(dep, deps_by_id, colors)?;
            }
        }
        colors.insert(id.to_string(), Color::Black);
        Ok(())
    }

    let mut colors = HashMap::new();
    for step in steps {
        visit(step.id(), &deps_by_id, &mut colors)?;
    }

    Ok(())
}
