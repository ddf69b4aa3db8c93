//! Dependency-DAG scheduling primitives.
//!
//! Pure functions over chunk snapshots: the caller owns the rolling
//! `completed` / `running` / `failed` sets and decides how many ready chunks
//! to dispatch. Dependencies are validated acyclic at write time, so the
//! readiness computation can assume acyclicity.

use crate::types::{Chunk, ChunkStatus, Id};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("chunk {0} depends on itself")]
    SelfDependency(Id),
    #[error("chunk {chunk} depends on unknown chunk {dependency}")]
    UnknownDependency { chunk: Id, dependency: Id },
    #[error("dependency cycle involving chunk {0}")]
    Cycle(Id),
}

pub type Result<T> = std::result::Result<T, DagError>;

/// Compute the chunks that can be dispatched now.
///
/// A chunk is ready iff it is not already tracked in any of the rolling sets,
/// its status permits (re-)execution, and every dependency is completed.
/// Successful chunks are skipped so a second run-all on a partially completed
/// spec only runs the remainder. Results are ordered by `order` ascending.
pub fn ready<'a>(
    chunks: &'a [Chunk],
    completed: &HashSet<Id>,
    running: &HashSet<Id>,
    failed: &HashSet<Id>,
) -> Vec<&'a Chunk> {
    let mut out: Vec<&Chunk> = chunks
        .iter()
        .filter(|chunk| {
            !completed.contains(&chunk.id)
                && !running.contains(&chunk.id)
                && !failed.contains(&chunk.id)
        })
        .filter(|chunk| {
            matches!(
                chunk.status,
                ChunkStatus::Pending | ChunkStatus::Failed | ChunkStatus::Cancelled
            )
        })
        .filter(|chunk| chunk.dependencies.iter().all(|dep| completed.contains(dep)))
        .collect();

    out.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
    out
}

/// Validate that a dependency assignment keeps the spec's graph acyclic.
///
/// `proposed` replaces the dependency list of `chunk_id` within the snapshot;
/// pass the chunk's current dependencies to validate the stored graph as-is.
/// Dependencies must reference chunks in the same snapshot.
pub fn validate_dependencies(chunks: &[Chunk], chunk_id: &Id, proposed: &[Id]) -> Result<()> {
    let known: HashSet<&Id> = chunks.iter().map(|c| &c.id).collect();

    for dep in proposed {
        if dep == chunk_id {
            return Err(DagError::SelfDependency(chunk_id.clone()));
        }
        if !known.contains(dep) {
            return Err(DagError::UnknownDependency {
                chunk: chunk_id.clone(),
                dependency: dep.clone(),
            });
        }
    }

    // Kahn's algorithm over the graph with the proposed edge set substituted.
    let deps_of = |c: &Chunk| -> Vec<Id> {
        if c.id == *chunk_id {
            proposed.to_vec()
        } else {
            c.dependencies.clone()
        }
    };

    let mut in_degree: HashMap<&Id, usize> = chunks.iter().map(|c| (&c.id, 0)).collect();
    let mut dependents: HashMap<Id, Vec<&Id>> = HashMap::new();
    for chunk in chunks {
        for dep in deps_of(chunk) {
            *in_degree.entry(&chunk.id).or_default() += 1;
            dependents.entry(dep).or_default().push(&chunk.id);
        }
    }

    let mut queue: Vec<&Id> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop() {
        visited += 1;
        if let Some(children) = dependents.get(id) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(*child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(*child);
                    }
                }
            }
        }
    }

    if visited == chunks.len() {
        Ok(())
    } else {
        Err(DagError::Cycle(chunk_id.clone()))
    }
}

/// Longest-path layering for DAG display.
///
/// A node's layer is `1 + max(layer of its dependencies)`; roots sit at
/// layer 0. Within a layer, chunks are ordered by `order` ascending.
pub fn layers(chunks: &[Chunk]) -> Vec<Vec<&Chunk>> {
    let by_id: HashMap<&Id, &Chunk> = chunks.iter().map(|c| (&c.id, c)).collect();
    let mut memo: HashMap<&Id, usize> = HashMap::new();

    fn layer_of<'a>(
        chunk: &'a Chunk,
        by_id: &HashMap<&'a Id, &'a Chunk>,
        memo: &mut HashMap<&'a Id, usize>,
    ) -> usize {
        if let Some(layer) = memo.get(&chunk.id) {
            return *layer;
        }
        let layer = chunk
            .dependencies
            .iter()
            .filter_map(|dep| by_id.get(dep).copied())
            .map(|dep| layer_of(dep, by_id, memo) + 1)
            .max()
            .unwrap_or(0);
        memo.insert(&chunk.id, layer);
        layer
    }

    let mut max_layer = 0;
    for chunk in chunks {
        max_layer = max_layer.max(layer_of(chunk, &by_id, &mut memo));
    }

    let mut out: Vec<Vec<&Chunk>> = vec![Vec::new(); max_layer + 1];
    for chunk in chunks {
        out[memo[&chunk.id]].push(chunk);
    }
    for layer in &mut out {
        layer.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
    }
    if chunks.is_empty() {
        out.clear();
    }
    out
}

/// The longest dependency chain through the graph, root first.
///
/// Ties at each step break toward the smaller `order`. Purely informational.
pub fn critical_path(chunks: &[Chunk]) -> Vec<Id> {
    let by_id: HashMap<&Id, &Chunk> = chunks.iter().map(|c| (&c.id, c)).collect();
    let mut memo: HashMap<&Id, usize> = HashMap::new();

    fn depth_of<'a>(
        chunk: &'a Chunk,
        by_id: &HashMap<&'a Id, &'a Chunk>,
        memo: &mut HashMap<&'a Id, usize>,
    ) -> usize {
        if let Some(depth) = memo.get(&chunk.id) {
            return *depth;
        }
        let depth = chunk
            .dependencies
            .iter()
            .filter_map(|dep| by_id.get(dep).copied())
            .map(|dep| depth_of(dep, by_id, memo) + 1)
            .max()
            .unwrap_or(1);
        memo.insert(&chunk.id, depth);
        depth
    }

    // Deepest terminal node, tie-broken by order.
    let Some(mut current) = chunks
        .iter()
        .max_by(|a, b| {
            depth_of(a, &by_id, &mut memo)
                .cmp(&depth_of(b, &by_id, &mut memo))
                .then_with(|| b.order.cmp(&a.order))
        })
        .map(|c| &c.id)
    else {
        return Vec::new();
    };

    let mut path = vec![by_id[current].id.clone()];
    loop {
        let chunk = by_id[current];
        let next = chunk
            .dependencies
            .iter()
            .filter_map(|dep| by_id.get(dep).copied())
            .max_by(|a, b| {
                memo[&a.id]
                    .cmp(&memo[&b.id])
                    .then_with(|| b.order.cmp(&a.order))
            });
        match next {
            Some(dep) => {
                path.push(dep.id.clone());
                current = &dep.id;
            }
            None => break,
        }
    }

    path.reverse();
    path
}
