//! Weighted undirected document similarity graph.
//!
//! Edges connect documents whose vectors exceed the configured cosine
//! threshold at ingest time. The graph is rebuilt wholesale at the end of
//! each ingest and persisted as a single file. Query-time expansion is a
//! multi-source BFS that ranks reachable documents by the product of edge
//! weights along the best path.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::fsutil;

/// An undirected edge. Endpoints are kept lexicographically ordered
/// (`a < b`) so the edge set has a canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub a: String,
    pub b: String,
    pub weight: f32,
}

impl Edge {
    pub fn new(x: impl Into<String>, y: impl Into<String>, weight: f32) -> Self {
        let (x, y) = (x.into(), y.into());
        if x <= y {
            Self { a: x, b: y, weight }
        } else {
            Self { a: y, b: x, weight }
        }
    }
}

/// A document reached by graph expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct Expanded {
    pub id: String,
    /// Immediate predecessor on the best path.
    pub via: String,
    /// Product of edge weights along the best path.
    pub weight: f32,
    /// Hop count from the nearest seed.
    pub depth: usize,
}

/// In-memory adjacency with bulk replacement and persistence.
#[derive(Debug, Default)]
pub struct SimilarityGraph {
    adjacency: HashMap<String, Vec<(String, f32)>>,
    edges: Vec<Edge>,
}

#[derive(Serialize, Deserialize)]
struct GraphSnapshot {
    version: u32,
    edges: Vec<Edge>,
}

const GRAPH_VERSION: u32 = 1;

impl SimilarityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole edge set. The canonical order (sorted by
    /// endpoints) is established here, so saves are deterministic.
    pub fn replace_all(&mut self, mut edges: Vec<Edge>) {
        edges = edges.into_iter().map(|e| Edge::new(e.a, e.b, e.weight)).collect();
        edges.sort_by(|x, y| x.a.cmp(&y.a).then_with(|| x.b.cmp(&y.b)));
        edges.dedup_by(|x, y| x.a == y.a && x.b == y.b);

        self.adjacency.clear();
        for edge in &edges {
            self.adjacency
                .entry(edge.a.clone())
                .or_default()
                .push((edge.b.clone(), edge.weight));
            self.adjacency
                .entry(edge.b.clone())
                .or_default()
                .push((edge.a.clone(), edge.weight));
        }
        for neighbors in self.adjacency.values_mut() {
            neighbors.sort_by(|x, y| x.0.cmp(&y.0));
        }
        self.edges = edges;
    }

    pub fn neighbors(&self, id: &str) -> &[(String, f32)] {
        self.adjacency.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn clear(&mut self) {
        self.adjacency.clear();
        self.edges.clear();
    }

    /// Multi-source BFS from `seeds` along edges with weight >=
    /// `min_weight`, up to `max_depth` hops.
    ///
    /// When a node is reachable over several paths the best one wins:
    /// highest weight product, then fewer hops, then lexicographically
    /// smaller `via`. Seeds are not included in the output.
    pub fn expand(
        &self,
        seeds: &[String],
        min_weight: f32,
        max_depth: usize,
    ) -> Vec<Expanded> {
        let seed_set: HashSet<&str> = seeds.iter().map(String::as_str).collect();

        // Best known (weight, depth, via) per reached node.
        let mut best: HashMap<String, (f32, usize, String)> = HashMap::new();
        // Deterministic frontier order keeps tie-breaking stable.
        let mut frontier: BTreeSet<String> = seeds.iter().cloned().collect();

        for depth in 1..=max_depth {
            let mut next: BTreeSet<String> = BTreeSet::new();

            for node in &frontier {
                let path_weight = if seed_set.contains(node.as_str()) {
                    1.0
                } else {
                    match best.get(node) {
                        Some((w, d, _)) if *d == depth - 1 => *w,
                        _ => continue,
                    }
                };

                for (neighbor, edge_weight) in self.neighbors(node) {
                    if *edge_weight < min_weight || seed_set.contains(neighbor.as_str()) {
                        continue;
                    }
                    let candidate = (path_weight * edge_weight, depth, node.clone());
                    match best.get(neighbor) {
                        Some(current) if !better(&candidate, current) => {}
                        _ => {
                            best.insert(neighbor.clone(), candidate);
                            next.insert(neighbor.clone());
                        }
                    }
                }
            }

            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        let mut results: Vec<Expanded> = best
            .into_iter()
            .map(|(id, (weight, depth, via))| Expanded {
                id,
                via,
                weight,
                depth,
            })
            .collect();
        results.sort_by(|x, y| {
            y.weight
                .partial_cmp(&x.weight)
                .unwrap_or(Ordering::Equal)
                .then_with(|| x.depth.cmp(&y.depth))
                .then_with(|| x.id.cmp(&y.id))
        });
        results
    }

    /// Edges whose both endpoints are in `nodes`.
    pub fn induced_edges(&self, nodes: &HashSet<String>) -> Vec<Edge> {
        self.edges
            .iter()
            .filter(|e| nodes.contains(&e.a) && nodes.contains(&e.b))
            .cloned()
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = GraphSnapshot {
            version: GRAPH_VERSION,
            edges: self.edges.clone(),
        };
        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| IndexError::Store(format!("serialize graph: {e}")))?;
        fsutil::write_atomic(path, &bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = std::fs::read(path)?;
        let snapshot: GraphSnapshot =
            bincode::deserialize(&bytes).map_err(|e| IndexError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let mut graph = Self::new();
        graph.replace_all(snapshot.edges);
        Ok(graph)
    }
}

/// Ordering for path candidates: higher weight, then fewer hops, then
/// lexicographically smaller predecessor.
fn better(candidate: &(f32, usize, String), current: &(f32, usize, String)) -> bool {
    match candidate.0.partial_cmp(&current.0) {
        Some(Ordering::Greater) => true,
        Some(Ordering::Less) => false,
        _ => match candidate.1.cmp(&current.1) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => candidate.2 < current.2,
        },
    }
}

/// Compute all edges above `threshold` from a set of unit vectors.
///
/// Blocked O(N^2/2) scan over document vectors; used for the ingest-time
/// graph rebuild.
pub fn pairs_above(
    vectors: &[(String, Vec<f32>)],
    threshold: f32,
) -> Vec<Edge> {
    let mut edges = Vec::new();
    for i in 0..vectors.len() {
        for j in (i + 1)..vectors.len() {
            let cosine = dot(&vectors[i].1, &vectors[j].1);
            if cosine >= threshold {
                edges.push(Edge::new(
                    vectors[i].0.clone(),
                    vectors[j].0.clone(),
                    cosine,
                ));
            }
        }
    }
    edges
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> SimilarityGraph {
        let mut graph = SimilarityGraph::new();
        graph.replace_all(vec![
            Edge::new("a", "b", 0.9),
            Edge::new("b", "c", 0.8),
            Edge::new("a", "c", 0.4),
        ]);
        graph
    }

    #[test]
    fn test_edges_canonicalized() {
        let mut graph = SimilarityGraph::new();
        graph.replace_all(vec![Edge::new("z", "a", 0.7)]);
        let edge = &graph.edges()[0];
        assert_eq!(edge.a, "a");
        assert_eq!(edge.b, "z");
    }

    #[test]
    fn test_replace_all_clears_previous() {
        let mut graph = triangle();
        graph.replace_all(vec![Edge::new("x", "y", 0.75)]);
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.neighbors("a").is_empty());
    }

    #[test]
    fn test_expand_multiplies_path_weights() {
        // a-b 0.9, b-c 0.8, a-c 0.4; expanding from a with min weight 0.5
        // must reach c through b at 0.72, not directly at 0.4.
        let graph = triangle();
        let expanded = graph.expand(&["a".to_string()], 0.5, 2);

        assert_eq!(expanded.len(), 2);
        let c = expanded.iter().find(|e| e.id == "c").unwrap();
        assert_eq!(c.via, "b");
        assert_eq!(c.depth, 2);
        assert!((c.weight - 0.72).abs() < 1e-6);
    }

    #[test]
    fn test_expand_excludes_seeds() {
        let graph = triangle();
        let expanded = graph.expand(&["a".to_string(), "b".to_string()], 0.0, 2);
        assert!(expanded.iter().all(|e| e.id == "c"));
    }

    #[test]
    fn test_expand_depth_limits_reach() {
        let mut graph = SimilarityGraph::new();
        graph.replace_all(vec![
            Edge::new("a", "b", 0.9),
            Edge::new("b", "c", 0.9),
            Edge::new("c", "d", 0.9),
        ]);

        let depth1 = graph.expand(&["a".to_string()], 0.5, 1);
        assert_eq!(depth1.len(), 1);

        let depth2 = graph.expand(&["a".to_string()], 0.5, 2);
        assert_eq!(depth2.len(), 2);

        let depth3 = graph.expand(&["a".to_string()], 0.5, 3);
        assert_eq!(depth3.len(), 3);
    }

    #[test]
    fn test_expand_monotone_in_depth() {
        let mut graph = SimilarityGraph::new();
        graph.replace_all(vec![
            Edge::new("a", "b", 0.9),
            Edge::new("b", "c", 0.8),
            Edge::new("c", "d", 0.7),
            Edge::new("a", "e", 0.6),
        ]);

        let mut previous: HashSet<String> = HashSet::new();
        for depth in 1..=4 {
            let ids: HashSet<String> = graph
                .expand(&["a".to_string()], 0.5, depth)
                .into_iter()
                .map(|e| e.id)
                .collect();
            assert!(previous.is_subset(&ids));
            previous = ids;
        }
    }

    #[test]
    fn test_expand_min_weight_filters_edges() {
        let graph = triangle();
        let expanded = graph.expand(&["c".to_string()], 0.85, 2);
        // Only c-b (0.8) and c-a (0.4) leave c; neither passes 0.85.
        assert!(expanded.is_empty());
    }

    #[test]
    fn test_expand_tie_prefers_smaller_via() {
        // d is reachable from both b and c at the same product and depth.
        let mut graph = SimilarityGraph::new();
        graph.replace_all(vec![
            Edge::new("a", "b", 0.8),
            Edge::new("a", "c", 0.8),
            Edge::new("b", "d", 0.8),
            Edge::new("c", "d", 0.8),
        ]);

        let expanded = graph.expand(&["a".to_string()], 0.5, 2);
        let d = expanded.iter().find(|e| e.id == "d").unwrap();
        assert_eq!(d.via, "b");
    }

    #[test]
    fn test_expand_handles_cycles() {
        let mut graph = SimilarityGraph::new();
        graph.replace_all(vec![
            Edge::new("a", "b", 0.9),
            Edge::new("b", "c", 0.9),
            Edge::new("c", "a", 0.9),
        ]);
        let expanded = graph.expand(&["a".to_string()], 0.5, 4);
        assert_eq!(expanded.len(), 2);
    }

    #[test]
    fn test_induced_edges() {
        let graph = triangle();
        let nodes: HashSet<String> =
            ["a", "b"].iter().map(|s| s.to_string()).collect();
        let induced = graph.induced_edges(&nodes);
        assert_eq!(induced.len(), 1);
        assert_eq!(induced[0].a, "a");
        assert_eq!(induced[0].b, "b");
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("graph.bin");

        let graph = triangle();
        graph.save(&path).unwrap();

        let loaded = SimilarityGraph::load(&path).unwrap();
        assert_eq!(loaded.edge_count(), 3);
        assert_eq!(loaded.neighbors("a").len(), 2);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = SimilarityGraph::load(&tmp.path().join("absent.bin")).unwrap();
        assert_eq!(loaded.edge_count(), 0);
    }

    #[test]
    fn test_pairs_above_threshold() {
        let vectors = vec![
            ("a".to_string(), vec![1.0, 0.0]),
            ("b".to_string(), vec![0.8, 0.6]),
            ("c".to_string(), vec![0.0, 1.0]),
        ];
        let edges = pairs_above(&vectors, 0.7);
        assert_eq!(edges.len(), 1);
        assert_eq!((edges[0].a.as_str(), edges[0].b.as_str()), ("a", "b"));
        assert!((edges[0].weight - 0.8).abs() < 1e-6);
    }
}
