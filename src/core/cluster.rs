use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Undirected weighted "is-neighbor-of" graph. Similarity is not assumed to
/// be transitive, so groups are the connected components (single linkage).
#[derive(Debug, Default, Clone)]
pub struct SimilarityGraph {
    adjacency: BTreeMap<String, BTreeMap<String, f64>>,
}

impl SimilarityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an edge, keeping the higher weight when it already exists.
    /// Self-loops are ignored.
    pub fn add_edge(&mut self, a: &str, b: &str, score: f64) {
        if a == b {
            return;
        }
        for (from, to) in [(a, b), (b, a)] {
            let slot = self
                .adjacency
                .entry(from.to_string())
                .or_default()
                .entry(to.to_string())
                .or_insert(score);
            if score > *slot {
                *slot = score;
            }
        }
    }

    pub fn edge(&self, a: &str, b: &str) -> Option<f64> {
        self.adjacency.get(a).and_then(|n| n.get(b)).copied()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(|n| n.len()).sum::<usize>() / 2
    }

    /// Strongest edge from `node` to any member of `within`.
    pub fn strongest_edge(&self, node: &str, within: &BTreeSet<String>) -> Option<f64> {
        self.adjacency.get(node).and_then(|neighbors| {
            neighbors
                .iter()
                .filter(|(other, _)| within.contains(*other))
                .map(|(_, score)| *score)
                .reduce(f64::max)
        })
    }

    /// Connected components with at least two members. Members are sorted and
    /// components are ordered by their first member.
    pub fn components(&self) -> Vec<Vec<String>> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut components = Vec::new();

        for start in self.adjacency.keys() {
            if seen.contains(start.as_str()) {
                continue;
            }
            let mut component = Vec::new();
            let mut queue = VecDeque::from([start.as_str()]);
            seen.insert(start.as_str());

            while let Some(node) = queue.pop_front() {
                component.push(node.to_string());
                if let Some(neighbors) = self.adjacency.get(node) {
                    for next in neighbors.keys() {
                        if seen.insert(next.as_str()) {
                            queue.push_back(next.as_str());
                        }
                    }
                }
            }

            if component.len() > 1 {
                component.sort();
                components.push(component);
            }
        }

        components
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_linkage_chains() {
        let mut graph = SimilarityGraph::new();
        graph.add_edge("a", "b", 0.9);
        graph.add_edge("b", "c", 0.91);
        graph.add_edge("x", "y", 0.95);

        let components = graph.components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0], vec!["a", "b", "c"]);
        assert_eq!(components[1], vec!["x", "y"]);
        // a and c are grouped without a direct edge
        assert_eq!(graph.edge("a", "c"), None);
    }

    #[test]
    fn test_edge_keeps_max_weight() {
        let mut graph = SimilarityGraph::new();
        graph.add_edge("a", "b", 0.8);
        graph.add_edge("b", "a", 0.9);
        graph.add_edge("a", "b", 0.7);
        assert_eq!(graph.edge("a", "b"), Some(0.9));
        assert_eq!(graph.edge("b", "a"), Some(0.9));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_self_loop_ignored() {
        let mut graph = SimilarityGraph::new();
        graph.add_edge("a", "a", 1.0);
        assert!(graph.components().is_empty());
    }

    #[test]
    fn test_strongest_edge_within_group() {
        let mut graph = SimilarityGraph::new();
        graph.add_edge("a", "b", 0.86);
        graph.add_edge("a", "c", 0.97);
        graph.add_edge("a", "z", 0.99);

        let within: BTreeSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(graph.strongest_edge("a", &within), Some(0.97));
        assert_eq!(graph.strongest_edge("q", &within), None);
    }
}
