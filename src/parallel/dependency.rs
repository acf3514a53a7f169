//! Story dependency graph.
//!
//! Edges point from a dependency to the story that depends on it. Building
//! the graph validates it: duplicate ids, dangling references and cycles are
//! all rejected before anything executes.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::epic::{Epic, Story, StoryStatus};
use crate::error::{EngineError, EngineResult};

/// Validated dependency graph over an epic's stories.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    waves: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build and validate the graph for a set of stories.
    ///
    /// Fails with `DuplicateStory`, `DanglingDependency` or `CycleDetected`.
    pub fn build(stories: &[Story]) -> EngineResult<Self> {
        let mut graph = DiGraph::with_capacity(stories.len(), stories.len());
        let mut index = HashMap::with_capacity(stories.len());

        for story in stories {
            if index.contains_key(&story.id) {
                return Err(EngineError::DuplicateStory(story.id.clone()));
            }
            let node = graph.add_node(story.id.clone());
            index.insert(story.id.clone(), node);
        }

        for story in stories {
            let target = index[&story.id];
            for dep in &story.depends_on {
                let Some(&source) = index.get(dep) else {
                    return Err(EngineError::DanglingDependency {
                        story: story.id.clone(),
                        missing: dep.clone(),
                    });
                };
                graph.update_edge(source, target, ());
            }
        }

        let mut built = Self {
            graph,
            index,
            waves: Vec::new(),
        };
        built.waves = built.layer()?;
        Ok(built)
    }

    /// Kahn layering. Wave 0 holds stories with no dependencies; each later
    /// wave holds stories whose dependencies all sit in earlier waves.
    fn layer(&self) -> EngineResult<Vec<Vec<String>>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .collect();
        let mut waves = Vec::new();
        let mut placed = 0usize;

        while !current.is_empty() {
            current.sort();
            placed += current.len();
            let mut next = Vec::new();
            for &node in &current {
                for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    let degree = &mut in_degree[dependent.index()];
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        next.push(dependent);
                    }
                }
            }
            waves.push(current.iter().map(|&n| self.graph[n].clone()).collect());
            current = next;
        }

        if placed < self.graph.node_count() {
            let stories: Vec<String> = self
                .graph
                .node_indices()
                .filter(|n| in_degree[n.index()] > 0)
                .map(|n| self.graph[n].clone())
                .collect();
            return Err(EngineError::CycleDetected {
                path: self.find_cycle(),
                stories,
            });
        }

        Ok(waves)
    }

    /// One concrete cycle, written along "depends on" edges.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let component = tarjan_scc(&self.graph).into_iter().find(|scc| {
            scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0])
        })?;
        let members: HashSet<NodeIndex> = component.iter().copied().collect();

        let mut path = Vec::new();
        let mut seen = HashMap::new();
        let mut node = *component.iter().min()?;
        loop {
            if let Some(&start) = seen.get(&node) {
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&n: &NodeIndex| self.graph[n].clone())
                    .collect();
                cycle.push(self.graph[node].clone());
                return Some(cycle);
            }
            seen.insert(node, path.len());
            path.push(node);
            node = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter(|n| members.contains(n))
                .min()?;
        }
    }

    /// The static wave layering computed at build time.
    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Direct dependencies of a story.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Stories that directly depend on `id`.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&str> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(node, direction).collect();
        nodes.sort();
        nodes.into_iter().map(|n| self.graph[n].as_str()).collect()
    }

    /// Every story downstream of `id`, nearest first.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect();
            next.sort();
            for dependent in next {
                if seen.insert(dependent) {
                    order.push(self.graph[dependent].clone());
                    queue.push_back(dependent);
                }
            }
        }
        order
    }

    /// The current wave: non-terminal, not-running stories whose dependencies
    /// have all completed. Returned in declaration order.
    pub fn ready_wave(&self, epic: &Epic) -> Vec<String> {
        let status: HashMap<&str, StoryStatus> = epic
            .stories
            .iter()
            .map(|s| (s.id.as_str(), s.status))
            .collect();

        let mut ready: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&n| {
                matches!(
                    status.get(self.graph[n].as_str()),
                    Some(StoryStatus::Pending | StoryStatus::Ready)
                )
            })
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .all(|dep| status.get(self.graph[dep].as_str()) == Some(&StoryStatus::Completed))
            })
            .collect();
        ready.sort();
        ready.into_iter().map(|n| self.graph[n].clone()).collect()
    }
}
