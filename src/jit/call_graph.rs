//! Observed call graph
//!
//! Nodes are functions, indexed like the program; edges come from the script
//! targets cached at call sites. Strongly connected components (Tarjan) mark
//! every function that can reach itself, directly or through mutual recursion.

use rustc_hash::FxHashSet;

use super::feedback::FeedbackStore;
use super::ic::{CallTarget, Handler};
use crate::bytecode::{FunctionId, Op, Program};

#[derive(Debug, Clone, Default)]
struct Node {
    edges: Vec<usize>,
}

/// Call graph over a program, built from feedback
#[derive(Debug, Clone)]
pub struct CallGraph {
    nodes: Vec<Node>,
    recursive: FxHashSet<FunctionId>,
}

impl CallGraph {
    /// Build from the call targets observed so far
    pub fn build(program: &Program, feedback: &FeedbackStore) -> Self {
        let mut nodes = vec![Node::default(); program.len()];
        for function in program.functions() {
            let node = &mut nodes[function.id.index()];
            for op in &function.code {
                let slot = match *op {
                    Op::Call { slot, .. } | Op::CallMethod { slot, .. } | Op::New { slot, .. } => slot,
                    _ => continue,
                };
                let snapshot = feedback.snapshot(feedback.site(function.id, slot));
                for entry in &snapshot.entries {
                    if let Handler::Target(CallTarget::Script { function: callee, .. }) = entry.handler {
                        if !node.edges.contains(&callee.index()) {
                            node.edges.push(callee.index());
                        }
                    }
                }
            }
        }
        Self::from_nodes(nodes)
    }

    /// Build from explicit edges
    pub fn from_edges(count: usize, edges: &[(FunctionId, FunctionId)]) -> Self {
        let mut nodes = vec![Node::default(); count];
        for (from, to) in edges {
            nodes[from.index()].edges.push(to.index());
        }
        Self::from_nodes(nodes)
    }

    fn from_nodes(nodes: Vec<Node>) -> Self {
        let mut graph = Self {
            nodes,
            recursive: FxHashSet::default(),
        };
        graph.recursive = graph.find_recursive();
        graph
    }

    pub fn callees(&self, function: FunctionId) -> impl Iterator<Item = FunctionId> + '_ {
        self.nodes[function.index()]
            .edges
            .iter()
            .map(|i| FunctionId(*i as u32))
    }

    /// Whether the function lies on a cycle
    pub fn is_recursive(&self, function: FunctionId) -> bool {
        self.recursive.contains(&function)
    }

    /// Strongly connected components, in reverse topological order
    pub fn components(&self) -> Vec<Vec<FunctionId>> {
        let mut tarjan = Tarjan {
            graph: self,
            index: 0,
            indices: vec![None; self.nodes.len()],
            lowlink: vec![0; self.nodes.len()],
            on_stack: vec![false; self.nodes.len()],
            stack: Vec::new(),
            components: Vec::new(),
        };
        for node in 0..self.nodes.len() {
            if tarjan.indices[node].is_none() {
                tarjan.visit(node);
            }
        }
        tarjan.components
    }

    fn find_recursive(&self) -> FxHashSet<FunctionId> {
        let mut recursive = FxHashSet::default();
        for component in self.components() {
            match component.as_slice() {
                [single] => {
                    if self.nodes[single.index()].edges.contains(&single.index()) {
                        recursive.insert(*single);
                    }
                }
                many => recursive.extend(many.iter().copied()),
            }
        }
        recursive
    }
}

struct Tarjan<'g> {
    graph: &'g CallGraph,
    index: usize,
    indices: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    components: Vec<Vec<FunctionId>>,
}

impl Tarjan<'_> {
    fn visit(&mut self, v: usize) {
        self.indices[v] = Some(self.index);
        self.lowlink[v] = self.index;
        self.index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for &w in &self.graph.nodes[v].edges {
            match self.indices[w] {
                None => {
                    self.visit(w);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(index) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(index);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v]) == self.indices[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(FunctionId(w as u32));
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(n: u32) -> FunctionId {
        FunctionId(n)
    }

    #[test]
    fn test_chain_has_no_recursion() {
        let graph = CallGraph::from_edges(3, &[(f(0), f(1)), (f(1), f(2))]);
        assert!((0..3).all(|i| !graph.is_recursive(f(i))));
        assert_eq!(graph.components().len(), 3);
    }

    #[test]
    fn test_self_recursion() {
        let graph = CallGraph::from_edges(2, &[(f(0), f(1)), (f(1), f(1))]);
        assert!(!graph.is_recursive(f(0)));
        assert!(graph.is_recursive(f(1)));
    }

    #[test]
    fn test_mutual_recursion_forms_one_component() {
        let graph = CallGraph::from_edges(4, &[(f(0), f(1)), (f(1), f(2)), (f(2), f(1)), (f(2), f(3))]);
        assert!(graph.is_recursive(f(1)));
        assert!(graph.is_recursive(f(2)));
        assert!(!graph.is_recursive(f(0)));
        assert!(!graph.is_recursive(f(3)));
        let sizes: Vec<usize> = graph.components().iter().map(|c| c.len()).collect();
        assert!(sizes.contains(&2));
    }
}
