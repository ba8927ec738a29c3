use std::collections::{BTreeSet, HashMap};

use plexus_core::error::{PlexusError, Result};
use plexus_core::types::{Plan, PlanNode};

/// Validated dependency graph of a plan.
///
/// Construction rejects duplicate node ids, edges naming undeclared nodes,
/// and cycles. The execution order is Kahn's algorithm where, among nodes
/// that are ready at the same time, the one declared first in the plan runs
/// first.
#[derive(Debug)]
pub struct PlanGraph<'a> {
    plan: &'a Plan,
    order: Vec<usize>,
    predecessors: Vec<Vec<usize>>,
    index: HashMap<&'a str, usize>,
}

impl<'a> PlanGraph<'a> {
    pub fn build(plan: &'a Plan) -> Result<Self> {
        let mut index = HashMap::with_capacity(plan.nodes.len());
        for (i, node) in plan.nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), i).is_some() {
                return Err(PlexusError::InvalidPlan(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let n = plan.nodes.len();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];
        for edge in &plan.edges {
            let lookup = |id: &str| {
                index.get(id).copied().ok_or_else(|| {
                    PlexusError::InvalidPlan(format!("edge references unknown node '{id}'"))
                })
            };
            let (from, to) = (lookup(edge.source())?, lookup(edge.target())?);
            successors[from].push(to);
            if !predecessors[to].contains(&from) {
                predecessors[to].push(from);
            }
            in_degree[to] += 1;
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &next in &successors[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != n {
            return Err(PlexusError::PlanCycle);
        }

        Ok(Self {
            plan,
            order,
            predecessors,
            index,
        })
    }

    /// Nodes in execution order.
    pub fn ordered_nodes(&self) -> impl Iterator<Item = &'a PlanNode> + '_ {
        let plan = self.plan;
        self.order.iter().map(move |&i| &plan.nodes[i])
    }

    /// Direct predecessors of a node, in edge declaration order.
    pub fn predecessors(&self, node_id: &str) -> Vec<&'a str> {
        self.index
            .get(node_id)
            .map(|&i| {
                self.predecessors[i]
                    .iter()
                    .map(|&p| self.plan.nodes[p].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
