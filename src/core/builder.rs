//! Graph construction with quality-checkpoint injection.
//!
//! Every standard task gets a code-review node and a QA node behind it, and
//! anything that depended on the task waits on its QA node instead. Two
//! project-level nodes (final code review, final QA) close the graph.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

use crate::conditions::Condition;
use crate::config::EngineConfig;
use crate::core::cycles::{mark_cyclical_edges, DetectedCycle};
use crate::core::graph::{EdgeType, TaskGraph};
use crate::core::task::{CheckpointType, NodeId, TaskNode, TaskSpec};
use crate::error::{Error, Result};

pub const FINAL_CODE_REVIEW_ID: &str = "final-code-review";
pub const FINAL_QA_ID: &str = "final-qa";

/// The checkpoint nodes injected for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointPair {
    pub code_review: NodeId,
    pub qa: NodeId,
}

impl CheckpointPair {
    pub fn for_task(id: &NodeId) -> Self {
        Self {
            code_review: NodeId::new(format!("{}-code-review", id)),
            qa: NodeId::new(format!("{}-qa", id)),
        }
    }
}

/// Output of [`GraphBuilder::build`].
#[derive(Debug)]
pub struct BuiltGraph {
    pub graph: TaskGraph,
    /// Original task id -> its injected checkpoint nodes.
    pub checkpoints: BTreeMap<NodeId, CheckpointPair>,
    pub final_code_review: NodeId,
    pub final_qa: NodeId,
    pub cycles: Vec<DetectedCycle>,
}

#[derive(Debug, Clone)]
pub struct GraphBuilder {
    max_retries: u32,
    quality_threshold: f64,
    max_cyclical_iterations: u32,
}

impl GraphBuilder {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            quality_threshold: config.quality_threshold,
            max_cyclical_iterations: config.max_cyclical_iterations,
        }
    }

    /// Conditions for an edge into `target`. Every edge also checks the
    /// target's retry budget and that some worker can take it.
    fn conditions(&self, graph: &TaskGraph, target: &NodeId, gated: bool) -> Vec<Condition> {
        let mut conditions = vec![Condition::Dependency];
        if gated {
            conditions.push(Condition::QualityGate {
                threshold: self.quality_threshold,
            });
        }
        let max_retries = graph.node(target).map_or(self.max_retries, |n| n.max_retries);
        conditions.push(Condition::Retry { max_retries });
        conditions.push(Condition::AgentAvailability);
        conditions
    }

    /// Build the executable graph from a flat task list.
    ///
    /// # Errors
    /// `GraphConstruction` for an empty list, duplicate ids, a dependency on
    /// an unknown id or on the task itself, or an input id that collides with
    /// an injected checkpoint id.
    pub fn build(&self, tasks: &[TaskSpec]) -> Result<BuiltGraph> {
        self.validate(tasks)?;

        let standard: Vec<&TaskSpec> = tasks.iter().filter(|t| !t.is_checkpoint).collect();
        let checkpoints: BTreeMap<NodeId, CheckpointPair> = standard
            .iter()
            .map(|t| (t.id.clone(), CheckpointPair::for_task(&t.id)))
            .collect();

        let input_ids: HashSet<&NodeId> = tasks.iter().map(|t| &t.id).collect();
        for pair in checkpoints.values() {
            for generated in [&pair.code_review, &pair.qa] {
                if input_ids.contains(generated) {
                    return Err(Error::GraphConstruction(format!(
                        "task id {} collides with an injected checkpoint",
                        generated
                    )));
                }
            }
        }
        for reserved in [FINAL_CODE_REVIEW_ID, FINAL_QA_ID] {
            if input_ids.contains(&NodeId::from(reserved)) {
                return Err(Error::GraphConstruction(format!(
                    "task id {} is reserved",
                    reserved
                )));
            }
        }

        // Dependents wait on the QA node of a standard dependency.
        let resolve = |dep: &NodeId| -> NodeId {
            checkpoints
                .get(dep)
                .map(|pair| pair.qa.clone())
                .unwrap_or_else(|| dep.clone())
        };

        let mut graph = TaskGraph::new();
        let mut originals = BTreeMap::new();

        for spec in tasks {
            let mut node = TaskNode::from_spec(spec, self.max_retries);
            if !node.is_checkpoint {
                node.dependencies = spec.dependencies.iter().map(&resolve).collect();
            }
            originals.insert(node.id.clone(), node.clone());
            graph.add_node(node)?;
        }

        for spec in &standard {
            let pair = &checkpoints[&spec.id];
            let original = originals.get(&spec.id);
            let review = TaskNode::checkpoint(
                pair.code_review.clone(),
                format!("Code review: {}", spec.title),
                CheckpointType::CodeReview,
                original,
                [spec.id.clone()].into_iter().collect(),
                self.max_retries,
            );
            let qa = TaskNode::checkpoint(
                pair.qa.clone(),
                format!("QA: {}", spec.title),
                CheckpointType::QaTesting,
                original,
                [pair.code_review.clone()].into_iter().collect(),
                self.max_retries,
            );
            graph.add_node(review)?;
            graph.add_node(qa)?;
            debug!(task = %spec.id, review = %pair.code_review, qa = %pair.qa, "checkpoints injected");
        }

        let mut final_deps: BTreeSet<NodeId> =
            checkpoints.values().map(|pair| pair.qa.clone()).collect();
        final_deps.extend(tasks.iter().filter(|t| t.is_checkpoint).map(|t| t.id.clone()));

        let final_review_id = NodeId::from(FINAL_CODE_REVIEW_ID);
        let final_qa_id = NodeId::from(FINAL_QA_ID);
        graph.add_node(TaskNode::checkpoint(
            final_review_id.clone(),
            "Final code review".to_string(),
            CheckpointType::FinalCodeReview,
            None,
            final_deps.clone(),
            self.max_retries,
        ))?;
        graph.add_node(TaskNode::checkpoint(
            final_qa_id.clone(),
            "Final QA".to_string(),
            CheckpointType::FinalQa,
            None,
            [final_review_id.clone()].into_iter().collect(),
            self.max_retries,
        ))?;

        // Edges
        for spec in &standard {
            let pair = &checkpoints[&spec.id];
            let into_review = self.conditions(&graph, &pair.code_review, false);
            graph.add_edge(
                &spec.id,
                &pair.code_review,
                EdgeType::CheckpointDependency,
                into_review,
            )?;
            let into_qa = self.conditions(&graph, &pair.qa, true);
            graph.add_edge(
                &pair.code_review,
                &pair.qa,
                EdgeType::CheckpointDependency,
                into_qa,
            )?;
        }
        for spec in tasks {
            for dep in &spec.dependencies {
                let source = if spec.is_checkpoint {
                    dep.clone()
                } else {
                    resolve(dep)
                };
                let from_checkpoint = graph.node(&source).is_some_and(|n| n.is_checkpoint);
                let conditions = self.conditions(&graph, &spec.id, from_checkpoint);
                graph.add_edge(&source, &spec.id, EdgeType::Dependency, conditions)?;
            }
        }
        for dep in &final_deps {
            let conditions = self.conditions(&graph, &final_review_id, true);
            graph.add_edge(
                dep,
                &final_review_id,
                EdgeType::FinalReviewDependency,
                conditions,
            )?;
        }
        let conditions = self.conditions(&graph, &final_qa_id, true);
        graph.add_edge(
            &final_review_id,
            &final_qa_id,
            EdgeType::FinalReviewDependency,
            conditions,
        )?;

        let cycles = mark_cyclical_edges(&mut graph, self.max_cyclical_iterations);
        if !graph.is_acyclic_ignoring_cyclical() {
            return Err(Error::GraphConstruction(
                "graph still cyclic after flagging cyclical edges".to_string(),
            ));
        }

        info!(
            tasks = tasks.len(),
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            cycles = cycles.len(),
            "graph built"
        );

        Ok(BuiltGraph {
            graph,
            checkpoints,
            final_code_review: final_review_id,
            final_qa: final_qa_id,
            cycles,
        })
    }

    fn validate(&self, tasks: &[TaskSpec]) -> Result<()> {
        if tasks.is_empty() {
            return Err(Error::GraphConstruction("task list is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for task in tasks {
            if !seen.insert(&task.id) {
                return Err(Error::GraphConstruction(format!(
                    "duplicate task id {}",
                    task.id
                )));
            }
        }
        for task in tasks {
            for dep in &task.dependencies {
                if dep == &task.id {
                    return Err(Error::GraphConstruction(format!(
                        "task {} depends on itself",
                        task.id
                    )));
                }
                if !seen.contains(dep) {
                    return Err(Error::GraphConstruction(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::NodeType;

    fn chain() -> Vec<TaskSpec> {
        vec![
            TaskSpec::new("a", "A"),
            TaskSpec::new("b", "B").with_dependencies(&["a"]),
            TaskSpec::new("c", "C").with_dependencies(&["b"]),
        ]
    }

    // Shape tests

    #[test]
    fn test_single_task_gets_checkpoint_pair_and_finals() {
        let built = GraphBuilder::default()
            .build(&[TaskSpec::new("login", "Build login form").with_skills(&["react"])])
            .unwrap();
        assert_eq!(built.graph.node_count(), 5);

        let pair = &built.checkpoints[&NodeId::from("login")];
        assert_eq!(pair.code_review, NodeId::from("login-code-review"));
        assert_eq!(pair.qa, NodeId::from("login-qa"));

        let review = built.graph.node(&pair.code_review).unwrap();
        assert_eq!(review.node_type, NodeType::CodeReview);
        assert_eq!(review.original_task_id, Some(NodeId::from("login")));
        assert!(review.required_skills.contains("code-review"));
        let qa = built.graph.node(&pair.qa).unwrap();
        assert!(qa.required_skills.contains("testing"));

        assert_eq!(
            built.graph.dependencies(&built.final_code_review),
            vec![pair.qa.clone()]
        );
        assert_eq!(
            built.graph.dependencies(&built.final_qa),
            vec![built.final_code_review.clone()]
        );
    }

    #[test]
    fn test_node_count_is_three_n_plus_two() {
        let tasks: Vec<TaskSpec> = (0..7)
            .map(|i| TaskSpec::new(&format!("t{}", i), "task"))
            .collect();
        let built = GraphBuilder::default().build(&tasks).unwrap();
        assert_eq!(built.graph.node_count(), 7 + 2 * 7 + 2);
        assert!(built.graph.is_acyclic_ignoring_cyclical());
        assert!(built.cycles.is_empty());
    }

    #[test]
    fn test_dependencies_rewritten_to_qa() {
        let built = GraphBuilder::default().build(&chain()).unwrap();
        assert_eq!(
            built.graph.dependencies(&"b".into()),
            vec![NodeId::from("a-qa")]
        );
        let node = built.graph.node(&"c".into()).unwrap();
        assert!(node.dependencies.contains(&NodeId::from("b-qa")));

        let edge = built.graph.edge_between(&"a-qa".into(), &"b".into()).unwrap();
        assert_eq!(edge.edge_type, EdgeType::Dependency);
        assert!(edge
            .conditions
            .iter()
            .any(|c| matches!(c, Condition::QualityGate { .. })));
    }

    #[test]
    fn test_every_edge_checks_retries_and_availability() {
        let mut specs = chain();
        specs[1].max_retries = Some(5);
        let built = GraphBuilder::default().build(&specs).unwrap();
        for edge in built.graph.edges() {
            assert!(
                edge.conditions.contains(&Condition::AgentAvailability),
                "{} lacks agent_availability",
                edge.id
            );
            let target = built.graph.node(&edge.target).unwrap();
            assert!(edge.conditions.contains(&Condition::Retry {
                max_retries: target.max_retries
            }));
        }

        let into_b = built.graph.edge_between(&"a-qa".into(), &"b".into()).unwrap();
        assert!(into_b
            .conditions
            .contains(&Condition::Retry { max_retries: 5 }));
    }

    #[test]
    fn test_topological_order_for_chain() {
        let built = GraphBuilder::default().build(&chain()).unwrap();
        let order = built.graph.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|n| n.as_str() == id).unwrap();
        assert!(pos("a-qa") < pos("b"));
        assert!(pos("b-qa") < pos("c"));
        assert!(pos("c-qa") < pos(FINAL_CODE_REVIEW_ID));
        assert!(pos(FINAL_CODE_REVIEW_ID) < pos(FINAL_QA_ID));
    }

    #[test]
    fn test_input_checkpoint_passes_through() {
        let mut audit = TaskSpec::new("audit", "Security audit").with_dependencies(&["a"]);
        audit.is_checkpoint = true;
        audit.checkpoint_type = Some(CheckpointType::CodeReview);
        audit.node_type = NodeType::CodeReview;

        let built = GraphBuilder::default()
            .build(&[TaskSpec::new("a", "A"), audit])
            .unwrap();
        // a + pair + audit + finals
        assert_eq!(built.graph.node_count(), 6);
        assert!(!built.checkpoints.contains_key(&NodeId::from("audit")));
        assert_eq!(built.graph.dependencies(&"audit".into()), vec![NodeId::from("a")]);
        assert!(built
            .graph
            .dependencies(&built.final_code_review)
            .contains(&NodeId::from("audit")));
    }

    // Validation tests

    #[test]
    fn test_empty_input_rejected() {
        let err = GraphBuilder::default().build(&[]).unwrap_err();
        assert!(matches!(err, Error::GraphConstruction(_)));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = GraphBuilder::default()
            .build(&[TaskSpec::new("a", "A").with_dependencies(&["ghost"])])
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_and_self_dependency_rejected() {
        let builder = GraphBuilder::default();
        assert!(builder
            .build(&[TaskSpec::new("a", "A"), TaskSpec::new("a", "again")])
            .is_err());
        assert!(builder
            .build(&[TaskSpec::new("a", "A").with_dependencies(&["a"])])
            .is_err());
    }

    #[test]
    fn test_id_collision_rejected() {
        let err = GraphBuilder::default()
            .build(&[TaskSpec::new("a", "A"), TaskSpec::new("a-qa", "sneaky")])
            .unwrap_err();
        assert!(err.to_string().contains("collides"));

        let err = GraphBuilder::default()
            .build(&[TaskSpec::new(FINAL_QA_ID, "reserved")])
            .unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    // Cycle tests

    #[test]
    fn test_mutual_dependency_becomes_cyclical() {
        let tasks = vec![
            TaskSpec::new("a", "A").with_dependencies(&["b"]),
            TaskSpec::new("b", "B").with_dependencies(&["a"]),
        ];
        let built = GraphBuilder::default().build(&tasks).unwrap();
        assert_eq!(built.cycles.len(), 1);
        assert!(built.graph.is_acyclic_ignoring_cyclical());

        let closing: Vec<_> = built.graph.edges().filter(|e| e.closes_cycle).collect();
        assert_eq!(closing.len(), 1);
        assert_eq!(closing[0].max_iterations, 5);
        assert_eq!(closing[0].cycle_nodes.len(), 6);
        assert_eq!(
            closing[0].cycle_purpose,
            Some(crate::core::cycles::CyclePurpose::QualityIteration)
        );
    }
}
