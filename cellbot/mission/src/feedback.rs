use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Correlates a server-assigned execution node with a graph element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFeedback {
    /// Execution node id assigned at load time.
    pub node_id: String,
    /// Element id in the loaded graph.
    pub element_id: String,
    /// Element display name.
    pub element_name: String,
}

/// Execution state of one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementState {
    /// Not reached yet.
    Pending,
    /// Navigating to or acting at the target.
    Running,
    /// Done.
    Completed,
    /// Failed after its own retries.
    Failed,
}

/// Element-wise feedback entry reported by the mission service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementProgress {
    /// Execution node id.
    pub node_id: String,
    /// Current state.
    pub state: ElementState,
}

impl ElementProgress {
    /// Convenience constructor.
    #[must_use]
    pub fn new(node_id: impl Into<String>, state: ElementState) -> Self {
        Self {
            node_id: node_id.into(),
            state,
        }
    }
}

/// Transition detected between two polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackEvent {
    /// Element observed running for the first time.
    Started(NodeFeedback),
    /// Element entered the completed state.
    Completed(NodeFeedback),
    /// Element entered the failed state.
    Failed(NodeFeedback),
}

/// Tracks per-element state across polls and reports each transition once.
#[derive(Debug)]
pub struct FeedbackTracker {
    nodes: Vec<NodeFeedback>,
    states: HashMap<String, ElementState>,
    started: HashSet<String>,
}

impl FeedbackTracker {
    /// Creates a tracker over the load-time node mapping.
    #[must_use]
    pub fn new(nodes: Vec<NodeFeedback>) -> Self {
        let states = nodes
            .iter()
            .map(|node| (node.node_id.clone(), ElementState::Pending))
            .collect();
        Self {
            nodes,
            states,
            started: HashSet::new(),
        }
    }

    /// Folds one poll into the tracker, returning transitions in graph order.
    ///
    /// Entries for unknown node ids are ignored.
    pub fn observe(&mut self, progress: &[ElementProgress]) -> Vec<FeedbackEvent> {
        let latest: HashMap<&str, ElementState> = progress
            .iter()
            .map(|entry| (entry.node_id.as_str(), entry.state))
            .collect();
        let mut events = Vec::new();
        for node in &self.nodes {
            let Some(&state) = latest.get(node.node_id.as_str()) else {
                continue;
            };
            let previous = self
                .states
                .insert(node.node_id.clone(), state)
                .unwrap_or(ElementState::Pending);
            if state == previous {
                continue;
            }
            match state {
                ElementState::Running => {
                    if self.started.insert(node.node_id.clone()) {
                        events.push(FeedbackEvent::Started(node.clone()));
                    }
                }
                ElementState::Completed => events.push(FeedbackEvent::Completed(node.clone())),
                ElementState::Failed => events.push(FeedbackEvent::Failed(node.clone())),
                ElementState::Pending => {}
            }
        }
        events
    }

    /// Element currently running, if any.
    #[must_use]
    pub fn running(&self) -> Option<&NodeFeedback> {
        self.nodes
            .iter()
            .find(|node| self.states.get(&node.node_id) == Some(&ElementState::Running))
    }

    /// Whether the final element has been seen completed.
    #[must_use]
    pub fn last_completed(&self) -> bool {
        self.nodes.last().is_some_and(|node| {
            self.states.get(&node.node_id) == Some(&ElementState::Completed)
        })
    }

    /// Load-time node mapping.
    #[must_use]
    pub fn nodes(&self) -> &[NodeFeedback] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<NodeFeedback> {
        ["a", "b"]
            .iter()
            .enumerate()
            .map(|(i, id)| NodeFeedback {
                node_id: format!("node-{i}"),
                element_id: (*id).to_string(),
                element_name: id.to_uppercase(),
            })
            .collect()
    }

    #[test]
    fn completion_then_next_running_in_one_poll() {
        let mut tracker = FeedbackTracker::new(nodes());
        let first = tracker.observe(&[ElementProgress::new("node-0", ElementState::Running)]);
        assert!(matches!(&first[..], [FeedbackEvent::Started(n)] if n.element_id == "a"));

        let second = tracker.observe(&[
            ElementProgress::new("node-0", ElementState::Completed),
            ElementProgress::new("node-1", ElementState::Running),
        ]);
        assert_eq!(second.len(), 2);
        assert!(matches!(&second[0], FeedbackEvent::Completed(n) if n.element_id == "a"));
        assert!(matches!(&second[1], FeedbackEvent::Started(n) if n.element_id == "b"));

        let third = tracker.observe(&[
            ElementProgress::new("node-0", ElementState::Completed),
            ElementProgress::new("node-1", ElementState::Running),
        ]);
        assert!(third.is_empty());
        assert_eq!(tracker.running().map(|n| n.element_id.as_str()), Some("b"));
        assert!(!tracker.last_completed());
    }

    #[test]
    fn rerunning_element_is_not_started_twice() {
        let mut tracker = FeedbackTracker::new(nodes());
        tracker.observe(&[ElementProgress::new("node-0", ElementState::Running)]);
        tracker.observe(&[ElementProgress::new("node-0", ElementState::Failed)]);
        let events = tracker.observe(&[ElementProgress::new("node-0", ElementState::Running)]);
        assert!(events.is_empty());
    }

    #[test]
    fn last_completion_is_tracked() {
        let mut tracker = FeedbackTracker::new(nodes());
        tracker.observe(&[
            ElementProgress::new("node-0", ElementState::Completed),
            ElementProgress::new("node-1", ElementState::Completed),
            ElementProgress::new("node-9", ElementState::Running),
        ]);
        assert!(tracker.last_completed());
    }
}
