//! Entity relationship types and bounded network traversal.
//!
//! Relationships are stored directionally; a logically undirected edge may
//! appear once per orientation. Traversal canonicalizes every edge by its
//! sorted endpoint pair plus relationship type so each logical edge appears
//! exactly once in the returned graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::decision::RiskLevel;
use crate::error::Result;
use crate::history::HistoryStore;

/// Reference to an entity at one end of a relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_id: String,
    /// "individual" or "organization"
    pub entity_type: String,
}

/// Stored direction of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipDirection {
    Unidirectional,
    Bidirectional,
    /// Stored source/target are swapped relative to the logical direction
    Reverse,
}

/// Evidence supporting a relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(rename = "type")]
    pub evidence_type: String,
    pub description: String,
    pub source: String,
}

/// A relationship between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub rel_id: String,
    pub source: EntityRef,
    pub target: EntityRef,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub direction: RelationshipDirection,
    /// [0,1]
    pub strength: f64,
    /// [0,1]
    pub confidence: f64,
    pub active: bool,
    pub verified: bool,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
}

impl Relationship {
    /// The endpoint opposite to `entity_id`, if this edge touches it.
    pub fn other_end(&self, entity_id: &str) -> Option<&EntityRef> {
        if self.source.entity_id == entity_id {
            Some(&self.target)
        } else if self.target.entity_id == entity_id {
            Some(&self.source)
        } else {
            None
        }
    }
}

/// Filter applied when reading relationships from the history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipFilter {
    pub min_confidence: f64,
    pub only_active: bool,
    /// Restrict to these relationship types; `None` means all
    pub relationship_types: Option<Vec<String>>,
}

impl Default for RelationshipFilter {
    fn default() -> Self {
        Self {
            min_confidence: 0.0,
            only_active: true,
            relationship_types: None,
        }
    }
}

impl RelationshipFilter {
    /// Whether a relationship passes this filter.
    pub fn accepts(&self, rel: &Relationship) -> bool {
        if rel.confidence < self.min_confidence {
            return false;
        }
        if self.only_active && !rel.active {
            return false;
        }
        if let Some(ref types) = self.relationship_types {
            if !types.iter().any(|t| t == &rel.rel_type) {
                return false;
            }
        }
        true
    }
}

/// Parameters for a network traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkParams {
    /// Hop limit, clamped to 1..=4
    pub max_depth: u32,
    pub min_confidence: f64,
    pub only_active: bool,
    /// Hard node cap including the center
    pub max_nodes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship_types: Option<Vec<String>>,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            max_depth: 2,
            min_confidence: 0.0,
            only_active: true,
            max_nodes: 100,
            relationship_types: None,
        }
    }
}

impl NetworkParams {
    fn filter(&self) -> RelationshipFilter {
        RelationshipFilter {
            min_confidence: self.min_confidence,
            only_active: self.only_active,
            relationship_types: self.relationship_types.clone(),
        }
    }
}

/// A node in the returned network graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkNode {
    pub id: String,
    pub label: String,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
}

/// An edge in the returned network graph, de-duplicated across orientations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub rel_type: String,
    pub direction: RelationshipDirection,
    pub strength: f64,
    pub verified: bool,
}

/// Result of a network traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkGraph {
    pub center_entity_id: String,
    pub nodes: Vec<NetworkNode>,
    pub edges: Vec<NetworkEdge>,
    pub max_depth_reached: u32,
    pub elapsed_ms: u64,
    pub average_strength: f64,
    pub average_confidence: f64,
    pub verified_count: usize,
}

/// Canonical undirected key: sorted endpoints plus relationship type.
fn canonical_key(a: &str, b: &str, rel_type: &str) -> (String, String, String) {
    if a <= b {
        (a.to_string(), b.to_string(), rel_type.to_string())
    } else {
        (b.to_string(), a.to_string(), rel_type.to_string())
    }
}

/// Bounded BFS over the relationships store.
pub struct NetworkTraversal {
    store: Arc<dyn HistoryStore>,
}

impl NetworkTraversal {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Build the relationship network around a center entity.
    ///
    /// Deterministic for a given store snapshot: nodes appear in first-visit
    /// order, edges in first-seen order.
    pub async fn build_network(&self, center: &str, params: &NetworkParams) -> Result<NetworkGraph> {
        let start = Instant::now();
        let max_depth = params.max_depth.clamp(1, 4);
        let filter = params.filter();

        let mut nodes: Vec<NetworkNode> = vec![NetworkNode {
            id: center.to_string(),
            label: center.to_string(),
            entity_type: "unknown".to_string(),
            risk_score: None,
            risk_level: None,
        }];
        let mut node_index: HashMap<String, usize> = HashMap::new();
        node_index.insert(center.to_string(), 0);

        let mut edges: Vec<NetworkEdge> = Vec::new();
        let mut edge_index: HashMap<(String, String, String), usize> = HashMap::new();
        let mut confidences: Vec<f64> = Vec::new();

        let mut frontier: Vec<String> = vec![center.to_string()];
        let mut max_depth_reached = 0;
        let mut node_cap_hit = false;

        for depth in 1..=max_depth {
            if frontier.is_empty() || node_cap_hit {
                break;
            }
            let mut next_frontier: Vec<String> = Vec::new();

            for entity_id in &frontier {
                let rels = self.store.get_relationships(entity_id, &filter).await?;

                for rel in rels {
                    let Some(other) = rel.other_end(entity_id) else {
                        continue;
                    };

                    let key = canonical_key(
                        &rel.source.entity_id,
                        &rel.target.entity_id,
                        &rel.rel_type,
                    );

                    if let Some(&idx) = edge_index.get(&key) {
                        // Second representation of the same logical edge:
                        // either orientation seen twice means bidirectional.
                        let existing = &mut edges[idx];
                        let (src, _dst) = oriented_endpoints(&rel);
                        if rel.direction == RelationshipDirection::Bidirectional
                            || existing.source != src
                        {
                            existing.direction = RelationshipDirection::Bidirectional;
                        }
                        continue;
                    }

                    // Make sure both endpoints fit under the node cap.
                    for end in [&rel.source, &rel.target] {
                        if node_index.contains_key(&end.entity_id) {
                            // Backfill the entity type learned from this edge.
                            let idx = node_index[&end.entity_id];
                            if nodes[idx].entity_type == "unknown" {
                                nodes[idx].entity_type = end.entity_type.clone();
                            }
                            continue;
                        }
                        if nodes.len() >= params.max_nodes {
                            node_cap_hit = true;
                            continue;
                        }
                        node_index.insert(end.entity_id.clone(), nodes.len());
                        nodes.push(NetworkNode {
                            id: end.entity_id.clone(),
                            label: end.entity_id.clone(),
                            entity_type: end.entity_type.clone(),
                            risk_score: None,
                            risk_level: None,
                        });
                        max_depth_reached = max_depth_reached.max(depth);
                        if end.entity_id == other.entity_id {
                            next_frontier.push(end.entity_id.clone());
                        }
                    }

                    // Skip edges whose far endpoint did not make it in.
                    if !node_index.contains_key(&rel.source.entity_id)
                        || !node_index.contains_key(&rel.target.entity_id)
                    {
                        continue;
                    }

                    let (source, target) = oriented_endpoints(&rel);
                    let direction = match rel.direction {
                        RelationshipDirection::Bidirectional => RelationshipDirection::Bidirectional,
                        // Reverse edges are emitted in logical orientation.
                        _ => RelationshipDirection::Unidirectional,
                    };

                    edge_index.insert(key, edges.len());
                    confidences.push(rel.confidence);
                    edges.push(NetworkEdge {
                        id: rel.rel_id.clone(),
                        source,
                        target,
                        rel_type: rel.rel_type.clone(),
                        direction,
                        strength: rel.strength,
                        verified: rel.verified,
                    });
                }
            }

            frontier = next_frontier;
        }

        let verified_count = edges.iter().filter(|e| e.verified).count();
        let average_strength = if edges.is_empty() {
            0.0
        } else {
            edges.iter().map(|e| e.strength).sum::<f64>() / edges.len() as f64
        };
        let average_confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        };

        debug!(
            center,
            nodes = nodes.len(),
            edges = edges.len(),
            max_depth_reached,
            "network traversal complete"
        );

        Ok(NetworkGraph {
            center_entity_id: center.to_string(),
            nodes,
            edges,
            max_depth_reached,
            elapsed_ms: start.elapsed().as_millis() as u64,
            average_strength,
            average_confidence,
            verified_count,
        })
    }
}

/// Logical (source, target) ids for an edge, unswapping `reverse` storage.
fn oriented_endpoints(rel: &Relationship) -> (String, String) {
    match rel.direction {
        RelationshipDirection::Reverse => {
            (rel.target.entity_id.clone(), rel.source.entity_id.clone())
        }
        _ => (rel.source.entity_id.clone(), rel.target.entity_id.clone()),
    }
}
