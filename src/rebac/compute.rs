//! Graph traversal over the tuple store and namespace expressions.
//!
//! The computer answers one question: does `subject` hold `permission`
//! on `object` in `zone`? It walks the namespace rewrite tree with a
//! visited set, a depth cap and a fan-out cap at each tuple-to-userset
//! expansion; exceeded caps count as deny.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::error::NexusResult;
use crate::metadata::Timestamp;

use super::conditions;
use super::namespace::{NamespaceRegistry, RelationExpr};
use super::store::RebacStore;
use super::{Entity, RebacTuple};

/// Where the computer reads tuples from: the live store, or a preloaded
/// snapshot for bulk checks.
pub trait TupleSource: Send + Sync {
    fn tuples_on_object(
        &self,
        relation: &str,
        object: &Entity,
        zone_id: &str,
    ) -> NexusResult<Vec<RebacTuple>>;

    fn tuples_with_subject(
        &self,
        subject: &Entity,
        relation: &str,
        zone_id: &str,
    ) -> NexusResult<Vec<RebacTuple>>;
}

impl TupleSource for RebacStore {
    fn tuples_on_object(
        &self,
        relation: &str,
        object: &Entity,
        zone_id: &str,
    ) -> NexusResult<Vec<RebacTuple>> {
        RebacStore::tuples_on_object(self, relation, object, zone_id)
    }

    fn tuples_with_subject(
        &self,
        subject: &Entity,
        relation: &str,
        zone_id: &str,
    ) -> NexusResult<Vec<RebacTuple>> {
        RebacStore::tuples_with_subject(self, subject, relation, zone_id)
    }
}

/// In-memory tuple index for the bulk-check fast path: one store scan,
/// many evaluations.
pub struct TupleSnapshot {
    tuples: Vec<RebacTuple>,
}

impl TupleSnapshot {
    pub fn new(tuples: Vec<RebacTuple>) -> Self {
        Self { tuples }
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

impl TupleSource for TupleSnapshot {
    fn tuples_on_object(
        &self,
        relation: &str,
        object: &Entity,
        zone_id: &str,
    ) -> NexusResult<Vec<RebacTuple>> {
        let now = Timestamp::now();
        Ok(self
            .tuples
            .iter()
            .filter(|t| {
                t.relation == relation
                    && t.object == *object
                    && (t.zone_id == zone_id || t.object_zone_id == zone_id)
                    && !t.is_expired(now)
            })
            .cloned()
            .collect())
    }

    fn tuples_with_subject(
        &self,
        subject: &Entity,
        relation: &str,
        zone_id: &str,
    ) -> NexusResult<Vec<RebacTuple>> {
        let now = Timestamp::now();
        Ok(self
            .tuples
            .iter()
            .filter(|t| {
                t.subject == *subject
                    && t.subject_relation.is_none()
                    && t.relation == relation
                    && t.zone_id == zone_id
                    && !t.is_expired(now)
            })
            .cloned()
            .collect())
    }
}

/// One node of an explain trace.
#[derive(Debug, Clone)]
pub struct TraceStep {
    pub depth: u32,
    pub relation: String,
    pub object: Entity,
    /// Which rule was tried: `direct`, `computed_userset:<r>`,
    /// `tuple_to_userset:<tupleset>-><r>`, `group_membership`, ...
    pub rule: String,
    pub granted: bool,
    pub tuples_consulted: usize,
}

pub struct PermissionComputer {
    namespaces: Arc<NamespaceRegistry>,
    max_depth: u32,
    max_fanout: usize,
}

struct Walk<'a> {
    source: &'a dyn TupleSource,
    zone_id: &'a str,
    context: Option<&'a Value>,
    now: Timestamp,
    visited: HashSet<(String, String, String, String, String)>,
    trace: Option<&'a mut Vec<TraceStep>>,
}

impl<'a> Walk<'a> {
    fn record(&mut self, depth: u32, relation: &str, object: &Entity, rule: &str, granted: bool, consulted: usize) {
        if let Some(trace) = &mut self.trace {
            trace.push(TraceStep {
                depth,
                relation: relation.to_owned(),
                object: object.clone(),
                rule: rule.to_owned(),
                granted,
                tuples_consulted: consulted,
            });
        }
    }
}

impl PermissionComputer {
    pub fn new(namespaces: Arc<NamespaceRegistry>, max_depth: u32, max_fanout: usize) -> Self {
        Self { namespaces, max_depth, max_fanout }
    }

    /// Boolean permission check.
    pub fn check(
        &self,
        source: &dyn TupleSource,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        context: Option<&Value>,
    ) -> NexusResult<bool> {
        let mut walk = Walk {
            source,
            zone_id,
            context,
            now: Timestamp::now(),
            visited: HashSet::new(),
            trace: None,
        };
        self.evaluate(&mut walk, subject, permission, object, 0)
    }

    /// Check accumulating every considered path into `trace`.
    pub fn check_with_trace(
        &self,
        source: &dyn TupleSource,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        context: Option<&Value>,
        trace: &mut Vec<TraceStep>,
    ) -> NexusResult<bool> {
        let mut walk = Walk {
            source,
            zone_id,
            context,
            now: Timestamp::now(),
            visited: HashSet::new(),
            trace: Some(trace),
        };
        self.evaluate(&mut walk, subject, permission, object, 0)
    }

    fn evaluate(
        &self,
        walk: &mut Walk<'_>,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        depth: u32,
    ) -> NexusResult<bool> {
        if depth > self.max_depth {
            warn!(%subject, relation, %object, depth, "permission walk exceeded max depth, denying");
            return Ok(false);
        }
        let key = (
            subject.entity_type.clone(),
            subject.entity_id.clone(),
            relation.to_owned(),
            object.entity_type.clone(),
            object.entity_id.clone(),
        );
        if !walk.visited.insert(key) {
            return Ok(false);
        }

        // Direct tuples first, usersets included.
        if self.check_direct(walk, subject, relation, object, depth)? {
            return Ok(true);
        }

        // Namespace rewrite.
        if let Some(config) = self.namespaces.get(&object.entity_type) {
            if let Some(expr) = config.relations.get(relation).cloned() {
                if self.evaluate_expr(walk, subject, relation, object, &expr, depth)? {
                    return Ok(true);
                }
            }
        }

        // Grouping fallback: a concrete group subject holding the
        // relation admits everyone with `member` on that group.
        let group_tuples = walk.source.tuples_on_object(relation, object, walk.zone_id)?;
        let consulted = group_tuples.len();
        for tuple in group_tuples {
            if tuple.subject_relation.is_none()
                && tuple.subject.entity_type == "group"
                && !tuple.is_expired(walk.now)
                && self.evaluate(walk, subject, "member", &tuple.subject.clone(), depth + 1)?
            {
                walk.record(depth, relation, object, "group_membership", true, consulted);
                return Ok(true);
            }
        }

        walk.record(depth, relation, object, "no_rule", false, consulted);
        Ok(false)
    }

    fn tuple_eligible(&self, walk: &Walk<'_>, tuple: &RebacTuple) -> bool {
        if tuple.is_expired(walk.now) {
            return false;
        }
        match &tuple.conditions {
            Some(conditions) => conditions::evaluate(conditions, walk.context, walk.now),
            None => true,
        }
    }

    fn check_direct(
        &self,
        walk: &mut Walk<'_>,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        depth: u32,
    ) -> NexusResult<bool> {
        let tuples = walk.source.tuples_on_object(relation, object, walk.zone_id)?;
        let consulted = tuples.len();
        for tuple in &tuples {
            if !self.tuple_eligible(walk, tuple) {
                continue;
            }
            match &tuple.subject_relation {
                None => {
                    if tuple.subject == *subject {
                        walk.record(depth, relation, object, "direct", true, consulted);
                        return Ok(true);
                    }
                }
                Some(userset_relation) => {
                    // Userset-as-subject: everyone with the relation on
                    // the subject object qualifies.
                    let userset_object = tuple.subject.clone();
                    let userset_relation = userset_relation.clone();
                    if self.evaluate(walk, subject, &userset_relation, &userset_object, depth + 1)? {
                        walk.record(depth, relation, object, "userset_subject", true, consulted);
                        return Ok(true);
                    }
                }
            }
        }
        walk.record(depth, relation, object, "direct", false, consulted);
        Ok(false)
    }

    fn evaluate_expr(
        &self,
        walk: &mut Walk<'_>,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        expr: &RelationExpr,
        depth: u32,
    ) -> NexusResult<bool> {
        match expr {
            // Already covered by the direct pass.
            RelationExpr::This => Ok(false),
            RelationExpr::ComputedUserset { relation: other } => {
                let granted = self.evaluate(walk, subject, other, object, depth + 1)?;
                walk.record(depth, relation, object, &format!("computed_userset:{other}"), granted, 0);
                Ok(granted)
            }
            RelationExpr::TupleToUserset { tupleset, computed_userset } => {
                let edges = walk.source.tuples_with_subject(object, tupleset, walk.zone_id)?;
                if edges.len() > self.max_fanout {
                    warn!(
                        %object,
                        tupleset,
                        fanout = edges.len(),
                        cap = self.max_fanout,
                        "tuple-to-userset fan-out exceeded, denying"
                    );
                    return Ok(false);
                }
                let consulted = edges.len();
                for edge in edges {
                    if !self.tuple_eligible(walk, &edge) {
                        continue;
                    }
                    if self.evaluate(walk, subject, computed_userset, &edge.object, depth + 1)? {
                        walk.record(
                            depth,
                            relation,
                            object,
                            &format!("tuple_to_userset:{tupleset}->{computed_userset}"),
                            true,
                            consulted,
                        );
                        return Ok(true);
                    }
                }
                walk.record(
                    depth,
                    relation,
                    object,
                    &format!("tuple_to_userset:{tupleset}->{computed_userset}"),
                    false,
                    consulted,
                );
                Ok(false)
            }
            RelationExpr::Union(children) => {
                for child in children {
                    if self.evaluate_expr(walk, subject, relation, object, child, depth)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            RelationExpr::Intersection(children) => {
                for child in children {
                    if !self.evaluate_expr(walk, subject, relation, object, child, depth)? {
                        return Ok(false);
                    }
                }
                Ok(!children.is_empty())
            }
            RelationExpr::Exclusion { include, exclude } => {
                if !self.evaluate_expr(walk, subject, relation, object, include, depth)? {
                    return Ok(false);
                }
                Ok(!self.evaluate_expr(walk, subject, relation, object, exclude, depth)?)
            }
        }
    }

    /// Subjects holding `relation` on `object`, usersets expanded one
    /// level. Backs the `rebac_expand` surface.
    pub fn expand(
        &self,
        source: &dyn TupleSource,
        relation: &str,
        object: &Entity,
        zone_id: &str,
    ) -> NexusResult<Vec<Entity>> {
        let mut out: Vec<Entity> = Vec::new();
        let mut queue = vec![(relation.to_owned(), object.clone(), 0u32)];
        let mut seen: HashSet<(String, Entity)> = HashSet::new();
        while let Some((relation, object, depth)) = queue.pop() {
            if depth > self.max_depth || !seen.insert((relation.clone(), object.clone())) {
                continue;
            }
            for tuple in source.tuples_on_object(&relation, &object, zone_id)? {
                match &tuple.subject_relation {
                    None => {
                        if !out.contains(&tuple.subject) {
                            out.push(tuple.subject.clone());
                        }
                    }
                    Some(userset_relation) => {
                        queue.push((userset_relation.clone(), tuple.subject.clone(), depth + 1));
                    }
                }
            }
            if let Some(config) = self.namespaces.get(&object.entity_type) {
                if let Some(expr) = config.relations.get(&relation) {
                    let mut referenced = Vec::new();
                    expr.referenced_relations(&mut referenced);
                    for other in referenced {
                        if other != "parent" {
                            queue.push((other, object.clone(), depth + 1));
                        }
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }
}
