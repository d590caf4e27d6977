//! Namespace configuration: per-object-type relation expression trees.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One node of a relation rewrite tree.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationExpr {
    /// Direct tuples carrying the relation itself.
    This,
    /// Another relation on the same object.
    ComputedUserset { relation: String },
    /// Indirect via another object: follow `tupleset` edges from the
    /// object, then require `computed_userset` there.
    TupleToUserset { tupleset: String, computed_userset: String },
    Union(Vec<RelationExpr>),
    Intersection(Vec<RelationExpr>),
    Exclusion { include: Box<RelationExpr>, exclude: Box<RelationExpr> },
}

impl RelationExpr {
    pub fn computed(relation: &str) -> Self {
        RelationExpr::ComputedUserset { relation: relation.to_owned() }
    }

    pub fn via_parent(computed_userset: &str) -> Self {
        RelationExpr::TupleToUserset {
            tupleset: "parent".to_owned(),
            computed_userset: computed_userset.to_owned(),
        }
    }

    /// Relations this expression references, used to derive the
    /// permissions affected by a tuple change.
    pub fn referenced_relations(&self, out: &mut Vec<String>) {
        match self {
            RelationExpr::This => {}
            RelationExpr::ComputedUserset { relation } => out.push(relation.clone()),
            RelationExpr::TupleToUserset { tupleset, computed_userset } => {
                out.push(tupleset.clone());
                out.push(computed_userset.clone());
            }
            RelationExpr::Union(children) | RelationExpr::Intersection(children) => {
                for child in children {
                    child.referenced_relations(out);
                }
            }
            RelationExpr::Exclusion { include, exclude } => {
                include.referenced_relations(out);
                exclude.referenced_relations(out);
            }
        }
    }
}

/// Relation definitions for one object type.
#[derive(Debug, Clone, Default)]
pub struct NamespaceConfig {
    pub object_type: String,
    pub relations: HashMap<String, RelationExpr>,
}

impl NamespaceConfig {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self { object_type: object_type.into(), relations: HashMap::new() }
    }

    pub fn relation(mut self, name: &str, expr: RelationExpr) -> Self {
        self.relations.insert(name.to_owned(), expr);
        self
    }

    /// Default namespace for files: ownership implies editing implies
    /// viewing, each tier inheriting down the parent chain and accepting
    /// its cross-zone shared variant.
    pub fn default_file() -> Self {
        NamespaceConfig::new("file")
            .relation("parent", RelationExpr::This)
            .relation("direct_owner", RelationExpr::This)
            .relation("direct_editor", RelationExpr::This)
            .relation("direct_viewer", RelationExpr::This)
            .relation("shared-owner", RelationExpr::This)
            .relation("shared-editor", RelationExpr::This)
            .relation("shared-viewer", RelationExpr::This)
            .relation(
                "owner",
                RelationExpr::Union(vec![
                    RelationExpr::This,
                    RelationExpr::computed("direct_owner"),
                    RelationExpr::computed("shared-owner"),
                    RelationExpr::via_parent("owner"),
                ]),
            )
            .relation(
                "editor",
                RelationExpr::Union(vec![
                    RelationExpr::This,
                    RelationExpr::computed("direct_editor"),
                    RelationExpr::computed("owner"),
                    RelationExpr::computed("shared-editor"),
                    RelationExpr::via_parent("editor"),
                ]),
            )
            .relation(
                "viewer",
                RelationExpr::Union(vec![
                    RelationExpr::This,
                    RelationExpr::computed("direct_viewer"),
                    RelationExpr::computed("editor"),
                    RelationExpr::computed("shared-viewer"),
                    RelationExpr::via_parent("viewer"),
                ]),
            )
            .relation("read", RelationExpr::computed("viewer"))
            .relation("write", RelationExpr::computed("editor"))
            .relation("traverse", RelationExpr::computed("viewer"))
    }

    /// Default namespace for groups: membership only.
    pub fn default_group() -> Self {
        NamespaceConfig::new("group")
            .relation("member", RelationExpr::This)
            .relation("owner", RelationExpr::This)
    }
}

/// Registry of namespace configs, caller-extensible.
pub struct NamespaceRegistry {
    configs: RwLock<HashMap<String, Arc<NamespaceConfig>>>,
}

impl NamespaceRegistry {
    /// Registry preloaded with the built-in file and group namespaces.
    pub fn with_defaults() -> Self {
        let registry = Self { configs: RwLock::new(HashMap::new()) };
        registry.register(NamespaceConfig::default_file());
        registry.register(NamespaceConfig::default_group());
        registry
    }

    pub fn register(&self, config: NamespaceConfig) {
        let mut guard = self.configs.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(config.object_type.clone(), Arc::new(config));
    }

    pub fn get(&self, object_type: &str) -> Option<Arc<NamespaceConfig>> {
        let guard = self.configs.read().unwrap_or_else(|e| e.into_inner());
        guard.get(object_type).cloned()
    }

    /// Permissions on `object_type` whose expansion mentions `relation`,
    /// capped at `limit`; drives eager recomputation.
    pub fn permissions_affected_by(
        &self,
        object_type: &str,
        relation: &str,
        limit: usize,
    ) -> Vec<String> {
        let Some(config) = self.get(object_type) else {
            return Vec::new();
        };
        let mut affected = Vec::new();
        // Transitive closure over referenced relations: start from the
        // changed relation and keep adding relations that mention one
        // already reached.
        let mut reached: Vec<String> = vec![relation.to_owned()];
        let mut changed = true;
        while changed {
            changed = false;
            for (name, expr) in &config.relations {
                if reached.contains(name) {
                    continue;
                }
                let mut refs = Vec::new();
                expr.referenced_relations(&mut refs);
                if refs.iter().any(|r| reached.contains(r)) {
                    reached.push(name.clone());
                    changed = true;
                }
            }
        }
        for name in reached {
            if name != relation && affected.len() < limit {
                affected.push(name);
            }
        }
        affected.sort();
        affected
    }
}
