use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::{Canonical, Canonicalizer, ParamsCanonicalizer, StructuralHash};
use crate::cache::error::CacheError;
use crate::cache::metadata::{LinkTargetKind, OntologyMetadata};
use crate::cache::object::{ObjectRef, ObjectSet};

/// Result type of an object set, as far as metadata can tell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SetType {
    Object(String),
    Interface(String),
    Unknown,
}

impl SetType {
    pub fn object_type(&self) -> Option<&str> {
        match self {
            Self::Object(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for SetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(name) => write!(f, "object:{name}"),
            Self::Interface(name) => write!(f, "interface:{name}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Canonical object-set node. Children are canonical, so equality is shallow.
#[derive(Debug, PartialEq, Eq, Hash)]
pub enum CanonicalObjectSet {
    Base(String),
    InterfaceBase(String),
    Filter {
        object_set: Canonical<CanonicalObjectSet>,
        where_clause: Canonical<Value>,
    },
    SearchAround {
        object_set: Canonical<CanonicalObjectSet>,
        link: String,
    },
    InterfaceLinkSearchAround {
        object_set: Canonical<CanonicalObjectSet>,
        link: String,
    },
    /// Children sorted by identity and deduplicated.
    Union(Vec<Canonical<CanonicalObjectSet>>),
    /// Children sorted by identity and deduplicated.
    Intersect(Vec<Canonical<CanonicalObjectSet>>),
    /// Children in the given order.
    Subtract(Vec<Canonical<CanonicalObjectSet>>),
    Static(Vec<ObjectRef>),
    Reference(String),
    /// Subtree beyond the depth limit, kept in its raw wire form.
    Opaque(Canonical<Value>),
}

impl CanonicalObjectSet {
    /// Rebuild the wire form for network requests.
    pub fn to_wire(&self) -> ObjectSet {
        match self {
            Self::Base(object_type) => ObjectSet::base(object_type.clone()),
            Self::InterfaceBase(interface_type) => ObjectSet::interface(interface_type.clone()),
            Self::Filter {
                object_set,
                where_clause,
            } => object_set.to_wire().filter((**where_clause).clone()),
            Self::SearchAround { object_set, link } => {
                object_set.to_wire().search_around(link.clone())
            }
            Self::InterfaceLinkSearchAround { object_set, link } => {
                ObjectSet::InterfaceLinkSearchAround {
                    object_set: Box::new(object_set.to_wire()),
                    interface_link: link.clone(),
                }
            }
            Self::Union(children) => ObjectSet::union(wire_all(children)),
            Self::Intersect(children) => ObjectSet::intersect(wire_all(children)),
            Self::Subtract(children) => ObjectSet::subtract(wire_all(children)),
            Self::Static(objects) => ObjectSet::Static {
                objects: objects.clone(),
            },
            Self::Reference(reference) => ObjectSet::Reference {
                reference: reference.clone(),
            },
            Self::Opaque(raw) => serde_json::from_value((**raw).clone())
                .unwrap_or_else(|_| ObjectSet::Static { objects: Vec::new() }),
        }
    }
}

fn wire_all(children: &[Canonical<CanonicalObjectSet>]) -> Vec<ObjectSet> {
    children.iter().map(|child| child.to_wire()).collect()
}

impl StructuralHash for CanonicalObjectSet {
    fn structural_hash<H: Hasher>(&self, state: &mut H) {
        self.hash(state);
    }
}

/// Canonicalizes object sets so that semantically equal sets share one
/// instance: union and intersect ignore child order, subtract does not, and
/// where clauses go through the parameter canonicalizer.
pub struct ObjectSetCanonicalizer {
    interned: Canonicalizer<CanonicalObjectSet>,
    params: Arc<ParamsCanonicalizer>,
    metadata: Arc<dyn OntologyMetadata>,
}

impl fmt::Debug for ObjectSetCanonicalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectSetCanonicalizer")
            .field("interned", &self.interned)
            .finish_non_exhaustive()
    }
}

impl ObjectSetCanonicalizer {
    pub fn new(params: Arc<ParamsCanonicalizer>, metadata: Arc<dyn OntologyMetadata>) -> Self {
        Self {
            interned: Canonicalizer::new("object_set"),
            params,
            metadata,
        }
    }

    pub fn canonicalize(
        &self,
        set: &ObjectSet,
    ) -> Result<Canonical<CanonicalObjectSet>, CacheError> {
        self.canonicalize_typed(set).map(|(canonical, _)| canonical)
    }

    /// Canonicalize and report the set's result type.
    pub fn canonicalize_typed(
        &self,
        set: &ObjectSet,
    ) -> Result<(Canonical<CanonicalObjectSet>, SetType), CacheError> {
        self.visit(set, 0)
    }

    fn visit(
        &self,
        set: &ObjectSet,
        depth: usize,
    ) -> Result<(Canonical<CanonicalObjectSet>, SetType), CacheError> {
        if depth > self.params.depth_limit() {
            debug!(
                depth,
                limit = self.params.depth_limit(),
                "Canonical depth limit reached"
            );
            let raw = self.params.intern_raw(set.to_json());
            return Ok((
                self.interned.intern(CanonicalObjectSet::Opaque(raw)),
                SetType::Unknown,
            ));
        }

        let (node, set_type) = match set {
            ObjectSet::Base { object_type } => (
                CanonicalObjectSet::Base(object_type.clone()),
                SetType::Object(object_type.clone()),
            ),
            ObjectSet::InterfaceBase { interface_type } => (
                CanonicalObjectSet::InterfaceBase(interface_type.clone()),
                SetType::Interface(interface_type.clone()),
            ),
            ObjectSet::Filter {
                object_set,
                r#where,
            } => {
                let (inner, set_type) = self.visit(object_set, depth + 1)?;
                let where_clause = self.params.canonicalize_json(r#where);
                (
                    CanonicalObjectSet::Filter {
                        object_set: inner,
                        where_clause,
                    },
                    set_type,
                )
            }
            ObjectSet::SearchAround { object_set, link } => {
                let (inner, source) = self.visit(object_set, depth + 1)?;
                let target = match &source {
                    SetType::Object(name) => {
                        let definition = self.metadata.object_definition(name)?;
                        SetType::Object(definition.link(link)?.target_type.clone())
                    }
                    _ => SetType::Unknown,
                };
                (
                    CanonicalObjectSet::SearchAround {
                        object_set: inner,
                        link: link.clone(),
                    },
                    target,
                )
            }
            ObjectSet::InterfaceLinkSearchAround {
                object_set,
                interface_link,
            } => {
                let (inner, source) = self.visit(object_set, depth + 1)?;
                let target = match &source {
                    SetType::Interface(name) => {
                        let definition = self.metadata.interface_definition(name)?;
                        let link = definition.link(interface_link)?;
                        match link.target_kind {
                            LinkTargetKind::Object => SetType::Object(link.target_api_name.clone()),
                            LinkTargetKind::Interface => {
                                SetType::Interface(link.target_api_name.clone())
                            }
                        }
                    }
                    _ => SetType::Unknown,
                };
                (
                    CanonicalObjectSet::InterfaceLinkSearchAround {
                        object_set: inner,
                        link: interface_link.clone(),
                    },
                    target,
                )
            }
            ObjectSet::Union { object_sets } => {
                let (children, set_type) = self.visit_children("union", object_sets, depth)?;
                (
                    CanonicalObjectSet::Union(sorted_unique(children)),
                    set_type,
                )
            }
            ObjectSet::Intersect { object_sets } => {
                let (children, set_type) = self.visit_children("intersect", object_sets, depth)?;
                (
                    CanonicalObjectSet::Intersect(sorted_unique(children)),
                    set_type,
                )
            }
            ObjectSet::Subtract { object_sets } => {
                let (children, set_type) = self.visit_children("subtract", object_sets, depth)?;
                (CanonicalObjectSet::Subtract(children), set_type)
            }
            ObjectSet::Static { objects } => {
                let mut objects = objects.clone();
                objects.sort();
                objects.dedup();
                let mut set_type = SetType::Unknown;
                for object in &objects {
                    set_type = merge_types(
                        "static",
                        set_type,
                        SetType::Object(object.api_name.clone()),
                    )?;
                }
                (CanonicalObjectSet::Static(objects), set_type)
            }
            ObjectSet::Reference { reference } => (
                CanonicalObjectSet::Reference(reference.clone()),
                SetType::Unknown,
            ),
        };

        Ok((self.interned.intern(node), set_type))
    }

    fn visit_children(
        &self,
        operation: &'static str,
        object_sets: &[ObjectSet],
        depth: usize,
    ) -> Result<(Vec<Canonical<CanonicalObjectSet>>, SetType), CacheError> {
        if object_sets.is_empty() {
            return Err(CacheError::EmptySetOperation { operation });
        }

        let mut children = Vec::with_capacity(object_sets.len());
        let mut set_type = SetType::Unknown;
        for child in object_sets {
            let (canonical, child_type) = self.visit(child, depth + 1)?;
            set_type = merge_types(operation, set_type, child_type)?;
            children.push(canonical);
        }
        Ok((children, set_type))
    }
}

fn merge_types(
    operation: &'static str,
    current: SetType,
    next: SetType,
) -> Result<SetType, CacheError> {
    match (current, next) {
        (SetType::Unknown, next) => Ok(next),
        (current, SetType::Unknown) => Ok(current),
        (current, next) if current == next => Ok(current),
        (current, next) => Err(CacheError::incompatible(
            operation,
            current.to_string(),
            next.to_string(),
        )),
    }
}

fn sorted_unique(
    mut children: Vec<Canonical<CanonicalObjectSet>>,
) -> Vec<Canonical<CanonicalObjectSet>> {
    children.sort_by_key(Canonical::address);
    children.dedup_by(|a, b| a.ptr_eq(b));
    children
}
