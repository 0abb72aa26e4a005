//! Which object types invalidate a composite object set.
//!
//! For `Employee.where(..).pivot(lead)` the result type is `Employee` and the
//! chain also reads `Employee` on the way in, so any `Employee` change must
//! invalidate it. For `Office.pivot(occupants)` only the result type is read;
//! changes to `Employee` objects are handled by ordinary list updates and do
//! not need a full refetch.
//!
//! Types are counted per occurrence in the chain; set operations merge child
//! counts by maximum, and the result type is uncounted once at the end. Every
//! type left with a positive count invalidates the set.

use std::collections::{BTreeMap, BTreeSet};

use super::canonical::SetType;
use super::error::CacheError;
use super::metadata::{LinkTargetKind, OntologyMetadata};
use super::object::ObjectSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationSet {
    pub result_type: SetType,
    pub counts: BTreeMap<String, usize>,
    pub types: BTreeSet<String>,
}

impl InvalidationSet {
    pub fn contains(&self, api_name: &str) -> bool {
        self.types.contains(api_name)
    }
}

pub fn object_types_that_invalidate(
    metadata: &dyn OntologyMetadata,
    object_set: &ObjectSet,
) -> Result<InvalidationSet, CacheError> {
    let mut counts = BTreeMap::new();
    let result_type = visit(metadata, object_set, &mut counts)?;

    let mut tweaked = counts.clone();
    if let SetType::Object(name) = &result_type
        && let Some(count) = tweaked.get_mut(name)
    {
        *count = count.saturating_sub(1);
    }

    let types = tweaked
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(name, _)| name)
        .collect();

    Ok(InvalidationSet {
        result_type,
        counts,
        types,
    })
}

fn bump_object(counts: &mut BTreeMap<String, usize>, api_name: &str) -> SetType {
    *counts.entry(api_name.to_string()).or_default() += 1;
    SetType::Object(api_name.to_string())
}

fn bump_interface(
    metadata: &dyn OntologyMetadata,
    counts: &mut BTreeMap<String, usize>,
    api_name: &str,
) -> Result<SetType, CacheError> {
    let definition = metadata.interface_definition(api_name)?;
    for implementer in &definition.implemented_by {
        *counts.entry(implementer.clone()).or_default() += 1;
    }
    Ok(SetType::Interface(api_name.to_string()))
}

fn visit(
    metadata: &dyn OntologyMetadata,
    object_set: &ObjectSet,
    counts: &mut BTreeMap<String, usize>,
) -> Result<SetType, CacheError> {
    match object_set {
        ObjectSet::Base { object_type } => {
            metadata.object_definition(object_type)?;
            Ok(bump_object(counts, object_type))
        }
        ObjectSet::InterfaceBase { interface_type } => {
            bump_interface(metadata, counts, interface_type)
        }
        ObjectSet::Filter { object_set, .. } => visit(metadata, object_set, counts),
        ObjectSet::SearchAround { object_set, link } => {
            let source = visit(metadata, object_set, counts)?;
            let SetType::Object(source) = source else {
                return Err(CacheError::UnsupportedObjectSet {
                    kind: "searchAround over a non-object set",
                });
            };
            let definition = metadata.object_definition(&source)?;
            let target = definition.link(link)?.target_type.clone();
            Ok(bump_object(counts, &target))
        }
        ObjectSet::InterfaceLinkSearchAround {
            object_set,
            interface_link,
        } => {
            let source = visit(metadata, object_set, counts)?;
            let SetType::Interface(source) = source else {
                return Err(CacheError::UnsupportedObjectSet {
                    kind: "interfaceLinkSearchAround over a non-interface set",
                });
            };
            let definition = metadata.interface_definition(&source)?;
            let link = definition.link(interface_link)?;
            match link.target_kind {
                LinkTargetKind::Object => Ok(bump_object(counts, &link.target_api_name)),
                LinkTargetKind::Interface => {
                    bump_interface(metadata, counts, &link.target_api_name)
                }
            }
        }
        ObjectSet::Union { object_sets } => merge_children(metadata, "union", object_sets, counts),
        ObjectSet::Intersect { object_sets } => {
            merge_children(metadata, "intersect", object_sets, counts)
        }
        ObjectSet::Subtract { object_sets } => {
            merge_children(metadata, "subtract", object_sets, counts)
        }
        ObjectSet::Static { .. } => Err(CacheError::UnsupportedObjectSet { kind: "static" }),
        ObjectSet::Reference { .. } => Err(CacheError::UnsupportedObjectSet { kind: "reference" }),
    }
}

fn merge_children(
    metadata: &dyn OntologyMetadata,
    operation: &'static str,
    object_sets: &[ObjectSet],
    counts: &mut BTreeMap<String, usize>,
) -> Result<SetType, CacheError> {
    let mut result: Option<SetType> = None;
    for child in object_sets {
        let mut child_counts = BTreeMap::new();
        let child_type = visit(metadata, child, &mut child_counts)?;
        for (name, count) in child_counts {
            let slot = counts.entry(name).or_default();
            *slot = (*slot).max(count);
        }
        match &result {
            None => result = Some(child_type),
            Some(existing) if *existing == child_type => {}
            Some(existing) => {
                return Err(CacheError::incompatible(
                    operation,
                    existing.to_string(),
                    child_type.to_string(),
                ));
            }
        }
    }
    result.ok_or(CacheError::EmptySetOperation { operation })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::metadata::{
        InterfaceDefinition, LinkMultiplicity, ObjectDefinition, StaticMetadata,
    };

    fn metadata() -> StaticMetadata {
        StaticMetadata::new()
            .with_object(
                ObjectDefinition::new("Employee", "id")
                    .with_link("lead", "Employee", LinkMultiplicity::One)
                    .with_link("office", "Office", LinkMultiplicity::One),
            )
            .with_object(
                ObjectDefinition::new("Office", "id").with_link(
                    "occupants",
                    "Employee",
                    LinkMultiplicity::Many,
                ),
            )
            .with_object(ObjectDefinition::new("Contractor", "id"))
            .with_interface(
                InterfaceDefinition::new("Worker")
                    .implemented_by("Employee")
                    .implemented_by("Contractor"),
            )
    }

    fn types(set: &InvalidationSet) -> Vec<&str> {
        set.types.iter().map(String::as_str).collect()
    }

    #[test]
    fn base_set_invalidates_nothing_beyond_itself() {
        let result = object_types_that_invalidate(&metadata(), &ObjectSet::base("Employee"))
            .expect("invalidation set");
        assert_eq!(result.result_type, SetType::Object("Employee".to_string()));
        assert!(result.types.is_empty());
    }

    #[test]
    fn pivot_back_to_the_source_type_invalidates_it() {
        let set = ObjectSet::base("Employee")
            .filter(json!({"name": "Ada"}))
            .search_around("lead");
        let result = object_types_that_invalidate(&metadata(), &set).expect("invalidation set");
        assert_eq!(types(&result), vec!["Employee"]);
    }

    #[test]
    fn pivot_to_another_type_invalidates_the_source() {
        let set = ObjectSet::base("Office").search_around("occupants");
        let result = object_types_that_invalidate(&metadata(), &set).expect("invalidation set");
        assert_eq!(result.result_type, SetType::Object("Employee".to_string()));
        assert_eq!(types(&result), vec!["Office"]);
    }

    #[test]
    fn set_operations_merge_counts_by_maximum() {
        let pivot = ObjectSet::base("Employee").search_around("office");
        let set = ObjectSet::union(vec![pivot.clone(), pivot]);
        let result = object_types_that_invalidate(&metadata(), &set).expect("invalidation set");
        assert_eq!(result.counts.get("Employee"), Some(&1));
        assert_eq!(result.counts.get("Office"), Some(&1));
        assert_eq!(types(&result), vec!["Employee"]);
    }

    #[test]
    fn interface_base_counts_implementers() {
        let result = object_types_that_invalidate(&metadata(), &ObjectSet::interface("Worker"))
            .expect("invalidation set");
        assert_eq!(types(&result), vec!["Contractor", "Employee"]);
    }

    #[test]
    fn mismatched_set_operation_types_are_rejected() {
        let set = ObjectSet::intersect(vec![ObjectSet::base("Employee"), ObjectSet::base("Office")]);
        assert!(matches!(
            object_types_that_invalidate(&metadata(), &set),
            Err(CacheError::IncompatibleSetTypes { .. })
        ));
    }

    #[test]
    fn static_and_reference_sets_are_unsupported() {
        let set = ObjectSet::Static {
            objects: Vec::new(),
        };
        assert!(matches!(
            object_types_that_invalidate(&metadata(), &set),
            Err(CacheError::UnsupportedObjectSet { kind: "static" })
        ));
    }
}
