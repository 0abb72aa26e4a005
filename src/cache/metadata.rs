//! Ontology type metadata consumed by canonicalization and invalidation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("unknown object type `{0}`")]
    UnknownObjectType(String),
    #[error("unknown interface `{0}`")]
    UnknownInterface(String),
    #[error("`{owner}` has no link named `{link}`")]
    UnknownLink { owner: String, link: String },
}

impl MetadataError {
    pub fn unknown_link(owner: impl Into<String>, link: impl Into<String>) -> Self {
        Self::UnknownLink {
            owner: owner.into(),
            link: link.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMultiplicity {
    One,
    Many,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDefinition {
    pub target_type: String,
    pub multiplicity: LinkMultiplicity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectDefinition {
    pub api_name: String,
    pub primary_key_api_name: String,
    pub links: BTreeMap<String, LinkDefinition>,
    pub implements: Vec<String>,
}

impl ObjectDefinition {
    pub fn new(api_name: impl Into<String>, primary_key_api_name: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            primary_key_api_name: primary_key_api_name.into(),
            ..Default::default()
        }
    }

    pub fn with_link(
        mut self,
        name: impl Into<String>,
        target_type: impl Into<String>,
        multiplicity: LinkMultiplicity,
    ) -> Self {
        self.links.insert(
            name.into(),
            LinkDefinition {
                target_type: target_type.into(),
                multiplicity,
            },
        );
        self
    }

    pub fn link(&self, name: &str) -> Result<&LinkDefinition, MetadataError> {
        self.links
            .get(name)
            .ok_or_else(|| MetadataError::unknown_link(&self.api_name, name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTargetKind {
    Object,
    Interface,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceLinkDefinition {
    pub target_api_name: String,
    pub target_kind: LinkTargetKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceDefinition {
    pub api_name: String,
    pub implemented_by: Vec<String>,
    pub links: BTreeMap<String, InterfaceLinkDefinition>,
}

impl InterfaceDefinition {
    pub fn new(api_name: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            ..Default::default()
        }
    }

    pub fn implemented_by(mut self, object_type: impl Into<String>) -> Self {
        self.implemented_by.push(object_type.into());
        self
    }

    pub fn with_link(
        mut self,
        name: impl Into<String>,
        target_api_name: impl Into<String>,
        target_kind: LinkTargetKind,
    ) -> Self {
        self.links.insert(
            name.into(),
            InterfaceLinkDefinition {
                target_api_name: target_api_name.into(),
                target_kind,
            },
        );
        self
    }

    pub fn link(&self, name: &str) -> Result<&InterfaceLinkDefinition, MetadataError> {
        self.links
            .get(name)
            .ok_or_else(|| MetadataError::unknown_link(&self.api_name, name))
    }
}

/// Synchronous type-metadata provider.
pub trait OntologyMetadata: Send + Sync {
    fn object_definition(&self, api_name: &str) -> Result<Arc<ObjectDefinition>, MetadataError>;

    fn interface_definition(
        &self,
        api_name: &str,
    ) -> Result<Arc<InterfaceDefinition>, MetadataError>;
}

/// In-memory metadata provider.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    objects: HashMap<String, Arc<ObjectDefinition>>,
    interfaces: HashMap<String, Arc<InterfaceDefinition>>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, definition: ObjectDefinition) -> Self {
        self.objects
            .insert(definition.api_name.clone(), Arc::new(definition));
        self
    }

    pub fn with_interface(mut self, definition: InterfaceDefinition) -> Self {
        self.interfaces
            .insert(definition.api_name.clone(), Arc::new(definition));
        self
    }
}

impl OntologyMetadata for StaticMetadata {
    fn object_definition(&self, api_name: &str) -> Result<Arc<ObjectDefinition>, MetadataError> {
        self.objects
            .get(api_name)
            .cloned()
            .ok_or_else(|| MetadataError::UnknownObjectType(api_name.to_string()))
    }

    fn interface_definition(
        &self,
        api_name: &str,
    ) -> Result<Arc<InterfaceDefinition>, MetadataError> {
        self.interfaces
            .get(api_name)
            .cloned()
            .ok_or_else(|| MetadataError::UnknownInterface(api_name.to_string()))
    }
}
