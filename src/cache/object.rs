//! Ontology data carried through the cache: objects, references and object sets.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Primary key of an ontology object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Int(i64),
    Str(String),
}

impl PrimaryKey {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(value) => Value::from(*value),
            Self::Str(value) => Value::from(value.as_str()),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => f.write_str(value),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Identity of one object: its type and primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "$apiName")]
    pub api_name: String,
    #[serde(rename = "$primaryKey")]
    pub primary_key: PrimaryKey,
}

impl ObjectRef {
    pub fn new(api_name: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        Self {
            api_name: api_name.into(),
            primary_key: primary_key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.api_name, self.primary_key)
    }
}

/// An ontology object as returned by the network and stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsdkObject {
    #[serde(rename = "$apiName")]
    pub api_name: String,
    #[serde(rename = "$primaryKey")]
    pub primary_key: PrimaryKey,
    #[serde(flatten)]
    pub properties: BTreeMap<String, Value>,
}

impl OsdkObject {
    pub fn new(api_name: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        Self {
            api_name: api_name.into(),
            primary_key: primary_key.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Property lookup; `$apiName` and `$primaryKey` resolve to the identity fields.
    pub fn property(&self, name: &str) -> Option<Value> {
        match name {
            "$apiName" => Some(Value::from(self.api_name.as_str())),
            "$primaryKey" => Some(self.primary_key.to_value()),
            _ => self.properties.get(name).cloned(),
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            api_name: self.api_name.clone(),
            primary_key: self.primary_key.clone(),
        }
    }
}

/// Wire form of an object set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ObjectSet {
    Base {
        object_type: String,
    },
    InterfaceBase {
        interface_type: String,
    },
    Filter {
        object_set: Box<ObjectSet>,
        r#where: Value,
    },
    SearchAround {
        object_set: Box<ObjectSet>,
        link: String,
    },
    InterfaceLinkSearchAround {
        object_set: Box<ObjectSet>,
        interface_link: String,
    },
    Union {
        object_sets: Vec<ObjectSet>,
    },
    Intersect {
        object_sets: Vec<ObjectSet>,
    },
    Subtract {
        object_sets: Vec<ObjectSet>,
    },
    Static {
        objects: Vec<ObjectRef>,
    },
    Reference {
        reference: String,
    },
}

impl ObjectSet {
    pub fn base(object_type: impl Into<String>) -> Self {
        Self::Base {
            object_type: object_type.into(),
        }
    }

    pub fn interface(interface_type: impl Into<String>) -> Self {
        Self::InterfaceBase {
            interface_type: interface_type.into(),
        }
    }

    pub fn filter(self, where_clause: Value) -> Self {
        Self::Filter {
            object_set: Box::new(self),
            r#where: where_clause,
        }
    }

    pub fn search_around(self, link: impl Into<String>) -> Self {
        Self::SearchAround {
            object_set: Box::new(self),
            link: link.into(),
        }
    }

    pub fn union(object_sets: Vec<ObjectSet>) -> Self {
        Self::Union { object_sets }
    }

    pub fn intersect(object_sets: Vec<ObjectSet>) -> Self {
        Self::Intersect { object_sets }
    }

    pub fn subtract(object_sets: Vec<ObjectSet>) -> Self {
        Self::Subtract { object_sets }
    }

    /// JSON wire form.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
