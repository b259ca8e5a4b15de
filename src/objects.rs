//! Schemas for the `objects` module.

use serde::{Deserialize, Serialize};

use crate::resource::{Resource, Service};

/// An address object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_netmask: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_range: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Resource for Address {
    const MODULE: &'static str = "objects";
    const PATH: &'static str = "/addresses";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

/// A tag object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Resource for Tag {
    const MODULE: &'static str = "objects";
    const PATH: &'static str = "/tags";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

pub type AddressService = Service<Address>;
pub type TagService = Service<Tag>;
