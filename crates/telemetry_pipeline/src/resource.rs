//! Process identity attached to every exported batch.

use crate::span::AttributeValue;
use serde::Serialize;
use std::collections::BTreeMap;

/// Well-known attribute key for the logical service name.
pub const SERVICE_NAME: &str = "service.name";
/// Well-known attribute key for the deployment environment.
pub const DEPLOYMENT_ENVIRONMENT: &str = "deployment.environment";

/// Immutable identity attributes (service name, environment, ...).
///
/// Built once at startup and shared behind an `Arc` by every processor.
/// A `Resource` always carries `service.name`; [`ResourceBuilder::build`]
/// refuses to produce one without it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    attributes: BTreeMap<String, AttributeValue>,
}

impl Resource {
    /// Starts a builder for the given service name.
    pub fn builder(service_name: impl Into<String>) -> ResourceBuilder {
        ResourceBuilder::new(service_name)
    }

    /// Returns the `service.name` attribute.
    pub fn service_name(&self) -> &str {
        match self.attributes.get(SERVICE_NAME) {
            Some(AttributeValue::String(name)) => name,
            _ => "",
        }
    }

    /// Looks up an attribute by key.
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Iterates attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Builder for [`Resource`].
#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    attributes: BTreeMap<String, AttributeValue>,
}

impl ResourceBuilder {
    fn new(service_name: impl Into<String>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            SERVICE_NAME.to_string(),
            AttributeValue::String(service_name.into()),
        );
        Self { attributes }
    }

    /// Sets `deployment.environment`.
    pub fn with_environment(self, environment: impl Into<String>) -> Self {
        self.with_attribute(
            DEPLOYMENT_ENVIRONMENT,
            AttributeValue::String(environment.into()),
        )
    }

    /// Adds a free-form attribute. `service.name` cannot be overwritten here.
    pub fn with_attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        let key = key.into();
        if key != SERVICE_NAME {
            self.attributes.insert(key, value);
        }
        self
    }

    /// Finishes the resource, failing if the service name is blank.
    pub fn build(self) -> Result<Resource, crate::error::ConfigError> {
        let blank = match self.attributes.get(SERVICE_NAME) {
            Some(AttributeValue::String(name)) => name.trim().is_empty(),
            _ => true,
        };
        if blank {
            return Err(crate::error::ConfigError::MissingAttribute(
                SERVICE_NAME.to_string(),
            ));
        }
        Ok(Resource {
            attributes: self.attributes,
        })
    }
}
