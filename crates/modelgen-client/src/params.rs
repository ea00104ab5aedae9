use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{ClientError, Result};
use crate::state::ModelState;
use crate::wire::GenerateRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub default: String,
    pub value: String,
}

/// Parameter schema of one model, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    entries: BTreeMap<String, Parameter>,
}

impl ParameterSet {
    /// Accepts `{name: scalar}` or `{name: {value|current, default}}`.
    /// JSON objects cannot repeat keys, so names are unique by construction.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(ClientError::malformed("parameters must be a JSON object"));
        };

        let mut entries = BTreeMap::new();
        for (name, raw) in object {
            if name.trim().is_empty() {
                return Err(ClientError::malformed("parameter names must not be empty"));
            }
            let (value, default) = match raw {
                Value::Object(fields) => {
                    let current = fields
                        .get("value")
                        .or_else(|| fields.get("current"))
                        .map(scalar_text)
                        .transpose()?;
                    let default = fields.get("default").map(scalar_text).transpose()?;
                    match (current, default) {
                        (Some(current), Some(default)) => (current, default),
                        (Some(current), None) => (current.clone(), current),
                        (None, Some(default)) => (default.clone(), default),
                        (None, None) => {
                            return Err(ClientError::malformed(format!(
                                "parameter `{name}` has neither value nor default"
                            )));
                        }
                    }
                }
                other => {
                    let text = scalar_text(other)?;
                    (text.clone(), text)
                }
            };
            entries.insert(
                name.clone(),
                Parameter {
                    name: name.clone(),
                    default,
                    value,
                },
            );
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.entries.values()
    }
}

fn scalar_text(value: &Value) -> Result<String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        other => Err(ClientError::malformed(format!(
            "parameter values must be scalars, got {other}"
        ))),
    }
}

/// Editable fields for the current model. Rebuilt from the tracker after
/// every applied update, so fields from an older schema never survive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterEditor {
    model_id: Option<String>,
    model_type: Option<String>,
    fields: BTreeMap<String, String>,
}

impl ParameterEditor {
    pub fn from_state(state: &ModelState) -> Self {
        Self {
            model_id: Some(state.model_id.clone()),
            model_type: state.model_type.clone(),
            fields: state
                .parameters
                .iter()
                .map(|param| (param.name.clone(), param.value.clone()))
                .collect(),
        }
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        match self.fields.get_mut(name) {
            Some(field) => {
                *field = value.into();
                Ok(())
            }
            None => Err(ClientError::UnknownParameter(name.to_string())),
        }
    }

    /// Restores every field to its schema default.
    pub fn reset(&mut self, state: &ModelState) {
        for param in state.parameters.iter() {
            if let Some(field) = self.fields.get_mut(&param.name) {
                field.clone_from(&param.default);
            }
        }
    }

    pub fn values(&self) -> BTreeMap<String, String> {
        self.fields.clone()
    }

    /// Regeneration request: carries the existing model id when there is one,
    /// so the backend updates that model in place.
    pub fn request(&self, session_id: Option<&str>) -> GenerateRequest {
        GenerateRequest {
            prompt: None,
            model_type: self.model_type.clone(),
            parameters: self.values(),
            session_id: session_id.map(str::to_string),
            model_id: self.model_id.clone(),
        }
    }
}
