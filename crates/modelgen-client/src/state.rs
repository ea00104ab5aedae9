use tracing::debug;

use crate::error::{ClientError, Result};
use crate::params::ParameterSet;
use crate::wire::ModelPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Parametric,
    Image,
}

impl ModelKind {
    pub fn from_type_tag(tag: Option<&str>) -> Self {
        match tag {
            Some("image") => Self::Image,
            _ => Self::Parametric,
        }
    }
}

/// Snapshot of the model currently shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelState {
    pub model_id: String,
    pub model_type: Option<String>,
    pub kind: ModelKind,
    pub code: Option<String>,
    pub preview_path: Option<String>,
    pub mesh_path: Option<String>,
    pub parameters: ParameterSet,
    pub revision: u64,
}

impl ModelState {
    pub fn from_payload(payload: &ModelPayload) -> Result<Self> {
        let model_id = payload
            .model_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ClientError::malformed("model payload has no model_id"))?;
        if !is_identifier(model_id) {
            return Err(ClientError::malformed(format!(
                "model_id `{model_id}` contains invalid characters"
            )));
        }

        if payload.code.is_none() && payload.preview_url.is_none() && payload.mesh_url.is_none() {
            return Err(ClientError::malformed(format!(
                "model `{model_id}` has no code, preview or mesh"
            )));
        }

        let parameters = match &payload.parameters {
            Some(value) if !value.is_null() => ParameterSet::from_json(value)?,
            _ => ParameterSet::default(),
        };

        Ok(Self {
            model_id: model_id.to_string(),
            model_type: payload.model_type.clone(),
            kind: ModelKind::from_type_tag(payload.model_type.as_deref()),
            code: payload.code.clone(),
            preview_path: payload.preview_url.clone(),
            mesh_path: payload.mesh_url.clone(),
            parameters,
            revision: payload.revision,
        })
    }
}

fn is_identifier(value: &str) -> bool {
    value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

/// Issued when a request that may update the model is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestTicket(u64);

impl RequestTicket {
    pub fn sequence(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// `new_model` is false when the update regenerated the model already shown.
    Applied { new_model: bool },
    /// A response to a newer request was applied first.
    Stale,
}

#[derive(Debug, Default)]
pub struct ModelStateTracker {
    current: Option<ModelState>,
    issued: u64,
    applied: u64,
}

impl ModelStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_request(&mut self) -> RequestTicket {
        self.issued += 1;
        RequestTicket(self.issued)
    }

    /// Replaces every tracked field at once. An invalid payload returns an
    /// error and leaves the previous state in place.
    pub fn apply(&mut self, ticket: RequestTicket, payload: &ModelPayload) -> Result<ApplyOutcome> {
        if ticket.0 <= self.applied {
            debug!(
                ticket = ticket.0,
                applied = self.applied,
                "discarding out-of-order model response"
            );
            return Ok(ApplyOutcome::Stale);
        }

        let next = ModelState::from_payload(payload)?;
        let new_model = self
            .current
            .as_ref()
            .is_none_or(|current| current.model_id != next.model_id);

        self.current = Some(next);
        self.applied = ticket.0;
        Ok(ApplyOutcome::Applied { new_model })
    }

    pub fn current(&self) -> Option<&ModelState> {
        self.current.as_ref()
    }

    pub fn last_applied(&self) -> u64 {
        self.applied
    }
}
