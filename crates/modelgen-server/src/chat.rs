use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::generation::{
    ChatTurn, LanguageModel, Role, SUPPORT_PROMPT, Shape, ShapeParameter, find_parameter_values,
};
use crate::store::new_id;

pub const WELCOME_MESSAGE: &str = "Hello! How can I help you with 3D model generation today?";
pub const APOLOGY: &str =
    "I'm sorry, I'm experiencing technical difficulties. Please try again later.";
const CONTEXT_TURNS: usize = 5;
const DEFAULT_IDLE: Duration = Duration::from_secs(24 * 60 * 60);

const REQUEST_VERBS: &[&str] = &[
    "create", "generate", "make", "build", "design", "model", "3d", "print",
];
const OBJECT_WORDS: &[&str] = &[
    "cube", "box", "sphere", "ball", "cylinder", "tube", "cone", "object", "shape", "pyramid",
    "gear", "bracket", "holder", "stand", "case", "container", "part",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("chat session `{0}` not found")]
    UnknownSession(String),
}

/// What the caller has to do with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatStep {
    /// Already recorded in the transcript.
    Reply(String),
    /// All parameters are known; build the model and record the reply.
    Build {
        shape: &'static Shape,
        values: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone)]
struct Collecting {
    shape: &'static Shape,
    values: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct Session {
    user_id: String,
    history: Vec<ChatTurn>,
    collecting: Option<Collecting>,
    last_active: Instant,
}

pub fn is_model_request(message: &str) -> bool {
    let lower = message.to_lowercase();
    REQUEST_VERBS.iter().any(|verb| lower.contains(verb))
        && OBJECT_WORDS.iter().any(|word| lower.contains(word))
}

fn wants_defaults(message: &str) -> bool {
    message.to_lowercase().contains("default")
}

fn missing_parameters(collecting: &Collecting) -> Vec<&'static ShapeParameter> {
    collecting
        .shape
        .parameters
        .iter()
        .filter(|parameter| !collecting.values.contains_key(parameter.name))
        .collect()
}

fn parameter_request(collecting: &Collecting) -> String {
    let mut message = format!(
        "To create your {}, I need a few more details:\n",
        collecting.shape.name
    );
    for parameter in missing_parameters(collecting) {
        message.push_str(&format!(
            "- {} (default is {})\n",
            parameter.name, parameter.default
        ));
    }
    message.push_str(
        "\nGive them all at once or one at a time, e.g. `radius = 5`, or say 'use defaults'.",
    );
    message
}

/// Per-session transcripts plus the parameter-collection state machine.
/// Sessions idle for longer than the timeout are dropped when new ones start.
pub struct ChatEngine {
    sessions: Mutex<HashMap<String, Session>>,
    model: Arc<dyn LanguageModel>,
    idle: Duration,
}

impl ChatEngine {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            model,
            idle: DEFAULT_IDLE,
        }
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a session and returns its id. The welcome line opens the transcript.
    pub fn start(&self, user_id: &str) -> String {
        self.start_at(user_id, Instant::now())
    }

    fn start_at(&self, user_id: &str, now: Instant) -> String {
        let session_id = new_id("chat");
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions
            .retain(|_, session| now.saturating_duration_since(session.last_active) < self.idle);
        let expired = before - sessions.len();
        if expired > 0 {
            debug!(expired, "idle chat sessions dropped");
        }
        sessions.insert(
            session_id.clone(),
            Session {
                user_id: user_id.to_string(),
                history: vec![ChatTurn::new(Role::Assistant, WELCOME_MESSAGE)],
                collecting: None,
                last_active: now,
            },
        );
        info!(user_id, session_id, "chat session started");
        session_id
    }

    pub fn history(&self, user_id: &str, session_id: &str) -> Result<Vec<ChatTurn>, ChatError> {
        self.lock()
            .get(session_id)
            .filter(|session| session.user_id == user_id)
            .map(|session| session.history.clone())
            .ok_or_else(|| ChatError::UnknownSession(session_id.to_string()))
    }

    pub fn record_reply(&self, session_id: &str, text: &str) {
        if let Some(session) = self.lock().get_mut(session_id) {
            session
                .history
                .push(ChatTurn::new(Role::Assistant, text.to_string()));
            session.last_active = Instant::now();
        }
    }

    pub async fn message(
        &self,
        user_id: &str,
        session_id: &str,
        message: &str,
    ) -> Result<ChatStep, ChatError> {
        let context = {
            let mut sessions = self.lock();
            let session = sessions
                .get_mut(session_id)
                .filter(|session| session.user_id == user_id)
                .ok_or_else(|| ChatError::UnknownSession(session_id.to_string()))?;
            session.history.push(ChatTurn::new(Role::User, message));
            session.last_active = Instant::now();

            let collecting = match session.collecting.take() {
                Some(collecting) => Some(collecting),
                None if is_model_request(message) => Some(Collecting {
                    shape: Shape::detect(message),
                    values: BTreeMap::new(),
                }),
                None => None,
            };

            if let Some(mut collecting) = collecting {
                let found =
                    find_parameter_values(message, collecting.shape.parameter_names());
                collecting.values.extend(found);
                if wants_defaults(message) {
                    for parameter in collecting.shape.parameters {
                        collecting
                            .values
                            .entry(parameter.name.to_string())
                            .or_insert_with(|| parameter.default.to_string());
                    }
                }

                if missing_parameters(&collecting).is_empty() {
                    info!(session_id, shape = collecting.shape.name, "parameters complete");
                    return Ok(ChatStep::Build {
                        shape: collecting.shape,
                        values: collecting.values,
                    });
                }
                let reply = parameter_request(&collecting);
                session.collecting = Some(collecting);
                session
                    .history
                    .push(ChatTurn::new(Role::Assistant, reply.clone()));
                return Ok(ChatStep::Reply(reply));
            }

            let start = session.history.len().saturating_sub(CONTEXT_TURNS);
            session.history[start..].to_vec()
        };

        let reply = match self.model.reply(SUPPORT_PROMPT, &context).await {
            Ok(reply) if !reply.trim().is_empty() => reply,
            Ok(_) => APOLOGY.to_string(),
            Err(err) => {
                warn!(session_id, %err, "chat reply failed");
                APOLOGY.to_string()
            }
        };
        self.record_reply(session_id, &reply);
        Ok(ChatStep::Reply(reply))
    }
}
