use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::LanguageModelConfig;

const CODER_PROMPT: &str = "You write OpenSCAD programs for 3D printing. \
Declare every dimension as a top-level numeric variable such as `width = 10;` \
with a short comment, wrap the geometry in a module, call that module at the \
end, and answer with OpenSCAD code only.";

pub const SUPPORT_PROMPT: &str = "You are the assistant of a 3D model generation \
service. Users can describe a parametric model in chat, convert a photo into a \
mesh, download STL or OBJ files and buy generation tokens. Answer briefly and \
politely; say so when you do not know.";

const TEMPLATE_REPLY: &str = "I can build cubes, spheres, cylinders and cones. \
Try something like \"make a sphere with radius 5\".";

static PARAMETER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*([A-Za-z_][A-Za-z0-9_]*)[ \t]*=[ \t]*(-?\d+(?:\.\d+)?)[ \t]*;")
        .expect("parameter regex is valid")
});

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z]*\s*\n?(.*?)```").expect("fence regex is valid")
});

static PRIMITIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(cube|sphere|cylinder|polyhedron|square|circle|polygon|text|import|surface)\s*\(")
        .expect("primitive regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("parameter `{name}` must be a finite number, got `{value}`")]
    InvalidParameter { name: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub current_code: Option<&'a str>,
    pub validation_errors: &'a [String],
    pub attempt: usize,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate_code(&self, request: &GenerationRequest<'_>) -> Result<String, String>;

    async fn reply(&self, system_prompt: &str, history: &[ChatTurn]) -> Result<String, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeParameter {
    pub name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
    arg: &'static str,
}

const fn param(
    name: &'static str,
    default: &'static str,
    description: &'static str,
    arg: &'static str,
) -> ShapeParameter {
    ShapeParameter {
        name,
        default,
        description,
        arg,
    }
}

/// A parametric template the service can always fall back to.
#[derive(Debug, PartialEq, Eq)]
pub struct Shape {
    pub name: &'static str,
    aliases: &'static [&'static str],
    pub parameters: &'static [ShapeParameter],
    body: &'static str,
}

pub static SHAPES: [Shape; 5] = [
    Shape {
        name: "sphere",
        aliases: &["sphere", "ball"],
        parameters: &[param("radius", "10", "Radius of the sphere", "r")],
        body: "sphere(r=r);",
    },
    Shape {
        name: "cylinder",
        aliases: &["cylinder", "tube"],
        parameters: &[
            param("height", "20", "Height of the cylinder", "h"),
            param("radius", "5", "Radius of the cylinder", "r"),
        ],
        body: "cylinder(h=h, r=r);",
    },
    Shape {
        name: "cone",
        aliases: &["cone"],
        parameters: &[
            param("height", "20", "Height of the cone", "h"),
            param("radius1", "10", "Base radius", "r1"),
            param("radius2", "0", "Top radius", "r2"),
        ],
        body: "cylinder(h=h, r1=r1, r2=r2);",
    },
    Shape {
        name: "cube",
        aliases: &["cube", "box"],
        parameters: &[
            param("width", "10", "Width of the cube", "w"),
            param("height", "10", "Height of the cube", "h"),
            param("depth", "10", "Depth of the cube", "d"),
        ],
        body: "cube([w, h, d]);",
    },
    Shape {
        name: "object",
        aliases: &["object", "shape", "default"],
        parameters: &[param("size", "10", "Size of the object", "s")],
        body: "cube(s);",
    },
];

impl Shape {
    /// First shape whose alias appears in `text`, else the generic object.
    pub fn detect(text: &str) -> &'static Shape {
        let lower = text.to_lowercase();
        SHAPES
            .iter()
            .find(|shape| shape.aliases.iter().any(|alias| lower.contains(alias)))
            .unwrap_or(&SHAPES[SHAPES.len() - 1])
    }

    pub fn named(name: &str) -> Option<&'static Shape> {
        let lower = name.trim().to_lowercase();
        SHAPES
            .iter()
            .find(|shape| shape.name == lower || shape.aliases.contains(&lower.as_str()))
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.parameters.iter().map(|parameter| parameter.name)
    }

    /// OpenSCAD source with `values` substituted for the defaults they name.
    pub fn template(&self, values: &BTreeMap<String, String>) -> String {
        let mut code = format!("// Customizable {}\n\n// Parameters\n", self.name);
        for parameter in self.parameters {
            let value = values
                .get(parameter.name)
                .map(String::as_str)
                .unwrap_or(parameter.default);
            code.push_str(&format!(
                "{} = {};  // {}\n",
                parameter.name, value, parameter.description
            ));
        }

        let args = self
            .parameters
            .iter()
            .map(|parameter| parameter.arg)
            .collect::<Vec<_>>()
            .join(", ");
        let names = self.parameter_names().collect::<Vec<_>>().join(", ");
        code.push_str(&format!(
            "\nmodule custom_{name}({args}) {{\n    {body}\n}}\n\ncustom_{name}({names});\n",
            name = self.name,
            body = self.body,
        ));
        code
    }
}

/// Canonical decimal form of a parameter value, or `None` when it is not a
/// finite number.
pub fn normalize_number(value: &str) -> Option<String> {
    let number: f64 = value.trim().parse().ok()?;
    number.is_finite().then(|| number.to_string())
}

/// Top-level `name = number;` assignments and their current values.
pub fn extract_parameters(code: &str) -> BTreeMap<String, String> {
    PARAMETER_LINE
        .captures_iter(code)
        .map(|captures| (captures[1].to_string(), captures[2].to_string()))
        .collect()
}

/// Rewrites the assignments named in `values`. Values must be numbers so
/// nothing but a literal ever lands in the program.
pub fn apply_parameters(
    code: &str,
    values: &BTreeMap<String, String>,
) -> Result<String, GenerationError> {
    let mut code = code.to_string();
    for (name, value) in values {
        let normalized =
            normalize_number(value).ok_or_else(|| GenerationError::InvalidParameter {
                name: name.clone(),
                value: value.clone(),
            })?;
        let pattern = format!(r"(?m)^([ \t]*{}[ \t]*=[ \t]*)[^;\n]+;", regex::escape(name));
        let Ok(assignment) = Regex::new(&pattern) else {
            continue;
        };
        code = assignment
            .replace_all(&code, |captures: &regex::Captures<'_>| {
                format!("{}{normalized};", &captures[1])
            })
            .into_owned();
    }
    Ok(code)
}

/// Finds `name = 5`, `name: 5`, `name is 5` or `name 5` for each of `names`.
/// A diameter fills in a missing radius.
pub fn find_parameter_values<'a>(
    text: &str,
    names: impl IntoIterator<Item = &'a str>,
) -> BTreeMap<String, String> {
    let mut found = BTreeMap::new();
    let mut wants_radius = false;
    for name in names {
        wants_radius |= name == "radius";
        if let Some(value) = number_after(text, name) {
            found.insert(name.to_string(), value);
        }
    }
    if wants_radius && !found.contains_key("radius") {
        let radius = number_after(text, "diameter")
            .and_then(|diameter| diameter.parse::<f64>().ok())
            .and_then(|diameter| normalize_number(&(diameter / 2.0).to_string()));
        if let Some(radius) = radius {
            found.insert("radius".to_string(), radius);
        }
    }
    found
}

fn number_after(text: &str, name: &str) -> Option<String> {
    let pattern = format!(
        r"(?i)\b{}\b\s*(?:[=:]|\bis\b|\bof\b|\bto\b)?\s*(-?\d+(?:\.\d+)?)",
        regex::escape(name)
    );
    let regex = Regex::new(&pattern).ok()?;
    let captures = regex.captures(text)?;
    normalize_number(&captures[1])
}

/// Code inside markdown fences when present, otherwise the trimmed text.
pub fn extract_code(response: &str) -> String {
    let blocks = CODE_FENCE
        .captures_iter(response)
        .map(|captures| captures[1].trim().to_string())
        .filter(|block| !block.is_empty())
        .collect::<Vec<_>>();
    if blocks.is_empty() {
        response.trim().to_string()
    } else {
        blocks.join("\n\n")
    }
}

/// Structural checks on a candidate program. Empty means acceptable.
pub fn validate_scad(code: &str) -> Vec<String> {
    let mut errors = Vec::new();
    let stripped = strip_comments_and_strings(code);
    if stripped.trim().is_empty() {
        errors.push("program is empty".to_string());
        return errors;
    }

    let mut stack = Vec::new();
    for ch in stripped.chars() {
        match ch {
            '(' | '[' | '{' => stack.push(ch),
            ')' | ']' | '}' => {
                let expected = match ch {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    errors.push(format!("unexpected `{ch}`"));
                    break;
                }
            }
            _ => {}
        }
    }
    if errors.is_empty() {
        if let Some(open) = stack.last() {
            errors.push(format!("unclosed `{open}`"));
        }
    }

    if !PRIMITIVE.is_match(&stripped) {
        errors.push("no solid primitive (cube, sphere, cylinder, ...) found".to_string());
    }
    errors
}

fn strip_comments_and_strings(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut chars = code.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
            }
            '"' => {
                let mut escaped = false;
                for next in chars.by_ref() {
                    if next == '"' && !escaped {
                        break;
                    }
                    escaped = next == '\\' && !escaped;
                }
                out.push_str("\"\"");
            }
            _ => out.push(ch),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeSource {
    LanguageModel,
    Template,
}

#[derive(Debug, Clone)]
pub struct GeneratedCode {
    pub code: String,
    pub source: CodeSource,
    pub attempts: usize,
    pub shape: Option<&'static str>,
}

impl GeneratedCode {
    pub fn from_shape(shape: &'static Shape, values: &BTreeMap<String, String>) -> Self {
        Self {
            code: shape.template(values),
            source: CodeSource::Template,
            attempts: 0,
            shape: Some(shape.name),
        }
    }
}

/// Asks the language model for a program, feeding validation errors back on
/// each retry, and falls back to a template when it never produces one.
pub struct ScadGenerator {
    model: Arc<dyn LanguageModel>,
    max_retries: usize,
}

impl ScadGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, max_retries: usize) -> Self {
        Self { model, max_retries }
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    pub async fn generate(&self, prompt: &str, current_code: Option<&str>) -> GeneratedCode {
        let max_attempts = self.max_retries.max(1);
        let mut validation_errors = Vec::new();

        for attempt in 1..=max_attempts {
            let request = GenerationRequest {
                system_prompt: CODER_PROMPT,
                user_prompt: prompt,
                current_code,
                validation_errors: &validation_errors,
                attempt,
            };
            let candidate = match self.model.generate_code(&request).await {
                Ok(response) => extract_code(&response),
                Err(err) => {
                    warn!(attempt, %err, "language model request failed");
                    break;
                }
            };

            let errors = validate_scad(&candidate);
            if errors.is_empty() {
                info!(attempt, "language model produced a valid program");
                return GeneratedCode {
                    code: candidate,
                    source: CodeSource::LanguageModel,
                    attempts: attempt,
                    shape: None,
                };
            }
            debug!(attempt, ?errors, "candidate program rejected");
            validation_errors = errors;
        }

        let shape = Shape::detect(prompt);
        warn!(shape = shape.name, "falling back to template");
        let values = find_parameter_values(prompt, shape.parameter_names());
        GeneratedCode {
            attempts: max_attempts,
            ..GeneratedCode::from_shape(shape, &values)
        }
    }
}

/// Offline model: always answers with the matching template.
#[derive(Debug, Default)]
pub struct TemplateModel;

#[async_trait]
impl LanguageModel for TemplateModel {
    async fn generate_code(&self, request: &GenerationRequest<'_>) -> Result<String, String> {
        let shape = Shape::detect(request.user_prompt);
        let values = find_parameter_values(request.user_prompt, shape.parameter_names());
        Ok(shape.template(&values))
    }

    async fn reply(&self, _system_prompt: &str, _history: &[ChatTurn]) -> Result<String, String> {
        Ok(TEMPLATE_REPLY.to_string())
    }
}

/// Any endpoint speaking the OpenAI chat-completions protocol.
pub struct OpenAiCompatibleModel {
    http: Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatTurn,
}

impl OpenAiCompatibleModel {
    pub fn new(url: impl Into<String>, config: &LanguageModelConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            url: url.into(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    async fn complete(&self, messages: Vec<ChatTurn>) -> Result<String, String> {
        let mut request = self.http.post(&self.url).json(&CompletionRequest {
            model: &self.model,
            messages,
            temperature: 0.7,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|err| err.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("completion endpoint returned {status}"));
        }
        let body: CompletionResponse = response.json().await.map_err(|err| err.to_string())?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| "completion contained no text".to_string())
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    async fn generate_code(&self, request: &GenerationRequest<'_>) -> Result<String, String> {
        let mut prompt = format!("Create OpenSCAD code for: {}", request.user_prompt);
        if let Some(current) = request.current_code {
            prompt.push_str(&format!("\n\nStart from this program:\n```openscad\n{current}\n```"));
        }
        if !request.validation_errors.is_empty() {
            prompt.push_str(&format!(
                "\n\nThe previous attempt was rejected: {}. Fix these problems.",
                request.validation_errors.join("; ")
            ));
        }
        self.complete(vec![
            ChatTurn::new(Role::System, request.system_prompt),
            ChatTurn::new(Role::User, prompt),
        ])
        .await
    }

    async fn reply(&self, system_prompt: &str, history: &[ChatTurn]) -> Result<String, String> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatTurn::new(Role::System, system_prompt));
        messages.extend(history.iter().cloned());
        let reply = self.complete(messages).await?;
        Ok(reply
            .strip_prefix("ASSISTANT:")
            .map(str::trim)
            .unwrap_or(&reply)
            .to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::{
        ChatTurn, CodeSource, GenerationError, GenerationRequest, LanguageModel, ScadGenerator,
        Shape, TemplateModel, apply_parameters, extract_code, extract_parameters,
        find_parameter_values, validate_scad,
    };

    #[derive(Debug, Clone)]
    pub(crate) struct RequestLog {
        pub attempt: usize,
        pub validation_errors: Vec<String>,
    }

    /// Answers from a queue; `Err` entries simulate endpoint failures.
    #[derive(Default)]
    pub(crate) struct ScriptedModel {
        code: Mutex<VecDeque<Result<String, String>>>,
        replies: Mutex<VecDeque<Result<String, String>>>,
        pub logs: Mutex<Vec<RequestLog>>,
        pub histories: Mutex<Vec<Vec<ChatTurn>>>,
    }

    impl ScriptedModel {
        pub fn with_code(self, responses: Vec<Result<&str, &str>>) -> Self {
            *self.code.lock().expect("lock") = responses
                .into_iter()
                .map(|response| response.map(str::to_string).map_err(str::to_string))
                .collect();
            self
        }

        pub fn with_replies(self, responses: Vec<Result<&str, &str>>) -> Self {
            *self.replies.lock().expect("lock") = responses
                .into_iter()
                .map(|response| response.map(str::to_string).map_err(str::to_string))
                .collect();
            self
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn generate_code(&self, request: &GenerationRequest<'_>) -> Result<String, String> {
            self.logs.lock().expect("lock").push(RequestLog {
                attempt: request.attempt,
                validation_errors: request.validation_errors.to_vec(),
            });
            self.code
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Err("no scripted response".to_string()))
        }

        async fn reply(&self, _system_prompt: &str, history: &[ChatTurn]) -> Result<String, String> {
            self.histories.lock().expect("lock").push(history.to_vec());
            self.replies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Err("no scripted reply".to_string()))
        }
    }

    #[tokio::test]
    async fn retries_with_validation_feedback() {
        let model = Arc::new(ScriptedModel::default().with_code(vec![
            Ok("cube([1, 2, 3];"),
            Ok("```openscad\nsize = 4;\ncube(size);\n```"),
        ]));
        let generator = ScadGenerator::new(model.clone(), 3);

        let generated = generator.generate("a small block", None).await;
        assert_eq!(generated.source, CodeSource::LanguageModel);
        assert_eq!(generated.attempts, 2);
        assert_eq!(generated.code, "size = 4;\ncube(size);");

        let logs = model.logs.lock().expect("lock");
        assert_eq!(logs.len(), 2);
        assert!(logs[0].validation_errors.is_empty());
        assert_eq!(logs[1].attempt, 2);
        assert!(!logs[1].validation_errors.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back_to_template() {
        let model = Arc::new(ScriptedModel::default().with_code(vec![
            Ok("hello"),
            Ok("still not code"),
        ]));
        let generator = ScadGenerator::new(model.clone(), 2);

        let generated = generator.generate("a box with width = 30", None).await;
        assert_eq!(generated.source, CodeSource::Template);
        assert_eq!(generated.shape, Some("cube"));
        assert_eq!(extract_parameters(&generated.code)["width"], "30");
        assert_eq!(model.logs.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn model_failure_falls_back_immediately() {
        let model = Arc::new(ScriptedModel::default().with_code(vec![Err("timeout")]));
        let generator = ScadGenerator::new(model.clone(), 3);
        let generated = generator.generate("a ball", None).await;
        assert_eq!(generated.shape, Some("sphere"));
        assert_eq!(model.logs.lock().expect("lock").len(), 1);
        assert!(validate_scad(&generated.code).is_empty());
    }

    #[tokio::test]
    async fn template_model_answers_every_shape() {
        let generator = ScadGenerator::new(Arc::new(TemplateModel), 3);
        for prompt in ["cube", "sphere", "cylinder", "cone", "something else"] {
            let generated = generator.generate(prompt, None).await;
            assert_eq!(generated.source, CodeSource::LanguageModel, "{prompt}");
            assert!(validate_scad(&generated.code).is_empty(), "{prompt}");
        }
    }

    #[test]
    fn templates_expose_their_parameters() {
        let cylinder = Shape::named("tube").expect("alias resolves");
        let params = extract_parameters(&cylinder.template(&BTreeMap::new()));
        assert_eq!(params.len(), 2);
        assert_eq!(params["height"], "20");
        assert_eq!(params["radius"], "5");

        assert_eq!(Shape::detect("Make me a BALL please").name, "sphere");
        assert_eq!(Shape::detect("a gear").name, "object");
        assert!(Shape::named("gear").is_none());
    }

    #[test]
    fn apply_parameters_rewrites_assignments_only() {
        let code = "radius = 10;  // Radius\nmodule m(r) { sphere(r=r); }\nm(radius);\n";
        let values = BTreeMap::from([("radius".to_string(), " 2.50 ".to_string())]);
        let updated = apply_parameters(code, &values).expect("numeric value applies");
        assert!(updated.starts_with("radius = 2.5;  // Radius"));
        assert!(updated.contains("sphere(r=r);"));
        assert!(updated.contains("m(radius);"));
    }

    #[test]
    fn apply_parameters_rejects_code_injection() {
        let values = BTreeMap::from([(
            "radius".to_string(),
            "1; import(\"/etc/passwd\")".to_string(),
        )]);
        let err = apply_parameters("radius = 1;", &values).expect_err("not a number");
        assert!(matches!(err, GenerationError::InvalidParameter { .. }));

        let values = BTreeMap::from([("radius".to_string(), "inf".to_string())]);
        assert!(apply_parameters("radius = 1;", &values).is_err());
    }

    #[test]
    fn parameter_values_in_free_text() {
        let found = find_parameter_values(
            "width = 5, height: 7 and depth 9.5",
            ["width", "height", "depth"],
        );
        assert_eq!(found["width"], "5");
        assert_eq!(found["height"], "7");
        assert_eq!(found["depth"], "9.5");

        let found = find_parameter_values("diameter of 12", ["radius"]);
        assert_eq!(found["radius"], "6");

        let found = find_parameter_values("radius1 is 4", ["radius", "radius1"]);
        assert_eq!(found.get("radius"), None);
        assert_eq!(found["radius1"], "4");
    }

    #[test]
    fn validation_catches_structure_errors() {
        assert!(validate_scad("cube(10);").is_empty());
        assert!(validate_scad("// (\ncube(10); /* ] */ echo(\"}\");").is_empty());
        assert!(!validate_scad("").is_empty());
        assert!(
            validate_scad("cube(10));")
                .iter()
                .any(|error| error.contains("unexpected"))
        );
        assert!(
            validate_scad("module m() { cube(1);")
                .iter()
                .any(|error| error.contains("unclosed"))
        );
        assert!(
            validate_scad("x = 1;")
                .iter()
                .any(|error| error.contains("primitive"))
        );
    }

    #[test]
    fn extract_code_prefers_fenced_blocks() {
        assert_eq!(extract_code("Here:\n```scad\ncube(1);\n```\nDone"), "cube(1);");
        assert_eq!(extract_code("  sphere(2);  "), "sphere(2);");
    }
}
