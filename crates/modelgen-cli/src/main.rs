//! `modelgen`: terminal front end for the model generation service.
//!
//! Subcommands:
//! - `chat`: talk to the assistant and refine the model it builds
//! - `generate`: create a model from a prompt or shape, or regenerate one
//! - `models`, `details`, `download`: browse and fetch saved models
//! - `convert`, `images`: turn a photo into a mesh, list earlier uploads
//! - `buy`, `history`, `balance`: tokens and payments
//! - `inspect`: geometry of a local STL file, optionally re-exported

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use modelgen_client::wire::{GenerateRequest, ModelPayload};
use modelgen_client::{
    ApplyOutcome, Backend, ClientConfig, HttpBackend, ModelLibrary, ModelState, SortOrder, Studio,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

mod checkout;
mod identity;
mod inspect;

use checkout::TerminalCheckout;
use inspect::MeshReport;

#[derive(Parser, Debug)]
#[command(name = "modelgen")]
#[command(about = "Generate, refine and download 3D models", long_about = None)]
struct Cli {
    /// Base URL of the model service
    #[arg(long, env = "MODELGEN_API_URL", default_value = "http://127.0.0.1:8080/")]
    api_url: String,

    /// File holding the user id reused across runs
    #[arg(long, env = "MODELGEN_IDENTITY", default_value = ".modelgen-user")]
    identity: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chat with the assistant; `/help` lists the editing commands
    Chat,
    /// Generate a model, or regenerate an existing one with `--model-id`
    Generate(GenerateArgs),
    /// List saved models
    Models(ModelsArgs),
    /// Show one model and its download formats
    Details { model_id: String },
    /// Download a model file
    Download(DownloadArgs),
    /// Convert a PNG, JPEG or WebP photo into a mesh
    Convert(ConvertArgs),
    /// List images uploaded earlier
    Images,
    /// Buy a token package
    Buy { package_id: String },
    /// List past payments
    History,
    /// Show the token balance
    Balance,
    /// Print the geometry of a local STL file
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// What to build, in plain words
    #[arg(short, long)]
    prompt: Option<String>,

    /// Known shape to build from its template
    #[arg(short, long)]
    shape: Option<String>,

    /// Existing model to regenerate in place
    #[arg(long)]
    model_id: Option<String>,

    /// Parameter values as `name=value`, repeatable
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
}

#[derive(Args, Debug)]
struct ModelsArgs {
    #[arg(long, value_enum, default_value = "newest")]
    sort: SortArg,

    /// Only `parametric` or `image` models
    #[arg(long = "type")]
    model_type: Option<String>,

    /// Keep fetching until every page is listed
    #[arg(long)]
    all: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SortArg {
    Newest,
    Oldest,
}

impl From<SortArg> for SortOrder {
    fn from(sort: SortArg) -> Self {
        match sort {
            SortArg::Newest => SortOrder::Newest,
            SortArg::Oldest => SortOrder::Oldest,
        }
    }
}

#[derive(Args, Debug)]
struct DownloadArgs {
    model_id: String,

    /// stl, obj or scad
    #[arg(short, long, default_value = "stl")]
    format: String,

    /// Directory the file is written into
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct ConvertArgs {
    /// Photo to upload
    image: Option<PathBuf>,

    /// Convert an earlier upload instead, see `modelgen images`
    #[arg(long)]
    file_id: Option<String>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    input: PathBuf,

    /// Write the mesh again; the extension picks STL or OBJ
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write STL output as text instead of binary
    #[arg(long)]
    ascii: bool,
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{raw}`"))?;
    let (name, value) = (name.trim(), value.trim());
    if name.is_empty() || value.is_empty() {
        return Err(format!("expected name=value, got `{raw}`"));
    }
    Ok((name.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Inspect(args) = &cli.command {
        return run_inspect(args);
    }

    let config = ClientConfig::new(&cli.api_url)?;
    let backend = identity::connect(&config, &cli.identity).await?;

    match cli.command {
        Commands::Chat => run_chat(Studio::new(backend)).await,
        Commands::Generate(args) => run_generate(&backend, args).await,
        Commands::Models(args) => run_models(&backend, args).await,
        Commands::Details { model_id } => run_details(&backend, &model_id).await,
        Commands::Download(args) => {
            let path = ModelLibrary::new(&backend)
                .download(&args.model_id, &args.format, &args.dir)
                .await?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Convert(args) => run_convert(Studio::new(backend), &args).await,
        Commands::Images => run_images(&backend).await,
        Commands::Buy { package_id } => run_buy(Studio::new(backend), &package_id).await,
        Commands::History => run_history(&backend).await,
        Commands::Balance => {
            let balance = backend.balance().await?;
            println!("balance: {} tokens", balance.balance);
            println!("free generations left: {}", balance.free_generations_remaining);
            Ok(())
        }
        Commands::Inspect(_) => Ok(()),
    }
}

fn run_inspect(args: &InspectArgs) -> Result<()> {
    let mesh = inspect::read_mesh(&args.input)?;
    println!("{}", MeshReport::of(&mesh));
    if let Some(output) = &args.output {
        inspect::export(&mesh, output, args.ascii)?;
        println!("wrote {}", output.display());
    }
    Ok(())
}

async fn run_generate(backend: &HttpBackend, args: GenerateArgs) -> Result<()> {
    if args.prompt.is_none() && args.shape.is_none() && args.model_id.is_none() {
        bail!("pass --prompt, --shape or --model-id");
    }
    let request = GenerateRequest {
        prompt: args.prompt,
        model_type: args.shape,
        parameters: args.params.into_iter().collect(),
        session_id: None,
        model_id: args.model_id,
    };
    let response = backend.generate(&request).await?;
    print_payload(&response.model);
    Ok(())
}

fn print_payload(model: &ModelPayload) {
    if let Some(model_id) = &model.model_id {
        println!("model: {model_id} (revision {})", model.revision);
    }
    if let Some(preview) = &model.preview_url {
        println!("preview: {preview}");
    }
    if let Some(mesh) = &model.mesh_url {
        println!("mesh: {mesh}");
    }
    if let Some(parameters) = model.parameters.as_ref().and_then(|value| value.as_object()) {
        for (name, parameter) in parameters {
            println!(
                "  {name} = {} (default {})",
                parameter["value"].as_str().unwrap_or("?"),
                parameter["default"].as_str().unwrap_or("?")
            );
        }
    }
}

async fn run_models(backend: &HttpBackend, args: ModelsArgs) -> Result<()> {
    let mut library = ModelLibrary::new(backend).sorted(args.sort.into());
    if let Some(model_type) = args.model_type {
        library = library.of_type(model_type);
    }

    let mut listed = 0;
    while let Some(page) = library.next_page().await? {
        for model in &page.models {
            println!("{}  {:<10}  {}", model.model_id, model.model_type, model.created_at);
        }
        listed += page.models.len();
        if !args.all {
            break;
        }
    }
    if listed == 0 {
        println!("no models yet");
    } else if library.has_more() {
        println!("more available, pass --all to list everything");
    }
    Ok(())
}

async fn run_details(backend: &HttpBackend, model_id: &str) -> Result<()> {
    let details = ModelLibrary::new(backend).details(model_id).await?;
    println!("model: {} ({})", details.model_id, details.model_type);
    println!("created: {}", details.created_at);
    if let Some(preview) = &details.preview_url {
        println!("preview: {preview}");
    }
    for (format, url) in &details.formats {
        println!("  {format}: {url}");
    }
    Ok(())
}

async fn run_convert(studio: Studio<HttpBackend>, args: &ConvertArgs) -> Result<()> {
    match (&args.image, &args.file_id) {
        (Some(image), _) => studio
            .upload_image(image)
            .await
            .with_context(|| format!("failed to convert {}", image.display()))?,
        (None, Some(file_id)) => studio
            .convert_upload(file_id)
            .await
            .with_context(|| format!("failed to convert upload {file_id}"))?,
        (None, None) => bail!("give an image path or --file-id"),
    };
    if let Some(state) = studio.state().await {
        print_state(&state);
    }
    Ok(())
}

async fn run_buy(studio: Studio<HttpBackend>, package_id: &str) -> Result<()> {
    let checkout = TerminalCheckout::new(BufReader::new(tokio::io::stdin()));
    let receipt = studio.purchase(&checkout, package_id).await?;
    println!(
        "order {} completed: +{} tokens, balance {}",
        receipt.order_id, receipt.tokens, receipt.new_balance
    );
    Ok(())
}

async fn run_images(backend: &HttpBackend) -> Result<()> {
    let images = backend.user_images().await?;
    if images.is_empty() {
        println!("no uploads yet");
    }
    for image in images {
        println!(
            "{}  {}  {} bytes  {}",
            image.uploaded_at, image.file_id, image.file_size, image.file_type
        );
    }
    Ok(())
}

async fn run_history(backend: &HttpBackend) -> Result<()> {
    let history = backend.payment_history().await?;
    if history.is_empty() {
        println!("no payments yet");
    }
    for record in history {
        println!(
            "{}  {}  {} {:.2}  {} tokens  {:?}",
            record.created_at,
            record.order_id,
            record.currency,
            record.amount as f64 / 100.0,
            record.tokens,
            record.status
        );
    }
    Ok(())
}

fn print_state(state: &ModelState) {
    println!("model: {} (revision {})", state.model_id, state.revision);
    if let Some(preview) = &state.preview_path {
        println!("preview: {preview}");
    }
    if let Some(mesh) = &state.mesh_path {
        println!("mesh: {mesh}");
    }
    for parameter in state.parameters.iter() {
        println!(
            "  {} = {} (default {})",
            parameter.name, parameter.value, parameter.default
        );
    }
}

/// A line typed at the chat prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChatInput {
    Message(String),
    Set { name: String, value: String },
    Apply,
    Reset,
    Show,
    Code,
    Help,
    Quit,
    Empty,
}

fn parse_chat_input(line: &str) -> std::result::Result<ChatInput, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ChatInput::Empty);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(ChatInput::Message(line.to_string()));
    };

    let mut words = command.split_whitespace();
    match words.next().unwrap_or_default() {
        "set" => match (words.next(), words.next()) {
            (Some(name), Some(value)) => Ok(ChatInput::Set {
                name: name.to_string(),
                value: value.to_string(),
            }),
            _ => {
                let (name, value) = parse_param(command.trim_start_matches("set").trim())?;
                Ok(ChatInput::Set { name, value })
            }
        },
        "apply" => Ok(ChatInput::Apply),
        "reset" => Ok(ChatInput::Reset),
        "show" => Ok(ChatInput::Show),
        "code" => Ok(ChatInput::Code),
        "help" => Ok(ChatInput::Help),
        "quit" | "exit" => Ok(ChatInput::Quit),
        other => Err(format!("unknown command `/{other}`, try /help")),
    }
}

const CHAT_HELP: &str = "\
/set <name> <value>  change a parameter of the current model
/apply               regenerate the model with the changed parameters
/reset               restore the parameter fields to the model's values
/show                print the current model
/code                print the current model's program
/quit                leave";

async fn run_chat(studio: Studio<HttpBackend>) -> Result<()> {
    if let Some(welcome) = studio.start_chat().await? {
        println!("assistant: {welcome}");
    }
    println!("(type /help for commands)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = match parse_chat_input(&line) {
            Ok(input) => input,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };

        // Failures are reported and the session carries on.
        let result = match input {
            ChatInput::Empty => Ok(()),
            ChatInput::Quit => break,
            ChatInput::Help => {
                println!("{CHAT_HELP}");
                Ok(())
            }
            ChatInput::Message(text) => chat_turn(&studio, &text).await,
            ChatInput::Set { name, value } => studio
                .set_parameter(&name, &value)
                .await
                .map_err(anyhow::Error::from),
            ChatInput::Apply => apply_parameters(&studio).await,
            ChatInput::Reset => studio.reset_parameters().await.map_err(anyhow::Error::from),
            ChatInput::Show => {
                match studio.state().await {
                    Some(state) => print_state(&state),
                    None => println!("no model yet"),
                }
                Ok(())
            }
            ChatInput::Code => {
                match studio.state().await.and_then(|state| state.code) {
                    Some(code) => println!("{code}"),
                    None => println!("no program for the current model"),
                }
                Ok(())
            }
        };
        if let Err(err) = result {
            println!("error: {err:#}");
        }
    }
    Ok(())
}

async fn chat_turn(studio: &Studio<HttpBackend>, text: &str) -> Result<()> {
    let outcome = studio.send_message(text).await?;
    println!("assistant: {}", outcome.response);
    if matches!(outcome.model, Some(ApplyOutcome::Applied { .. })) {
        if let Some(state) = studio.state().await {
            print_state(&state);
        }
    }
    Ok(())
}

async fn apply_parameters(studio: &Studio<HttpBackend>) -> Result<()> {
    match studio.submit_parameters().await? {
        ApplyOutcome::Applied { .. } => {
            if let Some(state) = studio.state().await {
                print_state(&state);
            }
        }
        ApplyOutcome::Stale => println!("a newer update arrived first"),
    }
    Ok(())
}
