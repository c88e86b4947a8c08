//! LOOM runtime demo CLI
//!
//! Runs an agent from a project file against offline mock models, and
//! converts agent identities to and from their token form.
//!
//! Usage:
//!   cargo run -p demo -- run demo/projects/sample.json flow --input topic=otters
//!   cargo run -p demo -- run demo/projects/sample.json summarize --input topic=otters --events
//!   cargo run -p demo -- encode-id sample summarize
//!   cargo run -p demo -- decode-id L3NhbXBsZS8vc3VtbWFyaXpl

mod mock;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use loom_config::RuntimeConfig;
use loom_contracts::{
    error::{LoomError, LoomResult},
    event::{EventSink, StreamEvent},
    identity::AgentIdentity,
};
use loom_core::{Collaborators, ExecuteOptions, InMemoryCache, Project, ReqwestHttpClient, RuntimeExecutor};
use loom_trace::EventRecorder;

use crate::mock::{DemoImageModel, DemoModel};

// ── CLI definition ────────────────────────────────────────────────────────────

/// LOOM — streaming agent runtime demo.
#[derive(Parser)]
#[command(
    name = "demo",
    about = "LOOM agent runtime demo",
    long_about = "Runs LOOM agents from a project file with offline mock models,\n\
                  streaming their text and printing the final outputs."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one agent of a project file.
    Run {
        /// Project JSON file.
        project: PathBuf,
        /// Agent id or identity token.
        agent: String,
        /// Input value as name=value; values that parse as JSON are used as such.
        #[arg(short, long = "input", value_name = "NAME=VALUE")]
        inputs: Vec<String>,
        /// Runtime configuration (TOML).
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Scripted model reply; repeat to script several calls.
        #[arg(long = "reply")]
        replies: Vec<String>,
        /// Print every event as a JSON line instead of the streamed text.
        #[arg(long)]
        events: bool,
    },
    /// Print the token for an agent identity.
    EncodeId {
        project: String,
        agent: String,
        #[arg(long)]
        component: Option<String>,
        #[arg(long)]
        revision: Option<String>,
    },
    /// Print the identity a token encodes.
    DecodeId { token: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Set RUST_LOG=debug for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run {
            project,
            agent,
            inputs,
            config,
            replies,
            events,
        } => run(&project, &agent, &inputs, config.as_deref(), replies, events).await,
        Command::EncodeId {
            project,
            agent,
            component,
            revision,
        } => encode_id(project, agent, component, revision),
        Command::DecodeId { token } => decode_id(&token),
    };

    if let Err(e) = result {
        eprintln!("Demo error: {}", e);
        std::process::exit(1);
    }
}

// ── run ───────────────────────────────────────────────────────────────────────

/// `name=value` pairs as an input object.
fn parse_inputs(pairs: &[String]) -> LoomResult<Value> {
    let mut inputs = Map::new();
    for pair in pairs {
        let (name, raw) = pair.split_once('=').ok_or_else(|| LoomError::InvalidInput {
            name: pair.clone(),
            reason: "expected NAME=VALUE".to_string(),
        })?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(name.to_string(), value);
    }
    Ok(Value::Object(inputs))
}

/// Streams text chunks to stdout and log lines to stderr.
fn console_sink(json_lines: bool) -> EventSink {
    EventSink::new(move |event| {
        if json_lines {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => eprintln!("unprintable event: {e}"),
            }
            return;
        }
        match event {
            StreamEvent::Chunk { delta, .. } => {
                if let Some(text) = delta.content {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
            }
            StreamEvent::Log { assistant_id, log, .. } => eprintln!("[{assistant_id}] {log}"),
            StreamEvent::Error { error } => eprintln!("error: {}", error.message),
            _ => {}
        }
    })
}

async fn run(
    project_path: &Path,
    agent: &str,
    inputs: &[String],
    config_path: Option<&Path>,
    replies: Vec<String>,
    events: bool,
) -> LoomResult<()> {
    let config = match config_path {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    let project = Project::from_file(project_path)?;
    let inputs = parse_inputs(inputs)?;
    info!(project = %project.id, agent, "running agent");

    let collaborators = Collaborators::default()
        .with_model(Arc::new(DemoModel::new(replies)))
        .with_image_model(Arc::new(DemoImageModel))
        .with_cache(Arc::new(InMemoryCache::default()))
        .with_http(Arc::new(ReqwestHttpClient::with_timeout(config.http.timeout())?));
    let runtime = RuntimeExecutor::new(project, collaborators, config);

    let recorder = EventRecorder::new(format!("demo-{agent}"));
    let sink = recorder.tee(console_sink(events));
    let outputs = runtime
        .execute(agent, inputs, ExecuteOptions::default(), sink)
        .await;

    println!();
    let tree = recorder.replay("user", "assistant");
    println!(
        "── {} event(s), {} task(s), digest {}",
        recorder.len(),
        tree.assistant.input_messages.len(),
        recorder.digest()
    );
    if let Some(usage) = &tree.assistant.usage {
        println!("── usage: {} prompt + {} completion tokens", usage.prompt_tokens, usage.completion_tokens);
    }

    let outputs = outputs?;
    println!("{}", serde_json::to_string_pretty(&outputs)?);
    Ok(())
}

// ── Identity tokens ───────────────────────────────────────────────────────────

fn encode_id(project: String, agent: String, component: Option<String>, revision: Option<String>) -> LoomResult<()> {
    let mut identity = AgentIdentity::local(project, agent);
    if let Some(component) = component {
        identity = identity.with_component(component);
    }
    if let Some(revision) = revision {
        identity = identity.with_revision(revision);
    }
    println!("{}", identity.encode()?);
    Ok(())
}

fn decode_id(token: &str) -> LoomResult<()> {
    match AgentIdentity::decode(token, true)? {
        Some(identity) => println!("{}", serde_json::to_string_pretty(&identity)?),
        None => println!("not an identity token"),
    }
    Ok(())
}
