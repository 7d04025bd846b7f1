//! Command-line interface parsing and handling
//!
//! This module parses command-line arguments, starts a session and hands it
//! to the selected command.

pub mod ask;
pub mod chat;
pub mod model_list;
pub mod tool_list;

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::cli::ask::{load_attachments, run_ask};
use crate::cli::chat::{load_conversation, ChatLoop};
use crate::cli::model_list::list_models;
use crate::cli::tool_list::list_tools;
use crate::core::config::Config;
use crate::core::session::SessionContext;
use crate::utils::logging::TranscriptLog;

#[derive(Parser)]
#[command(name = "rapport", version)]
#[command(about = "Chat with Ollama, Anthropic, OpenAI and watsonx models, with MCP tools")]
#[command(
    long_about = "Rapport is a terminal chat client for local and hosted language models. \
It can hand tool calls to MCP servers listed in the config file.\n\n\
Environment Variables:\n\
  ANTHROPIC_API_KEY     Anthropic API key\n\
  OPENAI_API_KEY        OpenAI API key\n\
  WATSONX_IAM_API_KEY   IBM Cloud API key for watsonx\n\
  WATSONX_PROJECT       watsonx project id\n\
  WATSONX_URL           watsonx endpoint (optional)\n\
  OLLAMA_HOST           Ollama server (optional, defaults to http://localhost:11434)\n\
  RAPPORT_LOG           Diagnostic log filter written to stderr (default: warn)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file to use instead of the platform default
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Model to use
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Append the transcript to this file
    #[arg(short = 'l', long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List catalog models and provider status
    Models,
    /// List tools exposed by the configured MCP servers
    Tools,
    /// Ask one question and stream the answer to stdout
    Ask {
        /// Prompt text (multiple words are joined with spaces)
        #[arg(required = true, trailing_var_arg = true)]
        prompt: Vec<String>,
        /// Attach an image
        #[arg(long, value_name = "PATH")]
        image: Vec<PathBuf>,
        /// Attach a text file
        #[arg(long, value_name = "PATH")]
        file: Vec<PathBuf>,
    },
    /// Start an interactive chat (default)
    Chat {
        /// Resume a conversation saved with /save
        #[arg(long, value_name = "PATH")]
        load: Option<PathBuf>,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let (config, config_path) = Config::load(args.config.as_deref())?;
    let log = args.log.as_deref().map(TranscriptLog::open).transpose()?;

    let session = SessionContext::start(config).await?;
    let result = dispatch(&session, &args, &config_path, log.as_ref()).await;
    session.shutdown().await;
    result
}

async fn dispatch(
    session: &SessionContext,
    args: &Args,
    config_path: &Path,
    log: Option<&TranscriptLog>,
) -> Result<(), Box<dyn Error>> {
    match &args.command {
        Some(Commands::Models) => {
            list_models(session, args.model.as_deref());
            Ok(())
        }
        Some(Commands::Tools) => {
            list_tools(session.tools());
            Ok(())
        }
        Some(Commands::Ask {
            prompt,
            image,
            file,
        }) => {
            let model = require_model(session, args.model.as_deref())?;
            let attachments = load_attachments(image, file)?;
            run_ask(session, &model, &prompt.join(" "), attachments, log).await
        }
        Some(Commands::Chat { load }) => {
            run_chat(session, args, load.as_deref(), config_path, log).await
        }
        None => run_chat(session, args, None, config_path, log).await,
    }
}

async fn run_chat(
    session: &SessionContext,
    args: &Args,
    load: Option<&Path>,
    config_path: &Path,
    log: Option<&TranscriptLog>,
) -> Result<(), Box<dyn Error>> {
    let mut model = require_model(session, args.model.as_deref())?;
    let conversation = load
        .map(|path| load_conversation(path, &model))
        .transpose()?;
    // A resumed conversation keeps its model unless one was asked for.
    if let Some(saved) = conversation.as_ref().map(|c| c.model.as_str()) {
        if args.model.is_none() && session.registry().lookup(saved).is_some() {
            model = saved.to_string();
        }
    }

    let mut chat = ChatLoop::new(session, &model, conversation, log);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    chat.run(stdin).await?;

    remember_model(session.config(), config_path, chat.model());
    Ok(())
}

fn require_model(session: &SessionContext, explicit: Option<&str>) -> Result<String, Box<dyn Error>> {
    session.select_model(explicit).ok_or_else(|| {
        "No usable model. Set a provider API key, start Ollama, or pass --model."
            .to_string()
            .into()
    })
}

/// Records the model for the next session. A failed write only warns.
fn remember_model(config: &Config, config_path: &Path, model: &str) {
    if config.last_used_model.as_deref() == Some(model) {
        return;
    }
    let mut updated = config.clone();
    updated.last_used_model = Some(model.to_string());
    if let Err(err) = updated.save_to_path(config_path) {
        warn!(error = %err, "Failed to remember last used model");
    }
}
