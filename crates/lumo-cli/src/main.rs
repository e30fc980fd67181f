use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use lumo_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use lumo_contracts::session::SessionContext;
use lumo_engine::AssistantEngine;
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "lumo", version, about = "Lumo assistant CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat session.
    Chat(ChatArgs),
    /// One-shot text generation.
    Ask(AskArgs),
    /// One-shot image generation.
    Art(ArtArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long, default_value = "lumo-out")]
    out: PathBuf,
    /// Event transcript path; defaults to <out>/events.jsonl.
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    token: Option<String>,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "lumo-out")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    token: Option<String>,
}

#[derive(Debug, Parser)]
struct ArtArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "lumo-out")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    token: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("lumo error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    dotenv().ok();
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => run_chat(args),
        Command::Ask(args) => run_ask(args),
        Command::Art(args) => run_art(args),
    }
}

/// Flag beats HUGGINGFACE_TOKEN beats HF_TOKEN; blank values do not count.
fn pick_token(
    flag: Option<String>,
    primary_env: Option<String>,
    secondary_env: Option<String>,
) -> Option<String> {
    [flag, primary_env, secondary_env]
        .into_iter()
        .flatten()
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn resolve_token(flag: Option<String>) -> Result<String> {
    match pick_token(flag, env_var("HUGGINGFACE_TOKEN"), env_var("HF_TOKEN")) {
        Some(token) => Ok(token),
        None => bail!("missing API token; set HUGGINGFACE_TOKEN or pass --token"),
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn events_path_for(out: &PathBuf, events: Option<PathBuf>) -> PathBuf {
    events.unwrap_or_else(|| out.join("events.jsonl"))
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    let token = resolve_token(args.token)?;
    let events_path = events_path_for(&args.out, args.events);

    let mut engine = AssistantEngine::new(&args.out, &token)?;
    engine.set_text_model(args.text_model);
    engine.set_image_model(args.image_model);

    let mut session = SessionContext::open(&events_path)?;
    println!("Lumo ready. Type /help for commands.");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("you> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let intent = parse_intent(&line);

        match intent.action.as_str() {
            "noop" => continue,
            "quit" => break,
            "help" => {
                println!("Available commands:");
                for command in CHAT_HELP_COMMANDS {
                    println!("  {command}");
                }
            }
            "history" => {
                if session.messages().is_empty() {
                    println!("No messages yet.");
                }
                for message in session.messages() {
                    println!("{}: {}", message.role, message.content);
                }
            }
            "new_session" => {
                session.close()?;
                session = SessionContext::open(&events_path)?;
                println!("Started a new session ({}).", session.id());
            }
            "set_text_model" => {
                match command_arg(&intent.command_args, "model") {
                    Some(model) => {
                        println!("Text model set to {model}.");
                        engine.set_text_model(Some(model));
                    }
                    None => println!(
                        "Text model: {}",
                        engine.text_model().unwrap_or("(default fallback list)")
                    ),
                }
            }
            "set_image_model" => {
                match command_arg(&intent.command_args, "model") {
                    Some(model) => {
                        println!("Image model set to {model}.");
                        engine.set_image_model(Some(model));
                    }
                    None => println!(
                        "Image model: {}",
                        engine.image_model().unwrap_or("(default fallback list)")
                    ),
                }
            }
            "create_image" => match command_arg(&intent.command_args, "prompt") {
                Some(prompt) => match engine.create_image(&mut session, &prompt) {
                    Ok(artifact) => {
                        print_fallback_note(&engine);
                        println!(
                            "Saved {} ({}x{}, model {}).",
                            artifact.path.display(),
                            artifact.width,
                            artifact.height,
                            artifact.model
                        );
                    }
                    Err(err) => println!("lumo> {err}"),
                },
                None => println!("Usage: /image <prompt>"),
            },
            "say" => {
                let prompt = intent.prompt.unwrap_or_default();
                match engine.respond(&mut session, &prompt) {
                    Ok(reply) => {
                        print_fallback_note(&engine);
                        println!("lumo> {reply}");
                    }
                    Err(err) => println!("lumo> {err}"),
                }
            }
            _ => {
                let command = command_arg(&intent.command_args, "command").unwrap_or_default();
                println!("Unknown command /{command}. Type /help for the command list.");
            }
        }
    }

    session.close()?;
    Ok(0)
}

fn run_ask(args: AskArgs) -> Result<i32> {
    let token = resolve_token(args.token)?;
    let events_path = events_path_for(&args.out, args.events);

    let mut engine = AssistantEngine::new(&args.out, &token)?;
    engine.set_text_model(args.text_model);

    let mut session = SessionContext::open(&events_path)?;
    let result = engine.respond(&mut session, &args.prompt);
    session.close()?;

    let reply = result?;
    print_fallback_note(&engine);
    println!("{reply}");
    Ok(0)
}

fn run_art(args: ArtArgs) -> Result<i32> {
    let token = resolve_token(args.token)?;
    let events_path = events_path_for(&args.out, args.events);

    let mut engine = AssistantEngine::new(&args.out, &token)?;
    engine.set_image_model(args.image_model);

    let mut session = SessionContext::open(&events_path)?;
    let result = engine.create_image(&mut session, &args.prompt);
    session.close()?;

    let artifact = result?;
    print_fallback_note(&engine);
    println!(
        "Saved {} ({}x{}, model {}).",
        artifact.path.display(),
        artifact.width,
        artifact.height,
        artifact.model
    );
    Ok(0)
}

fn command_arg(
    args: &std::collections::BTreeMap<String, Value>,
    key: &str,
) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn print_fallback_note(engine: &AssistantEngine) {
    if let Some(reason) = engine.last_fallback_reason() {
        println!("note: {reason}");
    }
}
