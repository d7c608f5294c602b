mod config;

use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lens_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use lens_contracts::media::ImageUpload;
use lens_contracts::models::{ModelRegistry, ModelSelector};
use lens_contracts::transcript::{self, ASSISTANT_LABEL};
use lens_engine::{default_provider_registry, ChatEngine, ChatSettings};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, ConfigOverrides};

#[derive(Debug, Parser)]
#[command(name = "lens", version, about = "Ask questions about an image")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat about one image at a time.
    Chat(ChatArgs),
    /// One question, one answer.
    Ask(AskArgs),
    /// List the known vision models.
    Models,
}

#[derive(Debug, Args)]
struct SessionArgs {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    system: Option<String>,
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    image: Option<PathBuf>,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    question: String,
    #[command(flatten)]
    session: SessionArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("lens error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            let mut engine = start_engine(&args.session)?;
            let stdin = io::stdin();
            run_chat(&mut engine, args.image.as_deref(), stdin.lock(), io::stdout())?;
            Ok(0)
        }
        Command::Ask(args) => run_ask(args),
        Command::Models => {
            print_models(&ModelRegistry::new(None), None, &mut io::stdout())?;
            Ok(0)
        }
    }
}

fn start_engine(args: &SessionArgs) -> Result<ChatEngine> {
    let overrides = ConfigOverrides {
        model: args.model.clone(),
        system_prompt: args.system.clone(),
        max_tokens: args.max_tokens,
        temperature: args.temperature,
    };
    let config = AppConfig::load(&overrides, &args.env_file)?;
    init_tracing(&config.log_filter);

    let selector = ModelSelector::new(None);
    config.ensure_credentials(&selector)?;
    let providers = default_provider_registry(
        config.api_key.as_deref(),
        config.api_base.as_deref(),
        config.timeout,
    )?;
    debug!(providers = ?providers.names(), "providers ready");
    ChatEngine::new(
        providers,
        selector,
        config.model.as_deref(),
        ChatSettings {
            max_tokens: config.max_tokens,
            temperature: Some(config.temperature),
            system_prompt: config.system_prompt.clone(),
        },
        args.events.as_deref(),
    )
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run_ask(args: AskArgs) -> Result<i32> {
    let mut engine = start_engine(&args.session)?;
    let upload = ImageUpload::from_path(&args.image)?;
    if let Err(err) = engine.upload_image(upload) {
        eprintln!("Error: {err}");
        return Ok(1);
    }
    match engine.analyze(&args.question) {
        Ok(outcome) => {
            println!("{}", outcome.reply.text);
            Ok(0)
        }
        Err(err) => {
            eprintln!("Error: {err}");
            Ok(1)
        }
    }
}

fn run_chat<R: BufRead, W: Write>(
    engine: &mut ChatEngine,
    initial_image: Option<&Path>,
    mut input: R,
    mut out: W,
) -> Result<()> {
    writeln!(
        out,
        "Lens chat started with {}. Type /help for commands.",
        engine.model().name
    )?;
    if let Some(path) = initial_image {
        load_image(engine, path, &mut out)?;
    }

    let mut line = String::new();
    loop {
        write!(out, "> ")?;
        out.flush()?;

        line.clear();
        let read = match input.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        match intent.action.as_str() {
            "noop" => continue,
            "help" => {
                writeln!(out, "Commands: {}", CHAT_HELP_COMMANDS.join(" "))?;
            }
            "quit" => break,
            "set_active_image" => match intent.arg("path") {
                Some(path) => load_image(engine, Path::new(path), &mut out)?,
                None => writeln!(out, "/image requires a path")?,
            },
            "reset" => {
                engine.reset();
                writeln!(out, "Conversation cleared.")?;
            }
            "set_model" => match intent.arg("model") {
                Some(model) => match engine.set_model(model) {
                    Ok(selection) => {
                        if let Some(reason) = &selection.fallback_reason {
                            writeln!(out, "{reason}")?;
                        }
                        writeln!(out, "Model set to {}", selection.model.name)?;
                    }
                    Err(err) => writeln!(out, "Model change failed: {err:#}")?,
                },
                None => writeln!(out, "Current model: {}", engine.model().name)?,
            },
            "list_models" => {
                let current = engine.model().name.clone();
                print_models(&engine.selector().registry, Some(&current), &mut out)?;
            }
            "history" => {
                let turns = engine.session().turns();
                if turns.is_empty() {
                    writeln!(out, "No messages yet.")?;
                } else {
                    write!(out, "{}", transcript::render_text(turns))?;
                }
            }
            "export" => {
                let path = PathBuf::from(intent.arg("path").unwrap_or("transcript.html"));
                let title = format!("Lens session {}", engine.session().session_id());
                match transcript::write_html(&path, &title, engine.session().turns()) {
                    Ok(()) => writeln!(out, "Transcript written to {}", path.display())?,
                    Err(err) => writeln!(out, "Export failed: {err:#}")?,
                }
            }
            "ask" => {
                let question = intent.question.as_deref().unwrap_or_default();
                match engine.analyze(question) {
                    Ok(outcome) => writeln!(out, "{ASSISTANT_LABEL}: {}", outcome.reply.text)?,
                    Err(err) => writeln!(out, "Error: {err}")?,
                }
            }
            _ => {
                let command = intent.arg("command").unwrap_or_default();
                writeln!(out, "Unknown command: /{command}. Type /help for commands.")?;
            }
        }
    }
    Ok(())
}

fn load_image<W: Write>(engine: &mut ChatEngine, path: &Path, out: &mut W) -> Result<()> {
    let upload = match ImageUpload::from_path(path) {
        Ok(upload) => upload,
        Err(err) => {
            writeln!(out, "Image load failed: {err:#}")?;
            return Ok(());
        }
    };
    let had_history = !engine.session().is_empty();
    match engine.upload_image(upload) {
        Ok(activation) => {
            if let Some(message) = activation.declared_mismatch.as_deref() {
                writeln!(out, "Note: {message}")?;
            }
            writeln!(
                out,
                "Active image: {} ({})",
                activation.name, activation.media_type
            )?;
            if activation.history_reset && had_history {
                writeln!(out, "New image; conversation cleared.")?;
            }
        }
        Err(err) => writeln!(out, "Error: {err}")?,
    }
    Ok(())
}

fn print_models<W: Write>(
    registry: &ModelRegistry,
    current: Option<&str>,
    out: &mut W,
) -> Result<()> {
    for model in registry.list() {
        let marker = if current == Some(model.name.as_str()) { "*" } else { " " };
        writeln!(
            out,
            "{marker} {:<28} {:<10} {}",
            model.name, model.provider, model.label
        )
        .context("failed to write model list")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn offline_engine(events: Option<&Path>) -> Result<ChatEngine> {
        let providers =
            default_provider_registry(None, None, std::time::Duration::from_secs(5))?;
        ChatEngine::new(
            providers,
            ModelSelector::new(None),
            Some("dryrun-vision-1"),
            ChatSettings::default(),
            events,
        )
    }

    fn write_png(path: &Path) -> Result<()> {
        image::RgbImage::from_pixel(3, 3, image::Rgb([10, 200, 10]))
            .save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }

    fn drive(engine: &mut ChatEngine, image: Option<&Path>, script: &str) -> Result<String> {
        let mut out = Vec::new();
        run_chat(engine, image, Cursor::new(script.as_bytes().to_vec()), &mut out)?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn chat_loop_answers_and_clears_on_new_image() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let first = temp.path().join("first.png");
        let second = temp.path().join("second.png");
        write_png(&first)?;
        write_png(&second)?;

        let mut engine = offline_engine(None)?;
        let script = format!(
            "What is this?\n/history\n/image \"{}\"\n/history\n/quit\nnever read\n",
            second.display()
        );
        let output = drive(&mut engine, Some(first.as_path()), &script)?;

        assert!(output.contains("Active image: first.png (image/png)"));
        assert!(output.contains("Claude: [dryrun] 1 message(s) in context."));
        assert!(output.contains("You: What is this?  [first.png]"));
        assert!(output.contains("New image; conversation cleared."));
        assert!(output.contains("No messages yet."));
        assert!(!output.contains("never read"));
        assert!(engine.session().is_empty());
        Ok(())
    }

    #[test]
    fn chat_loop_reports_recoverable_errors() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let notes = temp.path().join("notes.txt");
        std::fs::write(&notes, "plain text")?;

        let mut engine = offline_engine(None)?;
        let script = format!("Hello?\n/image {}\n/bogus\n", notes.display());
        let output = drive(&mut engine, None, &script)?;

        assert!(output.contains("Error: no image uploaded; upload an image before asking"));
        assert!(output.contains("Error: unsupported image format for 'notes.txt'"));
        assert!(output.contains("Unknown command: /bogus."));
        assert!(engine.session().active_image().is_none());
        Ok(())
    }

    #[test]
    fn chat_loop_exports_html_and_lists_models() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let image = temp.path().join("cat.png");
        write_png(&image)?;
        let export = temp.path().join("out").join("chat.html");
        let events = temp.path().join("events.jsonl");

        let mut engine = offline_engine(Some(&events))?;
        let script = format!(
            "What is this?\n/models\n/export {}\n/reset\n",
            export.display()
        );
        let output = drive(&mut engine, Some(image.as_path()), &script)?;

        assert!(output.contains("* dryrun-vision-1"));
        assert!(output.contains("Conversation cleared."));
        let html = std::fs::read_to_string(&export)?;
        assert!(html.contains("What is this?"));
        assert!(html.contains("data:image/png;base64,"));
        let log = std::fs::read_to_string(&events)?;
        assert!(log.lines().any(|line| line.contains("\"type\":\"session_reset\"")));
        Ok(())
    }
}
