//! `quill [PROMPT]`: run the writing agent.

use clap::Args;
use quill_agent::{
    AgentError, AgentLoop, AgentStreamEvent, EmergencyOutcome, RunOutcome, RunReport, Session,
    ShutdownSignal, StreamObserver, system_prompt,
};
use quill_config::AppConfig;
use quill_core::event::EventBus;
use quill_core::tool::ProjectContext;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use super::render::{StreamRenderer, describe};

const QUIT_WORDS: [&str; 3] = ["quit", "exit", "q"];

#[derive(Args, Debug, Default)]
pub struct WriteArgs {
    /// Your writing request (e.g. "Create a mystery novel")
    pub prompt: Option<String>,

    /// Continue from a context summary or checkpoint file
    #[arg(long, value_name = "FILE", conflicts_with = "prompt")]
    pub recover: Option<PathBuf>,

    /// Override the configured model
    #[arg(long)]
    pub model: Option<String>,

    /// Override the iteration cap
    #[arg(long)]
    pub max_iterations: Option<u32>,
}

/// Where the run's first user turn comes from.
#[derive(Debug, PartialEq, Eq)]
pub enum Seed {
    Prompt(String),
    Recover(PathBuf),
    /// The user declined to enter a prompt.
    Quit,
}

/// Resolve the seed from arguments, falling back to one line of `input`
/// after prompting on `output`.
pub fn resolve_seed(
    args: &WriteArgs,
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> Result<Seed, AgentError> {
    if let Some(path) = &args.recover {
        return Ok(Seed::Recover(path.clone()));
    }
    if let Some(prompt) = &args.prompt {
        return Ok(Seed::Prompt(prompt.clone()));
    }

    if let Err(e) = write!(output, "Enter your writing request (or 'quit' to exit): ")
        .and_then(|()| output.flush())
    {
        warn!(error = %e, "Could not write the input prompt");
    }
    let mut line = String::new();
    input.read_line(&mut line)?;
    let line = line.trim();

    if QUIT_WORDS.contains(&line.to_lowercase().as_str()) {
        return Ok(Seed::Quit);
    }
    if line.is_empty() {
        return Err(AgentError::EmptyPrompt);
    }
    Ok(Seed::Prompt(line.to_string()))
}

pub async fn run(args: WriteArgs, config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config =
        AppConfig::load_with(config_path).map_err(|e| format!("Failed to load config: {e}"))?;
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(max) = args.max_iterations {
        config.agent.max_iterations = max.max(1);
    }

    // Input errors are fatal before anything touches the network.
    let seed = resolve_seed(&args, &mut std::io::stdin().lock(), &mut std::io::stdout())?;
    let project = ProjectContext::new(&config.output_dir);
    let prompt = system_prompt(&config);
    let session = match seed {
        Seed::Quit => {
            println!("Goodbye!");
            return Ok(());
        }
        Seed::Prompt(text) => Session::new(&config.model, prompt, &text, project)?,
        Seed::Recover(path) => {
            println!("Recovering from {}", path.display());
            Session::recover(&config.model, prompt, &path, project)?
        }
    };

    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    export MOONSHOT_API_KEY='sk-...'   (recommended)");
        eprintln!("    export QUILL_API_KEY='sk-...'      (generic)");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let provider = quill_providers::build_from_config(&config)?;
    let tools = Arc::new(quill_tools::default_registry());

    println!();
    println!("  Quill");
    println!("  Model:      {}", config.model);
    println!("  Output:     {}", config.output_dir.display());
    println!("  Iterations: up to {}", config.agent.max_iterations);
    println!(
        "  Context:    compress at {} of {} tokens",
        config.context.compression_threshold, config.context.token_limit
    );
    println!();

    let bus = Arc::new(EventBus::default());
    let status = tokio::spawn(print_status(bus.subscribe()));
    let (stream_tx, stream_rx) = mpsc::unbounded_channel();
    let stream = tokio::spawn(print_stream(stream_rx));

    let shutdown = ShutdownSignal::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let agent = AgentLoop::new(provider, tools, &config)
        .with_event_bus(bus.clone())
        .with_observer(StreamObserver::new(stream_tx))
        .with_shutdown(shutdown);

    let report = agent.run(session).await;

    drop(agent);
    drop(bus);
    let _ = stream.await;
    let _ = status.await;

    print_report(&report);
    Ok(())
}

async fn print_stream(mut rx: mpsc::UnboundedReceiver<AgentStreamEvent>) {
    let mut renderer = StreamRenderer::default();
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        if let Err(e) = renderer.render(&event, &mut stdout) {
            warn!(error = %e, "Could not write to stdout");
        }
    }
    println!();
}

async fn print_status(mut rx: broadcast::Receiver<Arc<quill_core::event::DomainEvent>>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Some(line) = describe(&event) {
                    eprintln!("\n{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Status display fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// First SIGINT/SIGTERM requests a graceful stop; a second one exits at once.
async fn watch_signals(shutdown: ShutdownSignal) {
    wait_for_signal().await;
    if shutdown.trigger() {
        eprintln!("\nInterrupt received. Saving context before exit (interrupt again to force quit)...");
        info!("Shutdown requested");
    }
    wait_for_signal().await;
    eprintln!("\nForced exit. Context may not have been saved.");
    std::process::exit(130);
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_report(report: &RunReport) {
    println!();
    match &report.outcome {
        RunOutcome::Completed => {
            println!("Task completed in {} iterations.", report.iterations);
            if let Some(project) = report.session.project.active() {
                println!("Your work is in {}", project.display());
            }
        }
        RunOutcome::MaxIterationsReached { checkpoint } => {
            println!("Reached the maximum of {} iterations.", report.iterations);
            match checkpoint {
                Some(checkpoint) => {
                    println!("Context saved to {}", checkpoint.record.summary_file.display());
                    println!(
                        "Continue with: quill --recover \"{}\"",
                        checkpoint.record.summary_file.display()
                    );
                }
                None => println!("The final checkpoint could not be written."),
            }
        }
        RunOutcome::Aborted { reason, emergency } => {
            println!("Run stopped ({reason}) after {} iterations.", report.iterations);
            match emergency {
                EmergencyOutcome::Checkpointed(checkpoint) => {
                    println!("Full context saved to {}", checkpoint.record.summary_file.display());
                    println!(
                        "To resume later, run: quill --recover \"{}\"",
                        checkpoint.record.summary_file.display()
                    );
                }
                EmergencyOutcome::RawDump { path, error } => {
                    println!("Emergency save failed ({error}).");
                    println!("Raw message dump saved to {}", path.display());
                }
                EmergencyOutcome::Lost { error } => {
                    println!("Emergency save failed, context may be lost: {error}");
                }
            }
        }
    }
    println!("Goodbye!");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn prompt_argument_wins() {
        let args = WriteArgs {
            prompt: Some("Write a novel".into()),
            ..Default::default()
        };
        let seed = resolve_seed(&args, &mut Cursor::new("ignored\n"), &mut Vec::new()).unwrap();
        assert_eq!(seed, Seed::Prompt("Write a novel".into()));
    }

    #[test]
    fn recover_argument_selects_recovery() {
        let args = WriteArgs {
            recover: Some(PathBuf::from("summary.md")),
            ..Default::default()
        };
        let seed = resolve_seed(&args, &mut Cursor::new(""), &mut Vec::new()).unwrap();
        assert_eq!(seed, Seed::Recover(PathBuf::from("summary.md")));
    }

    #[test]
    fn interactive_prompt_is_trimmed() {
        let seed = resolve_seed(&WriteArgs::default(), &mut Cursor::new("  A sea saga \n"), &mut Vec::new()).unwrap();
        assert_eq!(seed, Seed::Prompt("A sea saga".into()));
    }

    #[test]
    fn interactive_prompt_is_written_to_output() {
        let mut out = Vec::new();
        resolve_seed(&WriteArgs::default(), &mut Cursor::new("saga\n"), &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Enter your writing request (or 'quit' to exit): "
        );
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn unwritable_output_still_reads_prompt() {
        let seed =
            resolve_seed(&WriteArgs::default(), &mut Cursor::new("A sea saga\n"), &mut BrokenPipe).unwrap();
        assert_eq!(seed, Seed::Prompt("A sea saga".into()));
    }

    #[test]
    fn quit_words_exit_cleanly() {
        for word in ["quit", "EXIT", "q"] {
            let seed = resolve_seed(&WriteArgs::default(), &mut Cursor::new(format!("{word}\n")), &mut Vec::new()).unwrap();
            assert_eq!(seed, Seed::Quit);
        }
    }

    #[test]
    fn empty_interactive_input_is_fatal() {
        let err = resolve_seed(&WriteArgs::default(), &mut Cursor::new("\n"), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, AgentError::EmptyPrompt));
        assert!(err.is_fatal_input());
    }

    #[test]
    fn recover_conflicts_with_prompt() {
        use clap::Parser;

        #[derive(Parser)]
        struct TestCli {
            #[command(flatten)]
            write: WriteArgs,
        }

        assert!(TestCli::try_parse_from(["quill", "a prompt", "--recover", "x.md"]).is_err());
        let cli = TestCli::try_parse_from(["quill", "--recover", "x.md", "--max-iterations", "5"]).unwrap();
        assert_eq!(cli.write.recover, Some(PathBuf::from("x.md")));
        assert_eq!(cli.write.max_iterations, Some(5));
    }
}
