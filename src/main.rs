use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use prompt2manga::core::config::{Config, DEFAULT_CONFIG_PATH};
use prompt2manga::core::error::PipelineError;
use prompt2manga::core::model::MangaRequest;
use prompt2manga::core::state::GenerationRun;
use prompt2manga::services::progress::ProgressSink;
use prompt2manga::services::setup::run_setup;
use prompt2manga::services::workflow::WorkflowManager;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "prompt2manga")]
#[command(about = "Turn a story prompt into illustrated manga chapters and a PDF")]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline: outline, characters, scripts, panels, PDF
    Generate {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "")]
        context: String,
        #[arg(long, default_value = "")]
        instructions: String,
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(1..=10))]
        chapters: u8,
        /// Language of dialogue and narration only
        #[arg(long, default_value = "english")]
        lang: String,
        /// Override the configured text model
        #[arg(long)]
        model: Option<String>,
        /// Appended to the story prompt
        #[arg(long)]
        art_style: Option<String>,
    },
    /// Continue an interrupted run
    Resume {
        /// Defaults to the run recorded as active
        namespace: Option<String>,
        /// Remove a lock left behind by a crashed process
        #[arg(long)]
        force: bool,
    },
    /// List finished runs
    History,
    /// Remove a run from the history
    Delete {
        index: usize,
        /// Also delete its images and PDF
        #[arg(long)]
        purge: bool,
    },
    /// Select a run and print the path of one of its panels
    View {
        index: usize,
        #[arg(long, default_value_t = 0)]
        panel: usize,
    },
    /// Forget all history
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Create or update the configuration file interactively
    Setup,
}

struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new() -> Result<Self> {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
                .progress_chars("#>-"),
        );
        Ok(Self { bar })
    }
}

impl ProgressSink for BarProgress {
    fn report(&self, step: &str, percent: u8) {
        self.bar.set_position(percent as u64);
        self.bar.set_message(step.to_string());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Command::Setup = cli.command {
        run_setup(&cli.config)?;
        println!("Configuration written to {}", cli.config);
        return Ok(());
    }

    let config = Config::load_from(&cli.config)?;
    let mut manager = WorkflowManager::from_config(config).await?;

    match cli.command {
        Command::Generate {
            prompt,
            context,
            instructions,
            chapters,
            lang,
            model,
            art_style,
        } => {
            let request = MangaRequest {
                prompt,
                context,
                instructions,
                num_chapters: chapters as usize,
                lang,
                model,
                art_style,
            };
            let progress = BarProgress::new()?;
            let result = manager.run(request, &progress, &cancel_on_ctrl_c()).await;
            progress.bar.finish_and_clear();
            report(result)?;
        }
        Command::Resume { namespace, force } => {
            let progress = BarProgress::new()?;
            let result = manager
                .resume(namespace.as_deref(), force, &progress, &cancel_on_ctrl_c())
                .await;
            progress.bar.finish_and_clear();
            report(result)?;
        }
        Command::History => {
            let state = manager.state();
            if state.history.is_empty() {
                println!("No runs yet.");
            }
            for (i, run) in state.history.iter().enumerate() {
                let when = chrono::DateTime::from_timestamp(run.timestamp as i64, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "[{}] {} ({}) {} chapters, {}/{} panels, {}",
                    i,
                    run.title,
                    when,
                    run.chapter_count,
                    run.image_paths.len(),
                    run.panel_count,
                    run.pdf_path.as_deref().unwrap_or("no PDF"),
                );
            }
            if let Some(ns) = &state.active_run {
                println!("Unfinished run: {} (prompt2manga resume)", ns);
            }
        }
        Command::Delete { index, purge } => match manager.delete_run(index, purge).await? {
            Some(run) => println!("Deleted '{}'", run.title),
            None => println!("No run at index {}", index),
        },
        Command::View { index, panel } => match manager.view(index, panel).await? {
            Some(path) => println!("{}", path),
            None => println!("Nothing to show for run {}", index),
        },
        Command::Clear { yes } => {
            let confirmed = yes
                || inquire::Confirm::new("Delete all history?")
                    .with_default(false)
                    .prompt()?;
            if confirmed {
                manager.clear().await?;
                println!("History cleared.");
            }
        }
        Command::Setup => {}
    }

    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            child.cancel();
        }
    });
    token
}

fn report(result: Result<GenerationRun, PipelineError>) -> Result<()> {
    let run = match result {
        Ok(run) => run,
        Err(PipelineError::Cancelled) => {
            println!("Cancelled. Run `prompt2manga resume` to continue.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "'{}': {}/{} panels in {}",
        run.title,
        run.image_paths.len(),
        run.panel_count,
        run.pdf_path.as_deref().unwrap_or("(no PDF)")
    );
    for failure in &run.failures {
        println!("  failed {} {}: {}", failure.stage, failure.artifact, failure.error);
    }
    Ok(())
}
