//! CLI entry points: `generate`, `init`, `doctor`.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use sceneloop::clarify::{self, AnswerSource};
use sceneloop::core::rubric::Rubric;
use sceneloop::core::types::SessionStatus;
use sceneloop::critic::ModelCritic;
use sceneloop::doctor::{all_passed, run_doctor};
use sceneloop::exit_codes;
use sceneloop::generator::ModelScriptGenerator;
use sceneloop::io::config::{CONFIG_FILE, load_config, write_default_config};
use sceneloop::io::engine::EngineSandbox;
use sceneloop::io::render::EngineRenderer;
use sceneloop::llm::{TextModel, create_model};
use sceneloop::pipeline::{ClarifyGate, NoClarification, Pipeline, PipelineOptions};
use sceneloop::session::{ClarificationExchange, Session, SessionConfig};

#[derive(Parser)]
#[command(
    name = "sceneloop",
    version,
    about = "Drive a 3D authoring engine toward a target appearance"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a generation session for a text prompt.
    Generate {
        /// Text description of the target appearance.
        prompt: String,
        /// Output directory root (defaults to pipeline.output_dir).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Path to the configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Style-reference image.
        #[arg(long)]
        reference: Option<PathBuf>,
        /// Goal image(s) the scene should converge to (edit mode).
        #[arg(long = "goal")]
        goal_images: Vec<PathBuf>,
        /// Existing scene to edit instead of building from scratch.
        #[arg(long = "scene")]
        starting_scene: Option<PathBuf>,
        /// Named viewpoint(s) to render in edit mode.
        #[arg(long = "view")]
        edit_views: Vec<String>,
        /// Maximum iterations (overrides config).
        #[arg(short = 'r', long)]
        max_iterations: Option<u32>,
        /// Disable interactive clarification prompts.
        #[arg(long)]
        no_interactive: bool,
    },
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Validate the engine path, credentials, and output root.
    Doctor {
        /// Path to the configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    sceneloop::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate {
            prompt,
            output,
            config,
            reference,
            goal_images,
            starting_scene,
            edit_views,
            max_iterations,
            no_interactive,
        } => cmd_generate(GenerateArgs {
            prompt,
            output,
            config,
            reference,
            goal_images,
            starting_scene,
            edit_views,
            max_iterations,
            no_interactive,
        }),
        Command::Init { force } => cmd_init(force),
        Command::Doctor { config } => cmd_doctor(config.as_deref()),
    }
}

struct GenerateArgs {
    prompt: String,
    output: Option<PathBuf>,
    config: Option<PathBuf>,
    reference: Option<PathBuf>,
    goal_images: Vec<PathBuf>,
    starting_scene: Option<PathBuf>,
    edit_views: Vec<String>,
    max_iterations: Option<u32>,
    no_interactive: bool,
}

fn cmd_generate(args: GenerateArgs) -> Result<i32> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let mut config = load_config(&config_path)?;
    if let Some(max_iterations) = args.max_iterations {
        config.pipeline.max_iterations = max_iterations;
    }

    // Setup failures abort before any session directory exists.
    let engine_path = config.engine_path().ok_or_else(|| {
        anyhow!(
            "engine.executable_path is not configured (edit {} or set {})",
            config_path.display(),
            sceneloop::io::config::ENGINE_PATH_ENV
        )
    })?;
    let sandbox = EngineSandbox::new(&engine_path);
    let version = sandbox
        .probe()
        .context("authoring engine is not reachable")?;
    println!("engine: {version}");

    let generator = ModelScriptGenerator::new(create_model(&config)?);
    let critic = ModelCritic::new(create_model(&config)?, Rubric::default());
    let renderer = EngineRenderer::new(&engine_path);

    let session_config = SessionConfig {
        prompt: args.prompt,
        reference_image: args.reference,
        goal_images: args.goal_images,
        starting_scene: args.starting_scene,
        edit_views: args.edit_views,
        interactive: !args.no_interactive,
        max_iterations: config.pipeline.max_iterations,
        output_root: args
            .output
            .unwrap_or_else(|| config.pipeline.output_dir.clone()),
    };

    let pipeline = Pipeline::new(
        generator,
        sandbox,
        renderer,
        critic,
        Rubric::default(),
        PipelineOptions {
            engine_timeout: Duration::from_secs(config.engine.timeout_seconds),
            output_limit_bytes: config.engine.output_limit_bytes,
        },
    );

    let session = if session_config.interactive {
        let clarify_model = create_model(&config)?;
        let mut gate = StdinClarifyGate {
            model: clarify_model,
        };
        pipeline.run(&session_config, &mut gate)?
    } else {
        pipeline.run(&session_config, &mut NoClarification)?
    };

    report_session(&session);
    Ok(match session.status {
        SessionStatus::Passed | SessionStatus::Exhausted => exit_codes::OK,
        _ => exit_codes::SESSION_FAILED,
    })
}

fn report_session(session: &Session) {
    println!();
    println!("session:    {}", session.id);
    println!("status:     {:?}", session.status);
    println!("iterations: {}", session.iterations.len());
    if let Some(selected) = session.selected_iteration() {
        println!(
            "selected:   iteration {} (score {})",
            selected.index, selected.critique.total
        );
        println!("artifacts:  {}", session.output_dir.join("final").display());
    } else {
        println!("artifacts:  {} (no presentable result)", session.output_dir.display());
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let path = Path::new(CONFIG_FILE);
    write_default_config(path, force)?;
    println!("created {}", path.display());
    println!();
    println!("next steps:");
    println!("  1. set engine.executable_path to your authoring engine binary");
    println!("  2. set llm.api_key (or export {})", sceneloop::io::config::API_KEY_ENV);
    println!("  3. run: sceneloop generate \"a wooden chair\"");
    Ok(exit_codes::OK)
}

fn cmd_doctor(config: Option<&Path>) -> Result<i32> {
    let config_path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let checks = run_doctor(&config_path);

    for check in &checks {
        let status = if check.passed { " OK " } else { "FAIL" };
        println!("[{status}] {:<22} {}", check.name, check.detail);
    }

    if all_passed(&checks) {
        println!("\nall checks passed");
        Ok(exit_codes::OK)
    } else {
        println!("\nsome checks failed; fix the items above");
        Ok(exit_codes::INVALID)
    }
}

/// Clarification gate that asks the configured model whether the prompt is
/// ambiguous and collects answers on stdin.
struct StdinClarifyGate {
    model: Box<dyn TextModel>,
}

impl ClarifyGate for StdinClarifyGate {
    fn run(&mut self, prompt: &str) -> Result<ClarificationExchange> {
        clarify::run_clarification(self.model.as_ref(), prompt, &mut StdinAnswers)
    }
}

/// Reads one answer per question from stdin; an empty line declines the
/// whole exchange.
struct StdinAnswers;

impl AnswerSource for StdinAnswers {
    fn answer(&mut self, questions: &[String]) -> Result<Vec<String>> {
        println!("\nA couple of details would improve the result (empty answer skips):");
        let mut answers = Vec::new();
        for question in questions {
            print!("  {question}\n  > ");
            std::io::stdout().flush().context("flush stdout")?;
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .context("read answer")?;
            let line = line.trim();
            if line.is_empty() {
                return Ok(Vec::new());
            }
            answers.push(line.to_string());
        }
        Ok(answers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_generate_defaults() {
        let cli = Cli::parse_from(["sceneloop", "generate", "a chair"]);
        match cli.command {
            Command::Generate {
                prompt,
                no_interactive,
                max_iterations,
                ..
            } => {
                assert_eq!(prompt, "a chair");
                assert!(!no_interactive);
                assert_eq!(max_iterations, None);
            }
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn parse_generate_edit_mode_flags() {
        let cli = Cli::parse_from([
            "sceneloop",
            "generate",
            "make the walls brick",
            "--scene",
            "room.blend",
            "--goal",
            "goal1.png",
            "--goal",
            "goal2.png",
            "--view",
            "cam_main",
            "--no-interactive",
        ]);
        match cli.command {
            Command::Generate {
                starting_scene,
                goal_images,
                edit_views,
                no_interactive,
                ..
            } => {
                assert_eq!(starting_scene, Some(PathBuf::from("room.blend")));
                assert_eq!(goal_images.len(), 2);
                assert_eq!(edit_views, vec!["cam_main"]);
                assert!(no_interactive);
            }
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["sceneloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_doctor() {
        let cli = Cli::parse_from(["sceneloop", "doctor"]);
        assert!(matches!(cli.command, Command::Doctor { config: None }));
    }
}
