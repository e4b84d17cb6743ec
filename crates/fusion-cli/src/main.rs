use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fusion_contracts::{
    style_preset, ClientConfig, EventWriter, GenerationRequest, RemotePipeline, Task, TaskStatus,
    ValidationMode, STYLE_PRESETS,
};
use fusion_engine::GenerationService;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const FALLBACK_PIPELINE_ID: &str = "kandinsky_3.1";
const FALLBACK_PIPELINE_NAME: &str = "Kandinsky 3.1";
const WATCH_INTERVAL: Duration = Duration::from_millis(250);
const EXIT_TASK_FAILED: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "fusion", version, about = "FusionBrain text-to-image client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the pipelines the account can use.
    Pipelines(ListArgs),
    /// List the style presets accepted by `--style`.
    Styles(ListArgs),
    /// Generate images for one prompt and wait for the result.
    Generate(GenerateArgs),
    /// Generate one task per line of a prompts file, all at once.
    Batch(BatchArgs),
}

#[derive(Debug, Parser)]
struct ListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RequestArgs {
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long)]
    pipeline: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Style preset id, see `fusion styles`.
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    images: Option<u32>,
    #[arg(long)]
    guidance_scale: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    lenient: bool,
    #[arg(long)]
    skip_availability: bool,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[command(flatten)]
    request: RequestArgs,
    /// Copy the finished images into this directory.
    #[arg(long)]
    export: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    /// Text file with one prompt per line.
    #[arg(long)]
    prompts: PathBuf,
    #[command(flatten)]
    request: RequestArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("fusion error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fusion=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Pipelines(args) => run_pipelines(args),
        Command::Styles(args) => run_styles(args),
        Command::Generate(args) => run_generate(args),
        Command::Batch(args) => run_batch(args),
    }
}

fn run_pipelines(args: ListArgs) -> Result<i32> {
    let config = ClientConfig::from_env()?;
    let service = GenerationService::new(&config, EventWriter::disabled())?;
    let pipelines = pipelines_or_fallback(service.list_pipelines());
    if args.json {
        println!("{}", serde_json::to_string_pretty(&pipelines)?);
    } else {
        for pipeline in &pipelines {
            println!("{}\t{}", pipeline.id, pipeline.name);
        }
    }
    Ok(0)
}

fn run_styles(args: ListArgs) -> Result<i32> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(&STYLE_PRESETS)?);
    } else {
        for preset in &STYLE_PRESETS {
            println!("{}\t{}", preset.id, preset.name);
        }
    }
    Ok(0)
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let (config, service) = open_service(&args.request)?;
    let pipeline_id = resolve_pipeline(&args.request, &config, &service);
    let request = build_request(&args.prompt, &pipeline_id, &args.request, &config);

    let id = service.submit(request)?;
    let task = watch(&service, &[id.clone()])?
        .into_iter()
        .next()
        .context("task vanished from the registry")?;
    println!("{}", serde_json::to_string_pretty(&task)?);

    if let Some(dir) = args.export.as_deref() {
        if task.status == TaskStatus::Done {
            for image in service.export_all(&id, dir)? {
                match (image.path, image.error) {
                    (Some(path), _) => println!("exported {}", path.display()),
                    (None, Some(error)) => eprintln!("image {}: {error}", image.index + 1),
                    (None, None) => {}
                }
            }
        }
    }
    Ok(exit_code(std::slice::from_ref(&task)))
}

fn run_batch(args: BatchArgs) -> Result<i32> {
    let text = fs::read_to_string(&args.prompts)
        .with_context(|| format!("failed reading {}", args.prompts.display()))?;
    let prompts = read_prompts(&text);
    if prompts.is_empty() {
        bail!("no prompts found in {}", args.prompts.display());
    }

    let (config, service) = open_service(&args.request)?;
    let pipeline_id = resolve_pipeline(&args.request, &config, &service);
    let mut ids = Vec::with_capacity(prompts.len());
    for prompt in &prompts {
        let request = build_request(prompt, &pipeline_id, &args.request, &config);
        ids.push(service.submit(request)?);
    }

    let tasks = watch(&service, &ids)?;
    println!();
    for row in summary_rows(&tasks) {
        println!("{row}");
    }
    Ok(exit_code(&tasks))
}

fn open_service(args: &RequestArgs) -> Result<(ClientConfig, GenerationService)> {
    let mut config = ClientConfig::from_env()?;
    if let Some(out) = args.out.clone() {
        config.output_dir = out;
    }
    if args.lenient {
        config.validation = ValidationMode::Lenient;
    }
    if args.skip_availability {
        config.check_availability = false;
    }
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| config.output_dir.join("events.jsonl"));
    let events = EventWriter::new(events_path, Uuid::new_v4().to_string());
    info!(
        session_id = events.session_id(),
        journal = ?events.path(),
        "event journal opened"
    );
    let service = GenerationService::new(&config, events)?;
    Ok((config, service))
}

fn pipelines_or_fallback(listed: fusion_contracts::Result<Vec<RemotePipeline>>) -> Vec<RemotePipeline> {
    match listed {
        Ok(pipelines) => pipelines,
        Err(err) => {
            warn!(error = %err, "pipeline catalog unavailable, using the built-in entry");
            vec![RemotePipeline {
                id: FALLBACK_PIPELINE_ID.to_string(),
                name: FALLBACK_PIPELINE_NAME.to_string(),
            }]
        }
    }
}

/// Explicit flag, then configured default, then the first listed pipeline.
fn resolve_pipeline(args: &RequestArgs, config: &ClientConfig, service: &GenerationService) -> String {
    if let Some(id) = args
        .pipeline
        .as_deref()
        .or(config.defaults.pipeline_id.as_deref())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return id.to_string();
    }
    pipelines_or_fallback(service.list_pipelines())
        .into_iter()
        .next()
        .map(|pipeline| pipeline.id)
        .unwrap_or_else(|| FALLBACK_PIPELINE_ID.to_string())
}

fn build_request(
    prompt: &str,
    pipeline_id: &str,
    args: &RequestArgs,
    config: &ClientConfig,
) -> GenerationRequest {
    let mut request = config.defaults.request(prompt, pipeline_id);
    if let Some(negative) = args.negative_prompt.clone() {
        request.negative_prompt = Some(negative);
    }
    if let Some(style) = args.style.clone() {
        if style_preset(&style).is_none() {
            warn!(%style, "not a known style preset, sending it as given");
        }
        request.style = Some(style);
    }
    if let Some(width) = args.width {
        request.width = width;
    }
    if let Some(height) = args.height {
        request.height = height;
    }
    if let Some(images) = args.images {
        request.images_num = images;
    }
    if let Some(scale) = args.guidance_scale {
        request.guidance_scale = scale;
    }
    request.seed = args.seed;
    request
}

/// Prints each status or progress change until every task is terminal.
fn watch(service: &GenerationService, ids: &[String]) -> Result<Vec<Task>> {
    let mut last: Vec<Option<(TaskStatus, u8)>> = vec![None; ids.len()];
    loop {
        let tasks = ids
            .iter()
            .map(|id| service.status(id))
            .collect::<fusion_contracts::Result<Vec<Task>>>()?;
        for (seen, task) in last.iter_mut().zip(&tasks) {
            let current = (task.status, task.progress);
            if *seen != Some(current) {
                eprintln!("[{}] {} {}%", short_id(&task.id), task.status, task.progress);
                *seen = Some(current);
            }
        }
        if tasks.iter().all(|task| task.status.is_terminal()) {
            return Ok(tasks);
        }
        std::thread::sleep(WATCH_INTERVAL);
    }
}

fn read_prompts(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn summary_rows(tasks: &[Task]) -> Vec<String> {
    tasks
        .iter()
        .map(|task| {
            let detail = match (&task.result, &task.error) {
                (Some(images), _) => {
                    let saved = images.iter().filter(|image| image.path.is_some()).count();
                    format!("{saved}/{} images", images.len())
                }
                (None, Some(error)) => error.message.clone(),
                (None, None) => String::new(),
            };
            format!(
                "{:<8} {:<11} {:<40} {}",
                short_id(&task.id),
                task.status.as_str(),
                truncate_prompt(&task.request.prompt, 40),
                detail
            )
        })
        .collect()
}

fn exit_code(tasks: &[Task]) -> i32 {
    if tasks.iter().all(|task| task.status == TaskStatus::Done) {
        0
    } else {
        EXIT_TASK_FAILED
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn truncate_prompt(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars - 1).collect::<String>() + "…"
}
