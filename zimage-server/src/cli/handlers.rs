use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use zimage_core::{
    default_loader, hardware, paths, registry, AppPaths, Config, Error, GenerationRequest,
    GenerationResult, HardwareProfile, LoraRequest, Worker,
};

use super::commands::{CliArgs, Commands, GenerateArgs, LorasCommand, ServeArgs};
use crate::error::OOM_HINT;
use crate::mcp::{self, LinkStyle, McpServer};
use crate::{router, AppState};

/// Exit code for mistakes the user can fix by changing the invocation.
pub const EXIT_USAGE: i32 = 2;
/// Exit code for everything else.
pub const EXIT_FAILURE: i32 = 1;

/// Client errors exit with [`EXIT_USAGE`], everything else with [`EXIT_FAILURE`].
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(e) if e.is_client_error() => EXIT_USAGE,
        _ => EXIT_FAILURE,
    }
}

/// Logs a failed command and picks its exit code.
pub fn report(err: &anyhow::Error) -> i32 {
    error!("{:#}", err);
    if err
        .downcast_ref::<Error>()
        .is_some_and(Error::is_out_of_memory)
    {
        warn!("Out of memory: {}", OOM_HINT);
    }
    exit_code(err)
}

/// Loads configuration, runs the one-time legacy migration, then dispatches.
pub async fn run(args: CliArgs) -> Result<()> {
    let config_dir = AppPaths::default_config_dir();
    let config = Config::load(&config_dir, &args.overrides())?;
    let legacy_root = std::env::current_dir().context("reading the working directory")?;
    if paths::ensure_initial_setup(&legacy_root, &config.paths)? {
        info!("Data directory is {}", config.paths.data_dir.display());
    }
    debug!("Resolved paths: {:?}", config.paths);

    let profile = tokio::task::spawn_blocking(hardware::detect)
        .await
        .context("hardware detection panicked")?;

    match args.command {
        Commands::Models => {
            print_models(&profile);
            Ok(())
        }
        Commands::Generate(gen) => {
            let worker = open_worker(&config, profile).await?;
            handle_generate(&worker, gen).await
        }
        Commands::Serve(serve) => {
            let worker = open_worker(&config, profile).await?;
            handle_serve(worker, serve).await
        }
        Commands::Mcp => {
            let worker = open_worker(&config, profile).await?;
            mcp::run_stdio(McpServer::new(worker, LinkStyle::File)).await
        }
        Commands::Loras(LorasCommand::List) => {
            let worker = open_worker(&config, profile).await?;
            handle_loras_list(&worker).await
        }
    }
}

async fn open_worker(config: &Config, profile: HardwareProfile) -> Result<Worker> {
    let loader = default_loader(config.features);
    Ok(Worker::open(config, profile, loader).await?)
}

fn print_models(profile: &HardwareProfile) {
    let ram = profile
        .ram_gb()
        .map_or_else(|| "unknown".to_string(), |gb| format!("{gb:.1} GB"));
    let vram = profile
        .vram_gb
        .map_or_else(|| "n/a".to_string(), |gb| format!("{gb:.1} GB"));
    println!("Device: {}  RAM: {}  VRAM: {}", profile.device, ram, vram);
    for variant in registry::list_variants(profile) {
        let mut notes = Vec::new();
        if variant.is_recommended {
            notes.push("recommended");
        }
        if !variant.available {
            notes.push("may not fit");
        }
        println!(
            "  {:<5} {:<34} {}",
            variant.precision.as_str(),
            variant.model_identifier,
            notes.join(", ")
        );
    }
}

/// A `--lora` value naming a file on disk that is not yet installed gets
/// installed first.
async fn resolve_lora_arg(worker: &Worker, lora: LoraRequest) -> Result<LoraRequest> {
    let path = Path::new(&lora.filename);
    if worker.loras().get_by_filename(&lora.filename).await?.is_some() || !path.is_file() {
        return Ok(lora);
    }
    let installed = worker.loras().install_from_path(path, None, None).await?;
    info!("Installed {} as {}", path.display(), installed.filename);
    Ok(LoraRequest {
        filename: installed.filename,
        strength: lora.strength,
    })
}

async fn handle_generate(worker: &Worker, args: GenerateArgs) -> Result<()> {
    let mut loras = Vec::with_capacity(args.loras.len());
    for lora in args.loras {
        loras.push(resolve_lora_arg(worker, lora).await?);
    }
    let request = GenerationRequest {
        width: args.width,
        height: args.height,
        steps: args.steps,
        seed: args.seed,
        precision: args.precision,
        loras,
        record_history: !args.no_history,
        ..GenerationRequest::new(args.prompt)
    };
    let result = worker.generate(request).await?;

    let saved = match args.output {
        Some(target) => copy_output(&result, &target).await?,
        None => result.output_path.clone(),
    };
    println!(
        "Saved {} ({}x{}, {} steps, seed {}, {}) in {:.2}s",
        saved.display(),
        result.width,
        result.height,
        result.steps,
        result.seed,
        result.precision,
        result.generation_time
    );
    Ok(())
}

/// Copies the generated image to `target`, or into it when it is a directory.
async fn copy_output(result: &GenerationResult, target: &Path) -> Result<PathBuf> {
    let dest = if target.is_dir() {
        target.join(&result.filename)
    } else {
        target.to_path_buf()
    };
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::copy(&result.output_path, &dest)
        .await
        .with_context(|| format!("copying image to {}", dest.display()))?;
    Ok(dest)
}

async fn handle_serve(worker: Worker, args: ServeArgs) -> Result<()> {
    if let Some(dir) = &args.static_dir {
        if !dir.is_dir() {
            return Err(Error::invalid(format!("static dir {} does not exist", dir.display())).into());
        }
    }
    let state = AppState::new(worker.clone()).with_public_url(args.public_url);
    let app = router(state, args.static_dir.as_deref());

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, releasing model");
    worker.release().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn handle_loras_list(worker: &Worker) -> Result<()> {
    let loras = worker.loras().list().await?;
    if loras.is_empty() {
        println!("No LoRAs installed in {}", worker.loras().dir().display());
        return Ok(());
    }
    for lora in loras {
        let trigger = lora
            .trigger_word
            .as_deref()
            .map(|t| format!("  trigger: {t}"))
            .unwrap_or_default();
        println!(
            "{:>4}  {:<40} {}{}",
            lora.id,
            lora.filename,
            lora.display_name(),
            trigger
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&Error::invalid("empty prompt").into()), EXIT_USAGE);
        assert_eq!(
            exit_code(&Error::UnknownPrecision("q9".into()).into()),
            EXIT_USAGE
        );
        assert_eq!(
            exit_code(&Error::generation(anyhow::anyhow!("out of memory")).into()),
            EXIT_FAILURE
        );
        assert_eq!(exit_code(&anyhow::anyhow!("bind failed")), EXIT_FAILURE);
    }
}
