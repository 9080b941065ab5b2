//! inferadmind — the InferAdmin control plane CLI.
//!
//! Every subcommand runs inside a full [`Lifecycle`]: the process starts the
//! dispatcher and services, performs the command, then shuts down in order.
//!
//! # Usage
//!
//! ```text
//! inferadmind images pull vllm/vllm-openai:v0.8.0
//! inferadmind models list
//! inferadmind llms deploy --model meta-llama/Llama-3.1-8B-Instruct \
//!     --image vllm/vllm-openai:v0.8.0 --port 8001 --gpu 0
//! inferadmind apps list
//! inferadmind watch --interval 30
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use inferadmin_deploy::{DeployApplication, DeployLlm};
use inferadmin_state::{AppType, LlmEngine};
use serde::Serialize;
use tracing::info;

use inferadmind::{InferAdminConfig, Lifecycle};

#[derive(Parser)]
#[command(name = "inferadmind", about = "InferAdmin control plane")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the state documents.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage application deployments.
    #[command(subcommand)]
    Apps(AppsCommand),

    /// Manage LLM deployments.
    #[command(subcommand)]
    Llms(LlmsCommand),

    /// Manage pulled images.
    #[command(subcommand)]
    Images(ImagesCommand),

    /// Manage models in the local model storage.
    #[command(subcommand)]
    Models(ModelsCommand),

    /// Reconcile periodically until interrupted.
    Watch {
        /// Seconds between reconciliation passes.
        #[arg(long, default_value = "30")]
        interval: u64,
    },
}

#[derive(Subcommand)]
enum AppsCommand {
    List,
    Get {
        id: String,
    },
    Deploy {
        #[arg(long)]
        name: String,
        /// Managed image id or reference.
        #[arg(long)]
        image: String,
        #[arg(long)]
        port: u16,
        /// Extra environment, `KEY=VALUE`. Repeatable.
        #[arg(long = "env", value_parser = parse_key_value)]
        env: Vec<(String, String)>,
        /// GPU UUID to expose. Repeatable.
        #[arg(long = "gpu")]
        gpus: Vec<String>,
    },
    Delete {
        id: String,
    },
    Start {
        id: String,
    },
    Stop {
        id: String,
    },
    Logs {
        id: String,
        #[arg(long)]
        tail: Option<usize>,
    },
}

#[derive(Subcommand)]
enum LlmsCommand {
    List,
    Get {
        id: String,
    },
    Deploy {
        /// Model name; its files must be under the model storage path.
        #[arg(long)]
        model: String,
        #[arg(long)]
        image: String,
        #[arg(long)]
        port: u16,
        /// GPU index. Repeatable; none means every GPU.
        #[arg(long = "gpu")]
        gpus: Vec<u32>,
        #[arg(long, default_value = "1")]
        tensor_parallel_size: u32,
        #[arg(long, default_value = "4096")]
        max_model_len: u32,
    },
    Delete {
        id: String,
    },
    Logs {
        id: String,
        #[arg(long)]
        tail: Option<usize>,
    },
}

#[derive(Subcommand)]
enum ImagesCommand {
    List,
    Pull { reference: String },
    Remove { id: String },
}

#[derive(Subcommand)]
enum ModelsCommand {
    List,
    /// Delete a model's files, e.g. `meta-llama/Llama-3.1-8B-Instruct`.
    Delete { repo_id: String },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env = std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)));
    let mut config =
        InferAdminConfig::load(cli.config.as_deref(), env).context("loading configuration")?;
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }

    let lifecycle = Lifecycle::start(config).await?;
    let result = run(&lifecycle, cli.command).await;
    lifecycle.shutdown().await;
    result
}

async fn run(lifecycle: &Lifecycle, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Apps(command) => run_apps(lifecycle, command).await,
        Command::Llms(command) => run_llms(lifecycle, command).await,
        Command::Images(command) => run_images(lifecycle, command).await,
        Command::Models(command) => run_models(lifecycle, command).await,
        Command::Watch { interval } => {
            info!(interval, "watching deployments");
            lifecycle
                .watch(Duration::from_secs(interval.max(1)), async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "failed to listen for ctrl-c");
                    }
                })
                .await;
            Ok(())
        }
    }
}

async fn run_apps(lifecycle: &Lifecycle, command: AppsCommand) -> anyhow::Result<()> {
    let apps = lifecycle.applications();
    match command {
        AppsCommand::List => print_json(&apps.list().await?),
        AppsCommand::Get { id } => print_json(&apps.get(&id).await?),
        AppsCommand::Deploy {
            name,
            image,
            port,
            env,
            gpus,
        } => {
            let request = DeployApplication {
                name,
                app_type: AppType::OpenWebUi,
                image,
                host_port: port,
                environment: env.into_iter().collect::<BTreeMap<_, _>>(),
                gpu_uuids: (!gpus.is_empty()).then_some(gpus),
            };
            print_json(&apps.deploy(request).await?)
        }
        AppsCommand::Delete { id } => {
            apps.delete(&id).await?;
            print_json(&serde_json::json!({ "deleted": id }))
        }
        AppsCommand::Start { id } => {
            apps.start(&id).await?;
            print_json(&serde_json::json!({ "started": id }))
        }
        AppsCommand::Stop { id } => {
            apps.stop(&id).await?;
            print_json(&serde_json::json!({ "stopped": id }))
        }
        AppsCommand::Logs { id, tail } => {
            print!("{}", apps.logs(&id, tail).await?);
            Ok(())
        }
    }
}

async fn run_llms(lifecycle: &Lifecycle, command: LlmsCommand) -> anyhow::Result<()> {
    let llms = lifecycle.llms();
    match command {
        LlmsCommand::List => print_json(&llms.list().await?),
        LlmsCommand::Get { id } => print_json(&llms.get(&id).await?),
        LlmsCommand::Deploy {
            model,
            image,
            port,
            gpus,
            tensor_parallel_size,
            max_model_len,
        } => {
            let request = DeployLlm {
                model_name: model,
                engine: LlmEngine::Vllm,
                image,
                host_port: port,
                gpu_ids: gpus,
                tensor_parallel_size,
                max_model_len,
            };
            print_json(&llms.deploy(request).await?)
        }
        LlmsCommand::Delete { id } => {
            llms.delete(&id).await?;
            print_json(&serde_json::json!({ "deleted": id }))
        }
        LlmsCommand::Logs { id, tail } => {
            print!("{}", llms.logs(&id, tail).await?);
            Ok(())
        }
    }
}

async fn run_images(lifecycle: &Lifecycle, command: ImagesCommand) -> anyhow::Result<()> {
    let images = lifecycle.images();
    match command {
        ImagesCommand::List => print_json(&images.list().await?),
        ImagesCommand::Pull { reference } => print_json(&images.pull(&reference).await?),
        ImagesCommand::Remove { id } => print_json(&images.remove(&id).await?),
    }
}

async fn run_models(lifecycle: &Lifecycle, command: ModelsCommand) -> anyhow::Result<()> {
    let models = lifecycle.models();
    match command {
        ModelsCommand::List => print_json(&models.list().await?),
        ModelsCommand::Delete { repo_id } => {
            models.delete(&repo_id).await?;
            print_json(&serde_json::json!({ "deleted": repo_id }))
        }
    }
}
