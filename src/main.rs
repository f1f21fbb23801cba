//! funclient - 远端函数执行服务命令行客户端
//!
//! 加载配置后构建 `FunctionsClient`，提供模板查询、任务提交与查询、上传等子命令。

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use funclient::application::client::{FunctionsClient, SubmitOptions};
use funclient::application::ports::{OfflineStorePort, ProgressCallback, UploadProgress};
use funclient::config::{load_config, load_config_from_path, print_config, AppConfig};
use funclient::domain::TemplateFilter;
use funclient::infrastructure::adapters::ReqwestTransport;
use funclient::infrastructure::cache::{open_cache_backend, ResponseCache};
use funclient::infrastructure::memory::MemoryOfflineStore;
use funclient::infrastructure::network::NetworkMonitor;
use funclient::infrastructure::persistence::{open_database, DatabaseConfig, SqliteOfflineStore};
use funclient::infrastructure::upload::UploadFile;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径（默认搜索 funclient.toml / funclient.local.toml）
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 列出模板
    Templates {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        search: Option<String>,
        /// 只列出需要 GPU 的模板
        #[arg(long)]
        gpu: Option<bool>,
    },
    /// 查看单个模板
    Template { id: String },
    /// 提交任务
    Submit {
        template_id: String,
        /// 输入参数，格式 key=value，value 按 JSON 解析，失败时视为字符串
        #[arg(long = "input", short = 'i', value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        #[arg(long)]
        quality: Option<String>,
        /// 轮询直到任务结束
        #[arg(long)]
        wait: bool,
    },
    /// 查询任务状态
    Status { task_id: String },
    /// 拉取任务结果
    Result { task_id: String },
    /// 取消任务
    Cancel { task_id: String },
    /// 上传文件
    Upload {
        files: Vec<PathBuf>,
        /// 使用分片续传（仅单个文件）
        #[arg(long)]
        resumable: bool,
        #[arg(long, value_name = "BYTES")]
        chunk_size: Option<usize>,
    },
    /// 回放离线队列
    Drain,
    /// 打印生效的配置
    Config,
}

fn parse_inputs(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid input '{}', expected KEY=VALUE", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

async fn build_client(config: &AppConfig) -> anyhow::Result<FunctionsClient> {
    let transport = Arc::new(ReqwestTransport::new(config.client.to_transport_config())?);

    let backend = open_cache_backend(
        config.cache.tier,
        config.cache.path.as_deref(),
        config.cache.max_size_bytes,
    )
    .await?;
    let cache = ResponseCache::new(backend, Duration::from_secs(config.cache.default_ttl_secs));

    let offline_store: Arc<dyn OfflineStorePort> = if config.offline.persistent {
        if let Some(parent) = config.offline.db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = open_database(&DatabaseConfig::new(&config.offline.db_path)).await?;
        Arc::new(SqliteOfflineStore::new(pool))
    } else {
        Arc::new(MemoryOfflineStore::new())
    };

    let network = NetworkMonitor::online().arc();
    if config.client.health_probe_secs > 0 {
        network.spawn_health_probe(
            transport.clone(),
            Duration::from_secs(config.client.health_probe_secs),
        );
    }

    let client = FunctionsClient::builder(transport)
        .network(network)
        .cache(cache)
        .offline_store(offline_store)
        .options(config.client_options())
        .build()
        .await?;
    Ok(client)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 加载配置（优先级：环境变量 > 配置文件 > 默认值）
    let config = match &args.config {
        Some(path) => load_config_from_path(Some(path)),
        None => load_config(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    let log_filter = format!("warn,funclient={}", config.log.level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Command::Config = args.command {
        print_config(&config);
        return Ok(());
    }

    let client = build_client(&config).await?;

    match args.command {
        Command::Templates {
            category,
            search,
            gpu,
        } => {
            let filter = TemplateFilter {
                category,
                search,
                gpu,
            };
            for template in client.list_templates(&filter).await? {
                println!(
                    "{:<24} {:<32} {}",
                    template.id,
                    template.name,
                    template.category.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Template { id } => print_json(&client.get_template(&id).await?)?,
        Command::Submit {
            template_id,
            inputs,
            quality,
            wait,
        } => {
            let handle = client
                .submit_task(
                    &template_id,
                    parse_inputs(&inputs)?,
                    SubmitOptions {
                        quality,
                        ..Default::default()
                    },
                )
                .await?;
            println!("{}", handle.task_id());

            if wait {
                // 命令行没有推送通道，退回轮询
                while !handle.is_settled() {
                    let status = handle.refresh_status().await?;
                    if status.state.is_terminal() {
                        continue;
                    }
                    eprintln!(
                        "{:<10} {:>5.1}% {}",
                        status.state.as_str(),
                        status.progress.unwrap_or(0.0),
                        status.stage.as_deref().unwrap_or("")
                    );
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                print_json(&handle.wait(None).await?)?;
            } else {
                handle.dispose();
            }
        }
        Command::Status { task_id } => print_json(&client.get_task_status(&task_id).await?)?,
        Command::Result { task_id } => print_json(&client.get_task_result(&task_id).await?)?,
        Command::Cancel { task_id } => {
            client.cancel_task(&task_id).await?;
            println!("cancelled {}", task_id);
        }
        Command::Upload {
            files,
            resumable,
            chunk_size,
        } => {
            let uploader = client.upload();
            if resumable {
                let path = files
                    .first()
                    .ok_or_else(|| anyhow::anyhow!("No file given"))?;
                let upload = uploader
                    .create_resumable(UploadFile::from_path(path).await?, chunk_size)
                    .await?;
                upload.on_chunk(|session| eprintln!("{:>5.1}%", session.percent()));
                print_json(&upload.start().await?)?;
            } else {
                let mut uploads = Vec::with_capacity(files.len());
                for path in &files {
                    uploads.push(UploadFile::from_path(path).await?);
                }
                let progress: ProgressCallback =
                    Arc::new(|p: UploadProgress| eprint!("\r{:>5.1}%", p.percent()));
                let uploaded = uploader
                    .upload_many(uploads, config.upload.mode, Some(progress))
                    .await?;
                eprintln!();
                print_json(&uploaded)?;
            }
        }
        Command::Drain => {
            let report = client.drain_offline().await;
            println!(
                "replayed {}, rejected {}, remaining {}",
                report.replayed, report.rejected, report.remaining
            );
        }
        Command::Config => {}
    }

    client.dispose().await;
    Ok(())
}
