use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use conductor_core::app::TaskService;
use conductor_core::observability::init_tracing;
use conductor_core::{AppBuilder, ConductorConfig, RegisterTask, TaskState};

#[derive(Debug, Parser)]
#[command(name = "conductor", about = "Durable task orchestration engine")]
struct Cli {
    /// TOML 設定ファイル。省略時はデフォルト値
    #[arg(long, short, env = "CONDUCTOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ctrl-C まで scan / dispatch / expire ループを動かす
    Serve,
    /// いくつかタスクを登録し、プロセス内 worker で処理する
    Demo {
        #[arg(long, default_value_t = 3)]
        tasks: u32,
        /// 成功し始める前に worker が報告する失敗の回数
        #[arg(long, default_value_t = 2)]
        failures: u32,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ConductorConfig> {
    match path {
        Some(path) => ConductorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(ConductorConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(config.log_format);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Demo { tasks, failures } => demo(config, tasks, failures).await,
    }
}

async fn serve(config: ConductorConfig) -> anyhow::Result<()> {
    let app = AppBuilder::new(config).build().await?;
    app.start().await.context("starting conductor")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutdown requested");
    app.shutdown().await;
    Ok(())
}

/// worker: poll → accept → 「実行」 → complete
async fn worker_loop(service: Arc<TaskService>, worker_id: String, failures: Arc<AtomicU32>) {
    loop {
        let task = match service
            .long_poll(&worker_id, "hello", Duration::from_secs(2))
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "long poll failed");
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
        };
        let id = task.id.to_string();
        if let Err(e) = service.accept_task(&id).await {
            warn!(task_id = %id, error = %e, "accept failed");
            continue;
        }

        let name = String::from_utf8_lossy(&task.input_args).into_owned();
        let left = failures.load(Ordering::Relaxed);
        let result = if left > 0 {
            failures.fetch_sub(1, Ordering::Relaxed);
            service
                .complete_task(&id, false, Vec::new(), &format!("intentional failure (left={left})"))
                .await
        } else {
            println!("Hello, {name}!");
            service
                .complete_task(&id, true, format!("greeted {name}").into_bytes(), "")
                .await
        };
        match result {
            Ok(task) => println!("task {} -> {}", task.id, task.state),
            Err(e) => warn!(task_id = %id, error = %e, "complete failed"),
        }
    }
}

async fn demo(config: ConductorConfig, count: u32, failures: u32) -> anyhow::Result<()> {
    let config = ConductorConfig {
        scan_interval_ms: 50,
        expire_interval_ms: 200,
        ..config
    };
    let app = AppBuilder::new(config).build().await?;
    app.start().await?;
    app.namespaces.create("demo").await?;

    let worker = tokio::spawn(worker_loop(
        app.tasks.clone(),
        "demo-worker".to_string(),
        Arc::new(AtomicU32::new(failures)),
    ));

    let mut ids = Vec::new();
    for n in 0..count {
        let req = RegisterTask {
            input_args: format!("task-{n}").into_bytes(),
            max_retry_cnt: 3,
            ..RegisterTask::new("demo", "hello")
        };
        ids.push(app.tasks.register_task(req).await?);
    }

    // 全タスクが終端状態になるまで待つ
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let mut pending = 0;
        for id in &ids {
            let task = app.tasks.get_task(&id.to_string()).await?;
            if !task.state.is_terminal() {
                pending += 1;
            }
        }
        if pending == 0 || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for id in &ids {
        let history = app.tasks.task_history(&id.to_string()).await?;
        let trail: Vec<String> = history.iter().map(|h| h.state.to_string()).collect();
        let last = history.last().map_or(TaskState::Inited, |h| h.state);
        println!("{id}: {last} [{}]", trail.join(" -> "));
    }
    println!("{}", serde_json::to_string_pretty(&app.status())?);

    worker.abort();
    app.shutdown().await;
    Ok(())
}
