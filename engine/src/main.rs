use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tasklane_core::{
    deep_merge, AppConfig, CacheStore, ClientSession, ConfigStore, HttpTaskApi, MutationClient,
    SessionConfig,
};
use tasklane_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use tasklane_server::{serve, AppState, ObjectStoreProbe, StaticTokenVerifier};
use tasklane_store::{Database, IsolationLevel, Provisioner};
use tasklane_types::{Task, TaskImage};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tasklane-engine")]
#[command(about = "Shared task list server and client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct ClientArgs {
    #[arg(long, env = "TASKLANE_SERVER_URL")]
    server_url: Option<String>,
    #[arg(long, env = "TASKLANE_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[arg(long)]
    state_dir: Option<String>,
    #[arg(long)]
    config: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = tasklane_core::DEFAULT_SERVER_PORT)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        db_path: Option<String>,
        #[arg(long)]
        isolation: Option<String>,
        #[arg(long)]
        object_store_url: Option<String>,
    },
    /// Print the task list.
    List {
        #[command(flatten)]
        client: ClientArgs,
    },
    Add {
        label: String,
        #[arg(long)]
        image_url: Option<String>,
        #[command(flatten)]
        client: ClientArgs,
    },
    Done {
        id: String,
        #[command(flatten)]
        client: ClientArgs,
    },
    Undone {
        id: String,
        #[command(flatten)]
        client: ClientArgs,
    },
    Rm {
        id: String,
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Follow the list live until interrupted.
    Watch {
        #[command(flatten)]
        client: ClientArgs,
    },
    Whoami {
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Remember the server and token for later commands.
    Login {
        server_url: String,
        #[arg(long, env = "TASKLANE_TOKEN", hide_env_values = true)]
        token: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            config,
            db_path,
            isolation,
            object_store_url,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(ProcessKind::Server, &logs_dir, 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("server jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!("server logging initialized: {:?}", log_info);

            let overrides = build_server_overrides(db_path, isolation, object_store_url);
            let config = load_config(&state_dir, config, overrides).await?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let state = build_server_state(&state_dir, &config)?;
            log_startup_paths(&state_dir, &addr, &config);
            serve(addr, state).await?;
        }
        Command::List { client } => {
            init_cli_logging();
            let (client, _) = build_client(client).await?;
            let tasks = client.refresh().await?;
            print_tasks(&tasks);
        }
        Command::Add {
            label,
            image_url,
            client,
        } => {
            init_cli_logging();
            let (client, _) = build_client(client).await?;
            let image = image_url.map(|url| TaskImage {
                url,
                metadata: Value::Null,
            });
            let task = client.create(label, image).await?;
            println!("{}", task.id);
        }
        Command::Done { id, client } => {
            init_cli_logging();
            set_done(client, &id, true).await?;
        }
        Command::Undone { id, client } => {
            init_cli_logging();
            set_done(client, &id, false).await?;
        }
        Command::Rm { id, client } => {
            init_cli_logging();
            let (client, _) = build_client(client).await?;
            let task = client.delete(&id).await?;
            println!("removed {}", task.id);
        }
        Command::Watch { client } => {
            let state_dir = resolve_state_dir(client.state_dir.clone());
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, _) = init_process_logging(ProcessKind::Client, &logs_dir, 14)?;
            let (client, api) = build_client(client).await?;
            watch(client, api).await?;
        }
        Command::Whoami { client } => {
            init_cli_logging();
            let (_, api) = build_client(client).await?;
            let me = api.me().await?;
            println!("{}", serde_json::to_string_pretty(&me)?);
        }
        Command::Login {
            server_url,
            token,
            state_dir,
            config,
        } => {
            init_cli_logging();
            let state_dir = resolve_state_dir(state_dir);
            let path = config_file_path(&state_dir, config);
            let store = ConfigStore::new(&path, None)
                .await
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            store.patch_project(login_patch(&server_url, token)).await?;
            println!("saved {}", path.display());
        }
    }

    Ok(())
}

fn init_cli_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("TASKLANE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|dir| dir.join("tasklane"))
        .unwrap_or_else(|| PathBuf::from(".tasklane"))
}

async fn load_config(
    state_dir: &Path,
    config_path: Option<String>,
    overrides: Option<Value>,
) -> anyhow::Result<AppConfig> {
    let path = config_file_path(state_dir, config_path);
    let store = ConfigStore::new(&path, overrides)
        .await
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    Ok(store.get().await)
}

fn config_file_path(state_dir: &Path, config_path: Option<String>) -> PathBuf {
    config_path
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("config.json"))
}

fn login_patch(server_url: &str, token: Option<String>) -> Value {
    json!({"client": {"server_url": server_url.trim_end_matches('/'), "token": token}})
}

fn build_server_overrides(
    db_path: Option<String>,
    isolation: Option<String>,
    object_store_url: Option<String>,
) -> Option<Value> {
    if db_path.is_none() && isolation.is_none() && object_store_url.is_none() {
        return None;
    }
    let mut root = json!({});
    if let Some(path) = db_path {
        deep_merge(&mut root, &json!({"server": {"db_path": path}}));
    }
    if let Some(level) = isolation {
        deep_merge(&mut root, &json!({"server": {"isolation": level}}));
    }
    if let Some(url) = object_store_url {
        deep_merge(&mut root, &json!({"server": {"object_store_url": url}}));
    }
    Some(root)
}

fn build_client_overrides(server_url: Option<String>, token: Option<String>) -> Option<Value> {
    if server_url.is_none() && token.is_none() {
        return None;
    }
    let mut root = json!({});
    if let Some(url) = server_url {
        deep_merge(&mut root, &json!({"client": {"server_url": url}}));
    }
    if let Some(token) = token {
        deep_merge(&mut root, &json!({"client": {"token": token}}));
    }
    Some(root)
}

fn build_server_state(state_dir: &Path, config: &AppConfig) -> anyhow::Result<AppState> {
    let db_path = config
        .server
        .db_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("tasklane.db"));
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    let isolation: IsolationLevel = config
        .server
        .isolation
        .parse()
        .context("invalid server.isolation")?;
    info!(db = %db.path().display(), %isolation, "database opened");
    let provisioner = Provisioner::new(db.clone(), isolation)?;
    let verifier = Arc::new(StaticTokenVerifier::new(config.server.tokens.clone()));
    if verifier.is_empty() {
        tracing::warn!("no tokens configured; every authenticated request will be rejected");
    } else {
        info!(tokens = verifier.len(), "token verifier ready");
    }
    Ok(AppState::new(db, provisioner, verifier)
        .with_event_buffer(config.server.event_buffer)
        .with_object_store_probe(Arc::new(ObjectStoreProbe::new(
            config.server.object_store_url.clone(),
        ))))
}

async fn build_client(args: ClientArgs) -> anyhow::Result<(MutationClient, HttpTaskApi)> {
    let state_dir = resolve_state_dir(args.state_dir);
    let overrides = build_client_overrides(args.server_url, args.token);
    let config = load_config(&state_dir, args.config, overrides).await?;
    let api = HttpTaskApi::new(config.client.server_url, config.client.token);
    let client = MutationClient::new(Arc::new(api.clone()), CacheStore::new());
    Ok((client, api))
}

async fn set_done(args: ClientArgs, id: &str, done: bool) -> anyhow::Result<()> {
    let (client, _) = build_client(args).await?;
    let task = client.set_done(id, done).await?;
    print_tasks(std::slice::from_ref(&task));
    Ok(())
}

async fn watch(client: MutationClient, api: HttpTaskApi) -> anyhow::Result<()> {
    let mut changes = client.cache().subscribe();
    let cache = client.cache().clone();
    let printer = tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            if let Some(tasks) = cache.read() {
                println!("--- {} task(s)", tasks.len());
                print_tasks(&tasks);
            }
        }
    });

    let token = api.token().map(str::to_string);
    let session = ClientSession::new(client, SessionConfig::new(api.push_url(), token));
    info!(session_id = session.id(), "watching {}", api.base_url());
    let result = session
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    printer.abort();
    result.context("push channel protocol violation")
}

fn print_tasks(tasks: &[Task]) {
    for task in tasks {
        let mark = if task.done { "x" } else { " " };
        match &task.image {
            Some(image) => println!("[{mark}] {}  ({})  {}", task.label, task.id, image.url),
            None => println!("[{mark}] {}  ({})", task.label, task.id),
        }
    }
}

fn log_startup_paths(state_dir: &Path, addr: &SocketAddr, config: &AppConfig) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting tasklane-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={} isolation={} tokens={}",
        exe.display(),
        cwd.display(),
        state_dir.display(),
        config.server.isolation,
        config.server.tokens.len()
    );
}
