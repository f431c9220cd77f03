use agent_pool::config::PoolConfig;
use agent_pool::context::AppContext;
use agent_pool::session::{RunOptions, SessionEvent};
use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Permission mode for REPL sessions; the engine runs fully trusted.
const REPL_PERMISSION_MODE: &str = "bypassPermissions";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = PoolConfig::from_env().context("invalid pool configuration")?;
    let working_directory = std::env::current_dir().context("no working directory")?;

    eprintln!("🤖 Agent Pool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Engine: {}", config.engine.kind.as_str());
    eprintln!("   Workers: {}", config.pool_size);
    eprintln!("   Worker binary: {}", config.worker_program.display());
    eprintln!("   Directory: {}", working_directory.display());
    eprintln!("   First line starts a session (/skill args... runs a skill).");
    eprintln!("   Later lines continue it. /cancel, /status, /quit.\n");

    let ctx = AppContext::init(config)
        .await
        .context("failed to start the worker pool")?;
    let orchestrator = ctx.orchestrator.clone();

    // Print everything the orchestrator publishes
    let mut events = orchestrator.subscribe_all();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Message { item, .. } => {
                    if let Some(text) = render_item(&item) {
                        println!("{text}");
                    }
                }
                SessionEvent::Complete { status, error, .. } => {
                    match error {
                        Some(error) => eprintln!("[{status}] {error}"),
                        None => eprintln!("[{status}]"),
                    }
                    eprint!("> ");
                }
            }
        }
    });

    let options = RunOptions::new(working_directory).with_permission_mode(REPL_PERMISSION_MODE);
    let mut session_id: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprint!("> ");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            eprint!("> ");
            continue;
        }

        match line {
            "/quit" | "/exit" => break,
            "/cancel" => {
                if let Some(ref id) = session_id {
                    orchestrator.cancel(id).await?;
                }
                continue;
            }
            "/status" => {
                let status = ctx.pool.status().await?;
                eprintln!("{}", serde_json::to_string_pretty(&status)?);
                if let Some(ref id) = session_id
                    && let Some(session) = orchestrator.get_session(id).await
                {
                    eprintln!(
                        "session {} turns={} status={:?} resume_token={:?}",
                        session.session_id, session.turns, session.status, session.resume_token
                    );
                }
                eprint!("> ");
                continue;
            }
            _ => {}
        }

        let result = if let Some(ref id) = session_id {
            orchestrator.continue_session(id, line).await.map(|_| ())
        } else {
            let started = match line.strip_prefix('/') {
                Some(invocation) => {
                    let mut parts = invocation.split_whitespace();
                    let skill = parts.next().unwrap_or_default();
                    let args: Vec<String> = parts.map(String::from).collect();
                    orchestrator.run(skill, None, &args, options.clone()).await
                }
                None => orchestrator.run_with_prompt(line, options.clone()).await,
            };
            started.map(|id| {
                eprintln!("   Session: {id}");
                session_id = Some(id);
            })
        };

        if let Err(e) = result {
            eprintln!("Error: {e}");
            eprint!("> ");
        }
    }

    let report = ctx.shutdown().await?;
    eprintln!(
        "\nStopped: {} acknowledged, {} killed",
        report.acknowledged, report.killed
    );
    Ok(())
}

/// Human-readable text of an engine item, if it has any.
fn render_item(item: &serde_json::Value) -> Option<String> {
    match item.get("type")?.as_str()? {
        "assistant" => {
            let text: Vec<&str> = item
                .pointer("/message/content")?
                .as_array()?
                .iter()
                .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|block| block.get("text")?.as_str())
                .collect();
            (!text.is_empty()).then(|| text.join("\n"))
        }
        _ => None,
    }
}
