use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;

use colloquy_core::agents::Agent;
use colloquy_core::customers::Customer;
use colloquy_engine::engine::{EngineComponents, Processor, StoreBundle};
use colloquy_engine::hooks::EngineHooks;
use colloquy_engine::policy::PreambleTiming;
use colloquy_engine::tasks::BackgroundTaskService;
use colloquy_engine::tool_caller::ToolRegistry;
use colloquy_llm::openai::{OpenAiCompatConfig, OpenAiCompatGenerator};
use colloquy_llm::SchematicGenerator;
use colloquy_store::{MemoryStores, SessionStore, SqliteSessionStore};
use colloquy_server::{start, AppState, ServerConfig};

#[derive(Parser)]
#[command(name = "colloquy", about = "Conversational agent runtime server")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8800)]
    port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to the SQLite session database. Omit for in-memory sessions.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Base URL of an OpenAI-compatible chat endpoint.
    #[arg(long, default_value = "https://api.openai.com")]
    llm_base_url: String,

    /// Model name for the LLM adapter.
    #[arg(long, default_value = "gpt-4o-mini")]
    llm_model: String,

    /// Display name of the default agent.
    #[arg(long, default_value = "Assistant")]
    agent_name: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _telemetry = colloquy_telemetry::init_telemetry(colloquy_telemetry::TelemetryConfig {
        default_level: args.log_level.clone(),
        compact: false,
    });

    let api_key = SecretString::from(std::env::var("LLM_API_KEY").unwrap_or_default());
    let generator: Arc<dyn SchematicGenerator> =
        Arc::new(OpenAiCompatGenerator::new(OpenAiCompatConfig {
            base_url: args.llm_base_url.clone(),
            api_key,
            model: args.llm_model.clone(),
            request_timeout: Duration::from_secs(60),
        }));

    // Configuration stores (agents, guidelines, journeys, templates) are
    // in-memory; the session event log optionally lives in SQLite.
    let stores = MemoryStores::new();
    let agent = Agent::new(args.agent_name.clone(), "a helpful conversational agent");
    let guest = Customer::guest();
    let guest_customer_id = guest.id.clone();
    stores.add_agent(agent.clone());
    stores.add_customer(guest);

    let sessions: Arc<dyn SessionStore> = match &args.db_path {
        Some(path) => {
            let db = colloquy_store::sqlite::Database::open(path).expect("open session database");
            tracing::info!(path = %path.display(), "session store backed by SQLite");
            Arc::new(SqliteSessionStore::new(db))
        }
        None => stores.clone(),
    };

    let mut bundle = StoreBundle::from_memory(stores.clone());
    bundle.sessions = sessions.clone();

    let components = EngineComponents::standard(
        bundle,
        generator,
        Arc::new(ToolRegistry::new()),
        EngineHooks::default(),
        PreambleTiming::default(),
    );

    let state = AppState {
        sessions,
        agents: stores.clone(),
        customers: stores.clone(),
        inspections: stores.clone(),
        processor: Arc::new(Processor::new(components)),
        tasks: BackgroundTaskService::new(),
        guest_customer_id,
    };

    tracing::info!(
        port = args.port,
        agent_id = %agent.id,
        model = %args.llm_model,
        "starting colloquy"
    );

    let handle = start(ServerConfig { port: args.port }, state)
        .await
        .expect("bind server");

    tokio::signal::ctrl_c().await.expect("install signal handler");
    tracing::info!("shutting down");
    handle.shutdown().await;
}
