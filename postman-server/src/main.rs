use std::sync::Arc;

use clap::Parser;
use postman_core::{PostmanConfig, QueueStore};
use tracing_subscriber::{fmt, EnvFilter};

use postman_server::event_loop;
use postman_server::subsystems::gateway::HttpMailGateway;
use postman_server::subsystems::mail::Mailer;
use postman_server::subsystems::orchestrator::{Orchestrator, OrchestratorConfig};
use postman_server::subsystems::terminal::TmuxRunner;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "postman.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (the mail password usually lives there)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match PostmanConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over service.log_level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.as_str()));
    fmt().with_env_filter(filter).init();

    let pool = match postman_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = postman_core::db::migrate(&pool).await {
        eprintln!("Failed to migrate database: {}", e);
        std::process::exit(1);
    }

    if args.health {
        match postman_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ SQLite connected: {}", v),
            Err(e) => {
                println!("❌ SQLite connection failed: {}", e);
                std::process::exit(1);
            }
        }
        match postman_core::db::schema_version(&pool).await {
            Ok(Some(v)) => println!("✅ Schema version: {}", v),
            Ok(None) => {
                println!("❌ Schema version missing");
                std::process::exit(1);
            }
            Err(e) => {
                println!("❌ Schema check failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Postman DB health check passed");
        return Ok(());
    }

    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let store = QueueStore::new(pool);
    let runner = Arc::new(TmuxRunner::new(&config.terminal));
    let orchestrator = Orchestrator::new(store.clone(), runner, OrchestratorConfig::from(&config));
    let gateway = Arc::new(HttpMailGateway::new(&config.mail)?);
    let mailer = Mailer::new(store, gateway, config.mail.clone());

    event_loop::run(config, orchestrator, mailer).await
}
