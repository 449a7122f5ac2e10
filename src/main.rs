use clap::{Parser, Subcommand};
use krishi_sakhi::ext::WeatherProvider;
use krishi_sakhi::web::AppState;
use krishi_sakhi::ws::ConnectionHub;
use krishi_sakhi::{admin_graphql, jobs, jwks, llm, notify, rules, seed, settings, storage};
use miette::{IntoDiagnostic, Result};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "krishi-sakhi",
    version,
    about = "Farming assistant backend for Kerala smallholders"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the API server and background jobs (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
    /// Load demo users, farmers, farms and fields from a JSON file
    SeedDemo {
        #[arg(long)]
        file: String,
    },
    /// Write the data export of one user as JSON
    ExportUser {
        #[arg(long)]
        phone: String,
        /// Output file; stdout when omitted
        #[arg(long)]
        out: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;
    storage::migrate(&db).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings, db).await,
        Command::Migrate => {
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::SeedDemo { file } => {
            seed::seed_from_file(&db, &file).await?;
            Ok(())
        }
        Command::ExportUser { phone, out } => export_user(&db, &phone, out.as_deref()).await,
    }
}

async fn serve(settings: settings::Settings, db: sea_orm::DatabaseConnection) -> Result<()> {
    // init jwks (generate if missing)
    let jwks_mgr = jwks::JwksManager::new(settings.keys.clone()).await?;

    let llm = llm::build(&settings.llm).into_diagnostic()?;
    let notifier = notify::build(&settings.notify).into_diagnostic()?;
    tracing::info!(llm = llm.name(), notify = %settings.notify.provider, "Providers ready");

    let state = AppState {
        hub: Arc::new(ConnectionHub::new(settings.ws.heartbeat_secs)),
        settings: Arc::new(settings),
        db: db.clone(),
        jwks: jwks_mgr,
        llm: Arc::new(llm),
        notify: Arc::new(notifier),
        rules: Arc::new(rules::builtin_rules()),
        weather: WeatherProvider::default(),
    };

    // background jobs; the scheduler must outlive the server
    let job_ctx = state.job_context();
    let _scheduler = jobs::init_scheduler(job_ctx.clone()).await?;

    let seaography_schema = admin_graphql::build_seaography_schema(db)?;
    let jobs_schema = admin_graphql::build_jobs_schema(job_ctx);

    krishi_sakhi::web::serve(state, seaography_schema, jobs_schema).await
}

async fn export_user(
    db: &sea_orm::DatabaseConnection,
    phone: &str,
    out: Option<&str>,
) -> Result<()> {
    let phone = krishi_sakhi::auth::normalize_phone(phone)?;
    let user = storage::get_user_by_phone(db, &phone)
        .await?
        .ok_or_else(|| miette::miette!("No user with phone {}", phone))?;
    let export = storage::export_user_data(db, &user.id).await?;
    let json = serde_json::to_string_pretty(&export).into_diagnostic()?;

    match out {
        Some(path) => {
            std::fs::write(path, json).into_diagnostic()?;
            tracing::info!(user_id = %user.id, path, "Export written");
        }
        None => println!("{json}"),
    }
    Ok(())
}
