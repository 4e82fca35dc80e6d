use clap::Parser;
use miette::{miette, IntoDiagnostic, Result};
use portunus::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "portunus-server",
    version,
    about = "Self-contained user/group directory service"
)]
struct Cli {
    /// Path to an optional configuration file; PORTUNUS_* environment
    /// variables always take precedence
    #[arg(short, long, default_value = "portunus.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // load settings before logging: the default verbosity depends on them
    let settings = Arc::new(settings::Settings::load(&cli.config)?);

    let default_level = if settings.debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(env_filter).init();
    tracing::info!(
        state_dir = %settings.server_state_dir.display(),
        ldap_suffix = %settings.ldap_suffix,
        http_listen = %settings.server_http_listen,
        "loaded configuration"
    );

    // the seed is consulted on every update, so it has to load first
    let seed = match &settings.seed_path {
        Some(path) => Some(seed::DatabaseSeed::load(path).into_diagnostic()?),
        None => None,
    };

    let nexus = Arc::new(nexus::Nexus::new(seed.clone()));

    // read the database file (or create it from the seed) and push it
    // into the nexus as the first update
    std::fs::create_dir_all(&settings.server_state_dir).into_diagnostic()?;
    let store = Arc::new(store::FileStore::new(settings.database_path()));
    let initial = store
        .initialize(|| seed::initial_database(seed.as_ref()))
        .into_diagnostic()?;
    nexus
        .update(
            move |db| {
                *db = initial;
                Ok(())
            },
            nexus::UpdateOptions::default(),
        )
        .map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            miette!("database file is not acceptable: {}", messages.join("; "))
        })?;

    // background subscribers hold a process-lifetime cancellation token;
    // both callbacks only enqueue, the real work runs on their own tasks
    let cancel = CancellationToken::new();

    let (save_tx, save_rx) = mpsc::unbounded_channel();
    nexus.add_listener(cancel.clone(), move |db| {
        let _ = save_tx.send(db.clone());
    });
    let (ldap_tx, ldap_rx) = mpsc::unbounded_channel();
    nexus.add_listener(cancel.clone(), move |db| {
        let _ = ldap_tx.send(db.clone());
    });

    {
        let store_task = store.clone().run(nexus.clone(), save_rx, cancel.clone());
        tokio::spawn(async move {
            if let Err(err) = store_task.await {
                tracing::error!(%err, "file store failed");
                std::process::exit(1);
            }
        });
    }

    // the service-user password is shared in memory between slapd's
    // rootpw and the projector's bind
    let ldap_password = settings
        .ldap_password
        .clone()
        .unwrap_or_else(crypt::generate_password);
    let root_password_hash =
        format!("{{CRYPT}}{}", crypt::hash_password(&ldap_password).into_diagnostic()?);

    ldap::slapd::prepare_state_dir(&settings, &root_password_hash).into_diagnostic()?;
    {
        let settings = settings.clone();
        tokio::spawn(async move {
            let err = ldap::slapd::run(&settings).await;
            tracing::error!(%err, "slapd terminated");
            std::process::exit(1);
        });
    }

    let projector =
        ldap::LdapProjector::new(&settings.ldap_suffix, settings.ldap_url(), ldap_password);
    tokio::spawn(projector.run(ldap_rx, cancel.clone()));

    let engine = engine::Engine::new(nexus.clone());
    web::serve(settings.clone(), engine).await?;
    Err(miette!("HTTP frontend terminated unexpectedly"))
}
