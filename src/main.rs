use std::{ env, sync::Arc };
use std::path::Path;

use anyhow::Result;
use tracing::{ error, info };
use tracing_subscriber::filter::LevelFilter;

use mailgate::gateway::{ Gateway, GatewaySettings };
use mailgate::net::listener;
use mailgate::storage::db::{ Database, DatabaseConfig };
use mailgate::storage::MySqlStore;
use mailgate::utils::config::{ Config, ConfigLoader };

#[tokio::main]
async fn main() -> Result<()> {
    let mut config_path = String::from("/etc/mailgate/config.ini");

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    config_path = path;
                }
            }
            _ => {}
        }
    }

    // Resolve config path: honor CLI arg, else fallback for dev
    let resolved_path = if Path::new(&config_path).exists() {
        config_path.clone()
    } else {
        let dev_path = "config/mailgate.conf";
        if Path::new(dev_path).exists() { dev_path.to_string() } else { config_path.clone() }
    };

    let config = match ConfigLoader::new(resolved_path).load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    let settings = match GatewaySettings::from_config(&config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let db = match Database::new(database_config(&config)).await {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to connect to account store: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = db.ping().await {
        error!("Account store not responding: {}", e);
        std::process::exit(1);
    }

    let store = Arc::new(MySqlStore::new(db));
    let gateway = Arc::new(Gateway::new(settings, store));

    info!("MailGate starting");

    let tasks = match listener::serve(gateway).await {
        Ok(tasks) => tasks,
        Err(e) => {
            error!("Failed to start listeners: {}", e);
            std::process::exit(1);
        }
    };

    // wait forever (or until one fails)
    for task in tasks {
        task.await?;
    }

    Ok(())
}

fn init_logging(config: &Config) {
    // Defaults: plain logs; if logging.json=true, enable JSON format
    let json_enabled = config.get_bool("logging", "json", false);
    let level = match config.get_value("logging", "level").unwrap_or("info").to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };
    if json_enabled {
        tracing_subscriber::fmt().with_max_level(level).json().init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }
}

fn database_config(config: &Config) -> DatabaseConfig {
    DatabaseConfig {
        host: config.get_value("database", "host").unwrap_or("localhost").to_string(),
        port: config.get_int("database", "port", 3306) as u16,
        user: config.get_value("database", "user").unwrap_or("root").to_string(),
        password: config.get_value("database", "password").unwrap_or("").to_string(),
        database: config.get_value("database", "database").unwrap_or("mailgate").to_string(),
        pool_size: config.get_value("database", "pool_size").and_then(|p| p.parse().ok()),
        pool_idle_timeout: config
            .get_value("database", "pool_idle_timeout")
            .and_then(|p| p.parse().ok()),
        pool_max_lifetime: config
            .get_value("database", "pool_max_lifetime")
            .and_then(|p| p.parse().ok()),
        connect_timeout: config
            .get_value("database", "connect_timeout")
            .and_then(|p| p.parse().ok()),
    }
}
