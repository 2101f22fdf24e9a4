use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use stock_bridge::{BroadcastHub, ChannelListener, PgNotificationSource, StreamSessions};
use stock_settings::StockSettings;
use stock_store::{schema, PgProductStore};
use stock_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Streams inventory quantity changes from PostgreSQL to browser clients.
#[derive(Debug, Parser)]
#[command(name = "stockstream", version)]
struct Cli {
    /// Settings file. Defaults to $STOCKSTREAM_CONFIG, then ./stockstream.json.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the table and trigger DDL for the configured channel and exit.
    #[arg(long, conflicts_with = "install_schema")]
    print_schema: bool,

    /// Create the table and trigger for the configured channel before serving.
    #[arg(long)]
    install_schema: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => stock_settings::load_settings_from_path(path),
        None => stock_settings::load_settings(),
    }
    .context("loading settings")?;
    loaded.settings.validate().context("invalid settings")?;

    if cli.print_schema {
        println!(
            "{}",
            schema::install_script(&loaded.settings.listener.channel_to_listen)
        );
        return Ok(());
    }

    let telemetry = init_telemetry(telemetry_config(&loaded.settings));
    loaded.log_report();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        filter = telemetry.directives(),
        "starting stockstream"
    );
    run(loaded.settings, cli.install_schema).await
}

/// Levels were checked by `validate()`, so parsing cannot fail here.
fn telemetry_config(settings: &StockSettings) -> TelemetryConfig {
    let module_levels = settings
        .logging
        .module_levels
        .iter()
        .filter_map(|(module, level)| parse_level(level).map(|level| (module.clone(), level)))
        .collect();
    TelemetryConfig {
        log_level: parse_level(&settings.logging.level).unwrap_or(tracing::Level::INFO),
        module_levels,
        json: settings.logging.json,
    }
}

async fn run(settings: StockSettings, install_schema: bool) -> anyhow::Result<()> {
    let store = PgProductStore::connect(&settings.database.url, settings.database.max_pool_size)
        .context("creating connection pool")?;
    if install_schema {
        store
            .install_schema(&settings.listener.channel_to_listen)
            .await
            .context("installing product schema")?;
    }

    let hub = BroadcastHub::new(settings.stream.subscriber_capacity);
    let sessions = StreamSessions::new(
        hub.clone(),
        settings.stream.heartbeat_interval(),
        settings.stream.frame_buffer,
    );

    let source = PgNotificationSource::connect(&settings.database.url)
        .await
        .context("opening listen connection")?;
    let listener = ChannelListener::start(
        &settings.listener.channel_to_listen,
        source,
        hub.clone(),
        settings.listener.poll_wait(),
    )
    .await
    .context("starting notification listener")?;

    let server_config = stock_server::ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        cors_origin: settings.server.cors_origin.clone(),
        stream_timeout: settings.stream.timeout(),
    };
    let server = match stock_server::start(
        server_config,
        Arc::new(store),
        sessions,
        listener.monitor(),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            let _ = listener.stop().await;
            return Err(e).context("starting HTTP server");
        }
    };

    tracing::info!(port = server.port, "stockstream ready");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down");
        }
        () = listener.terminated() => {
            tracing::error!("notification listener terminated");
        }
    }

    let listener_result = listener.stop().await;
    server.shutdown().await;

    listener_result.context("notification listener failed")?;
    tracing::info!("stockstream stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_config_carries_module_levels() {
        let mut settings = StockSettings::default();
        settings.logging.level = "warn".into();
        settings.logging.json = false;
        settings
            .logging
            .module_levels
            .insert("stock_bridge".into(), "debug".into());

        let config = telemetry_config(&settings);
        assert_eq!(config.log_level, tracing::Level::WARN);
        assert!(!config.json);
        assert_eq!(
            config.module_levels,
            vec![("stock_bridge".to_string(), tracing::Level::DEBUG)]
        );
    }
}
