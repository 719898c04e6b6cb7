use std::{process::ExitCode, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use weatherbee::{
    config::Config,
    core::{
        display,
        readiness::{Readiness, ReadinessState},
        sensor, MqttPublishClient, PayloadEncoder, RetryingPublisher, SampleLoop,
    },
    logger::LoggerManager,
    print_error,
};
use weatherbee_mqtt::MqttManager;

/// Configuration or logging could not be set up.
const EXIT_CONFIG: u8 = 1;
/// The broker could not be reached at startup, or the connection failed fatally.
const EXIT_BROKER: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = match Config::new() {
        Ok(cfg) => cfg,
        Err(e) => {
            print_error!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let logger_manager = match LoggerManager::new(cfg.logger.clone()) {
        Ok(manager) => manager,
        Err(e) => {
            print_error!("Failed to setup Log Manager: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(e) = logger_manager.init() {
        print_error!("Failed to init Log Manager: {}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    info!("Starting weatherbee version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.transport);

    let sensor = sensor::from_config(&cfg.telemetry.sensor);
    let display = match display::from_config(&cfg.telemetry.display) {
        Ok(display) => display,
        Err(e) => {
            error!("Failed to set up display: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let manager = match MqttManager::from_config(cfg.transport.clone()) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to create MqttManager: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let instance = match manager.build_and_start() {
        Ok(instance) => instance,
        Err(e) => {
            error!("Failed to build and start MQTT kernel: {}", e);
            return ExitCode::from(EXIT_BROKER);
        }
    };
    instance.start_monitoring();

    let readiness = Readiness::default();
    readiness.start_listening(instance.state_receiver());

    let connection_timeout = cfg.transport.connection_timeout();
    info!(
        "Waiting up to {:?} for {}:{}",
        connection_timeout, cfg.transport.host, cfg.transport.port
    );
    if let Err(e) = readiness.wait_ready(connection_timeout).await {
        error!("Broker connection not established: {}", e);
        let _ = instance.shutdown().await;
        return ExitCode::from(EXIT_BROKER);
    }

    let client = MqttPublishClient::new(instance.publisher(), cfg.telemetry.endpoint.clone());
    info!("Publishing readings to '{}'", client.topic());

    let publisher = Arc::new(RetryingPublisher::new(Arc::new(client), &cfg.delivery));
    let sampler = SampleLoop::new(
        cfg.telemetry.device_id.clone(),
        cfg.telemetry.sample_interval(),
        sensor,
        display,
        PayloadEncoder::new(cfg.telemetry.include_timestamp),
        publisher.clone(),
    );

    let stop = CancellationToken::new();
    let mut sampling = tokio::spawn(sampler.run(stop.clone()));
    let mut readiness_rx = readiness.subscribe();

    let mut exit = ExitCode::SUCCESS;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
        _ = readiness_rx.wait_for(ReadinessState::is_failed) => {
            error!("Broker connection failed: {}", readiness.current_state());
            exit = ExitCode::from(EXIT_BROKER);
        }
        _ = &mut sampling => {
            warn!("Sample loop finished unexpectedly");
        }
    }

    stop.cancel();
    if !sampling.is_finished() {
        match sampling.await {
            Ok(summary) => debug!("{:?}", summary),
            Err(e) => error!("Sample loop task failed: {}", e),
        }
    }

    let stats = publisher.shutdown().await;
    debug!("{:?}", stats);

    if let Err(e) = instance.shutdown().await {
        warn!("MQTT shutdown failed: {}", e);
    }

    info!("Shutdown complete");
    exit
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
