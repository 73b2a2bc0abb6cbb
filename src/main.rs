//! iotdm - oneM2M device-management gateway
//!
//! Serves a oneM2M resource tree over HTTP, CoAP and MQTT and delivers
//! subscription notifications over the subscriber's transport.

use iotdm_client::{ClientPool, Notifier, Router};
use iotdm_core::MemoryStore;
use iotdm_protocol::{Protocol, SecurityLevel};
use iotdm_server::{
    create_tls_acceptor, run_metrics_server, validate, CoapServer, Config, EventBroadcaster,
    HttpServer, Metrics, MqttServer, NotificationDispatcher, RxPipeline, ServerError,
    TransportRegistry, TransportServer,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Builds the server of one configured transport.
fn build_server(
    protocol: Protocol,
    config: &Config,
    pipeline: &Arc<RxPipeline>,
    registry: &Arc<TransportRegistry>,
    metrics: Option<&Arc<Metrics>>,
) -> Result<Option<Arc<dyn TransportServer>>, ServerError> {
    let transport = config.transport(protocol);
    let Some(section) = transport.server.clone() else {
        return Ok(None);
    };
    let server: Arc<dyn TransportServer> = match protocol {
        Protocol::Http => {
            let mut server = HttpServer::new(section.clone(), pipeline.clone(), registry.clone());
            if section.level >= SecurityLevel::L1 {
                server = server.with_tls(create_tls_acceptor(&section, &transport.security)?);
                if section.require_client_cert {
                    tracing::info!("  mTLS: enabled (client certificate required)");
                }
            }
            if let Some(metrics) = metrics {
                server = server.with_metrics(metrics.clone());
            }
            Arc::new(server)
        }
        Protocol::Coap => {
            let mut server = CoapServer::new(section, pipeline.clone(), registry.clone());
            if let Some(metrics) = metrics {
                server = server.with_metrics(metrics.clone());
            }
            Arc::new(server)
        }
        Protocol::Mqtt => {
            let client_id = format!(
                "{}-rx-{}",
                config.client.client_id_prefix,
                config.cse.cse_id.trim_start_matches('/')
            );
            let mut server = MqttServer::new(
                section,
                transport.broker_client_config(),
                pipeline.clone(),
                registry.clone(),
            )
            .with_client_id(client_id);
            if let Some(metrics) = metrics {
                server = server.with_metrics(metrics.clone());
            }
            Arc::new(server)
        }
    };
    Ok(Some(server))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if IOTDM_CONFIG is set, then env overrides)
    let config_path = std::env::var("IOTDM_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting iotdm gateway");
    tracing::info!("  CSE base: {}", config.cse.name);
    tracing::info!("  CSE-ID: {}", config.cse.cse_id);
    for (cse_id, next_hop) in &config.cse.routes {
        tracing::info!("  Route: {} via {}", cse_id, next_hop);
    }

    // A transport with an invalid configuration is left out entirely
    let transports: Vec<Protocol> = Protocol::ALL
        .into_iter()
        .filter(|&protocol| match validate(protocol, config.transport(protocol)) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("{} transport disabled: {}", protocol, e);
                false
            }
        })
        .collect();

    let metrics = if config.metrics.enabled {
        Some(Arc::new(Metrics::new()?))
    } else {
        None
    };

    let store = Arc::new(MemoryStore::new());
    let pool = Arc::new(ClientPool::new(config.pool_settings()));

    let mut notifier = Notifier::new(pool.clone());
    let mut router = Router::new(pool.clone(), config.cse.cse_id.clone());
    for &protocol in &transports {
        let transport = config.transport(protocol);
        notifier = notifier.with_config(protocol, transport.notifier_client_config());
        router = router.with_config(protocol, transport.router_client_config());
    }

    let events = Arc::new(EventBroadcaster::default());
    let mut pipeline = RxPipeline::new(store.clone(), config.cse.clone())
        .with_router(Arc::new(router))
        .with_events(events.clone());
    for &protocol in &transports {
        if let Some(server) = &config.transport(protocol).server {
            pipeline = pipeline.with_min_level(protocol, server.level);
        }
    }
    if let Some(metrics) = &metrics {
        pipeline = pipeline.with_metrics(metrics.clone());
    }
    let root_id = pipeline.provision_cse_base()?;
    tracing::info!("  CSE base resource id: {}", root_id);
    let pipeline = Arc::new(pipeline);

    // Notification dispatch
    let mut dispatcher =
        NotificationDispatcher::new(store.clone(), Arc::new(notifier), config.cse.cse_id.clone());
    if let Some(metrics) = &metrics {
        dispatcher = dispatcher.with_metrics(metrics.clone());
    }
    let dispatcher = Arc::new(dispatcher);
    let dispatcher_handle = {
        let dispatcher = dispatcher.clone();
        let receiver = events.subscribe_all();
        tokio::spawn(async move {
            dispatcher.run(receiver).await;
        })
    };

    // Metrics server
    let (metrics_shutdown, _) = broadcast::channel(1);
    if let Some(metrics) = &metrics {
        let addr = config.metrics.bind_addr;
        let metrics = metrics.clone();
        let pool = pool.clone();
        let shutdown_rx = metrics_shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, Some(pool), shutdown_rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    } else {
        tracing::info!("  Metrics: disabled");
    }

    // Transport servers
    let registry = Arc::new(TransportRegistry::new());
    let mut servers: Vec<Arc<dyn TransportServer>> = Vec::new();
    for &protocol in &transports {
        match build_server(protocol, &config, &pipeline, &registry, metrics.as_ref()) {
            Ok(Some(server)) => servers.push(server),
            Ok(None) => tracing::info!("  {}: not configured", protocol),
            Err(e) => tracing::error!("{} transport disabled: {}", protocol, e),
        }
    }
    if servers.is_empty() {
        tracing::warn!("No transport server configured");
    }

    let handles: Vec<_> = servers
        .iter()
        .map(|server| {
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    tracing::error!("{} transport stopped: {}", server.protocol(), e);
                }
            })
        })
        .collect();

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Received shutdown signal, stopping gateway...");

    for server in &servers {
        server.shutdown();
    }
    for handle in handles {
        let _ = handle.await;
    }

    dispatcher.shutdown();
    let _ = dispatcher_handle.await;
    let _ = metrics_shutdown.send(());

    pool.shutdown().await;
    store.close();

    tracing::info!("Gateway stopped");
    Ok(())
}
