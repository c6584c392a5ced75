use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tika_pipes::config::Config;
use tika_pipes::dispatch::Dispatcher;
use tika_pipes::health::HealthRegistry;
use tika_pipes::metrics_http::{add_metrics_route, install_recorder};
use tika_pipes::registry::{FetcherRegistry, RegistryConfig};
use tika_pipes::service::TikaService;
use tika_pipes::stream::StreamConfig;
use tika_pipes::worker::{ProcessSpawner, WorkerPool};
use tika_pipes_proto::tika::v1::tika_server::TikaServer;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

tika_pipes::use_default_allocator!();

async fn listen_ambient(app: Router, bind: String) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await
}

async fn shutdown_signal() {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let env_config = Config::init_from_env().expect("failed to load configuration from env");
    let (app_config, pool_sizing) = env_config.to_components()?;

    let liveness = HealthRegistry::new();
    let registry_liveness = liveness
        .register("fetcher_registry", app_config.fetcher_sweep_interval * 4)
        .await;

    let registry = FetcherRegistry::spawn(
        RegistryConfig {
            idle_ttl: app_config.fetcher_idle_ttl,
            sweep_interval: app_config.fetcher_sweep_interval,
            delete_policy: app_config.delete_policy,
        },
        Some(registry_liveness),
    );

    let spawner = Arc::new(ProcessSpawner {
        program: app_config.runtime_path.clone(),
        args: app_config.runtime_args.clone(),
    });
    let pool = WorkerPool::new(pool_sizing.num_workers, spawner, pool_sizing.worker_config);
    let dispatcher = Dispatcher::new(registry.clone(), pool.clone(), app_config.request_timeout_ceiling);
    let stream_config = StreamConfig {
        in_flight_capacity: pool_sizing.num_workers * app_config.in_flight_multiplier.max(1),
    };
    let service = TikaService::new(registry, dispatcher, stream_config);

    let metrics_handle = install_recorder();
    let ambient_app = add_metrics_route(
        Router::new().route("/_liveness", get(move || ready(liveness.get_status()))),
        metrics_handle,
    );
    let ambient_bind = format!("{}:{}", app_config.bind_host, app_config.bind_port + 1);
    let ambient_server = tokio::spawn(listen_ambient(ambient_app, ambient_bind));

    let grpc_bind = format!("{}:{}", app_config.bind_host, app_config.bind_port)
        .parse()
        .expect("invalid bind address");

    let mut server = Server::builder();
    if let Some(tls) = &app_config.tls {
        let cert = std::fs::read(&tls.server_cert_chain_path)?;
        let key = std::fs::read(&tls.server_private_key_path)?;
        let mut tls_config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
        if let Some(ca_path) = &tls.trust_cert_collection_path {
            let ca = std::fs::read(ca_path)?;
            tls_config = tls_config
                .client_ca_root(Certificate::from_pem(ca))
                .client_auth_optional(!tls.client_auth_required);
        }
        server = server.tls_config(tls_config)?;
    }

    let tika_server = TikaServer::new(service)
        .max_decoding_message_size(app_config.max_inbound_message_bytes)
        .max_encoding_message_size(app_config.max_outbound_message_bytes);

    info!(bind = %grpc_bind, "tika-pipes starting");
    let grpc_server = tokio::spawn(async move {
        server
            .add_service(tika_server)
            .serve_with_shutdown(grpc_bind, shutdown_signal())
            .await
    });

    tokio::select! {
        res = grpc_server => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "grpc server exited with an error"),
                Err(e) => error!(error = %e, "grpc server task panicked"),
            }
        }
        res = ambient_server => {
            error!("ambient health/metrics server exited unexpectedly");
            if let Err(e) = res {
                error!(error = %e, "ambient server task panicked");
            }
        }
    }

    pool.shutdown(Duration::from_secs(5)).await;
    info!("tika-pipes exiting");
    Ok(())
}
