use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{error, info};

use ekko_ingest_writer::config::Config;
use ekko_ingest_writer::metrics;
use ekko_ingest_writer::orchestrator::Engine;
use ekko_ingest_writer::reconcile::DuckDbStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("starting ingest engine");

    let config = Config::from_env()?;
    info!(service = %config.service_name, "configuration loaded");

    let prometheus_handle = metrics::init_metrics().context("failed to initialize metrics")?;

    let store = Arc::new(
        DuckDbStore::open(&config.duckdb_path)
            .with_context(|| format!("failed to open DuckDB store at {}", config.duckdb_path))?,
    );

    let nats_client = async_nats::connect(&config.nats_url)
        .await
        .context("failed to connect to NATS")?;
    let jetstream = async_nats::jetstream::new(nats_client);

    let engine = Engine::new(config.clone(), jetstream, store);

    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let http_handle = tokio::spawn(serve_http(http_addr, prometheus_handle));
    info!(%http_addr, "health/metrics endpoint listening");

    let engine_for_run = engine.clone();
    let mut run_handle = tokio::spawn(async move { engine_for_run.run().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            engine.stop();
            let _ = run_handle.await;
        }
        result = &mut run_handle => {
            match result {
                Ok(Ok(())) => info!("engine stopped on its own"),
                Ok(Err(e)) => error!(error = %e, "engine exited with error"),
                Err(e) => error!(error = %e, "engine task panicked"),
            }
        }
    }

    http_handle.abort();
    info!("shutdown complete");
    Ok(())
}

async fn serve_http(addr: SocketAddr, prometheus_handle: PrometheusHandle) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let prometheus_handle = prometheus_handle.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_http(req, prometheus_handle.clone())
            }))
        }
    });

    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

async fn handle_http(
    req: Request<Body>,
    prometheus_handle: PrometheusHandle,
) -> Result<Response<Body>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" => Response::new(Body::from("ok")),
        "/metrics" => Response::new(Body::from(prometheus_handle.render())),
        _ => Response::builder()
            .status(hyper::StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .expect("static response is well-formed"),
    };
    Ok(response)
}
