mod buffer;
mod config;
mod flatten;
mod http;
mod ingest;
mod mqtt;
mod pipeline;
mod point;
mod sink;
mod status;
mod telemetry;

#[cfg(test)]
mod test_support;

use crate::config::Config;
use crate::ingest::TelemetryIngestor;
use crate::pipeline::{shutdown, spawn_flush_loop, BridgeContext};
use crate::sink::{InfluxSink, PointSink};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const OUTBOUND_QUEUE: usize = 8;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_bridge=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "telemetry-bridge"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn build_sink(config: &Config) -> Option<Arc<dyn PointSink>> {
    match InfluxSink::from_config(config) {
        Ok(sink) => {
            tracing::info!(url=%sink.write_url(), bucket=%config.influx_bucket, "metrics store enabled");
            Some(Arc::new(sink))
        }
        Err(err) => {
            tracing::error!(error=%err, "metrics store disabled; status reports will buffer without flushing");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let context = Arc::new(BridgeContext::new(
        config.buffer_capacity,
        config.pipeline_settings(),
    ));
    let cancel = CancellationToken::new();
    let transport_cancel = CancellationToken::new();

    let sink = build_sink(&config);
    context.stats.set_sink_enabled(sink.is_some());
    let flush_handle = sink.clone().map(|sink| {
        spawn_flush_loop(
            context.clone(),
            sink,
            config.flush_interval(),
            cancel.child_token(),
        )
    });

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let status_handle = status::spawn_status_loop(
        context.clone(),
        config.status_topic.clone(),
        config.status_interval(),
        outbound_tx,
        cancel.child_token(),
    );

    let ingestor = TelemetryIngestor::new(
        context.clone(),
        sink,
        config.mqtt_topic_prefix.clone(),
        config.status_topic.clone(),
        config.log_write_timeout(),
    );
    let mut mqtt_handle = {
        let config = config.clone();
        let cancel = transport_cancel.child_token();
        tokio::spawn(async move {
            mqtt::run_listener(&config, &ingestor, ingestor.stats(), outbound_rx, cancel).await
        })
    };

    let http_handle = if config.enable_http {
        let bind = config.http_bind.clone();
        let state = http::HttpState {
            context: context.clone(),
        };
        let cancel = cancel.child_token();
        Some(tokio::spawn(async move {
            if let Err(err) = http::serve(&bind, state, cancel).await {
                tracing::error!(error=%err, "HTTP query surface exited");
            }
        }))
    } else {
        None
    };

    let mut mqtt_finished = false;
    tokio::select! {
        res = &mut mqtt_handle => {
            mqtt_finished = true;
            match res {
                Ok(Ok(())) => tracing::warn!("MQTT listener exited"),
                Ok(Err(err)) => tracing::error!(error=%err, "MQTT listener failed"),
                Err(err) => tracing::error!(error=%err, "MQTT task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    let mut tasks = vec![("status", status_handle)];
    tasks.extend(flush_handle.map(|handle| ("flush", handle)));
    tasks.extend(http_handle.map(|handle| ("http", handle)));
    shutdown(
        &transport_cancel,
        (!mqtt_finished).then_some(mqtt_handle),
        &cancel,
        tasks,
    )
    .await;

    let remaining = context.buffer.len();
    if remaining > 0 {
        tracing::warn!(remaining, "exiting with unflushed records");
    }
    Ok(())
}
