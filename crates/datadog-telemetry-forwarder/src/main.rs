// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Reads newline-delimited JSON events from stdin and forwards them through a
//! telemetry channel until stdin closes or the process is interrupted.

use std::{env, sync::Arc};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use datadog_telemetry_channel::{
    credential::CredentialFactory,
    http::{get_client, ReqwestSender},
    logger, ChannelConfig, TelemetryChannel, TelemetryItem,
};

const DEFAULT_ITEM_NAME: &str = "event";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("DD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .event_format(logger::Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match ChannelConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}. Shutting down.", e);
            return;
        }
    };

    let client = get_client(config.https_proxy.as_deref(), config.request_timeout);
    let mut sender = ReqwestSender::new(client);
    match env::var("DD_API_KEY") {
        Ok(api_key) if !api_key.trim().is_empty() => {
            sender = sender.with_credential(Arc::new(CredentialFactory::new_from_static_token(
                api_key.trim(),
            )));
        }
        _ => warn!("DD_API_KEY is not set, sending unauthenticated requests"),
    }

    let endpoint = config.endpoint.clone();
    let channel = match TelemetryChannel::with_defaults(config, Arc::new(sender)) {
        Ok(channel) => channel,
        Err(e) => {
            error!("Failed to start telemetry channel: {}", e);
            return;
        }
    };
    info!("Forwarding telemetry to {}", endpoint);

    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(item) = parse_line(&line) {
                        channel.send(item);
                    }
                }
                Ok(None) => {
                    debug!("Reached end of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                break;
            }
        }
    }

    if let Err(e) = channel.shutdown().await {
        error!("Telemetry channel did not shut down cleanly: {}", e);
    }
    let stats = channel.stats();
    info!(
        "Forwarder stopped: sent={} retried={} stored={} dropped={} sampled_out={}",
        stats.transmissions_sent,
        stats.transmissions_retried,
        stats.transmissions_stored,
        stats.transmissions_dropped + stats.items_dropped,
        stats.items_sampled_out
    );
}

/// `{"name": ..., "data": ..., "correlation_id": ...}` lines become items
/// with those fields; any other JSON value is wrapped as the payload of a
/// generic event.
fn parse_line(line: &str) -> Option<TelemetryItem> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!("Skipping malformed input line: {}", e);
            return None;
        }
    };

    let Some(object) = value.as_object_mut() else {
        return Some(TelemetryItem::new(DEFAULT_ITEM_NAME, value));
    };
    let Some(name) = object
        .get("name")
        .and_then(|name| name.as_str())
        .map(str::to_string)
    else {
        return Some(TelemetryItem::new(DEFAULT_ITEM_NAME, value));
    };

    let payload = object.remove("data").unwrap_or(serde_json::Value::Null);
    let mut item = TelemetryItem::new(name, payload);
    if let Some(id) = object.get("correlation_id").and_then(|id| id.as_str()) {
        item = item.with_correlation_id(id);
    }
    Some(item)
}
