use crate::config::Config;
use crate::ingest::MessageHandler;
use crate::pipeline::IngestStats;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Payload waiting to be published by the transport task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// MQTT filter matching: `+` matches one level, a trailing `#` matches the
/// remaining levels (including none).
pub fn topic_matches_filter(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    options
}

/// Drives the broker connection until `cancel` fires. Inbound publishes are
/// handed to `handler` one at a time; outbound status payloads are published
/// without blocking the event loop.
pub async fn run_listener<H: MessageHandler>(
    config: &Config,
    handler: &H,
    stats: &IngestStats,
    mut outbound_rx: mpsc::Receiver<OutboundMessage>,
    cancel: CancellationToken,
) -> Result<()> {
    let filters = config.inbound_filters();
    while !cancel.is_cancelled() {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), 64);

        let mut subscribed = true;
        for filter in &filters {
            if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                tracing::warn!(error=%err, topic=%filter, "failed to subscribe; retrying");
                subscribed = false;
                break;
            }
            tracing::info!(topic=%filter, "subscribed to device feed");
        }

        if subscribed {
            let stop = drive_connection(
                &client,
                &mut eventloop,
                handler,
                stats,
                &mut outbound_rx,
                &cancel,
            )
            .await;
            stats.set_mqtt_connected(false);
            if stop {
                if let Err(err) = client.try_disconnect() {
                    tracing::debug!(error=%err, "MQTT disconnect request failed");
                }
                break;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(RECONNECT_DELAY) => {}
        }
    }
    tracing::info!("MQTT listener stopped");
    Ok(())
}

/// Returns `true` when the listener should stop for good.
async fn drive_connection<H: MessageHandler>(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    handler: &H,
    stats: &IngestStats,
    outbound_rx: &mut mpsc::Receiver<OutboundMessage>,
    cancel: &CancellationToken,
) -> bool {
    let mut outbound_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return true,

            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    tracing::info!("MQTT connected");
                    stats.set_mqtt_connected(true);
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let outcome = handler.handle_message(&publish.topic, &publish.payload).await;
                    tracing::trace!(topic=%publish.topic, ?outcome, "handled message");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    return false;
                }
            },

            maybe = outbound_rx.recv(), if outbound_open => match maybe {
                Some(message) => {
                    if let Err(err) = client.try_publish(
                        message.topic,
                        QoS::AtMostOnce,
                        false,
                        message.payload,
                    ) {
                        tracing::debug!(error=%err, "failed to queue status publish");
                    }
                }
                None => outbound_open = false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_level_wildcard_matches_one_segment() {
        assert!(topic_matches_filter("rgbww/+/monitor", "rgbww/12/monitor"));
        assert!(topic_matches_filter("rgbww/+/monitor", "rgbww/bridge/monitor"));
        assert!(!topic_matches_filter("rgbww/+/monitor", "rgbww/12/log"));
        assert!(!topic_matches_filter("rgbww/+/monitor", "rgbww/a/b/monitor"));
        assert!(!topic_matches_filter("rgbww/+/monitor", "rgbww/monitor"));
    }

    #[test]
    fn multi_level_wildcard_matches_remaining_segments() {
        assert!(topic_matches_filter("rgbww/#", "rgbww/1/log"));
        assert!(topic_matches_filter("rgbww/#", "rgbww"));
        assert!(topic_matches_filter("#", "bridge/status"));
        assert!(!topic_matches_filter("rgbww/#", "bridge/status"));
    }

    #[test]
    fn literal_filters_match_exactly() {
        assert!(topic_matches_filter("bridge/status", "bridge/status"));
        assert!(!topic_matches_filter("bridge/status", "bridge/status/x"));
        assert!(!topic_matches_filter("bridge/status/x", "bridge/status"));
    }
}
