use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};

use super::ReadingIngestor;
use crate::alerts::AlertChannels;
use crate::config::Config;

/// Long-lived subscribe loop. Messages are processed sequentially to
/// completion; connection errors reconnect after a short pause and never
/// terminate the loop.
pub async fn run_listener<C: AlertChannels>(
    config: Config,
    ingestor: ReadingIngestor<C>,
) -> Result<()> {
    loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

        match client
            .subscribe(config.mqtt_topic_filter.clone(), QoS::AtMostOnce)
            .await
        {
            Ok(_) => {
                tracing::info!(topic = %config.mqtt_topic_filter, "subscribed to sensor feed")
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to subscribe; retrying");
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let mut payload = publish.payload.to_vec();
                    if let Err(err) = ingestor.handle_message(&publish.topic, &mut payload).await {
                        tracing::warn!(error = %err, topic = %publish.topic, "failed to process message");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}
