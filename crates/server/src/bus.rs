//! Topic-based pub/sub between the control plane and gateways.
//!
//! Topics follow the `gateways/{gateway_id}/commands` and
//! `gateways/{gateway_id}/progress` layout. Filters use MQTT-style wildcards:
//! `+` matches one level and a trailing `#` matches the rest.

use crate::error::{FleetError, FleetResult};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Default number of messages buffered per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// A message as seen on the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload. Delivery is at-most-once per subscriber; the REST
    /// polling path covers gateways that were not listening.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> FleetResult<()>;

    /// Subscribe to every topic matching `filter`.
    fn subscribe(&self, filter: &str) -> FleetResult<Subscription>;
}

/// A filtered stream of bus messages.
pub struct Subscription {
    filter: String,
    rx: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    /// Wait for the next matching message. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if topic_matches(&self.filter, &msg.topic) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(filter = %self.filter, skipped, "Bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// In-process bus backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> FleetResult<()> {
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(FleetError::Bus(format!("invalid publish topic: {topic:?}")));
        }
        let msg = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        // No receivers is not an error: nobody is listening right now.
        if self.tx.send(msg).is_err() {
            tracing::debug!(topic, "Published with no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> FleetResult<Subscription> {
        validate_filter(filter)?;
        Ok(Subscription {
            filter: filter.to_string(),
            rx: self.tx.subscribe(),
        })
    }
}

fn validate_filter(filter: &str) -> FleetResult<()> {
    if filter.is_empty() {
        return Err(FleetError::Bus("empty topic filter".to_string()));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let is_last = i + 1 == levels.len();
        if level.contains('#') && (*level != "#" || !is_last) {
            return Err(FleetError::Bus(format!("invalid topic filter: {filter}")));
        }
        if level.contains('+') && *level != "+" {
            return Err(FleetError::Bus(format!("invalid topic filter: {filter}")));
        }
    }
    Ok(())
}

/// Match a topic against an MQTT-style filter.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("gateways/+/progress", "gateways/gw-1/progress"));
        assert!(!topic_matches("gateways/+/progress", "gateways/gw-1/commands"));
        assert!(!topic_matches("gateways/+/progress", "gateways/a/b/progress"));
        assert!(topic_matches("gateways/#", "gateways/gw-1/commands"));
        assert!(topic_matches(
            "gateways/gw-1/commands",
            "gateways/gw-1/commands"
        ));
        assert!(!topic_matches("gateways/gw-1", "gateways/gw-1/commands"));
    }

    #[test]
    fn test_filter_validation() {
        let bus = MemoryBus::default();
        assert!(bus.subscribe("gateways/+/progress").is_ok());
        assert!(bus.subscribe("gateways/#").is_ok());
        assert!(bus.subscribe("gateways/#/progress").is_err());
        assert!(bus.subscribe("gateways/gw+/progress").is_err());
        assert!(bus.subscribe("").is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers_only() {
        let bus = MemoryBus::default();
        let mut progress = bus.subscribe("gateways/+/progress").unwrap();
        let mut commands = bus.subscribe("gateways/gw-1/commands").unwrap();

        bus.publish("gateways/gw-1/progress", b"p".to_vec())
            .await
            .unwrap();
        bus.publish("gateways/gw-1/commands", b"c".to_vec())
            .await
            .unwrap();

        let msg = progress.recv().await.unwrap();
        assert_eq!(msg.topic, "gateways/gw-1/progress");
        assert_eq!(msg.payload, b"p");

        let msg = commands.recv().await.unwrap();
        assert_eq!(msg.payload, b"c");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryBus::default();
        bus.publish("gateways/gw-1/commands", vec![]).await.unwrap();
        assert!(bus.publish("gateways/+/commands", vec![]).await.is_err());
    }
}
