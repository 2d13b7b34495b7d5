//! Bus de notificaciones en proceso: publicación por tema y esperas que
//! siempre llevan timeout.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub triggered_by: String,
    pub event: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MqError {
    #[error("timed out waiting for notification")]
    Timeout,

    #[error("notification bus closed")]
    Closed,
}

type Topics = HashMap<String, Vec<(u64, mpsc::Sender<Message>)>>;

#[derive(Clone, Default)]
pub struct NotificationBus {
    topics: Arc<RwLock<Topics>>,
    next_id: Arc<AtomicU64>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic.to_string())
            .or_default()
            .push((id, tx));

        Subscription {
            topic: topic.to_string(),
            id,
            rx,
            topics: Arc::clone(&self.topics),
        }
    }

    /// Entrega `msg` a todos los suscriptores del tema; devuelve cuántos lo recibieron.
    pub fn publish(&self, topic: &str, msg: Message) -> usize {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        let Some(subs) = topics.get(topic) else {
            debug!(topic, "notificación sin suscriptores");
            return 0;
        };
        subs.iter()
            .filter(|(_, tx)| tx.try_send(msg.clone()).is_ok())
            .count()
    }

    pub fn subscribers(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map_or(0, Vec::len)
    }
}

/// Suscripción a un tema; al soltarse se da de baja.
pub struct Subscription {
    topic: String,
    id: u64,
    rx: mpsc::Receiver<Message>,
    topics: Arc<RwLock<Topics>>,
}

impl Subscription {
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Message, MqError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(MqError::Closed),
            Err(_) => Err(MqError::Timeout),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = topics.get_mut(&self.topic) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                topics.remove(&self.topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(event: &str) -> Message {
        Message {
            triggered_by: "slave-2".into(),
            event: event.into(),
            content: json!({}),
        }
    }

    #[tokio::test]
    async fn publica_a_suscriptor() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe("t1");
        assert_eq!(bus.publish("t1", msg("success")), 1);
        let got = sub.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.event, "success");
    }

    #[tokio::test]
    async fn espera_expira() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe("t1");
        bus.publish("otro", msg("success"));
        assert_eq!(
            sub.recv_timeout(Duration::from_millis(20)).await,
            Err(MqError::Timeout)
        );
    }

    #[test]
    fn soltar_la_suscripcion_la_elimina() {
        let bus = NotificationBus::new();
        let a = bus.subscribe("t");
        let b = bus.subscribe("t");
        assert_eq!(bus.subscribers("t"), 2);
        drop(a);
        assert_eq!(bus.subscribers("t"), 1);
        drop(b);
        assert_eq!(bus.publish("t", msg("x")), 0);
    }
}
