//! # Log Emitter
//!
//! Log records travel over the bus like any other message, on
//! `log.<level>.<class>.<instanceId>`, so a collector can subscribe with
//! wildcards (`log.error.>`). Every record is also mirrored to the local
//! `tracing` output. Publishing is best effort: a failed publish is reported
//! locally and otherwise ignored.

use crate::channel::BusSubject;
use crate::envelope::Message;
use crate::rpc::RpcClient;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Class segment used when the node has no class.
pub const DEFAULT_LOG_CLASS: &str = "default";

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Fatal,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| format!("unknown log level: {s}"))
    }
}

/// Record published for every log call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: String,
    pub class: String,
    pub instance_id: String,
    /// Unix time in nanoseconds.
    pub time: i64,
    pub level: LogLevel,
    pub text: String,
}

/// Subject a record of `level` is published on.
#[must_use]
pub fn log_subject(level: LogLevel, class: &str, instance_id: &str) -> BusSubject {
    let class = if class.is_empty() {
        DEFAULT_LOG_CLASS
    } else {
        class
    };
    BusSubject::new(format!("log.{level}.{class}.{instance_id}"))
}

/// Publishes log records for one node identity.
#[derive(Clone)]
pub struct LogEmitter {
    rpc: RpcClient,
    class: String,
    instance_id: String,
}

impl LogEmitter {
    pub fn new(rpc: RpcClient, class: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            rpc,
            class: class.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Emit one record. Never fails.
    pub async fn log(&self, level: LogLevel, text: &str) {
        self.mirror(level, text);

        let record = LogRecord {
            id: Uuid::new_v4().to_string(),
            class: self.class.clone(),
            instance_id: self.instance_id.clone(),
            time: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            level,
            text: text.to_string(),
        };
        let subject = log_subject(level, &self.class, &self.instance_id);

        let payload = match serde_json::to_value(&record)
            .map(|params| Message::new(level.as_str(), params).with_id(record.id.clone()))
            .and_then(|message| serde_json::to_vec(&message))
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode log record");
                return;
            }
        };

        if let Err(e) = self.rpc.publish_to_subject(&subject, Bytes::from(payload)).await {
            warn!(subject = %subject, error = %e, "Failed to publish log record");
        }
    }

    fn mirror(&self, level: LogLevel, text: &str) {
        let class = self.class.as_str();
        let instance = self.instance_id.as_str();
        match level {
            LogLevel::Trace => trace!(class, instance, "{text}"),
            LogLevel::Debug => debug!(class, instance, "{text}"),
            LogLevel::Info => info!(class, instance, "{text}"),
            LogLevel::Warning => warn!(class, instance, "{text}"),
            LogLevel::Error => error!(class, instance, "{text}"),
            LogLevel::Fatal => error!(class, instance, fatal = true, "{text}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelMapper;
    use crate::pool::ConnectionPool;
    use cube_bus::{BusConnection, InMemoryBus};
    use std::sync::Arc;
    use std::time::Duration;

    fn emitter(bus: &InMemoryBus, class: &str) -> LogEmitter {
        let pool = ConnectionPool::new(Arc::new(bus.clone()), 2, Duration::from_secs(1));
        let rpc = RpcClient::new(Arc::new(ChannelMapper::identity()), pool);
        LogEmitter::new(rpc, class, "node-1")
    }

    #[test]
    fn test_subject_convention() {
        assert_eq!(
            log_subject(LogLevel::Warning, "gateway", "abc").as_str(),
            "log.warning.gateway.abc"
        );
        assert_eq!(
            log_subject(LogLevel::Info, "", "abc").as_str(),
            "log.info.default.abc"
        );
    }

    #[test]
    fn test_level_parsing() {
        for level in LogLevel::ALL {
            assert_eq!(level.as_str().parse::<LogLevel>().unwrap(), level);
        }
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[tokio::test]
    async fn test_record_published_on_level_subject() {
        let bus = InMemoryBus::new();
        let collector = bus.open().unwrap();
        let mut sub = collector.subscribe("log.>", None).await.unwrap();

        emitter(&bus, "gateway").log(LogLevel::Error, "boom").await;

        let delivery = sub.next_delivery().await.unwrap();
        assert_eq!(delivery.subject, "log.error.gateway.node-1");

        let message: Message = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(message.method, "error");
        let record: LogRecord = serde_json::from_value(message.params).unwrap();
        assert_eq!(record.text, "boom");
        assert_eq!(record.instance_id, "node-1");
        assert_eq!(message.id.as_deref(), Some(record.id.as_str()));
        assert!(record.time > 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let bus = InMemoryBus::new();
        bus.set_reachable(false);
        emitter(&bus, "gateway").log(LogLevel::Info, "nobody hears this").await;
    }
}
