/*
    ChannelRouter - maps sessions to channels and filters inbound traffic

    Outbound: every event is addressed to exactly one channel, the
    recipient's `session_<id>`. Nothing is ever broadcast.

    Inbound: the event name is parsed, a fingerprint is computed and checked
    against the dedup cache before anything else sees the event.

      RawEvent ──parse name──► fingerprint ──seen?──► drop (debug log)
                                                │
                                                └─new──► RoutedEvent
*/

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::dedup::DedupCache;
use super::errors::{RouterError, RouterResult};
use super::metrics;
use super::transport::Transport;
use crate::config::RouterConfig;
use crate::core_codec::checksum;
use crate::types::SessionId;
use crate::wire::{EventKind, EventName, RawEvent};

/// An inbound event that passed dedup, ready for its family handler
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    pub name: EventName,
    pub payload: Value,
    /// Dedup key recorded for this event
    pub fingerprint: String,
}

pub struct ChannelRouter {
    local: SessionId,
    transport: Arc<dyn Transport>,
    joined: bool,
    dedup: DedupCache,
}

impl ChannelRouter {
    pub fn new(local: SessionId, transport: Arc<dyn Transport>, config: &RouterConfig) -> Self {
        Self {
            local,
            transport,
            joined: false,
            dedup: DedupCache::new(config.dedup_capacity, config.dedup_horizon),
        }
    }

    pub fn local(&self) -> &SessionId {
        &self.local
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Subscribe to the local session's channel; joining twice is a no-op
    pub async fn join(&mut self, sink: mpsc::Sender<RawEvent>) -> RouterResult<()> {
        if self.joined {
            return Ok(());
        }
        let channel = self.local.channel();
        self.transport.subscribe(&channel, sink).await?;
        self.joined = true;
        info!(channel = %channel, "Joined session channel");
        Ok(())
    }

    /// Leave the local channel; leaving twice is a no-op
    pub async fn leave(&mut self) -> RouterResult<()> {
        if !self.joined {
            return Ok(());
        }
        let channel = self.local.channel();
        self.joined = false;
        self.transport.unsubscribe(&channel).await?;
        info!(channel = %channel, "Left session channel");
        Ok(())
    }

    /// Emit `payload` as a `kind` event on the recipient's channel
    pub async fn send_to_recipient(
        &self,
        kind: EventKind,
        recipient: &SessionId,
        payload: Value,
    ) -> RouterResult<()> {
        if !self.joined {
            return Err(RouterError::NotConnected(format!(
                "{} has not joined its channel",
                self.local
            )));
        }
        if !self.transport.is_connected() {
            return Err(RouterError::NotConnected("transport is down".to_string()));
        }

        let name = EventName::new(kind, self.local.clone()).to_string();
        debug!(event = %name, recipient = %recipient, "Emitting event");
        self.transport
            .emit(&recipient.channel(), RawEvent::new(name, payload))
            .await?;
        Ok(())
    }

    /// Parse and deduplicate an inbound event
    ///
    /// Returns `Ok(None)` for redeliveries; those are never errors.
    pub fn on_inbound(&mut self, raw: RawEvent) -> RouterResult<Option<RoutedEvent>> {
        let name: EventName = raw.name.parse()?;
        let fingerprint = fingerprint(&name, &raw.payload)?;

        let fresh = self.dedup.check_and_insert(&fingerprint, Instant::now());
        metrics::set_dedup_cache_size(self.dedup.len());
        if !fresh {
            metrics::duplicate_event();
            debug!(event = %raw.name, fingerprint = %fingerprint, "Dropping duplicate event");
            return Ok(None);
        }

        metrics::inbound_event(name.kind.family().as_str());
        Ok(Some(RoutedEvent {
            name,
            payload: raw.payload,
            fingerprint,
        }))
    }

    /// Drop a recorded fingerprint so a later copy of the event is processed
    ///
    /// Used when the copy that claimed it turned out to be unusable.
    pub fn forget(&mut self, fingerprint: &str) {
        if self.dedup.remove(fingerprint) {
            debug!(fingerprint = %fingerprint, "Forgot fingerprint of rejected event");
            metrics::set_dedup_cache_size(self.dedup.len());
        }
    }

    /// Prune dedup entries past their horizon
    pub fn housekeeping(&mut self, now: Instant) {
        let pruned = self.dedup.prune(now);
        if pruned > 0 {
            debug!(pruned, "Pruned dedup cache");
            metrics::set_dedup_cache_size(self.dedup.len());
        }
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }
}

/// Redelivery fingerprint of an inbound event
///
/// Key exchange events are keyed by request id. Encrypted events are keyed
/// by a digest of the `encrypted_data` actually received, never by the
/// checksum the payload claims, so a damaged copy cannot shadow the genuine one.
pub fn fingerprint(name: &EventName, payload: &Value) -> RouterResult<String> {
    let kind = name.kind;
    if kind.is_plaintext() {
        let request_id = payload
            .get("requestId")
            .and_then(Value::as_str)
            .ok_or_else(|| RouterError::MalformedPayload("missing requestId".to_string()))?;
        return Ok(format!(
            "{}:{}:{}",
            kind.family(),
            request_id,
            kind.action_type()
        ));
    }

    let data = payload
        .get("encrypted_data")
        .and_then(Value::as_str)
        .ok_or_else(|| RouterError::MalformedPayload("missing encrypted_data".to_string()))?;
    Ok(format!(
        "{}:{}:{}:{}",
        kind.family(),
        kind.action_type(),
        name.sender,
        checksum(data.as_bytes())
    ))
}
