//! Correlates publishes with broker acknowledgements.
//!
//! `rumqttc` hands requests to its event loop through a FIFO channel and only
//! reveals the packet identifier once the packet is written
//! (`Outgoing::Publish(pkid)`). The tracker mirrors that FIFO: a waiter is
//! queued under the same lock that enqueues the request, the connection kernel
//! pops the front waiter on each outgoing publish and files it under its pkid,
//! and PUBACK/PUBCOMP resolve it.
//!
//! Retransmissions after a reconnect reuse their pkid, so an outgoing publish
//! whose pkid is already tracked is not matched against the queue. When the
//! link drops, every waiter fails with [`TransferError::NotAcknowledged`] but
//! its slot stays in place to keep the correlation aligned.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use rumqttc::{AsyncClient, QoS};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::TransferError;

type AckResult = Result<u16, TransferError>;
type Waiter = oneshot::Sender<AckResult>;

#[derive(Debug, Default)]
struct Slots {
    /// Requests handed to the event loop but not yet written, oldest first.
    queued: VecDeque<Option<Waiter>>,

    /// Written QoS 1/2 publishes awaiting PUBACK/PUBCOMP, by pkid.
    inflight: HashMap<u16, Option<Waiter>>,

    closed: Option<String>,
}

/// Shared between the publishers and the connection kernel.
#[derive(Debug, Clone, Default)]
pub struct AckTracker {
    slots: Arc<Mutex<Slots>>,
}

/// Resolves once the broker acknowledged the publish, or fails.
#[derive(Debug)]
pub struct PendingAck {
    rx: oneshot::Receiver<AckResult>,
}

impl PendingAck {
    /// Waits for the acknowledgement and returns the packet identifier
    /// (`0` for QoS 0).
    pub async fn wait(self) -> AckResult {
        self.rx.await.map_err(|_| TransferError::Closed)?
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a publish on `client` and registers a waiter for it.
    ///
    /// Never blocks: a full request channel is reported as
    /// [`TransferError::ClientTransfer`].
    pub fn publish(
        &self,
        client: &AsyncClient,
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<PendingAck, TransferError> {
        let mut slots = self.lock();
        if let Some(reason) = &slots.closed {
            debug!("Rejecting publish to {topic}: transport closed ({reason})");
            return Err(TransferError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        slots.queued.push_back(Some(tx));

        if let Err(e) = client.try_publish(topic, qos, retain, payload) {
            slots.queued.pop_back();
            return Err(e.into());
        }

        Ok(PendingAck { rx })
    }

    /// Called by the kernel for every `Outgoing::Publish(pkid)` event.
    pub fn on_outgoing_publish(&self, pkid: u16) {
        let mut slots = self.lock();

        if pkid != 0 && slots.inflight.contains_key(&pkid) {
            trace!("Retransmission of pkid {pkid}");
            return;
        }

        let Some(waiter) = slots.queued.pop_front() else {
            trace!("Untracked outgoing publish, pkid {pkid}");
            return;
        };

        if pkid == 0 {
            if let Some(tx) = waiter {
                let _ = tx.send(Ok(0));
            }
        } else {
            slots.inflight.insert(pkid, waiter);
        }
    }

    /// Called by the kernel for PUBACK (QoS 1) and PUBCOMP (QoS 2).
    pub fn on_ack(&self, pkid: u16) {
        let mut slots = self.lock();
        match slots.inflight.remove(&pkid) {
            Some(Some(tx)) => {
                let _ = tx.send(Ok(pkid));
            }
            Some(None) => trace!("Ack for abandoned pkid {pkid}"),
            None => trace!("Ack for unknown pkid {pkid}"),
        }
    }

    /// Fails every waiter while keeping its slot.
    pub fn on_connection_lost(&self, reason: &str) {
        let mut slots = self.lock();
        let Slots {
            queued, inflight, ..
        } = &mut *slots;

        let failed = queued
            .iter_mut()
            .chain(inflight.values_mut())
            .filter_map(Option::take)
            .map(|tx| tx.send(Err(TransferError::NotAcknowledged(reason.to_string()))))
            .count();

        if failed > 0 {
            debug!("Failed {failed} publishes awaiting acknowledgement: {reason}");
        }
    }

    /// Fails every waiter and rejects further publishes.
    pub fn close(&self, reason: &str) {
        let mut slots = self.lock();
        let Slots {
            queued,
            inflight,
            closed,
        } = &mut *slots;

        *closed = Some(reason.to_string());
        for tx in queued
            .drain(..)
            .chain(inflight.drain().map(|(_, tx)| tx))
            .flatten()
        {
            let _ = tx.send(Err(TransferError::Closed));
        }
    }

    /// Publishes that still expect an acknowledgement event.
    pub fn outstanding(&self) -> usize {
        let slots = self.lock();
        slots.queued.len() + slots.inflight.len()
    }
}
