//! Negotiation engine
//!
//! Owns the pool of negotiation primitives, keyed by (kind, remote peer).
//! Every primitive gets one worker task that runs description and candidate
//! operations strictly in order. Each step first checks whether the
//! connection that queued it has since closed; results go back to the
//! session actor, which re-checks ownership before acting on them.

use peerlink_core::{
    id::random_token, sdp::higher_bandwidth_sdp, ConnectionKind, IceCandidate, SessionDescription,
};
use peerlink_transport::{
    Capabilities, NegotiationPrimitive, PrimitiveConfig, PrimitiveProvider,
    SignalingState, TransportError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::Owner;
use crate::session::Event;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub kind: ConnectionKind,
    pub peer: String,
}

impl PoolKey {
    pub fn new(kind: ConnectionKind, peer: &str) -> Self {
        Self {
            kind,
            peer: peer.to_string(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Op {
    MakeOffer,
    RemoteDescription(SessionDescription),
    Candidate(IceCandidate),
}

/// One queued operation plus the context of the connection that queued it
pub(crate) struct Job {
    pub owner: Owner,
    pub closed: Arc<AtomicBool>,
    /// Apply the higher-bandwidth patch to local descriptions
    pub patch_sdp: bool,
    pub op: Op,
}

/// Result of a worker step, posted back to the session
#[derive(Debug)]
pub(crate) enum Outcome {
    /// A local offer or answer was set and must now be signaled
    LocalDescription {
        owner: Owner,
        primitive_id: String,
        description: SessionDescription,
    },
    Failed {
        owner: Owner,
        message: String,
    },
}

struct Pooled {
    primitive: Arc<dyn NegotiationPrimitive>,
    jobs: mpsc::UnboundedSender<Job>,
    /// Connection whose events this primitive currently reports to
    owner: Owner,
    muted: bool,
}

pub(crate) struct Negotiator {
    provider: Arc<dyn PrimitiveProvider>,
    config: PrimitiveConfig,
    caps: Capabilities,
    pools: HashMap<PoolKey, HashMap<String, Pooled>>,
    events: mpsc::UnboundedSender<Event>,
}

impl Negotiator {
    pub fn new(
        provider: Arc<dyn PrimitiveProvider>,
        config: PrimitiveConfig,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let caps = provider.capabilities();
        Self {
            provider,
            config,
            caps,
            pools: HashMap::new(),
            events,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Whether a connection needs the higher-bandwidth description patch
    pub fn patches_sdp(&self, kind: ConnectionKind, reliable: bool) -> bool {
        !self.caps.sctp && kind == ConnectionKind::Data && reliable
    }

    /// Get a primitive for `owner`. A pooled one is reused only when
    /// `requested` names it and it is stable; otherwise a fresh one is made.
    pub async fn acquire(
        &mut self,
        kind: ConnectionKind,
        owner: &Owner,
        requested: Option<&str>,
    ) -> Result<(String, Arc<dyn NegotiationPrimitive>), TransportError> {
        let key = PoolKey::new(kind, &owner.peer);

        if let Some(id) = requested {
            if let Some(pooled) = self.pools.get_mut(&key).and_then(|pool| pool.get_mut(id)) {
                let state = pooled.primitive.signaling_state();
                if state == SignalingState::Stable && !pooled.primitive.is_closed() {
                    debug!(peer = %owner.peer, primitive = id, "reusing pooled primitive");
                    pooled.owner = owner.clone();
                    pooled.muted = false;
                    return Ok((id.to_string(), pooled.primitive.clone()));
                }
                debug!(peer = %owner.peer, primitive = id, ?state, "pooled primitive busy, creating a new one");
            }
        }

        let id = format!("pc_{}", random_token());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let primitive = self.provider.create(&self.config, kind, tx).await?;

        let events = self.events.clone();
        let forward_key = key.clone();
        let forward_id = id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let tagged = Event::Primitive {
                    key: forward_key.clone(),
                    primitive_id: forward_id.clone(),
                    event,
                };
                if events.send(tagged).is_err() {
                    break;
                }
            }
        });

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(
            primitive.clone(),
            id.clone(),
            jobs_rx,
            self.events.clone(),
        ));

        debug!(peer = %owner.peer, primitive = %id, %kind, "created primitive");
        self.pools.entry(key).or_default().insert(
            id.clone(),
            Pooled {
                primitive: primitive.clone(),
                jobs: jobs_tx,
                owner: owner.clone(),
                muted: false,
            },
        );
        Ok((id, primitive))
    }

    pub fn primitive(&self, key: &PoolKey, id: &str) -> Option<Arc<dyn NegotiationPrimitive>> {
        self.pools
            .get(key)
            .and_then(|pool| pool.get(id))
            .map(|p| p.primitive.clone())
    }

    pub fn owner_of(&self, key: &PoolKey, id: &str) -> Option<&Owner> {
        self.pools.get(key).and_then(|pool| pool.get(id)).map(|p| &p.owner)
    }

    pub fn is_muted(&self, key: &PoolKey, id: &str) -> bool {
        self.pools
            .get(key)
            .and_then(|pool| pool.get(id))
            .is_some_and(|p| p.muted)
    }

    /// Stop forwarding local candidates from this primitive
    pub fn mute(&mut self, key: &PoolKey, id: &str) {
        if let Some(pooled) = self.pools.get_mut(key).and_then(|pool| pool.get_mut(id)) {
            pooled.muted = true;
        }
    }

    pub fn enqueue(&self, key: &PoolKey, id: &str, job: Job) {
        match self.pools.get(key).and_then(|pool| pool.get(id)) {
            Some(pooled) => {
                if pooled.jobs.send(job).is_err() {
                    warn!(primitive = id, "negotiation worker gone");
                }
            }
            None => debug!(primitive = id, "no such primitive, operation dropped"),
        }
    }

    /// Remove a primitive from the pool and close it unless it already is.
    /// Safe to call more than once.
    pub fn cleanup(&mut self, key: &PoolKey, id: &str) {
        let Some(pool) = self.pools.get_mut(key) else {
            return;
        };
        if let Some(pooled) = pool.remove(id) {
            if !pooled.primitive.is_closed() {
                pooled.primitive.close();
            }
            debug!(peer = %key.peer, primitive = id, "primitive cleaned up");
        }
        if pool.is_empty() {
            self.pools.remove(key);
        }
    }

    /// Close every pooled primitive
    pub fn clear(&mut self) {
        for (_, pool) in self.pools.drain() {
            for (_, pooled) in pool {
                if !pooled.primitive.is_closed() {
                    pooled.primitive.close();
                }
            }
        }
    }
}

async fn run_worker(
    primitive: Arc<dyn NegotiationPrimitive>,
    primitive_id: String,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(job) = jobs.recv().await {
        let Job {
            owner,
            closed,
            patch_sdp,
            op,
        } = job;
        if closed.load(Ordering::SeqCst) {
            debug!(connection_id = %owner.connection_id, ?op, "connection closed, skipping");
            continue;
        }

        let result = match op {
            Op::MakeOffer => local_description(&*primitive, &closed, patch_sdp, true).await,
            Op::RemoteDescription(description) => {
                let is_offer = description.is_offer();
                match primitive.set_remote_description(description).await {
                    Ok(()) if is_offer => {
                        local_description(&*primitive, &closed, patch_sdp, false).await
                    }
                    Ok(()) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            Op::Candidate(candidate) => primitive.add_ice_candidate(candidate).await.map(|_| None),
        };

        let outcome = match result {
            Ok(Some(description)) => Outcome::LocalDescription {
                owner,
                primitive_id: primitive_id.clone(),
                description,
            },
            Ok(None) => continue,
            Err(e) => {
                warn!(connection_id = %owner.connection_id, error = %e, "negotiation step failed");
                Outcome::Failed {
                    owner,
                    message: e.to_string(),
                }
            }
        };
        if events.send(Event::Negotiated(outcome)).is_err() {
            break;
        }
    }
}

/// Create, patch and set a local offer or answer. `None` when the
/// connection closed in between.
async fn local_description(
    primitive: &dyn NegotiationPrimitive,
    closed: &AtomicBool,
    patch_sdp: bool,
    offer: bool,
) -> Result<Option<SessionDescription>, TransportError> {
    let mut description = if offer {
        primitive.create_offer().await?
    } else {
        primitive.create_answer().await?
    };
    if patch_sdp {
        description.sdp = higher_bandwidth_sdp(&description.sdp);
    }
    if closed.load(Ordering::SeqCst) {
        return Ok(None);
    }
    primitive.set_local_description(description.clone()).await?;
    Ok(Some(description))
}
