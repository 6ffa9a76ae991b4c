//! The broadcast hub.
//!
//! One task owns the membership map and handles join, leave and forward
//! intents strictly in arrival order. Nothing else touches the map, so no
//! lock guards it. Each member's outbox is a bounded channel whose only
//! sender lives in the map: removing the entry is what closes the outbox.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::Identity;
use crate::messages::ChatMessage;

pub type ParticipantId = Uuid;
pub type OutboxSender = mpsc::Sender<Arc<ChatMessage>>;
pub type Outbox = mpsc::Receiver<Arc<ChatMessage>>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HubError {
    #[error("hub has stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Leave the sender out of its own fan-out. Browsers normally render
    /// their own echo, so the default delivers to everyone.
    pub exclude_sender: bool,
    pub queue_capacity: NonZeroUsize,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            exclude_sender: false,
            queue_capacity: NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

/// Server-side handle for one connected client.
#[derive(Debug, Clone)]
pub struct Participant {
    id: ParticipantId,
    identity: Arc<Identity>,
}

impl Participant {
    pub fn new(identity: Identity) -> Self {
        Participant {
            id: Uuid::new_v4(),
            identity: Arc::new(identity),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

enum Intent {
    Join {
        participant: Participant,
        outbox: OutboxSender,
    },
    Leave {
        id: ParticipantId,
    },
    Forward {
        from: Option<ParticipantId>,
        message: Arc<ChatMessage>,
    },
    Members {
        reply: oneshot::Sender<Vec<ParticipantId>>,
    },
}

struct Member {
    participant: Participant,
    outbox: OutboxSender,
}

/// Cheap, cloneable way in to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    intents: mpsc::Sender<Intent>,
    shutdown: Arc<Notify>,
}

impl HubHandle {
    /// Makes `participant` a fan-out target. `outbox` must be the only
    /// sender for that participant's outbox.
    pub async fn join(
        &self,
        participant: Participant,
        outbox: OutboxSender,
    ) -> Result<(), HubError> {
        self.send(Intent::Join {
            participant,
            outbox,
        })
        .await
    }

    /// Removes a participant and closes its outbox. Unknown ids are ignored.
    pub async fn leave(&self, id: ParticipantId) -> Result<(), HubError> {
        self.send(Intent::Leave { id }).await
    }

    pub async fn forward(
        &self,
        from: Option<ParticipantId>,
        message: ChatMessage,
    ) -> Result<(), HubError> {
        self.send(Intent::Forward {
            from,
            message: Arc::new(message),
        })
        .await
    }

    /// Current membership, as seen after every intent sent before this call.
    pub async fn members(&self) -> Result<Vec<ParticipantId>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Intent::Members { reply }).await?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Asks the hub task to stop at its next wait for an intent. Intents
    /// already queued are still handled; later ones get `HubError::Stopped`.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    async fn send(&self, intent: Intent) -> Result<(), HubError> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| HubError::Stopped)
    }
}

pub struct Hub {
    config: HubConfig,
    members: HashMap<ParticipantId, Member>,
    intents: mpsc::Receiver<Intent>,
    shutdown: Arc<Notify>,
}

impl Hub {
    /// Starts the hub task and returns the handle used to reach it.
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.get());
        let shutdown = Arc::new(Notify::new());
        let hub = Hub {
            config,
            members: HashMap::new(),
            intents: rx,
            shutdown: Arc::clone(&shutdown),
        };
        let task = tokio::spawn(hub.run());
        (
            HubHandle {
                intents: tx,
                shutdown,
            },
            task,
        )
    }

    async fn run(mut self) {
        info!("Hub started");
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.notified() => break,
                intent = self.intents.recv() => match intent {
                    Some(intent) => self.handle(intent),
                    None => break,
                },
            }
        }

        // Refuse new intents but finish the ones callers were already told
        // had been accepted.
        self.intents.close();
        while let Some(intent) = self.intents.recv().await {
            self.handle(intent);
        }

        info!("Hub stopping, closing {} outboxes", self.members.len());
        self.members.clear();
    }

    fn handle(&mut self, intent: Intent) {
        match intent {
            Intent::Join {
                participant,
                outbox,
            } => self.join(participant, outbox),
            Intent::Leave { id } => self.leave(id),
            Intent::Forward { from, message } => self.forward(from, &message),
            Intent::Members { reply } => {
                let _ = reply.send(self.members.keys().copied().collect());
            }
        }
    }

    fn join(&mut self, participant: Participant, outbox: OutboxSender) {
        let id = participant.id();
        if self.members.contains_key(&id) {
            warn!("Participant {id} joined twice, keeping the first registration");
            return;
        }
        debug!(
            "Participant {} ({}) joined, {} connected",
            id,
            participant.identity().name,
            self.members.len() + 1
        );
        self.members.insert(
            id,
            Member {
                participant,
                outbox,
            },
        );
    }

    fn leave(&mut self, id: ParticipantId) {
        if let Some(member) = self.members.remove(&id) {
            debug!(
                "Participant {} ({}) left, {} connected",
                id,
                member.participant.identity().name,
                self.members.len()
            );
        }
    }

    fn forward(&mut self, from: Option<ParticipantId>, message: &Arc<ChatMessage>) {
        trace!("Message from {}: {}", message.sender_name, message.body);

        let mut evicted = Vec::new();
        for (id, member) in &self.members {
            if self.config.exclude_sender && from == Some(*id) {
                continue;
            }
            match member.outbox.try_send(Arc::clone(message)) {
                Ok(()) => trace!(" -- delivered to {id}"),
                Err(TrySendError::Full(_)) => {
                    warn!("Outbox of {id} is full, evicting slow participant");
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Outbox of {id} is gone, removing participant");
                    evicted.push(*id);
                }
            }
        }

        for id in evicted {
            self.members.remove(&id);
        }
    }
}
