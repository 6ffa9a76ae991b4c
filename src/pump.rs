//! Bridges one WebSocket to the hub: an inbound task turns frames into
//! forward intents and an outbound task drains the participant's outbox
//! onto the socket. Whichever stops first ends the connection.

use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use warp::ws::Message;

use crate::auth::Identity;
use crate::hub::{HubError, HubHandle, Outbox, Participant};
use crate::messages::{ChatMessage, ClientMessage};

#[derive(Error, Debug)]
pub enum PumpError {
    #[error("transport read failed: {0}")]
    Read(String),
    #[error("transport write failed: {0}")]
    Write(String),
    #[error("undecodable frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("message body of {0} bytes exceeds the limit")]
    TooLong(usize),
    #[error("no traffic for {0:?}")]
    Idle(Duration),
    #[error("message could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("pump task failed: {0}")]
    Task(#[from] JoinError),
    #[error(transparent)]
    Hub(#[from] HubError),
}

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub outbox_capacity: NonZeroUsize,
    pub idle_timeout: Option<Duration>,
    pub max_body_len: usize,
    /// How long the writer may keep flushing after the peer has gone.
    pub drain_timeout: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        PumpConfig {
            outbox_capacity: NonZeroUsize::new(256).unwrap_or(NonZeroUsize::MIN),
            idle_timeout: None,
            max_body_len: 4096,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a connection ended.
#[derive(Debug)]
pub enum Disconnect {
    /// The hub was gone before the participant could join.
    HubStopped,
    /// The peer closed the socket, went quiet, or sent something unreadable.
    Inbound(Result<(), PumpError>),
    /// The hub closed the outbox or a write to the socket failed.
    Outbound(Result<(), PumpError>),
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::HubStopped => write!(f, "hub stopped"),
            Disconnect::Inbound(Ok(())) => write!(f, "peer closed"),
            Disconnect::Inbound(Err(e)) => write!(f, "inbound: {e}"),
            Disconnect::Outbound(Ok(())) => write!(f, "removed by hub"),
            Disconnect::Outbound(Err(e)) => write!(f, "outbound: {e}"),
        }
    }
}

#[derive(Clone)]
pub struct Pump {
    hub: HubHandle,
    config: PumpConfig,
}

impl Pump {
    pub fn new(hub: HubHandle, config: PumpConfig) -> Self {
        Pump { hub, config }
    }

    /// Joins the hub as `identity`, runs both directions until one of them
    /// stops, then leaves. Leave is sent exactly once per call.
    pub async fn run<R, W, E>(&self, identity: Identity, reader: R, writer: W) -> Disconnect
    where
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: fmt::Display + Send + 'static,
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: fmt::Display + Send,
    {
        let participant = Participant::new(identity);
        let id = participant.id();
        let (outbox_tx, outbox) = mpsc::channel(self.config.outbox_capacity.get());

        if self.hub.join(participant.clone(), outbox_tx).await.is_err() {
            return Disconnect::HubStopped;
        }
        info!("Participant {} connected as {}", id, participant.identity().name);

        let mut inbound = tokio::spawn(read_loop(
            reader,
            participant,
            self.hub.clone(),
            self.config.clone(),
        ));
        let mut outbound = tokio::spawn(write_loop(writer, outbox));

        let reason = tokio::select! {
            res = &mut inbound => Disconnect::Inbound(res.unwrap_or_else(|e| Err(e.into()))),
            res = &mut outbound => Disconnect::Outbound(res.unwrap_or_else(|e| Err(e.into()))),
        };

        if let Err(e) = self.hub.leave(id).await {
            // A stopped hub has already closed every outbox.
            debug!("Leave for {id} not delivered: {e}");
        }

        if matches!(reason, Disconnect::Inbound(_)) {
            // The outbox is closed now; let the writer flush what is left,
            // unless the transport stopped accepting writes.
            match tokio::time::timeout(self.config.drain_timeout, &mut outbound).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("Outbound task for {id} failed: {e}"),
                Err(_) => {
                    debug!("Outbound task for {id} still flushing, aborting");
                    outbound.abort();
                }
            }
        } else {
            inbound.abort();
        }

        info!("Participant {id} disconnected: {reason}");
        reason
    }
}

async fn read_loop<R, E>(
    mut reader: R,
    participant: Participant,
    hub: HubHandle,
    config: PumpConfig,
) -> Result<(), PumpError>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let next = match config.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, reader.next())
                .await
                .map_err(|_| PumpError::Idle(limit))?,
            None => reader.next().await,
        };

        let frame = match next {
            None => return Ok(()),
            Some(Err(e)) => return Err(PumpError::Read(e.to_string())),
            Some(Ok(frame)) => frame,
        };
        if frame.is_close() {
            return Ok(());
        }
        if frame.is_ping() || frame.is_pong() {
            continue;
        }

        let incoming: ClientMessage =
            serde_json::from_slice(frame.as_bytes()).map_err(PumpError::Decode)?;
        if incoming.body.len() > config.max_body_len {
            return Err(PumpError::TooLong(incoming.body.len()));
        }

        let message = ChatMessage::stamp(incoming.body, participant.identity(), Utc::now());
        hub.forward(Some(participant.id()), message).await?;
    }
}

async fn write_loop<W>(mut writer: W, mut outbox: Outbox) -> Result<(), PumpError>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    while let Some(message) = outbox.recv().await {
        let text = serde_json::to_string(&*message).map_err(PumpError::Encode)?;
        writer
            .send(Message::text(text))
            .await
            .map_err(|e| PumpError::Write(e.to_string()))?;
    }
    if let Err(e) = writer.close().await {
        debug!("Closing transport failed: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, HubConfig, ParticipantId};
    use futures::channel::mpsc as transport;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    type Frames = transport::UnboundedSender<Result<Message, String>>;
    type Written = transport::UnboundedReceiver<Message>;

    struct Peer {
        frames: Frames,
        written: Written,
        task: JoinHandle<Disconnect>,
    }

    fn connect(pump: &Pump, name: &str) -> Peer {
        let (frames, reader) = transport::unbounded();
        let (writer, written) = transport::unbounded();
        let pump = pump.clone();
        let identity = Identity::new(name, format!("/avatars/{name}"));
        let task = tokio::spawn(async move { pump.run(identity, reader, writer).await });
        Peer {
            frames,
            written,
            task,
        }
    }

    async fn wait_for_members(hub: &HubHandle, count: usize) -> Vec<ParticipantId> {
        timeout(WAIT, async {
            loop {
                let members = hub.members().await.unwrap();
                if members.len() == count {
                    return members;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap()
    }

    async fn next_written(written: &mut Written) -> ChatMessage {
        let frame = timeout(WAIT, written.next()).await.unwrap().unwrap();
        serde_json::from_str(frame.to_str().unwrap()).unwrap()
    }

    fn text(body: &str) -> Result<Message, String> {
        Ok(Message::text(body.to_string()))
    }

    fn setup(config: PumpConfig) -> (HubHandle, Pump) {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        (hub.clone(), Pump::new(hub, config))
    }

    #[tokio::test]
    async fn inbound_messages_are_stamped_by_the_server() {
        let (hub, pump) = setup(PumpConfig::default());
        let mut alice = connect(&pump, "alice");
        let mut bob = connect(&pump, "bob");
        wait_for_members(&hub, 2).await;

        let before = Utc::now();
        alice
            .frames
            .unbounded_send(text(
                r#"{"body":"hi","senderName":"mallory","senderAvatarURL":"x","sentAt":"1999-01-01T00:00:00Z"}"#,
            ))
            .unwrap();

        for peer in [&mut alice, &mut bob] {
            let message = next_written(&mut peer.written).await;
            assert_eq!(message.body, "hi");
            assert_eq!(message.sender_name, "alice");
            assert_eq!(message.sender_avatar_url, "/avatars/alice");
            assert!(message.sent_at >= before);
        }
    }

    #[tokio::test]
    async fn control_frames_are_skipped() {
        let (hub, pump) = setup(PumpConfig::default());
        let mut alice = connect(&pump, "alice");
        wait_for_members(&hub, 1).await;

        alice.frames.unbounded_send(Ok(Message::ping(Vec::new()))).unwrap();
        alice
            .frames
            .unbounded_send(Ok(Message::binary(br#"{"body":"bin"}"#.to_vec())))
            .unwrap();

        assert_eq!(next_written(&mut alice.written).await.body, "bin");
    }

    #[tokio::test]
    async fn peer_close_leaves_the_hub() {
        let (hub, pump) = setup(PumpConfig::default());
        let alice = connect(&pump, "alice");
        wait_for_members(&hub, 1).await;

        drop(alice.frames);

        let reason = timeout(WAIT, alice.task).await.unwrap().unwrap();
        assert!(matches!(reason, Disconnect::Inbound(Ok(()))));
        assert!(hub.members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_frame_leaves_the_hub() {
        let (hub, pump) = setup(PumpConfig::default());
        let alice = connect(&pump, "alice");
        wait_for_members(&hub, 1).await;

        alice.frames.unbounded_send(Ok(Message::close())).unwrap();

        let reason = timeout(WAIT, alice.task).await.unwrap().unwrap();
        assert!(matches!(reason, Disconnect::Inbound(Ok(()))));
        assert!(hub.members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_frame_ends_the_connection() {
        let (hub, pump) = setup(PumpConfig::default());
        let alice = connect(&pump, "alice");
        wait_for_members(&hub, 1).await;

        alice.frames.unbounded_send(text("not json")).unwrap();

        let reason = timeout(WAIT, alice.task).await.unwrap().unwrap();
        assert!(matches!(reason, Disconnect::Inbound(Err(PumpError::Decode(_)))));
        assert!(hub.members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_error_ends_the_connection() {
        let (hub, pump) = setup(PumpConfig::default());
        let alice = connect(&pump, "alice");
        wait_for_members(&hub, 1).await;

        alice
            .frames
            .unbounded_send(Err("connection reset".to_string()))
            .unwrap();

        let reason = timeout(WAIT, alice.task).await.unwrap().unwrap();
        assert!(matches!(reason, Disconnect::Inbound(Err(PumpError::Read(_)))));
        assert!(hub.members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_body_ends_the_connection() {
        let (hub, pump) = setup(PumpConfig {
            max_body_len: 4,
            ..PumpConfig::default()
        });
        let alice = connect(&pump, "alice");
        wait_for_members(&hub, 1).await;

        alice.frames.unbounded_send(text(r#"{"body":"too long"}"#)).unwrap();

        let reason = timeout(WAIT, alice.task).await.unwrap().unwrap();
        assert!(matches!(
            reason,
            Disconnect::Inbound(Err(PumpError::TooLong(8)))
        ));
    }

    #[tokio::test]
    async fn write_failure_ends_an_idle_connection() {
        let (hub, pump) = setup(PumpConfig::default());
        // The peer never sends anything; only the write side can notice.
        let quiet = connect(&pump, "quiet");
        let mut talker = connect(&pump, "talker");
        wait_for_members(&hub, 2).await;

        drop(quiet.written);
        talker.frames.unbounded_send(text(r#"{"body":"hello?"}"#)).unwrap();

        let reason = timeout(WAIT, quiet.task).await.unwrap().unwrap();
        assert!(matches!(reason, Disconnect::Outbound(Err(PumpError::Write(_)))));
        assert_eq!(wait_for_members(&hub, 1).await.len(), 1);
        assert_eq!(next_written(&mut talker.written).await.body, "hello?");
        drop(quiet.frames);
    }

    #[tokio::test]
    async fn removal_by_hub_ends_the_connection() {
        let (hub, pump) = setup(PumpConfig::default());
        let alice = connect(&pump, "alice");
        let members = wait_for_members(&hub, 1).await;

        hub.leave(members[0]).await.unwrap();

        let reason = timeout(WAIT, alice.task).await.unwrap().unwrap();
        assert!(matches!(reason, Disconnect::Outbound(Ok(()))));
        drop(alice.frames);
    }

    #[tokio::test]
    async fn idle_peer_times_out() {
        let (hub, pump) = setup(PumpConfig {
            idle_timeout: Some(Duration::from_millis(20)),
            ..PumpConfig::default()
        });
        let alice = connect(&pump, "alice");

        let reason = timeout(WAIT, alice.task).await.unwrap().unwrap();
        assert!(matches!(reason, Disconnect::Inbound(Err(PumpError::Idle(_)))));
        assert!(hub.members().await.unwrap().is_empty());
        drop(alice.frames);
    }

    #[tokio::test]
    async fn stopped_hub_refuses_the_connection() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        hub.shutdown();
        task.await.unwrap();
        let pump = Pump::new(hub, PumpConfig::default());

        let alice = connect(&pump, "alice");
        let reason = timeout(WAIT, alice.task).await.unwrap().unwrap();
        assert!(matches!(reason, Disconnect::HubStopped));
    }

    #[tokio::test]
    async fn stalled_writer_does_not_hold_up_disconnect() {
        let (hub, pump) = setup(PumpConfig {
            drain_timeout: Duration::from_millis(50),
            ..PumpConfig::default()
        });
        let (frames, reader) = transport::unbounded::<Result<Message, String>>();
        // Never read from, so the second write blocks forever.
        let (writer, _stalled) = transport::channel::<Message>(0);
        let task = {
            let pump = pump.clone();
            tokio::spawn(async move {
                pump.run(Identity::new("alice", ""), reader, writer).await
            })
        };
        wait_for_members(&hub, 1).await;

        for n in 0..5 {
            let message = ChatMessage::stamp(
                format!("m{n}"),
                &Identity::new("bob", ""),
                Utc::now(),
            );
            hub.forward(None, message).await.unwrap();
        }
        hub.members().await.unwrap();
        drop(frames);

        let reason = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(reason, Disconnect::Inbound(Ok(()))));
        assert!(hub.members().await.unwrap().is_empty());
    }
}
