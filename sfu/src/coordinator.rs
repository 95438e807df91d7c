use std::sync::{Arc, OnceLock};

use derivative::Derivative;
use enclose::enc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use crate::{
    config::CoordinatorConfig,
    connection::ConnectionTable,
    engine::{DtlsState, EngineRouter, MediaEngine, RtpCapabilities},
    error::{EngineErrorKind, Error, NotFoundErrorKind, ProtocolOrderErrorKind},
    peer::{PeerDetails, PeerSession, PeerTable},
    registry::{ConsumerRecord, ProducerRecord, Registry, TransportRecord},
    room::{Room, RoomRegistry},
    signaling::message::ServerMessage,
};

/// Everything guarded by the coordinator mutex.
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) rooms: RoomRegistry,
    pub(crate) peers: PeerTable,
    pub(crate) transports: Registry<TransportRecord>,
    pub(crate) producers: Registry<ProducerRecord>,
    pub(crate) consumers: Registry<ConsumerRecord>,
    pub(crate) connections: ConnectionTable,
}

impl State {
    pub(crate) fn peer(&self, connection_id: &str) -> Result<&PeerSession, Error> {
        self.peers.get(connection_id).ok_or_else(|| not_joined(connection_id))
    }

    pub(crate) fn router_of(&self, connection_id: &str) -> Result<Arc<dyn EngineRouter>, Error> {
        let peer = self.peer(connection_id)?;
        self.rooms
            .get(&peer.room_name)
            .map(|room| room.router.clone())
            .ok_or_else(|| {
                Error::new_not_found(
                    format!("Room {} is not found", peer.room_name),
                    NotFoundErrorKind::RoomNotFoundError,
                )
            })
    }

    /// Removes the room when it has no members left and garbage collection is enabled.
    pub(crate) fn collect_room(
        &mut self,
        room_name: &str,
        close_empty_rooms: bool,
    ) -> Option<Arc<dyn EngineRouter>> {
        if !close_empty_rooms {
            return None;
        }
        let empty = self
            .rooms
            .get(room_name)
            .map(|room| room.members().is_empty())?;
        if !empty {
            return None;
        }
        let room = self.rooms.remove(room_name)?;
        tracing::info!("Room {} is empty and removed", room_name);
        Some(room.router)
    }
}

pub(crate) fn not_joined(connection_id: &str) -> Error {
    Error::new_protocol_order(
        format!("Connection {} has not joined a room", connection_id),
        ProtocolOrderErrorKind::NotJoinedError,
    )
}

/// Counts of every registry, for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub rooms: usize,
    pub peers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

/// Events raised by engine handles, processed one at a time by the coordinator event loop.
#[derive(Debug)]
pub(crate) enum CoordinatorEvent {
    TransportDtlsStateChanged(String, DtlsState),
    TransportClosed(String),
    ProducerTransportClosed(String),
    ConsumerTransportClosed(String),
    ConsumerProducerClosed(String),
    EngineDied(String),
    Barrier(oneshot::Sender<()>),
    Closed,
}

/// Stops the event loop when the last handle handed out by [`Coordinator::new`] is dropped.
#[derive(Debug)]
struct LoopGuard {
    event_sender: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        let _ = self.event_sender.send(CoordinatorEvent::Closed);
    }
}

/// Coordinator owns every room, peer and engine resource of the process. It is cheap to clone
/// and every clone drives the same state. Dropping the last clone stops the event loop but leaves
/// routers open, call [`Coordinator::close`] to release them.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Coordinator {
    pub(crate) state: Arc<Mutex<State>>,
    #[derivative(Debug = "ignore")]
    pub(crate) engine: Arc<dyn MediaEngine>,
    pub(crate) config: Arc<CoordinatorConfig>,
    pub(crate) event_sender: mpsc::UnboundedSender<CoordinatorEvent>,
    failure_sender: broadcast::Sender<String>,
    failure: Arc<OnceLock<String>>,
    // Only handles outside the event loop carry it.
    #[derivative(Debug = "ignore")]
    guard: Option<Arc<LoopGuard>>,
}

impl Coordinator {
    /// Must be called inside a tokio runtime, because the event loop is spawned here.
    pub fn new(engine: Arc<dyn MediaEngine>, config: CoordinatorConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<CoordinatorEvent>();
        let (failure_sender, _) = broadcast::channel(4);
        let failure = Arc::new(OnceLock::new());

        engine.on_died(Box::new(enc!((tx, failure) move |reason: String| {
            let _ = failure.set(reason.clone());
            if let Err(err) = tx.send(CoordinatorEvent::EngineDied(reason)) {
                tracing::error!("Failed to send EngineDied event: {}", err);
            }
        })));

        let coordinator = Self {
            state: Arc::new(Mutex::new(State::default())),
            engine,
            config: Arc::new(config),
            guard: Some(Arc::new(LoopGuard {
                event_sender: tx.clone(),
            })),
            event_sender: tx,
            failure_sender,
            failure,
        };

        {
            let copied = Self {
                guard: None,
                ..coordinator.clone()
            };
            tokio::spawn(async move {
                copied.coordinator_event_loop(rx).await;
            });
        }

        tracing::debug!("Coordinator is created");
        coordinator
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    async fn coordinator_event_loop(
        &self,
        mut event_receiver: mpsc::UnboundedReceiver<CoordinatorEvent>,
    ) {
        tracing::debug!("Coordinator event loop started");
        while let Some(event) = event_receiver.recv().await {
            match event {
                CoordinatorEvent::TransportDtlsStateChanged(transport_id, state) => {
                    tracing::debug!("Transport {} dtls state is {}", transport_id, state);
                    if state == DtlsState::Closed {
                        self.on_transport_dtls_closed(&transport_id).await;
                    }
                }
                CoordinatorEvent::TransportClosed(transport_id) => {
                    self.on_transport_closed(&transport_id).await;
                }
                CoordinatorEvent::ProducerTransportClosed(producer_id) => {
                    self.on_producer_transport_closed(&producer_id).await;
                }
                CoordinatorEvent::ConsumerTransportClosed(consumer_id) => {
                    self.on_consumer_transport_closed(&consumer_id).await;
                }
                CoordinatorEvent::ConsumerProducerClosed(consumer_id) => {
                    self.on_consumer_producer_closed(&consumer_id).await;
                }
                CoordinatorEvent::EngineDied(reason) => {
                    tracing::error!("Media engine died: {}", reason);
                    if let Err(err) = self.failure_sender.send(reason) {
                        tracing::warn!("Nobody is watching engine failures: {}", err);
                    }
                }
                CoordinatorEvent::Barrier(reply_sender) => {
                    // Events raised while handling earlier ones must be drained too.
                    if event_receiver.is_empty() {
                        let _ = reply_sender.send(());
                    } else if let Err(err) =
                        self.event_sender.send(CoordinatorEvent::Barrier(reply_sender))
                    {
                        tracing::error!("Failed to requeue barrier: {}", err);
                    }
                }
                CoordinatorEvent::Closed => {
                    break;
                }
            }
        }
        tracing::debug!("Coordinator event loop finished");
    }

    /// Waits until every engine event raised so far has been processed.
    pub async fn flush_events(&self) {
        let (tx, rx) = oneshot::channel();
        if self.event_sender.send(CoordinatorEvent::Barrier(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub(crate) fn emit(sender: &mpsc::UnboundedSender<CoordinatorEvent>, event: CoordinatorEvent) {
        if let Err(err) = sender.send(event) {
            tracing::error!("Failed to send coordinator event: {}", err);
        }
    }

    pub(crate) fn check_alive(&self) -> Result<(), Error> {
        match self.failure.get() {
            Some(reason) => Err(Error::new_engine(
                format!("Media engine died: {}", reason),
                EngineErrorKind::EngineDiedError,
            )),
            None => Ok(()),
        }
    }

    /// Subscribes to engine failure broadcasts.
    pub fn engine_failures(&self) -> broadcast::Receiver<String> {
        self.failure_sender.subscribe()
    }

    /// The reason the engine died, if it has.
    pub fn engine_failure(&self) -> Option<String> {
        self.failure.get().cloned()
    }

    /// Registers the outbound channel of a new signaling connection.
    pub async fn register_connection(
        &self,
        connection_id: &str,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) {
        let mut state = self.state.lock().await;
        state.connections.register(connection_id.to_owned(), sender);
        tracing::debug!("Connection {} is registered", connection_id);
    }

    pub async fn join_room(
        &self,
        connection_id: &str,
        room_name: &str,
    ) -> Result<RtpCapabilities, Error> {
        self.join_room_as(connection_id, room_name, PeerDetails::default())
            .await
    }

    /// Joins `room_name`, creating its router on first use. A connection that is already in a
    /// room leaves it first.
    pub async fn join_room_as(
        &self,
        connection_id: &str,
        room_name: &str,
        details: PeerDetails,
    ) -> Result<RtpCapabilities, Error> {
        self.check_alive()?;

        let existing = {
            let state = self.state.lock().await;
            if !state.connections.contains(connection_id) {
                return Err(connection_not_found(connection_id));
            }
            if state.peers.contains(connection_id) {
                None
            } else {
                Some(state.rooms.get(room_name).map(|room| room.router.clone()))
            }
        };

        let existing = match existing {
            Some(existing) => existing,
            None => {
                tracing::debug!("Connection {} re-joins, reclaiming first", connection_id);
                self.reclaim(connection_id, false, Some(room_name)).await;
                let state = self.state.lock().await;
                state.rooms.get(room_name).map(|room| room.router.clone())
            }
        };

        let created = match existing {
            Some(_) => None,
            None => Some(self.engine.create_router(&self.config.media).await?),
        };

        let mut state = self.state.lock().await;
        let current = state.rooms.get(room_name).map(|room| room.router.clone());
        let router = match (current, created) {
            (Some(router), Some(loser)) => {
                tracing::debug!(
                    "Room {} was created concurrently, closing router {}",
                    room_name,
                    loser.id()
                );
                loser.close();
                router
            }
            (Some(router), None) => router,
            (None, Some(router)) => {
                tracing::info!("Room {} is created with router {}", room_name, router.id());
                state
                    .rooms
                    .insert(Room::new(room_name.to_owned(), router.clone()));
                router
            }
            (None, None) => {
                return Err(Error::new_not_found(
                    format!("Room {} was removed while joining", room_name),
                    NotFoundErrorKind::RoomNotFoundError,
                ));
            }
        };

        if !state.connections.contains(connection_id) {
            let collected = state.collect_room(room_name, self.config.close_empty_rooms);
            drop(state);
            if let Some(router) = collected {
                router.close();
            }
            return Err(connection_not_found(connection_id));
        }

        if let Some(room) = state.rooms.get_mut(room_name) {
            room.add_member(connection_id);
        }
        let mut session = PeerSession::new(connection_id.to_owned(), room_name.to_owned());
        session.details = details;
        if let Some(previous) = state.peers.insert(session) {
            // Another join of the same connection finished while we awaited the engine.
            if previous.room_name != room_name {
                if let Some(room) = state.rooms.get_mut(&previous.room_name) {
                    room.remove_member(connection_id);
                }
            }
        }
        tracing::info!("Connection {} joined room {}", connection_id, room_name);

        Ok(router.rtp_capabilities())
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().await;
        Snapshot {
            rooms: state.rooms.len(),
            peers: state.peers.len(),
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
        }
    }

    pub async fn room_router_id(&self, room_name: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.rooms.get(room_name).map(|room| room.router.id())
    }

    pub async fn room_members(&self, room_name: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .rooms
            .get(room_name)
            .map(|room| room.members().to_vec())
            .unwrap_or_default()
    }

    pub async fn peer(&self, connection_id: &str) -> Option<PeerSession> {
        let state = self.state.lock().await;
        state.peers.get(connection_id).cloned()
    }

    /// Closes every router and stops the event loop.
    pub async fn close(&self) {
        let rooms = {
            let mut state = self.state.lock().await;
            state.rooms.drain()
        };
        for room in rooms {
            room.router.close();
        }
        self.flush_events().await;
        Self::emit(&self.event_sender, CoordinatorEvent::Closed);
        tracing::debug!("Coordinator is closed");
    }
}

fn connection_not_found(connection_id: &str) -> Error {
    Error::new_not_found(
        format!("Connection {} is not registered", connection_id),
        NotFoundErrorKind::PeerNotFoundError,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::WorkerConfig, engine::loopback::LoopbackEngine};
    use std::time::Duration;

    async fn coordinator(latency: Duration) -> (Coordinator, Arc<LoopbackEngine>) {
        let engine = LoopbackEngine::with_latency(WorkerConfig::default(), latency);
        let coordinator = Coordinator::new(engine.clone(), CoordinatorConfig::default());
        (coordinator, engine)
    }

    async fn connect(coordinator: &Coordinator, id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        coordinator.register_connection(id, tx).await;
        rx
    }

    #[tokio::test]
    async fn dropping_last_handle_releases_state() {
        let (coordinator, _engine) = coordinator(Duration::ZERO).await;
        let _a = connect(&coordinator, "a").await;
        coordinator.join_room("a", "x").await.unwrap();
        let second = coordinator.clone();
        let state = Arc::downgrade(&coordinator.state);

        drop(coordinator);
        second.flush_events().await;
        assert!(state.upgrade().is_some());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), async {
            while state.upgrade().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let (coordinator, engine) = coordinator(Duration::ZERO).await;
        let _a = connect(&coordinator, "a").await;
        let _b = connect(&coordinator, "b").await;

        let caps = coordinator.join_room("a", "x").await.unwrap();
        assert_eq!(caps.codecs.len(), 2);
        let router_id = coordinator.room_router_id("x").await.unwrap();

        coordinator.join_room("a", "x").await.unwrap();
        coordinator.join_room("b", "x").await.unwrap();
        assert_eq!(coordinator.room_router_id("x").await.unwrap(), router_id);
        assert_eq!(engine.router_count(), 1);
        assert_eq!(
            coordinator.room_members("x").await,
            vec!["a".to_owned(), "b".to_owned()]
        );
    }

    #[tokio::test]
    async fn concurrent_joins_share_one_router() {
        let (coordinator, engine) = coordinator(Duration::from_millis(20)).await;
        let _a = connect(&coordinator, "a").await;
        let _b = connect(&coordinator, "b").await;

        let (first, second) = tokio::join!(
            coordinator.join_room("a", "x"),
            coordinator.join_room("b", "x")
        );
        first.unwrap();
        second.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.router_count(), 1);
        assert_eq!(coordinator.snapshot().await.rooms, 1);
        assert_eq!(coordinator.room_members("x").await.len(), 2);
    }

    #[tokio::test]
    async fn join_requires_registered_connection() {
        let (coordinator, _engine) = coordinator(Duration::ZERO).await;
        let err = coordinator.join_room("ghost", "x").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn rejoin_moves_between_rooms() {
        let (coordinator, _engine) = coordinator(Duration::ZERO).await;
        let _a = connect(&coordinator, "a").await;

        coordinator.join_room("a", "x").await.unwrap();
        coordinator.join_room("a", "y").await.unwrap();

        assert!(coordinator.room_members("x").await.is_empty());
        assert_eq!(coordinator.room_members("y").await, vec!["a".to_owned()]);
        assert_eq!(coordinator.peer("a").await.unwrap().room_name, "y");
        assert_eq!(coordinator.snapshot().await.rooms, 2);
    }

    #[tokio::test]
    async fn engine_death_is_broadcast_and_fatal() {
        let (coordinator, engine) = coordinator(Duration::ZERO).await;
        let _a = connect(&coordinator, "a").await;
        let mut failures = coordinator.engine_failures();

        engine.kill("worker exited");
        let reason = tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, "worker exited");

        let err = coordinator.join_room("a", "x").await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(coordinator.engine_failure().as_deref(), Some("worker exited"));
    }

    #[tokio::test]
    async fn close_closes_routers() {
        let (coordinator, engine) = coordinator(Duration::ZERO).await;
        let _a = connect(&coordinator, "a").await;
        coordinator.join_room("a", "x").await.unwrap();
        let router_id = coordinator.room_router_id("x").await.unwrap();
        let router = engine.router(&router_id).unwrap();

        coordinator.close().await;
        assert!(router.closed());
        assert_eq!(coordinator.snapshot().await.rooms, 0);
    }
}
