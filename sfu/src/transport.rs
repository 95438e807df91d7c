use std::sync::Arc;

use enclose::enc;
use serde::Serialize;

use crate::{
    coordinator::{Coordinator, CoordinatorEvent, State},
    engine::{DtlsParameters, EngineTransport, IceCandidate, IceParameters},
    error::{Error, NotFoundErrorKind, ProtocolOrderErrorKind},
    registry::{Direction, TransportRecord, TransportState},
};

/// What a client needs to build its side of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl State {
    /// The most recently created send transport of the connection.
    pub(crate) fn send_transport(&self, connection_id: &str) -> Option<&TransportRecord> {
        let peer = self.peers.get(connection_id)?;
        peer.transport_ids
            .iter()
            .rev()
            .filter_map(|id| self.transports.get(id))
            .find(|transport| transport.direction == Direction::Send)
    }

    /// Drops a transport from the registry and from its owner's session.
    pub(crate) fn deregister_transport(&mut self, transport_id: &str) -> Option<TransportRecord> {
        let record = self.transports.remove(transport_id)?;
        if let Some(peer) = self.peers.get_mut(&record.connection_id) {
            peer.forget_transport(transport_id);
        }
        Some(record)
    }
}

fn transport_not_found(message: String) -> Error {
    Error::new_not_found(message, NotFoundErrorKind::TransportNotFoundError)
}

impl Coordinator {
    /// Creates a WebRTC transport on the router of the caller's room.
    pub async fn create_transport(
        &self,
        connection_id: &str,
        direction: Direction,
    ) -> Result<TransportParameters, Error> {
        self.check_alive()?;

        let (router, room_name) = {
            let state = self.state.lock().await;
            let router = state.router_of(connection_id)?;
            (router, state.peer(connection_id)?.room_name.clone())
        };

        let handle = router
            .create_webrtc_transport(&self.config.transport)
            .await?;
        let transport_id = handle.id();
        self.watch_transport(&handle);

        let mut state = self.state.lock().await;
        let still_joined = state
            .peers
            .get(connection_id)
            .map(|peer| peer.room_name == room_name)
            .unwrap_or(false);
        if !still_joined || handle.closed() {
            drop(state);
            handle.close();
            return Err(transport_not_found(format!(
                "Connection {} left before transport {} was ready",
                connection_id, transport_id
            )));
        }

        let parameters = TransportParameters {
            id: transport_id.clone(),
            ice_parameters: handle.ice_parameters(),
            ice_candidates: handle.ice_candidates(),
            dtls_parameters: handle.dtls_parameters(),
        };
        state.transports.insert(TransportRecord {
            id: transport_id.clone(),
            connection_id: connection_id.to_owned(),
            room_name,
            direction,
            state: TransportState::ParametersExchanged,
            handle,
        });
        if let Some(peer) = state.peers.get_mut(connection_id) {
            peer.transport_ids.push(transport_id.clone());
        }

        tracing::info!(
            "{} transport {} is created for connection_id={}",
            direction,
            transport_id,
            connection_id
        );
        Ok(parameters)
    }

    fn watch_transport(&self, handle: &Arc<dyn EngineTransport>) {
        let transport_id = handle.id();
        let event_sender = self.event_sender.clone();
        handle.on_dtls_state_change(Box::new(enc!((transport_id, event_sender) move |state| {
            Coordinator::emit(
                &event_sender,
                CoordinatorEvent::TransportDtlsStateChanged(transport_id.clone(), state),
            );
        })));
        handle.on_close(Box::new(enc!((transport_id, event_sender) move || {
            Coordinator::emit(
                &event_sender,
                CoordinatorEvent::TransportClosed(transport_id.clone()),
            );
        })));
    }

    /// Connects the most recently created send transport of the connection.
    pub async fn connect_send_transport(
        &self,
        connection_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), Error> {
        self.check_alive()?;

        let transport_id = {
            let state = self.state.lock().await;
            state.peer(connection_id)?;
            state
                .send_transport(connection_id)
                .map(|transport| transport.id.clone())
                .ok_or_else(|| {
                    transport_not_found(format!(
                        "Connection {} has no send transport",
                        connection_id
                    ))
                })?
        };

        self.connect_transport(connection_id, &transport_id, dtls_parameters)
            .await
    }

    /// Connects a receive transport the caller owns.
    pub async fn connect_recv_transport(
        &self,
        connection_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), Error> {
        self.check_alive()?;

        {
            let state = self.state.lock().await;
            state.peer(connection_id)?;
            let owned = state
                .transports
                .get(transport_id)
                .map(|t| t.connection_id == connection_id && t.direction == Direction::Receive)
                .unwrap_or(false);
            if !owned {
                return Err(transport_not_found(format!(
                    "Receive transport {} is not found for connection {}",
                    transport_id, connection_id
                )));
            }
        }

        self.connect_transport(connection_id, transport_id, dtls_parameters)
            .await
    }

    async fn connect_transport(
        &self,
        connection_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), Error> {
        let handle = {
            let state = self.state.lock().await;
            let transport = state.transports.get(transport_id).ok_or_else(|| {
                transport_not_found(format!("Transport {} is not found", transport_id))
            })?;
            match transport.state {
                TransportState::Connected => {
                    return Err(Error::new_protocol_order(
                        format!("Transport {} is already connected", transport_id),
                        ProtocolOrderErrorKind::TransportAlreadyConnectedError,
                    ));
                }
                TransportState::Closed => {
                    return Err(Error::new_protocol_order(
                        format!("Transport {} is closed", transport_id),
                        ProtocolOrderErrorKind::TransportClosedError,
                    ));
                }
                TransportState::ParametersExchanged => {}
            }
            transport.handle.clone()
        };

        handle.connect(dtls_parameters).await?;

        let mut state = self.state.lock().await;
        match state.transports.get_mut(transport_id) {
            Some(transport) if transport.state == TransportState::Closed => {
                Err(Error::new_protocol_order(
                    format!("Transport {} was closed while connecting", transport_id),
                    ProtocolOrderErrorKind::TransportClosedError,
                ))
            }
            Some(transport) => {
                transport.state = TransportState::Connected;
                tracing::info!(
                    "Transport {} is connected for connection_id={}",
                    transport_id,
                    connection_id
                );
                Ok(())
            }
            None => Err(transport_not_found(format!(
                "Transport {} was closed while connecting",
                transport_id
            ))),
        }
    }

    /// Marks the transport `Closed`, closes it on the engine, then drops the record.
    pub(crate) async fn on_transport_dtls_closed(&self, transport_id: &str) {
        let handle = {
            let mut state = self.state.lock().await;
            match state.transports.get_mut(transport_id) {
                Some(record) => {
                    record.state = TransportState::Closed;
                    record.handle.clone()
                }
                None => return,
            }
        };
        tracing::debug!("Transport {} dtls is closed, closing it", transport_id);
        handle.close();

        let mut state = self.state.lock().await;
        state.deregister_transport(transport_id);
    }

    pub(crate) async fn on_transport_closed(&self, transport_id: &str) {
        let mut state = self.state.lock().await;
        if state.deregister_transport(transport_id).is_some() {
            tracing::debug!("Transport {} is closed by the engine", transport_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{CoordinatorConfig, WorkerConfig},
        engine::{loopback::LoopbackEngine, DtlsFingerprint, DtlsRole, DtlsState},
        signaling::message::ServerMessage,
    };
    use tokio::sync::mpsc;

    fn client_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_owned(),
                value: "AB:CD".to_owned(),
            }],
        }
    }

    async fn joined(id: &str) -> (Coordinator, Arc<LoopbackEngine>, mpsc::UnboundedReceiver<ServerMessage>) {
        let engine = LoopbackEngine::new(WorkerConfig::default());
        let coordinator = Coordinator::new(engine.clone(), CoordinatorConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        coordinator.register_connection(id, tx).await;
        coordinator.join_room(id, "x").await.unwrap();
        (coordinator, engine, rx)
    }

    #[tokio::test]
    async fn create_before_join_is_rejected() {
        let engine = LoopbackEngine::new(WorkerConfig::default());
        let coordinator = Coordinator::new(engine, CoordinatorConfig::default());
        let err = coordinator
            .create_transport("a", Direction::Send)
            .await
            .unwrap_err();
        assert!(err.is_protocol_order());
    }

    #[tokio::test]
    async fn create_returns_announced_parameters() {
        let (coordinator, _engine, _rx) = joined("a").await;
        let params = coordinator
            .create_transport("a", Direction::Send)
            .await
            .unwrap();
        assert!(!params.ice_candidates.is_empty());
        assert!(params.ice_candidates.iter().all(|c| c.ip == "127.0.0.1"));
        assert_eq!(coordinator.peer("a").await.unwrap().transport_ids, vec![params.id.clone()]);

        let value = serde_json::to_value(&params).unwrap();
        assert!(value["iceParameters"]["usernameFragment"].is_string());
        assert!(value["dtlsParameters"]["fingerprints"].is_array());
    }

    #[tokio::test]
    async fn connect_targets_latest_send_transport() {
        let (coordinator, engine, _rx) = joined("a").await;
        let first = coordinator.create_transport("a", Direction::Send).await.unwrap();
        let second = coordinator.create_transport("a", Direction::Send).await.unwrap();
        coordinator
            .create_transport("a", Direction::Receive)
            .await
            .unwrap();

        coordinator
            .connect_send_transport("a", client_dtls())
            .await
            .unwrap();
        assert_eq!(engine.transport(&second.id).unwrap().dtls_state(), DtlsState::Connected);
        assert_eq!(engine.transport(&first.id).unwrap().dtls_state(), DtlsState::New);

        let err = coordinator
            .connect_send_transport("a", client_dtls())
            .await
            .unwrap_err();
        assert!(err.is_protocol_order());
    }

    #[tokio::test]
    async fn connect_send_without_transport_is_not_found() {
        let (coordinator, _engine, _rx) = joined("a").await;
        let err = coordinator
            .connect_send_transport("a", client_dtls())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn recv_connect_checks_owner_and_direction() {
        let (coordinator, _engine, _rx) = joined("a").await;
        let (tx, _b_rx) = mpsc::unbounded_channel();
        coordinator.register_connection("b", tx).await;
        coordinator.join_room("b", "x").await.unwrap();

        let send = coordinator.create_transport("a", Direction::Send).await.unwrap();
        let recv = coordinator.create_transport("a", Direction::Receive).await.unwrap();

        let err = coordinator
            .connect_recv_transport("a", &send.id, client_dtls())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let err = coordinator
            .connect_recv_transport("b", &recv.id, client_dtls())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        coordinator
            .connect_recv_transport("a", &recv.id, client_dtls())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dtls_closed_removes_transport() {
        let (coordinator, engine, _rx) = joined("a").await;
        let params = coordinator.create_transport("a", Direction::Send).await.unwrap();
        let transport = engine.transport(&params.id).unwrap();

        transport.set_dtls_state(DtlsState::Closed);
        coordinator.flush_events().await;

        assert!(transport.closed());
        assert_eq!(coordinator.snapshot().await.transports, 0);
        assert!(coordinator.peer("a").await.unwrap().transport_ids.is_empty());
    }
    #[tokio::test]
    async fn closed_transport_refuses_connect_and_consume() {
        let (coordinator, _engine, _rx) = joined("a").await;
        let recv = coordinator.create_transport("a", Direction::Receive).await.unwrap();
        coordinator
            .state
            .lock()
            .await
            .transports
            .get_mut(&recv.id)
            .unwrap()
            .state = TransportState::Closed;

        let closed = crate::error::ErrorKind::ProtocolOrderError(
            ProtocolOrderErrorKind::TransportClosedError,
        );
        let err = coordinator
            .connect_recv_transport("a", &recv.id, client_dtls())
            .await
            .unwrap_err();
        assert_eq!(err.kind, closed);
        let err = coordinator
            .consume(
                "a",
                crate::engine::RtpCapabilities::default(),
                "any-producer",
                &recv.id,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, closed);
    }
}
