//! An engine that allocates routers, transports, producers and consumers and raises their events
//! like a real SFU worker would, without moving any media. Useful for tests and local signaling
//! development.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use derivative::Derivative;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    config::{MediaConfig, WebRtcTransportConfig, WorkerConfig},
    error::{EngineErrorKind, Error},
};

use super::{
    ConsumeOptions, DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, EngineConsumer,
    EngineProducer, EngineRouter, EngineTransport, IceCandidate, IceParameters, MediaEngine,
    MediaKind, OnCloseFn, OnDiedFn, OnDtlsStateChangeFn, Protocol, RtpCapabilities,
    RtpParameters,
};

type ProducerMap = Arc<Mutex<HashMap<String, Arc<LoopbackProducer>>>>;
type TransportList = Arc<Mutex<Vec<Weak<LoopbackTransport>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn died_error() -> Error {
    Error::new_engine(
        "Loopback engine has died".to_owned(),
        EngineErrorKind::EngineDiedError,
    )
}

#[derive(Debug)]
struct PortAllocator {
    min: u16,
    max: u16,
    next: AtomicU32,
}

impl PortAllocator {
    fn allocate(&self) -> u16 {
        let span = u32::from(self.max - self.min) + 1;
        let offset = self.next.fetch_add(1, Ordering::Relaxed) % span;
        self.min + offset as u16
    }
}

/// Owns the routers of this process, like a media worker.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct LoopbackEngine {
    routers: Arc<Mutex<HashMap<String, Arc<LoopbackRouter>>>>,
    transports: Arc<Mutex<HashMap<String, Weak<LoopbackTransport>>>>,
    ports: Arc<PortAllocator>,
    latency: Duration,
    dead: Arc<AtomicBool>,
    #[derivative(Debug = "ignore")]
    on_died_fns: Mutex<Vec<OnDiedFn>>,
    worker_event_sender: mpsc::UnboundedSender<WorkerEvent>,
}

impl LoopbackEngine {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        Self::with_latency(config, Duration::ZERO)
    }

    /// Every asynchronous engine call sleeps for `latency` before it completes.
    pub fn with_latency(config: WorkerConfig, latency: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let engine = Self {
            routers: Arc::new(Mutex::new(HashMap::new())),
            transports: Arc::new(Mutex::new(HashMap::new())),
            ports: Arc::new(PortAllocator {
                min: config.rtc_min_port,
                max: config.rtc_max_port.max(config.rtc_min_port),
                next: AtomicU32::new(0),
            }),
            latency,
            dead: Arc::new(AtomicBool::new(false)),
            on_died_fns: Mutex::new(Vec::new()),
            worker_event_sender: tx,
        };

        {
            let routers = engine.routers.clone();
            let transports = engine.transports.clone();
            tokio::spawn(async move {
                Self::worker_event_loop(routers, transports, rx).await;
            });
        }

        Arc::new(engine)
    }

    async fn worker_event_loop(
        routers: Arc<Mutex<HashMap<String, Arc<LoopbackRouter>>>>,
        transports: Arc<Mutex<HashMap<String, Weak<LoopbackTransport>>>>,
        mut event_receiver: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        while let Some(event) = event_receiver.recv().await {
            match event {
                WorkerEvent::RouterClosed(router_id) => {
                    lock(&routers).remove(&router_id);
                }
                WorkerEvent::TransportClosed(transport_id) => {
                    lock(&transports).remove(&transport_id);
                }
            }
        }
        tracing::debug!("Loopback worker event loop finished");
    }

    pub fn router(&self, router_id: &str) -> Option<Arc<LoopbackRouter>> {
        lock(&self.routers).get(router_id).cloned()
    }

    pub fn router_count(&self) -> usize {
        lock(&self.routers).len()
    }

    pub fn transport(&self, transport_id: &str) -> Option<Arc<LoopbackTransport>> {
        lock(&self.transports)
            .get(transport_id)
            .and_then(|transport| transport.upgrade())
    }

    /// Simulates the worker process dying.
    pub fn kill(&self, reason: &str) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!("Loopback engine died: {}", reason);
        for f in lock(&self.on_died_fns).iter() {
            f(reason.to_owned());
        }
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(
        &self,
        media_config: &MediaConfig,
    ) -> Result<Arc<dyn EngineRouter>, Error> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(died_error());
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let router = Arc::new(LoopbackRouter {
            id: Uuid::new_v4().to_string(),
            rtp_capabilities: RtpCapabilities::from_media_config(media_config),
            producers: Arc::new(Mutex::new(HashMap::new())),
            transports: Arc::new(Mutex::new(Vec::new())),
            engine_transports: self.transports.clone(),
            ports: self.ports.clone(),
            latency: self.latency,
            closed: AtomicBool::new(false),
            dead: self.dead.clone(),
            worker_event_sender: self.worker_event_sender.clone(),
        });
        lock(&self.routers).insert(router.id.clone(), router.clone());
        tracing::debug!("LoopbackRouter {} is created", router.id);
        Ok(router)
    }

    fn on_died(&self, f: OnDiedFn) {
        lock(&self.on_died_fns).push(f);
    }
}

#[derive(Debug)]
enum WorkerEvent {
    RouterClosed(String),
    TransportClosed(String),
}

#[derive(Debug)]
pub struct LoopbackRouter {
    pub id: String,
    rtp_capabilities: RtpCapabilities,
    producers: ProducerMap,
    transports: TransportList,
    engine_transports: Arc<Mutex<HashMap<String, Weak<LoopbackTransport>>>>,
    ports: Arc<PortAllocator>,
    latency: Duration,
    closed: AtomicBool,
    dead: Arc<AtomicBool>,
    worker_event_sender: mpsc::UnboundedSender<WorkerEvent>,
}

impl LoopbackRouter {
    pub fn producer_count(&self) -> usize {
        lock(&self.producers).len()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_usable(&self) -> Result<(), Error> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(died_error());
        }
        if self.closed() {
            return Err(Error::new_engine(
                format!("Router {} is closed", self.id),
                EngineErrorKind::RouterClosedError,
            ));
        }
        Ok(())
    }

    fn build_candidates(config: &WebRtcTransportConfig, port: u16) -> Vec<IceCandidate> {
        let ip = config.advertised_ip().to_string();
        let (udp_priority, tcp_priority) = if config.prefer_udp {
            (1076302079, 1076276479)
        } else {
            (1076276479, 1076302079)
        };
        let mut candidates = Vec::new();
        if config.enable_udp {
            candidates.push(IceCandidate {
                foundation: "udpcandidate".to_owned(),
                priority: udp_priority,
                ip: ip.clone(),
                protocol: Protocol::Udp,
                port,
                candidate_type: "host".to_owned(),
                tcp_type: None,
            });
        }
        if config.enable_tcp {
            candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_owned(),
                priority: tcp_priority,
                ip,
                protocol: Protocol::Tcp,
                port,
                candidate_type: "host".to_owned(),
                tcp_type: Some("passive".to_owned()),
            });
        }
        candidates
    }
}

#[async_trait]
impl EngineRouter for LoopbackRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.rtp_capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        match lock(&self.producers).get(producer_id) {
            Some(producer) => !consumable_codecs(&producer.rtp_parameters, rtp_capabilities)
                .codecs
                .is_empty(),
            None => {
                tracing::debug!(
                    "Router {} can not consume unknown producer {}",
                    self.id,
                    producer_id
                );
                false
            }
        }
    }

    async fn create_webrtc_transport(
        &self,
        config: &WebRtcTransportConfig,
    ) -> Result<Arc<dyn EngineTransport>, Error> {
        self.check_usable()?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
            self.check_usable()?;
        }

        let id = Uuid::new_v4().to_string();
        let port = self.ports.allocate();
        let transport = Arc::new(LoopbackTransport {
            id: id.clone(),
            ice_parameters: IceParameters {
                username_fragment: Uuid::new_v4().simple().to_string(),
                password: Uuid::new_v4().simple().to_string(),
                ice_lite: true,
            },
            ice_candidates: Self::build_candidates(config, port),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_owned(),
                    value: fingerprint(),
                }],
            },
            router_capabilities: self.rtp_capabilities.clone(),
            router_producers: self.producers.clone(),
            router_transports: Arc::downgrade(&self.transports),
            dtls_state: Mutex::new(DtlsState::New),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            on_dtls_state_change_fns: Mutex::new(Vec::new()),
            on_close_fns: Mutex::new(Vec::new()),
            latency: self.latency,
            dead: self.dead.clone(),
            worker_event_sender: self.worker_event_sender.clone(),
        });

        {
            let mut transports = lock(&self.transports);
            transports.retain(|t| t.upgrade().is_some_and(|t| !t.closed()));
            transports.push(Arc::downgrade(&transport));
        }
        lock(&self.engine_transports).insert(id, Arc::downgrade(&transport));
        tracing::debug!(
            "LoopbackTransport {} is created on router {} port={}",
            transport.id,
            self.id,
            port
        );
        Ok(transport)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports: Vec<_> = lock(&self.transports).drain(..).collect();
        for transport in transports.into_iter().filter_map(|t| t.upgrade()) {
            transport.close();
        }
        if let Err(err) = self
            .worker_event_sender
            .send(WorkerEvent::RouterClosed(self.id.clone()))
        {
            tracing::error!("Failed to send RouterClosed event id={}: {}", self.id, err);
        }
        tracing::debug!("LoopbackRouter {} is closed", self.id);
    }
}

impl Drop for LoopbackRouter {
    fn drop(&mut self) {
        tracing::debug!("LoopbackRouter {} is dropped", self.id);
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct LoopbackTransport {
    pub id: String,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    router_capabilities: RtpCapabilities,
    #[derivative(Debug = "ignore")]
    router_producers: ProducerMap,
    #[derivative(Debug = "ignore")]
    router_transports: Weak<Mutex<Vec<Weak<LoopbackTransport>>>>,
    dtls_state: Mutex<DtlsState>,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
    #[derivative(Debug = "ignore")]
    on_dtls_state_change_fns: Mutex<Vec<OnDtlsStateChangeFn>>,
    #[derivative(Debug = "ignore")]
    on_close_fns: Mutex<Vec<OnCloseFn>>,
    latency: Duration,
    dead: Arc<AtomicBool>,
    worker_event_sender: mpsc::UnboundedSender<WorkerEvent>,
}

impl LoopbackTransport {
    pub fn dtls_state(&self) -> DtlsState {
        *lock(&self.dtls_state)
    }

    /// Moves the DTLS state machine as if the remote peer did, and raises `dtlsstatechange`.
    pub fn set_dtls_state(&self, state: DtlsState) {
        *lock(&self.dtls_state) = state;
        for f in lock(&self.on_dtls_state_change_fns).iter() {
            f(state);
        }
    }

    fn check_usable(&self) -> Result<(), Error> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(died_error());
        }
        if self.closed() {
            return Err(Error::new_engine(
                format!("Transport {} is closed", self.id),
                EngineErrorKind::TransportClosedError,
            ));
        }
        Ok(())
    }

    async fn simulate_latency(&self) -> Result<(), Error> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
            self.check_usable()?;
        }
        Ok(())
    }
}

#[async_trait]
impl EngineTransport for LoopbackTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), Error> {
        self.check_usable()?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(Error::new_engine(
                "dtlsParameters without fingerprints".to_owned(),
                EngineErrorKind::InvalidParametersError,
            ));
        }
        if self.dtls_state() != DtlsState::New {
            return Err(Error::new_engine(
                format!("connect() already called on transport {}", self.id),
                EngineErrorKind::InvalidStateError,
            ));
        }
        self.set_dtls_state(DtlsState::Connecting);
        self.simulate_latency().await?;
        self.set_dtls_state(DtlsState::Connected);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, Error> {
        self.check_usable()?;
        if rtp_parameters.codecs.is_empty() {
            return Err(Error::new_engine(
                "rtpParameters without codecs".to_owned(),
                EngineErrorKind::InvalidParametersError,
            ));
        }
        for codec in rtp_parameters.codecs.iter() {
            if MediaKind::from_mime_type(&codec.mime_type) != Some(kind) {
                return Err(Error::new_engine(
                    format!("codec {} does not match kind {}", codec.mime_type, kind),
                    EngineErrorKind::InvalidParametersError,
                ));
            }
            if !self
                .router_capabilities
                .supports(&codec.mime_type, codec.clock_rate)
            {
                return Err(Error::new_engine(
                    format!("codec {} is not supported by the router", codec.mime_type),
                    EngineErrorKind::InvalidParametersError,
                ));
            }
        }
        self.simulate_latency().await?;

        let producer = Arc::new(LoopbackProducer {
            id: Uuid::new_v4().to_string(),
            kind,
            rtp_parameters,
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            on_transport_close_fns: Mutex::new(Vec::new()),
            router_producers: Arc::downgrade(&self.router_producers),
        });
        lock(&self.router_producers).insert(producer.id.clone(), producer.clone());
        {
            let mut producers = lock(&self.producers);
            producers.retain(|p| !p.closed());
            producers.push(producer.clone());
        }
        tracing::debug!(
            "LoopbackProducer {} kind={} is created on transport {}",
            producer.id,
            kind,
            self.id
        );
        Ok(producer)
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn EngineConsumer>, Error> {
        self.check_usable()?;
        let producer = lock(&self.router_producers)
            .get(&options.producer_id)
            .cloned()
            .ok_or_else(|| {
                Error::new_engine(
                    format!("Producer {} is not found", options.producer_id),
                    EngineErrorKind::ProducerClosedError,
                )
            })?;
        let rtp_parameters = consumable_codecs(&producer.rtp_parameters, &options.rtp_capabilities);
        if rtp_parameters.codecs.is_empty() {
            return Err(Error::new_engine(
                format!("Can not consume producer {}", producer.id),
                EngineErrorKind::InvalidParametersError,
            ));
        }
        self.simulate_latency().await?;
        if producer.closed() {
            return Err(Error::new_engine(
                format!("Producer {} is closed", producer.id),
                EngineErrorKind::ProducerClosedError,
            ));
        }

        let consumer = Arc::new(LoopbackConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(options.paused),
            closed: AtomicBool::new(false),
            producer: Arc::downgrade(&producer),
            on_transport_close_fns: Mutex::new(Vec::new()),
            on_producer_close_fns: Mutex::new(Vec::new()),
        });
        lock(&producer.consumers).push(Arc::downgrade(&consumer));
        {
            let mut consumers = lock(&self.consumers);
            consumers.retain(|c| !c.closed());
            consumers.push(consumer.clone());
        }
        tracing::debug!(
            "LoopbackConsumer {} is created for producer {} on transport {}",
            consumer.id,
            producer.id,
            self.id
        );
        Ok(consumer)
    }

    fn on_dtls_state_change(&self, f: OnDtlsStateChangeFn) {
        lock(&self.on_dtls_state_change_fns).push(f);
    }

    fn on_close(&self, f: OnCloseFn) {
        lock(&self.on_close_fns).push(f);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let producers: Vec<_> = lock(&self.producers).drain(..).collect();
        for producer in producers {
            producer.transport_closed();
        }
        let consumers: Vec<_> = lock(&self.consumers).drain(..).collect();
        for consumer in consumers {
            consumer.transport_closed();
        }
        if let Some(transports) = self.router_transports.upgrade() {
            lock(&transports).retain(|t| t.upgrade().is_some_and(|t| t.id != self.id));
        }
        for f in lock(&self.on_close_fns).iter() {
            f();
        }
        if let Err(err) = self
            .worker_event_sender
            .send(WorkerEvent::TransportClosed(self.id.clone()))
        {
            tracing::error!(
                "Failed to send TransportClosed event id={}: {}",
                self.id,
                err
            );
        }
        tracing::debug!("LoopbackTransport {} is closed", self.id);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        tracing::debug!("LoopbackTransport {} is dropped", self.id);
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct LoopbackProducer {
    pub id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    closed: AtomicBool,
    consumers: Mutex<Vec<Weak<LoopbackConsumer>>>,
    #[derivative(Debug = "ignore")]
    on_transport_close_fns: Mutex<Vec<OnCloseFn>>,
    #[derivative(Debug = "ignore")]
    router_producers: Weak<Mutex<HashMap<String, Arc<LoopbackProducer>>>>,
}

impl LoopbackProducer {
    /// Marks the producer closed and tells every consumer. Returns false if it was already closed.
    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(producers) = self.router_producers.upgrade() {
            lock(&producers).remove(&self.id);
        }
        let consumers: Vec<_> = lock(&self.consumers).drain(..).collect();
        for consumer in consumers.into_iter().filter_map(|c| c.upgrade()) {
            consumer.producer_closed();
        }
        true
    }

    fn transport_closed(&self) {
        if self.shutdown() {
            for f in lock(&self.on_transport_close_fns).iter() {
                f();
            }
        }
    }
}

impl EngineProducer for LoopbackProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn on_transport_close(&self, f: OnCloseFn) {
        lock(&self.on_transport_close_fns).push(f);
    }

    fn close(&self) {
        if self.shutdown() {
            tracing::debug!("LoopbackProducer {} is closed", self.id);
        }
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for LoopbackProducer {
    fn drop(&mut self) {
        tracing::debug!("LoopbackProducer {} is dropped", self.id);
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct LoopbackConsumer {
    pub id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    #[derivative(Debug = "ignore")]
    producer: Weak<LoopbackProducer>,
    #[derivative(Debug = "ignore")]
    on_transport_close_fns: Mutex<Vec<OnCloseFn>>,
    #[derivative(Debug = "ignore")]
    on_producer_close_fns: Mutex<Vec<OnCloseFn>>,
}

impl LoopbackConsumer {
    fn producer_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for f in lock(&self.on_producer_close_fns).iter() {
            f();
        }
    }

    fn transport_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.detach();
        for f in lock(&self.on_transport_close_fns).iter() {
            f();
        }
    }

    /// Stops the source producer from tracking this consumer.
    fn detach(&self) {
        if let Some(producer) = self.producer.upgrade() {
            lock(&producer.consumers).retain(|c| c.upgrade().is_some_and(|c| c.id != self.id));
        }
    }
}

#[async_trait]
impl EngineConsumer for LoopbackConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), Error> {
        if self.closed() {
            return Err(Error::new_engine(
                format!("Consumer {} is closed", self.id),
                EngineErrorKind::ConsumerClosedError,
            ));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn on_transport_close(&self, f: OnCloseFn) {
        lock(&self.on_transport_close_fns).push(f);
    }

    fn on_producer_close(&self, f: OnCloseFn) {
        lock(&self.on_producer_close_fns).push(f);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.detach();
            tracing::debug!("LoopbackConsumer {} is closed", self.id);
        }
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for LoopbackConsumer {
    fn drop(&mut self) {
        tracing::debug!("LoopbackConsumer {} is dropped", self.id);
    }
}

/// Producer codecs the consuming endpoint also understands.
fn consumable_codecs(producer: &RtpParameters, capabilities: &RtpCapabilities) -> RtpParameters {
    RtpParameters {
        mid: None,
        codecs: producer
            .codecs
            .iter()
            .filter(|codec| capabilities.supports(&codec.mime_type, codec.clock_rate))
            .cloned()
            .collect(),
        header_extensions: producer.header_extensions.clone(),
        encodings: producer.encodings.clone(),
        rtcp: producer.rtcp.clone(),
    }
}

/// Random sha-256 shaped fingerprint. Nothing ever verifies it.
fn fingerprint() -> String {
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    first
        .as_bytes()
        .iter()
        .chain(second.as_bytes().iter())
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::engine::RtpCodecParameters;

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_owned(),
                payload_type: 101,
                clock_rate: 90000,
                channels: None,
                parameters: Default::default(),
                rtcp_feedback: vec![],
            }],
            ..Default::default()
        }
    }

    fn client_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_owned(),
                value: "AA:BB".to_owned(),
            }],
        }
    }

    async fn router(engine: &LoopbackEngine) -> Arc<dyn EngineRouter> {
        engine
            .create_router(&MediaConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn transport_parameters_follow_config() {
        let engine = LoopbackEngine::new(WorkerConfig {
            rtc_min_port: 40000,
            rtc_max_port: 40001,
        });
        let router = router(&engine).await;
        let config = WebRtcTransportConfig::default();

        let first = router.create_webrtc_transport(&config).await.unwrap();
        let second = router.create_webrtc_transport(&config).await.unwrap();
        let third = router.create_webrtc_transport(&config).await.unwrap();

        let candidates = first.ice_candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].protocol, Protocol::Udp);
        assert_eq!(candidates[0].ip, "127.0.0.1");
        assert!(candidates[0].priority > candidates[1].priority);
        assert_eq!(candidates[0].port, 40000);
        assert_eq!(second.ice_candidates()[0].port, 40001);
        assert_eq!(third.ice_candidates()[0].port, 40000);
        assert_eq!(first.dtls_parameters().fingerprints[0].value.len(), 95);
        assert!(engine.transport(&first.id()).is_some());
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let engine = LoopbackEngine::new(WorkerConfig::default());
        let router = router(&engine).await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportConfig::default())
            .await
            .unwrap();

        let states = Arc::new(Mutex::new(Vec::new()));
        {
            let states = states.clone();
            transport.on_dtls_state_change(Box::new(move |state| lock(&states).push(state)));
        }
        transport.connect(client_dtls()).await.unwrap();
        assert_eq!(
            *lock(&states),
            vec![DtlsState::Connecting, DtlsState::Connected]
        );

        let err = transport.connect(client_dtls()).await.unwrap_err();
        assert_eq!(
            err.kind,
            crate::error::ErrorKind::EngineError(EngineErrorKind::InvalidStateError)
        );
    }

    #[tokio::test]
    async fn producer_close_reaches_consumers() {
        let engine = LoopbackEngine::new(WorkerConfig::default());
        let router = router(&engine).await;
        let config = WebRtcTransportConfig::default();
        let send = router.create_webrtc_transport(&config).await.unwrap();
        let recv = router.create_webrtc_transport(&config).await.unwrap();

        let producer = send
            .produce(MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        assert!(router.can_consume(&producer.id(), &router.rtp_capabilities()));
        assert!(!router.can_consume(&producer.id(), &RtpCapabilities::default()));

        let consumer = recv
            .consume(ConsumeOptions {
                producer_id: producer.id(),
                rtp_capabilities: router.rtp_capabilities(),
                paused: true,
            })
            .await
            .unwrap();
        assert!(consumer.paused());
        assert_eq!(consumer.kind(), MediaKind::Video);

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            consumer.on_producer_close(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }

        producer.close();
        producer.close();
        assert!(consumer.closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!router.can_consume(&producer.id(), &router.rtp_capabilities()));
    }

    #[tokio::test]
    async fn transport_close_reaches_producers() {
        let engine = LoopbackEngine::new(WorkerConfig::default());
        let router = router(&engine).await;
        let send = router
            .create_webrtc_transport(&WebRtcTransportConfig::default())
            .await
            .unwrap();
        let producer = send
            .produce(MediaKind::Video, vp8_parameters())
            .await
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            producer.on_transport_close(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        send.close();
        send.close();
        assert!(producer.closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(send.produce(MediaKind::Video, vp8_parameters()).await.is_err());
    }

    #[tokio::test]
    async fn produce_validates_codecs() {
        let engine = LoopbackEngine::new(WorkerConfig::default());
        let router = router(&engine).await;
        let send = router
            .create_webrtc_transport(&WebRtcTransportConfig::default())
            .await
            .unwrap();

        let err = send
            .produce(MediaKind::Audio, vp8_parameters())
            .await
            .unwrap_err();
        assert_eq!(
            err.kind,
            crate::error::ErrorKind::EngineError(EngineErrorKind::InvalidParametersError)
        );
        assert!(send
            .produce(MediaKind::Video, RtpParameters::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn killed_engine_refuses_work() {
        let engine = LoopbackEngine::new(WorkerConfig::default());
        let router = router(&engine).await;
        let reasons = Arc::new(Mutex::new(Vec::new()));
        {
            let reasons = reasons.clone();
            engine.on_died(Box::new(move |reason| lock(&reasons).push(reason)));
        }

        engine.kill("segfault");
        engine.kill("again");
        assert_eq!(*lock(&reasons), vec!["segfault".to_owned()]);

        let err = router
            .create_webrtc_transport(&WebRtcTransportConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(engine
            .create_router(&MediaConfig::default())
            .await
            .unwrap_err()
            .is_fatal());
    }

    #[tokio::test]
    async fn router_close_closes_transports() {
        let engine = LoopbackEngine::new(WorkerConfig::default());
        let router = router(&engine).await;
        let transport = router
            .create_webrtc_transport(&WebRtcTransportConfig::default())
            .await
            .unwrap();
        assert_eq!(engine.router_count(), 1);

        router.close();
        assert!(transport.closed());
        assert!(router
            .create_webrtc_transport(&WebRtcTransportConfig::default())
            .await
            .is_err());
    }
    #[tokio::test]
    async fn closed_children_are_forgotten() {
        let engine = LoopbackEngine::new(WorkerConfig::default());
        let router = router(&engine).await;
        let loopback_router = engine.router(&router.id()).unwrap();
        let config = WebRtcTransportConfig::default();
        let send = router.create_webrtc_transport(&config).await.unwrap();
        let recv = router.create_webrtc_transport(&config).await.unwrap();
        let spare = router.create_webrtc_transport(&config).await.unwrap();

        spare.close();
        assert_eq!(lock(&loopback_router.transports).len(), 2);

        let producer = send
            .produce(MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        let options = || ConsumeOptions {
            producer_id: producer.id(),
            rtp_capabilities: router.rtp_capabilities(),
            paused: true,
        };
        let first = recv.consume(options()).await.unwrap();
        recv.consume(options()).await.unwrap();
        let loopback_producer = lock(&loopback_router.producers)
            .get(&producer.id())
            .cloned()
            .unwrap();
        assert_eq!(lock(&loopback_producer.consumers).len(), 2);

        first.close();
        assert_eq!(lock(&loopback_producer.consumers).len(), 1);

        recv.close();
        assert!(lock(&loopback_producer.consumers).is_empty());
        assert_eq!(lock(&loopback_router.transports).len(), 1);
    }
}
