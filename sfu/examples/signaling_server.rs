use std::env;
use std::sync::Arc;

use actix::{Actor, ActorContext, AsyncContext, Handler, Message, StreamHandler};
use actix_web::web::Data;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use actix_web_actors::ws;
use conclave::config::{CoordinatorConfig, WorkerConfig};
use conclave::coordinator::Coordinator;
use conclave::engine::loopback::LoopbackEngine;
use conclave::signaling::message::ServerMessage;
use conclave::signaling::session::SignalingSession;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let worker_config = WorkerConfig::from_env().map_err(std::io::Error::other)?;
    let config = CoordinatorConfig::from_env().map_err(std::io::Error::other)?;
    let grace = config.engine_failure_grace;

    let engine = LoopbackEngine::new(worker_config);
    let coordinator = Coordinator::new(engine, config);

    {
        let mut failures = coordinator.engine_failures();
        actix::spawn(async move {
            if let Ok(reason) = failures.recv().await {
                tracing::error!(
                    "media engine died: {}, exiting in {} ms",
                    reason,
                    grace.as_millis()
                );
                tokio::time::sleep(grace).await;
                std::process::exit(1);
            }
        });
    }

    let coordinator_data = Data::new(coordinator);
    let port = env::var("PORT").unwrap_or_else(|_| "4000".to_string());

    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .service(index)
            .app_data(coordinator_data.clone())
            .route("/mediasoup", web::get().to(socket))
    })
    .bind(format!("0.0.0.0:{}", port))?
    .run()
    .await
}

#[actix_web::get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body("healthy")
}

async fn socket(
    req: HttpRequest,
    coordinator: Data<Coordinator>,
    stream: web::Payload,
) -> impl Responder {
    let server = WebSocket::new(coordinator.get_ref().clone());
    ws::start(server, &req, stream)
}

struct WebSocket {
    coordinator: Coordinator,
    inbound: Option<mpsc::UnboundedSender<String>>,
    cancel: CancellationToken,
}

impl WebSocket {
    fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            inbound: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl Actor for WebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!("New WebSocket connection is started");
        let address = ctx.address();
        let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerMessage>();
        let (inbound_sender, mut inbound_receiver) = mpsc::unbounded_channel::<String>();
        self.inbound = Some(inbound_sender);

        actix::spawn(async move {
            while let Some(message) = outbound_receiver.recv().await {
                address.do_send(SendingMessage(message));
            }
        });

        let coordinator = self.coordinator.clone();
        let cancel = self.cancel.clone();
        actix::spawn(async move {
            let session = Arc::new(SignalingSession::open(coordinator, outbound_sender).await);

            // Disconnect must not wait for the frame in flight.
            {
                let session = session.clone();
                let cancel = cancel.clone();
                actix::spawn(async move {
                    cancel.cancelled().await;
                    session.close().await;
                });
            }

            loop {
                let text = tokio::select! {
                    _ = cancel.cancelled() => break,
                    text = inbound_receiver.recv() => text,
                };
                match text {
                    Some(text) => session.handle_text(&text).await,
                    None => break,
                }
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("The WebSocket connection is stopped");
        self.inbound = None;
        self.cancel.cancel();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WebSocket {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) => tracing::info!("pong received"),
            Ok(ws::Message::Text(text)) => match &self.inbound {
                Some(inbound) => {
                    if let Err(err) = inbound.send(text.to_string()) {
                        tracing::error!("failed to queue client message: {}", err);
                    }
                }
                None => tracing::warn!("message after close is ignored: {}", text),
            },
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(err) => {
                tracing::error!("websocket protocol error: {}", err);
                ctx.stop();
            }
            _ => (),
        }
    }
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
struct SendingMessage(ServerMessage);

impl Handler<SendingMessage> for WebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendingMessage, ctx: &mut Self::Context) -> Self::Result {
        tracing::debug!("sending message: {:?}", msg);
        match msg.0.to_text() {
            Ok(text) => ctx.text(text),
            Err(err) => tracing::error!("failed to serialize server message: {}", err),
        }
    }
}
