//! The client side of a connection.
//!
//! Ingress, outermost first: `logger → release ids → control → application`.
//!
//! Egress, outermost first: `last sent → assign ids → logger → sender`.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::config::ClientConfig;
use crate::mqtt::id_pool::{AssignIds, IdPool, ReleaseIds};
use crate::mqtt::middleware::{combine_in, combine_out, handler_fn, DynHandler, In, Out, PacketLogger};
use crate::mqtt::receiver::{ReadTimeout, Receiver};
use crate::mqtt::sender::Sender;
use crate::mqtt::session::short_id;
use crate::mqtt::socket::{DirectSocket, MqttSocket};
use crate::mqtt::Error;
use crate::protocol::{
    Ack, Connect, Disconnect, Packet, Publish, QoS, ReasonCode, SubscribeFilter, Subscribe,
    Unsubscribe,
};

const PING_TICK: Duration = Duration::from_secs(1);

struct ClientState {
    assigned_client_id: OnceLock<String>,
    /// When the last packet was written.
    last_sent: Mutex<Instant>,
    span: Span,
}

impl ClientState {
    fn touch(&self) {
        *self.last_sent.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// A cheap handle for talking to the server, given to the application handler.
#[derive(Clone)]
pub struct ClientHandle {
    egress: DynHandler,
    token: CancellationToken,
    pool: Arc<IdPool>,
    state: Arc<ClientState>,
}

impl ClientHandle {
    /// Send `packet` through the egress chain.
    pub async fn send(&self, packet: Packet) -> Result<(), Error> {
        self.egress.handle(&self.token, packet).await
    }

    /// Publish `payload` to `topic`.
    ///
    /// At QoS 1 this doesn't wait for the `PUBACK`; the application handler receives it.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        qos: QoS,
        payload: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.send(Packet::Publish(Publish::new(topic, qos, payload)))
            .await
    }

    pub async fn subscribe(&self, filters: Vec<SubscribeFilter>) -> Result<(), Error> {
        self.send(Packet::Subscribe(Subscribe::new(0, filters)))
            .await
    }

    pub async fn unsubscribe(&self, filters: Vec<String>) -> Result<(), Error> {
        self.send(Packet::Unsubscribe(Unsubscribe::new(0, filters)))
            .await
    }

    /// Send a normal `DISCONNECT` and end the session.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let res = self
            .send(Packet::Disconnect(Disconnect::new(
                ReasonCode::NORMAL_DISCONNECTION,
            )))
            .await;

        self.token.cancel();
        res
    }

    /// The client identifier the server assigned, if we didn't send one.
    pub fn assigned_client_id(&self) -> Option<&str> {
        self.state.assigned_client_id.get().map(String::as_str)
    }

    pub fn pool(&self) -> &Arc<IdPool> {
        &self.pool
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves when the session has ended.
    pub async fn done(&self) {
        self.token.cancelled().await
    }
}

pub struct Client {
    handle: ClientHandle,
    receiver: JoinHandle<Result<(), Error>>,
    pinger: Option<JoinHandle<()>>,
}

impl Client {
    /// Dial `addr` (`host:port`) and [`start()`](Self::start) a session over the connection.
    pub async fn connect(
        addr: &str,
        config: ClientConfig,
        app: impl FnOnce(ClientHandle) -> DynHandler,
    ) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let remote_addr = stream.peer_addr()?;

        Self::start(DirectSocket::new(remote_addr, stream), config, app).await
    }

    /// Run a session over `socket`: send the `CONNECT` and hand every packet received to the
    /// handler built by `app`.
    ///
    /// The `CONNACK` goes to the application handler like everything else; the session
    /// may be used as soon as it arrives.
    pub async fn start(
        socket: impl MqttSocket,
        config: ClientConfig,
        app: impl FnOnce(ClientHandle) -> DynHandler,
    ) -> Result<Self, Error> {
        let span = tracing::info_span!(
            "client",
            remote_addr = %socket.remote_addr(),
            client = tracing::field::Empty
        );

        if !config.client_id.is_empty() {
            span.record("client", short_id(&config.client_id).as_str());
        }

        let (reader, writer) = socket.into_split();

        let sender = Arc::new(Sender::new(writer));
        let pool = Arc::new(IdPool::new(config.pool_size, config.id_timeout));
        let token = CancellationToken::new();

        let state = Arc::new(ClientState {
            assigned_client_id: OnceLock::new(),
            last_sent: Mutex::new(Instant::now()),
            span: span.clone(),
        });

        let egress = combine_out(
            sender.handler(),
            &[
                &LastSent(state.clone()),
                &AssignIds(pool.clone()),
                &PacketLogger::sending(span.clone()),
            ],
        );

        let handle = ClientHandle {
            egress: egress.clone(),
            token: token.clone(),
            pool: pool.clone(),
            state: state.clone(),
        };

        let ingress = combine_in(
            app(handle.clone()),
            &[
                &PacketLogger::received(span.clone()),
                &ReleaseIds(pool.clone()),
                &Control {
                    state: state.clone(),
                    egress: egress.clone(),
                },
            ],
        );

        let mut receiver = Receiver::new(reader, config.max_packet_size, ReadTimeout::default());

        let receiver = tokio::spawn({
            let token = token.clone();
            let sender = sender.clone();

            async move {
                let res = receiver.run(ingress, &token).await;

                token.cancel();
                sender.close().await;

                match res {
                    Ok(()) | Err(Error::Cancelled) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            .instrument(span.clone())
        });

        let mut connect = Connect::new(config.client_id);
        connect.clean_start = config.clean_start;
        connect.keep_alive = config.keep_alive.as_seconds();
        connect.username = config.username;
        connect.password = config.password.map(Bytes::from);

        if let Err(e) = handle.send(Packet::Connect(connect)).await {
            token.cancel();
            return Err(e);
        }

        let pinger = config.keep_alive.ping_after().map(|ping_after| {
            tokio::spawn(ping(handle.clone(), ping_after).instrument(span))
        });

        Ok(Self {
            handle,
            receiver,
            pinger,
        })
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Wait for the session to end, returning the error that ended it, if any.
    pub async fn wait(self) -> crate::Result<()> {
        let res = self.receiver.await.map_err(crate::map_join_error)?;

        self.handle.token.cancel();

        if let Some(pinger) = self.pinger {
            pinger.await.map_err(crate::map_join_error)?;
        }

        Ok(res?)
    }
}

/// Sends a `PINGREQ` whenever nothing else was sent for `ping_after`.
///
/// Idle time is checked once a second and rounded to whole seconds.
async fn ping(handle: ClientHandle, ping_after: Duration) {
    let mut ticker = tokio::time::interval(PING_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => (),
            _ = handle.token.cancelled() => break,
        }

        let idle = Duration::from_secs((handle.state.idle_for().as_millis() as u64 + 500) / 1000);

        if idle < ping_after {
            continue;
        }

        if let Err(e) = handle.send(Packet::PingReq).await {
            tracing::debug!("failed to send PINGREQ: {e}");

            if e.is_fatal() {
                handle.token.cancel();
                break;
            }
        }
    }
}

/// Egress: remembers when the last packet went out, for the pinger.
struct LastSent(Arc<ClientState>);

impl Out for LastSent {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        let state = self.0.clone();

        handler_fn(move |token, packet| {
            let state = state.clone();
            let next = next.clone();

            async move {
                next.handle(&token, packet).await?;
                state.touch();
                Ok(())
            }
        })
    }
}

/// Ingress: `CONNACK`, `DISCONNECT`, `PINGRESP`, and acknowledging QoS 1 publishes.
struct Control {
    state: Arc<ClientState>,
    egress: DynHandler,
}

impl In for Control {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        let state = self.state.clone();
        let egress = self.egress.clone();

        handler_fn(move |token, packet| {
            let state = state.clone();
            let egress = egress.clone();
            let next = next.clone();

            async move {
                match packet {
                    Packet::ConnAck(connack) => {
                        if let Some(assigned) = connack.properties.assigned_client_id() {
                            if state.assigned_client_id.set(assigned.to_string()).is_ok() {
                                state.span.record("client", short_id(assigned).as_str());
                            } else {
                                tracing::warn!(
                                    %assigned,
                                    "second CONNACK assigned a client ID; keeping the first"
                                );
                            }
                        }

                        let refused = connack.reason.is_error();

                        if refused {
                            tracing::warn!(reason = %connack.reason, "connection refused");
                        } else {
                            tracing::info!("connected");
                        }

                        next.handle(&token, Packet::ConnAck(connack)).await?;

                        if refused {
                            token.cancel();
                        }

                        Ok(())
                    }
                    Packet::Disconnect(disconnect) => {
                        tracing::info!(
                            reason = %disconnect.reason,
                            reason_string = disconnect.properties.reason_string(),
                            "disconnected by server"
                        );

                        let res = next.handle(&token, Packet::Disconnect(disconnect)).await;
                        token.cancel();
                        res
                    }
                    Packet::PingResp => Ok(()),
                    Packet::Publish(publish) if publish.qos == QoS::AtLeastOnce => {
                        let packet_id = publish.packet_id;

                        next.handle(&token, Packet::Publish(publish)).await?;

                        egress
                            .handle(&token, Packet::PubAck(Ack::new(packet_id)))
                            .await
                    }
                    packet => next.handle(&token, packet).await,
                }
            }
        })
    }
}
