//! The server side of one connection.
//!
//! Ingress, outermost first:
//!
//! ```text
//! logger → well-formed → connect gate → release ids → QoS policy → control → subscriptions → router
//! ```
//!
//! Egress, outermost first:
//!
//! ```text
//! close on disconnect → maximum QoS → assign ids → logger → sender
//! ```

use std::cmp;
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::mqtt::id_pool::{AssignIds, ReleaseIds};
use crate::mqtt::keep_alive::KeepAlive;
use crate::mqtt::middleware::{combine_in, combine_out, handler_fn, DynHandler, In, Out, PacketLogger};
use crate::mqtt::receiver::{ReadTimeout, Receiver};
use crate::mqtt::router::{Router, Subscription};
use crate::mqtt::sender::Sender;
use crate::mqtt::socket::MqttSocket;
use crate::mqtt::topic::{Filter, TopicName};
use crate::mqtt::{Error, IdPool};
use crate::protocol::{
    Ack, ConnAck, Connect, Disconnect, Packet, Property, QoS, ReasonCode, SubAck, Subscribe,
    UnsubAck, Unsubscribe,
};

/// How long we try to get a `DISCONNECT` out before closing anyway.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the middlewares of one session share.
pub struct SessionState {
    pub id: SessionId,
    pub remote_addr: SocketAddr,
    client_id: OnceLock<String>,
    connected: AtomicBool,
    /// Set once a `DISCONNECT` was received or sent.
    disconnected: AtomicBool,
    pub max_qos: QoS,
    /// Identifiers for the publishes delivered to this session.
    pub pool: Arc<IdPool>,
    /// Cancelled when the session must end.
    pub token: CancellationToken,
    pub read_timeout: ReadTimeout,
    pub span: Span,
}

impl SessionState {
    pub fn new(
        id: SessionId,
        remote_addr: SocketAddr,
        config: &BrokerConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            remote_addr,
            client_id: OnceLock::new(),
            connected: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            // QoS 2 flows aren't implemented, whatever the config says.
            max_qos: cmp::min(config.max_qos, QoS::AtLeastOnce),
            pool: Arc::new(IdPool::new(config.pool_size, config.id_timeout)),
            token,
            // Until the client has connected, the whole CONNECT must arrive within this.
            read_timeout: ReadTimeout::new(Some(config.connect_timeout)),
            span: tracing::info_span!(
                "session",
                %id,
                %remote_addr,
                client = tracing::field::Empty
            ),
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.get().map(String::as_str)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn set_connected(&self, client_id: String) {
        self.span.record("client", short_id(&client_id).as_str());

        if self.client_id.set(client_id).is_err() {
            tracing::warn!("BUG: client ID set twice");
        }

        self.connected.store(true, Ordering::Release);
    }

    fn set_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.token.cancel();
    }

    /// The reason to close the session with, given how the receiver loop ended.
    fn close_reason(&self, res: &Result<(), Error>) -> Option<ReasonCode> {
        let Err(e) = res else {
            return None;
        };

        if let Some(reason) = e.disconnect_reason() {
            return Some(reason);
        }

        match e {
            Error::ReadTimeout if self.is_connected() => Some(ReasonCode::KEEP_ALIVE_TIMEOUT),
            Error::Cancelled if self.is_connected() && !self.is_disconnected() => {
                Some(ReasonCode::SERVER_SHUTTING_DOWN)
            }
            _ => None,
        }
    }
}

/// `~` and the last 5 characters of `client_id`, to tell sessions apart in logs.
pub fn short_id(client_id: &str) -> String {
    let start = client_id
        .char_indices()
        .rev()
        .nth(4)
        .map_or(0, |(idx, _)| idx);

    format!("~{}", &client_id[start..])
}

pub struct Session {
    state: Arc<SessionState>,
    config: Arc<BrokerConfig>,
    router: Arc<Router>,
}

impl Session {
    pub fn new(state: Arc<SessionState>, config: Arc<BrokerConfig>, router: Arc<Router>) -> Self {
        Self {
            state,
            config,
            router,
        }
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Drive the connection until either side closes it.
    ///
    /// Protocol violations, keep alive timeouts and shutdowns are reported to the client with a
    /// `DISCONNECT` before the connection is closed.
    pub async fn run(self, socket: impl MqttSocket) -> Result<(), Error> {
        let span = self.state.span.clone();
        self.run_inner(socket).instrument(span).await
    }

    async fn run_inner(self, socket: impl MqttSocket) -> Result<(), Error> {
        let state = &self.state;
        let (reader, writer) = socket.into_split();

        let sender = Arc::new(Sender::new(writer));
        let egress = self.egress(&sender);
        let ingress = self.ingress(&egress);

        let mut receiver = Receiver::new(
            reader,
            self.config.max_packet_size,
            state.read_timeout.clone(),
        );

        let res = receiver.run(ingress, &state.token).await;

        if let Some(reason) = state.close_reason(&res) {
            let mut disconnect = Disconnect::new(reason);

            if let Err(Error::Disconnect { message, .. }) = &res {
                disconnect
                    .properties
                    .push(Property::ReasonString(message.clone()));
            }

            // The session token may already be cancelled.
            let token = CancellationToken::new();

            match tokio::time::timeout(
                DISCONNECT_TIMEOUT,
                egress.handle(&token, Packet::Disconnect(disconnect)),
            )
            .await
            {
                Ok(Ok(())) => (),
                Ok(Err(e)) => tracing::debug!("failed to send DISCONNECT: {e}"),
                Err(_) => tracing::debug!("timed out sending DISCONNECT"),
            }
        }

        // Stops deliveries already in flight to this session.
        state.token.cancel();

        let removed = self.router.remove_session(state.id).await;
        tracing::debug!(removed, "subscriptions removed");

        sender.close().await;

        match res {
            Ok(()) => {
                tracing::info!("connection closed by peer");
                Ok(())
            }
            Err(Error::Cancelled) => {
                tracing::info!("session ended");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn egress(&self, sender: &Arc<Sender>) -> DynHandler {
        combine_out(
            sender.handler(),
            &[
                &CloseOnDisconnect(self.state.clone()),
                &MaxQos(self.state.max_qos),
                &AssignIds(self.state.pool.clone()),
                &PacketLogger::sending(self.state.span.clone()),
            ],
        )
    }

    fn ingress(&self, egress: &DynHandler) -> DynHandler {
        let base = {
            let router = self.router.clone();

            handler_fn(move |_token, packet| {
                let router = router.clone();
                async move { route(&router, packet).await }
            })
        };

        combine_in(
            base,
            &[
                &PacketLogger::received(self.state.span.clone()),
                &WellFormed,
                &ConnectGate(self.state.clone()),
                &ReleaseIds(self.state.pool.clone()),
                &QosPolicy {
                    max: self.state.max_qos,
                    egress: egress.clone(),
                },
                &Control {
                    state: self.state.clone(),
                    max_keep_alive: self.config.max_keep_alive,
                    egress: egress.clone(),
                },
                &Subscriptions {
                    state: self.state.clone(),
                    router: self.router.clone(),
                    egress: egress.clone(),
                },
            ],
        )
    }
}

async fn route(router: &Router, packet: Packet) -> Result<(), Error> {
    match packet {
        Packet::Publish(publish) => {
            if let Err(e) = TopicName::parse(&publish.topic) {
                disconnect!(TOPIC_NAME_INVALID, "invalid topic name: {e}");
            }

            let delivered = router.route(&publish).await;
            tracing::trace!(topic = %publish.topic, delivered, "publish routed");

            Ok(())
        }
        Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
            disconnect!(PROTOCOL_ERROR, "{} can only be sent by a server", packet.kind());
        }
        // Acknowledgements were handled on the way in, QoS 2 flows are declined.
        _ => Ok(()),
    }
}

/// Rejects packets that fail [`Packet::validate()`].
struct WellFormed;

impl In for WellFormed {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        handler_fn(move |token, packet| {
            let next = next.clone();

            async move {
                if let Err(e) = packet.validate() {
                    disconnect!(MALFORMED_PACKET, "{} failed validation: {e}", packet.kind());
                }

                next.handle(&token, packet).await
            }
        })
    }
}

/// The first packet must be a `CONNECT`, and only the first.
struct ConnectGate(Arc<SessionState>);

impl In for ConnectGate {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        let state = self.0.clone();

        handler_fn(move |token, packet| {
            let state = state.clone();
            let next = next.clone();

            async move {
                let is_connect = matches!(packet, Packet::Connect(_));

                match (state.is_connected(), is_connect) {
                    (false, false) => {
                        disconnect!(PROTOCOL_ERROR, "expected CONNECT, got {}", packet.kind());
                    }
                    // The Server MUST process a second CONNECT packet sent from a Client as a
                    // Protocol Error and close the Network Connection [MQTT-3.1.0-2].
                    (true, true) => disconnect!(PROTOCOL_ERROR, "second CONNECT"),
                    _ => next.handle(&token, packet).await,
                }
            }
        })
    }
}

/// Enforces the maximum QoS on inbound publishes and acknowledges QoS 1 publishes.
struct QosPolicy {
    max: QoS,
    egress: DynHandler,
}

impl In for QosPolicy {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        let max = self.max;
        let egress = self.egress.clone();

        handler_fn(move |token, packet| {
            let next = next.clone();
            let egress = egress.clone();

            async move {
                let Packet::Publish(publish) = &packet else {
                    return next.handle(&token, packet).await;
                };

                let (qos, packet_id) = (publish.qos, publish.packet_id);

                if qos > max {
                    disconnect!(
                        QOS_NOT_SUPPORTED,
                        "QoS {} exceeds the maximum of {}",
                        qos as u8,
                        max as u8
                    );
                }

                next.handle(&token, packet).await?;

                if qos == QoS::AtLeastOnce {
                    egress
                        .handle(&token, Packet::PubAck(Ack::new(packet_id)))
                        .await?;
                }

                Ok(())
            }
        })
    }
}

/// `CONNECT`, `PINGREQ` and `DISCONNECT`.
struct Control {
    state: Arc<SessionState>,
    max_keep_alive: KeepAlive,
    egress: DynHandler,
}

impl In for Control {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        let state = self.state.clone();
        let max_keep_alive = self.max_keep_alive;
        let egress = self.egress.clone();

        handler_fn(move |token, packet| {
            let state = state.clone();
            let next = next.clone();
            let egress = egress.clone();

            async move {
                match packet {
                    Packet::Connect(connect) => {
                        let connack = handle_connect(&state, max_keep_alive, connect);
                        egress.handle(&token, Packet::ConnAck(connack)).await
                    }
                    Packet::PingReq => egress.handle(&token, Packet::PingResp).await,
                    Packet::Disconnect(disconnect) => {
                        tracing::info!(reason = %disconnect.reason, "client disconnected");
                        state.set_disconnected();
                        Ok(())
                    }
                    packet => next.handle(&token, packet).await,
                }
            }
        })
    }
}

fn handle_connect(state: &SessionState, max_keep_alive: KeepAlive, connect: Connect) -> ConnAck {
    let mut connack = ConnAck::new(ReasonCode::SUCCESS);

    // https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901059
    let client_id = if connect.client_id.is_empty() {
        let assigned = Uuid::new_v4().to_string();

        connack
            .properties
            .push(Property::AssignedClientIdentifier(assigned.clone()));

        assigned
    } else {
        connect.client_id
    };

    let requested = KeepAlive::from_seconds(connect.keep_alive);
    let keep_alive = requested.with_max(max_keep_alive);

    if keep_alive != requested {
        connack
            .properties
            .push(Property::ServerKeepAlive(keep_alive.as_seconds()));
    }

    state.read_timeout.set(keep_alive.as_timeout());
    state.set_connected(client_id);

    tracing::info!(
        client_id = state.client_id(),
        clean_start = connect.clean_start,
        %keep_alive,
        "client connected"
    );

    connack
}

/// `SUBSCRIBE` and `UNSUBSCRIBE`.
struct Subscriptions {
    state: Arc<SessionState>,
    router: Arc<Router>,
    egress: DynHandler,
}

impl In for Subscriptions {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        let state = self.state.clone();
        let router = self.router.clone();
        let egress = self.egress.clone();

        handler_fn(move |token, packet| {
            let state = state.clone();
            let router = router.clone();
            let egress = egress.clone();
            let next = next.clone();

            async move {
                let reply = match packet {
                    Packet::Subscribe(subscribe) => {
                        Packet::SubAck(subscribe_all(&state, &router, &egress, subscribe).await?)
                    }
                    Packet::Unsubscribe(unsubscribe) => {
                        Packet::UnsubAck(unsubscribe_all(&state, &router, unsubscribe).await?)
                    }
                    packet => return next.handle(&token, packet).await,
                };

                egress.handle(&token, reply).await
            }
        })
    }
}

async fn subscribe_all(
    state: &SessionState,
    router: &Router,
    egress: &DynHandler,
    subscribe: Subscribe,
) -> Result<SubAck, Error> {
    // Check every filter before touching the router.
    let mut filters = Vec::with_capacity(subscribe.filters.len());

    for filter in &subscribe.filters {
        match filter.path.parse::<Filter>() {
            Ok(parsed) => filters.push((parsed, filter.qos)),
            Err(e) => disconnect!(MALFORMED_PACKET, "invalid topic filter {:?}: {e}", filter.path),
        }
    }

    let subscription = Arc::new(Subscription {
        session: state.id,
        subscription_id: subscribe.properties.subscription_id(),
        token: state.token.clone(),
        handler: egress.clone(),
    });

    let mut reasons = Vec::with_capacity(filters.len());

    for (filter, requested) in filters {
        let granted = cmp::min(requested, state.max_qos);

        router.subscribe(&filter, granted, subscription.clone()).await;
        tracing::debug!(%filter, qos = granted as u8, "subscribed");

        reasons.push(ReasonCode::granted(granted));
    }

    Ok(SubAck {
        packet_id: subscribe.packet_id,
        reasons,
        ..Default::default()
    })
}

async fn unsubscribe_all(
    state: &SessionState,
    router: &Router,
    unsubscribe: Unsubscribe,
) -> Result<UnsubAck, Error> {
    if let Some(Err(e)) = unsubscribe
        .filters
        .iter()
        .map(|filter| filter.parse::<Filter>())
        .find(Result::is_err)
    {
        disconnect!(MALFORMED_PACKET, "invalid topic filter: {e}");
    }

    let mut reasons = Vec::with_capacity(unsubscribe.filters.len());

    for filter in &unsubscribe.filters {
        let reason = if router.unsubscribe(state.id, filter).await {
            tracing::debug!(%filter, "unsubscribed");
            ReasonCode::SUCCESS
        } else {
            ReasonCode::NO_SUBSCRIPTION_EXISTED
        };

        reasons.push(reason);
    }

    Ok(UnsubAck {
        packet_id: unsubscribe.packet_id,
        reasons,
        ..Default::default()
    })
}

/// Advertises the maximum QoS in the `CONNACK`.
struct MaxQos(QoS);

impl Out for MaxQos {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        let max = self.0;

        handler_fn(move |token, mut packet| {
            let next = next.clone();

            // If the Server does not support QoS 1 or QoS 2 PUBLISH packets it MUST send a
            // Maximum QoS in the CONNACK packet specifying the highest QoS it supports [MQTT-3.2.2-9].
            if let Packet::ConnAck(connack) = &mut packet {
                if max < QoS::ExactlyOnce {
                    connack.properties.replace(Property::MaximumQos(max as u8), |it| {
                        matches!(it, Property::MaximumQos(_))
                    });
                }
            }

            async move { next.handle(&token, packet).await }
        })
    }
}

/// Ends the session once a `DISCONNECT` has been written.
struct CloseOnDisconnect(Arc<SessionState>);

impl Out for CloseOnDisconnect {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        let state = self.0.clone();

        handler_fn(move |token, packet| {
            let state = state.clone();
            let next = next.clone();

            async move {
                let is_disconnect = matches!(packet, Packet::Disconnect(_));

                next.handle(&token, packet).await?;

                if is_disconnect {
                    state.set_disconnected();
                }

                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids() {
        assert_eq!(short_id("0c8f6a7e-2b31-4a4f-9e1a-5a8c3d2b1f09"), "~b1f09");
        assert_eq!(short_id("abc"), "~abc");
        assert_eq!(short_id(""), "~");
        assert_eq!(short_id("ääääää"), "~äääää");
    }

    #[test]
    fn close_reasons() {
        let config = BrokerConfig::default();
        let state = SessionState::new(
            SessionId(1),
            "127.0.0.1:1883".parse().unwrap(),
            &config,
            CancellationToken::new(),
        );

        // Not connected yet: timeouts and shutdowns just close.
        assert_eq!(state.close_reason(&Err(Error::ReadTimeout)), None);
        assert_eq!(state.close_reason(&Err(Error::Cancelled)), None);
        assert_eq!(
            state.close_reason(&Err(Error::Disconnect {
                reason: ReasonCode::PROTOCOL_ERROR,
                message: "expected CONNECT".into()
            })),
            Some(ReasonCode::PROTOCOL_ERROR)
        );

        state.set_connected("client".into());
        assert_eq!(state.client_id(), Some("client"));

        assert_eq!(
            state.close_reason(&Err(Error::ReadTimeout)),
            Some(ReasonCode::KEEP_ALIVE_TIMEOUT)
        );
        assert_eq!(
            state.close_reason(&Err(Error::Cancelled)),
            Some(ReasonCode::SERVER_SHUTTING_DOWN)
        );
        assert_eq!(state.close_reason(&Ok(())), None);

        state.set_disconnected();
        assert!(state.token.is_cancelled());
        assert_eq!(state.close_reason(&Err(Error::Cancelled)), None);
    }

    #[test]
    fn connect_assigns_client_id() {
        let config = BrokerConfig::default();
        let state = SessionState::new(
            SessionId(1),
            "127.0.0.1:1883".parse().unwrap(),
            &config,
            CancellationToken::new(),
        );

        let mut connect = Connect::new("");
        connect.keep_alive = 0;

        let connack = handle_connect(&state, KeepAlive::from_seconds(60), connect);

        let assigned = connack.properties.assigned_client_id().unwrap();
        assert_eq!(state.client_id(), Some(assigned));
        assert!(Uuid::parse_str(assigned).is_ok());
        assert_eq!(connack.properties.server_keep_alive(), Some(60));
        assert_eq!(state.read_timeout.get(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn connect_keeps_client_id() {
        let config = BrokerConfig::default();
        let state = SessionState::new(
            SessionId(1),
            "127.0.0.1:1883".parse().unwrap(),
            &config,
            CancellationToken::new(),
        );

        let mut connect = Connect::new("sensor-1");
        connect.keep_alive = 10;

        let connack = handle_connect(&state, KeepAlive::from_seconds(60), connect);

        assert_eq!(connack.reason, ReasonCode::SUCCESS);
        assert_eq!(connack.properties.assigned_client_id(), None);
        assert_eq!(connack.properties.server_keep_alive(), None);
        assert_eq!(state.client_id(), Some("sensor-1"));
        assert_eq!(state.read_timeout.get(), Some(Duration::from_secs(15)));
    }
}
