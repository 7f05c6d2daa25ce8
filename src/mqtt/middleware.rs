//! Handlers and the middlewares that wrap them.
//!
//! A [`Handler`] consumes one packet. An [`In`] or [`Out`] middleware takes the next handler of its
//! chain and returns a new handler wrapping it, which may inspect or rewrite the packet, answer it
//! through the egress chain, swallow it, or pass it on.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::mqtt::Error;
use crate::protocol::Packet;

pub trait Handler: Send + Sync {
    fn handle<'a>(
        &'a self,
        token: &'a CancellationToken,
        packet: Packet,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

pub type DynHandler = Arc<dyn Handler>;

/// An ingress middleware, wrapping handlers of packets read from the connection.
pub trait In: Send + Sync {
    fn wrap(&self, next: DynHandler) -> DynHandler;
}

/// An egress middleware, wrapping handlers of packets about to be written to the connection.
pub trait Out: Send + Sync {
    fn wrap(&self, next: DynHandler) -> DynHandler;
}

/// `combine_in(base, [m1, m2, .., mk])` is `m1(m2(..mk(base)))`: packets pass through `m1` first.
pub fn combine_in(base: DynHandler, middlewares: &[&dyn In]) -> DynHandler {
    middlewares
        .iter()
        .rev()
        .fold(base, |next, middleware| middleware.wrap(next))
}

/// The egress counterpart of [`combine_in()`].
pub fn combine_out(base: DynHandler, middlewares: &[&dyn Out]) -> DynHandler {
    middlewares
        .iter()
        .rev()
        .fold(base, |next, middleware| middleware.wrap(next))
}

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CancellationToken, Packet) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        token: &'a CancellationToken,
        packet: Packet,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin((self.0)(token.clone(), packet))
    }
}

/// Turn a closure into a [`DynHandler`].
pub fn handler_fn<F, Fut>(f: F) -> DynHandler
where
    F: Fn(CancellationToken, Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A handler that drops every packet.
pub fn discard() -> DynHandler {
    handler_fn(|_, _| async { Ok(()) })
}

/// Logs every packet passing through at `debug`, inside the session's span.
///
/// Usable in both directions.
#[derive(Clone)]
pub struct PacketLogger {
    span: Span,
    message: &'static str,
}

impl PacketLogger {
    pub fn received(span: Span) -> Self {
        Self {
            span,
            message: "received",
        }
    }

    pub fn sending(span: Span) -> Self {
        Self {
            span,
            message: "sending",
        }
    }

    fn wrap_handler(&self, next: DynHandler) -> DynHandler {
        let this = self.clone();

        handler_fn(move |token, packet| {
            let next = next.clone();

            this.span.in_scope(|| {
                tracing::debug!(kind = %packet.kind(), ?packet, "{}", this.message);
            });

            async move { next.handle(&token, packet).await }
        })
    }
}

impl In for PacketLogger {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        self.wrap_handler(next)
    }
}

impl Out for PacketLogger {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        self.wrap_handler(next)
    }
}
