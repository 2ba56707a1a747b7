//! Handler table shared by the connections of one client or server
//!
//! Frames are dispatched on `(module_id, message_id)`. Frames without a
//! registered handler go to the default handler, or are dropped when there is
//! none. Handlers may be registered at any time before the connection is
//! served; registration after that point applies to subsequent frames.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::trace;

use crate::codec::RawCodec;
use crate::connection::Connection;
use crate::frame::Frame;

pub type ConnectHandler<C> =
    Arc<dyn Fn(Arc<Connection<C>>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type MessageHandler<C> =
    Arc<dyn Fn(Arc<Connection<C>>, Frame) -> BoxFuture<'static, ()> + Send + Sync>;

struct Handlers<C> {
    connect: Option<ConnectHandler<C>>,
    disconnect: Option<ConnectHandler<C>>,
    messages: HashMap<(u16, u16), MessageHandler<C>>,
    fallback: Option<MessageHandler<C>>,
}

impl<C> Default for Handlers<C> {
    fn default() -> Self {
        Self {
            connect: None,
            disconnect: None,
            messages: HashMap::new(),
            fallback: None,
        }
    }
}

/// Codec plus handler table.
pub struct ConnMux<C = RawCodec> {
    codec: C,
    handlers: RwLock<Handlers<C>>,
}

impl<C: Default> Default for ConnMux<C> {
    fn default() -> Self {
        Self::new(C::default())
    }
}

impl<C> ConnMux<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            handlers: RwLock::new(Handlers::default()),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }
}

impl<C> ConnMux<C>
where
    C: Send + Sync + 'static,
{
    pub fn connect_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.write().connect = Some(Arc::new(move |conn| handler(conn).boxed()));
    }

    pub fn disconnect_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.write().disconnect = Some(Arc::new(move |conn| handler(conn).boxed()));
    }

    /// Register the handler for one `(module_id, message_id)`; replaces any
    /// earlier handler for the same key.
    pub fn message_handler<F, Fut>(&self, module_id: u16, message_id: u16, handler: F)
    where
        F: Fn(Arc<Connection<C>>, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.write().messages.insert(
            (module_id, message_id),
            Arc::new(move |conn, frame| handler(conn, frame).boxed()),
        );
    }

    pub fn default_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection<C>>, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.write().fallback = Some(Arc::new(move |conn, frame| handler(conn, frame).boxed()));
    }

    /// Whether any handler at all has been registered.
    pub fn has_handlers(&self) -> bool {
        let handlers = self.handlers.read();
        handlers.connect.is_some()
            || handlers.disconnect.is_some()
            || handlers.fallback.is_some()
            || !handlers.messages.is_empty()
    }

    pub(crate) async fn handle_connect(&self, conn: &Arc<Connection<C>>) {
        let handler = self.handlers.read().connect.clone();
        if let Some(handler) = handler {
            handler(conn.clone()).await;
        }
    }

    pub(crate) async fn handle_disconnect(&self, conn: &Arc<Connection<C>>) {
        let handler = self.handlers.read().disconnect.clone();
        if let Some(handler) = handler {
            handler(conn.clone()).await;
        }
    }

    pub(crate) async fn handle_message(&self, conn: &Arc<Connection<C>>, frame: Frame) {
        let handler = {
            let handlers = self.handlers.read();
            handlers
                .messages
                .get(&frame.key())
                .or(handlers.fallback.as_ref())
                .cloned()
        };

        match handler {
            Some(handler) => handler(conn.clone(), frame).await,
            None => trace!(
                "Dropping frame {}:{} on connection {}, no handler",
                frame.module_id,
                frame.message_id,
                conn.id()
            ),
        }
    }
}
