use std::{collections::HashMap, fmt, future::Future, marker::PhantomData, sync::Arc};

use async_trait::async_trait;

use crate::api::{message::ErrorReply, Message, Packet, PacketId};

/// Type name reported when no handler is registered for a request
pub const UNHANDLED_REQUEST: &str = "UnhandledRequest";

/// Failure of a request handler, sent back to the caller as an [`ErrorReply`]
///
/// Any error type converts into a `HandlerError`, which records its type name, its message and
/// the message of its source if there is one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    reply: ErrorReply,
}

impl HandlerError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reply: ErrorReply {
                type_name: type_name.into(),
                message: message.into(),
                cause: None,
            },
        }
    }

    pub fn unhandled(id: PacketId) -> Self {
        Self::new(UNHANDLED_REQUEST, format!("no handler for {} packets", id))
    }

    pub fn type_name(&self) -> &str {
        &self.reply.type_name
    }

    pub fn into_reply(self) -> ErrorReply {
        self.reply
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reply)?;

        if let Some(cause) = &self.reply.cause {
            write!(f, " ({})", cause)?;
        }

        Ok(())
    }
}

impl<E: std::error::Error + 'static> From<E> for HandlerError {
    fn from(error: E) -> Self {
        Self {
            reply: ErrorReply {
                type_name: std::any::type_name::<E>().to_owned(),
                message: error.to_string(),
                cause: error.source().map(|source| source.to_string()),
            },
        }
    }
}

/// Handler for one kind of inbound request
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Packet) -> Result<Packet, HandlerError>;
}

/// Request handlers of a transmitter, by packet identifier
#[derive(Default, Clone)]
pub struct Handlers {
    handlers: HashMap<PacketId, Arc<dyn RequestHandler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: PacketId, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(id, handler);
    }

    /// Register `f` as the handler for `Req` messages, replying with the `Rep` it returns
    pub fn on<Req, Rep, F, Fut>(mut self, f: F) -> Self
    where
        Req: Message + Send + 'static,
        Rep: Message + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rep, HandlerError>> + Send + 'static,
    {
        self.insert(
            Req::ID,
            Arc::new(MessageHandler {
                f,
                _request: PhantomData,
            }),
        );

        self
    }

    pub fn get(&self, id: PacketId) -> Option<&Arc<dyn RequestHandler>> {
        self.handlers.get(&id)
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

struct MessageHandler<Req, F> {
    f: F,
    _request: PhantomData<fn(Req)>,
}

#[async_trait]
impl<Req, Rep, F, Fut> RequestHandler for MessageHandler<Req, F>
where
    Req: Message + Send + 'static,
    Rep: Message + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Rep, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Packet) -> Result<Packet, HandlerError> {
        let request = Req::from_packet(request)?;
        let reply = (self.f)(request).await?;
        Ok(reply.to_packet())
    }
}
