use std::{collections::HashMap, io, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, warn};

use crate::{
    net::Destination,
    ray::{ray, InboundRay, OutboundRay, DEFAULT_PIPE_CAPACITY},
};

/// Something that can carry a connection towards its destination.
///
/// The handler owns the outbound half of the ray for the whole connection. It
/// should close the output pipe when the upstream finishes; returning early
/// (or panicking) drops the half, which releases both pipes.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    async fn handle(&self, destination: Destination, ray: OutboundRay) -> io::Result<()>;
}

/// Picks an outbound handler tag for a destination.
pub trait Router: Send + Sync {
    fn pick_route(&self, destination: &Destination) -> Option<String>;
}

pub trait Dispatcher: Send + Sync {
    /// Starts an outbound connection and returns the listener's half of its
    /// ray without waiting for the outbound side to connect.
    fn dispatch_to_outbound(&self, destination: Destination) -> InboundRay;
}

pub struct DefaultDispatcher {
    default: Arc<dyn OutboundHandler>,
    handlers: HashMap<String, Arc<dyn OutboundHandler>>,
    router: Option<Arc<dyn Router>>,
    capacity: usize,
}

impl DefaultDispatcher {
    pub fn new(default: Arc<dyn OutboundHandler>) -> Self {
        Self {
            default,
            handlers: HashMap::new(),
            router: None,
            capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    pub fn with_handler(mut self, tag: impl Into<String>, handler: Arc<dyn OutboundHandler>) -> Self {
        self.handlers.insert(tag.into(), handler);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    fn select(&self, destination: &Destination) -> Arc<dyn OutboundHandler> {
        let Some(router) = &self.router else {
            return self.default.clone();
        };
        match router.pick_route(destination) {
            Some(tag) => match self.handlers.get(&tag) {
                Some(handler) => handler.clone(),
                None => {
                    warn!("no outbound tagged {}, using default for {}", tag, destination);
                    self.default.clone()
                }
            },
            None => self.default.clone(),
        }
    }
}

impl Dispatcher for DefaultDispatcher {
    fn dispatch_to_outbound(&self, destination: Destination) -> InboundRay {
        let handler = self.select(&destination);
        let (inbound, outbound) = ray(self.capacity);

        debug!("dispatching {}", destination);
        tokio::spawn(async move {
            let target = destination.to_string();
            match AssertUnwindSafe(handler.handle(destination, outbound))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => debug!("outbound to {} finished", target),
                Ok(Err(e)) => warn!("outbound to {} failed: {}", target, e),
                Err(_) => error!("outbound handler for {} panicked", target),
            }
        });

        inbound
    }
}
