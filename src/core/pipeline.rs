use std::sync::Arc;

use async_trait::async_trait;

use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;

/// A pipeline stage composed around the protocol forwarder.
///
/// A middleware either produces a terminal response (short-circuit) or
/// yields to `next`; errors never bypass outer layers.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        request: GatewayRequest,
        next: Arc<dyn MiddlewareHandler>,
    ) -> Result<GatewayResponse, GatewayError>;

    /// Name of this middleware, for logs
    fn name(&self) -> &str;
}

/// The rest of the chain as seen from one middleware.
#[async_trait]
pub trait MiddlewareHandler: Send + Sync {
    async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError>;
}

/// Ordered middleware chain for one route, built innermost-out around the
/// protocol forwarder.
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    /// Add a middleware to the chain; earlier additions run outermost.
    pub fn add<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middlewares.push(Arc::new(middleware));
    }

    /// Wrap the chain around the innermost handler (the forwarder).
    pub fn build(self, inner: Arc<dyn MiddlewareHandler>) -> Arc<dyn MiddlewareHandler> {
        let mut handler = inner;

        for middleware in self.middlewares.into_iter().rev() {
            handler = Arc::new(MiddlewareLink {
                middleware,
                next: handler,
            });
        }

        handler
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

struct MiddlewareLink {
    middleware: Arc<dyn Middleware>,
    next: Arc<dyn MiddlewareHandler>,
}

#[async_trait]
impl MiddlewareHandler for MiddlewareLink {
    async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.middleware.handle(request, self.next.clone()).await
    }
}
