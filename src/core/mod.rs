pub mod dispatcher;
pub mod pipeline;
pub mod request;
pub mod response;

pub use dispatcher::Dispatcher;
pub use pipeline::{Middleware, MiddlewareChain, MiddlewareHandler};
pub use request::GatewayRequest;
pub use response::{GatewayResponse, ResponseBody};
