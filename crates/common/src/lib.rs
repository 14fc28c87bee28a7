pub mod dispatcher;
pub mod net;
pub mod ray;
pub mod relay;

pub use dispatcher::{DefaultDispatcher, Dispatcher, OutboundHandler, Router};
pub use net::{Address, Destination, Network};
pub use ray::{
    pipe, ray, InboundRay, OutboundRay, PipeError, PipeReader, PipeState, PipeWriter,
    RayState,
};
pub use relay::{ActivityTimer, Timeouts};
