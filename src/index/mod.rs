pub mod endpoint;
pub mod sequence;
pub mod timeout;

pub(crate) use endpoint::EndpointIndex;
pub use sequence::*;
pub use timeout::*;
