pub mod frame;
pub mod transport;

pub use frame::{Command, Frame, HeartBeat};
pub use transport::{ConnectionState, StompConfig, StompTransport, TopicScheme, TransportEvents};
