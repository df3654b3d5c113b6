mod connection;

pub(crate) use connection::frame_bytes;
pub use connection::{
    Connection, ConnectionSettings, ConnectionState, ReceiveEnd, ReceiveHandle,
};
