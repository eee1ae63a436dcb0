pub mod hub;
pub mod protocol;

pub use hub::{upgrade, AccessPolicy, ConnectQuery, Hub, HubState};
pub use protocol::{ClientFrame, CloseCode, ServerFrame, PROTOCOL_VERSION};
