//! Node server and controller façade.

pub mod controller;
pub mod node;

pub use controller::CxlController;
pub use node::{NodeServer, NodeServerConfig, PeerInfo, ServerStats};
