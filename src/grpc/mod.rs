pub mod client_service;
pub mod overlay_service;
pub mod server;
pub mod uplink;

pub use server::GrpcServer;
pub use uplink::GrpcUplink;
