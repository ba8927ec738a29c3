pub mod direct;
pub mod registry;
pub mod rpc;
pub mod servers;
pub mod stdio;
pub mod transport;
pub mod worker;

pub use direct::DirectTransport;
pub use registry::ServerRegistry;
pub use stdio::{StdioTransport, WorkerCommand};
pub use transport::build_transport;
pub use worker::{run_stdio_worker, serve, write_manifest};
