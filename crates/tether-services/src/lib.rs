//! tether-services — the chunked RPC and HTTP tunnel built on top of the
//! call and event primitives.

pub mod chunk_client;
pub mod chunk_server;
pub mod downstream;
pub mod loopback;
pub mod pending;
pub mod registry;
pub mod router;
pub mod transport;
pub mod tunnel_client;
pub mod tunnel_server;

pub use chunk_client::ChunkMethodClient;
pub use chunk_server::ChunkMethodServer;
pub use downstream::{HttpClient, ReqwestClient};
pub use loopback::{LoopbackCallTransport, LoopbackEventTransport};
pub use pending::{PendingCompletion, PendingCompletions};
pub use registry::ExchangeRegistry;
pub use router::{MethodError, MethodHandler, MethodRequest, MethodResponse, MethodRouter};
pub use transport::{CallTransport, EventMessage, EventTransport};
pub use tunnel_client::HttpTunnelClient;
pub use tunnel_server::{HttpTunnelServer, ReadyRequest};
