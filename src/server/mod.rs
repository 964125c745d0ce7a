//! The dcfed server: cluster formation, reconciliation, routing and RPC

pub mod bootstrap;
pub mod endpoints;
pub mod flood;
pub mod http;
pub mod lifecycle;
pub mod reconcile;
pub mod router;
pub mod rpc;

pub use bootstrap::{BootstrapExpect, Evaluation};
pub use endpoints::{ApplyReply, Endpoint};
pub use lifecycle::{local_tags, Collaborators, Lifecycle, MemoryNetwork, Server};
pub use router::{Router, RoutingTable, ServerRoute};
pub use rpc::{CollectReplies, ReplyMerger, RpcDispatcher};
