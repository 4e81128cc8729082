/**
 * Transport facade: the iroh endpoint, the per-protocol stream handlers,
 * the authenticated broadcast topic, and the binding handshake.
 */
pub mod bind;
pub mod broadcast;
pub mod node;
pub mod protocol;

pub use bind::{BindError, BindListener, BindOutcome, ClientInfoMsg};
pub use node::{Node, NodeBuilder};
pub use protocol::NetworkSyncClient;
