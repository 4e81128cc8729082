pub mod publisher;
pub mod update;

pub use publisher::{publish_data_update, publish_peer_update, PublishError};
pub use update::{
    peer_list_hash, DataAction, DataChange, PeerAction, PeerChange, SignedUpdate, Update,
    UpdateError, UpdatePayload,
};
