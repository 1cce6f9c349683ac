//! Mesh core: flood routing, store-and-forward, authenticated sessions,
//! ephemeral identity rotation, and privacy shaping over a lossy,
//! small-MTU broadcast medium.
//!
//! Everything here is transport- and UI-agnostic: `transport::LinkLayer` is
//! implemented by the host's radio adapter, `transport::Delegate` is
//! implemented by the host's UI/view-model, and `MeshEngine` mediates
//! between the two under a single-task concurrency model (no internal
//! locking beyond the shared collections that genuinely need concurrent
//! readers).

pub mod bounded_set;
pub mod clock;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod identity;
pub mod peer;
pub mod privacy;
pub mod session;
pub mod store_forward;
pub mod transport;

pub use config::{MeshConfig, PowerMode};
pub use engine::{Effect, MeshEngine, Task};
pub use error::{MeshError, MeshResult};
pub use transport::{Delegate, DelegateEvent, LinkLayer};
