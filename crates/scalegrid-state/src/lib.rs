//! scalegrid-state: cluster model and isolated views for ScaleGrid.
//!
//! Holds everything the simulation engine reads and writes:
//!
//! - **`types`**: nodes, workloads, priority/runtime classes, snapshots
//! - **`scaling`**: node pools, templates, advice requests, scale-out plans
//! - **`resources`**: signed resource lists and their arithmetic
//! - **`view`**: versioned copy-on-write object views with an event sink
//!
//! # Architecture
//!
//! ```text
//! ViewAccess
//!   └── base View (snapshot replayed once per request)
//!         ├── sandbox View (one per Simulation per pass)
//!         └── sandbox View ──► promoted winner ──► delegate of next pass
//! ```
//!
//! Views are `Send + Sync` and shared as `Arc<View>`. A sandbox never writes
//! to its delegate; reads fall through the delegate chain.

pub mod error;
pub mod resources;
pub mod scaling;
pub mod types;
pub mod view;

pub use error::{StateError, StateResult};
pub use resources::{CPU, GIB, MEMORY, ResourceList};
pub use scaling::*;
pub use types::*;
pub use view::{
    ClientFacade, EventReason, StoredObject, View, ViewAccess, ViewEvent, WatchEvent,
    WatchEventType,
};
