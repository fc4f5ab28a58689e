//! Drag-and-drop pipeline board: stage registry, record distribution, drag
//! sessions, drop-target geometry and optimistic reconciliation against a
//! managed backend.

pub mod backend;
pub mod board;
pub mod distributor;
pub mod drag;
pub mod error;
pub mod geometry;
pub mod options;
pub mod policy;
pub mod reconciler;
pub mod registry;
pub mod remote;
pub mod settle;

pub use backend::{
    BoardBackend, ChangeFeed, FeedSignal, MissingChangeFeed, MutationSink, RecordSource,
    Subscription,
};
pub use board::Board;
pub use distributor::{distribute, Card, Column, DefaultColumnPolicy, DragIdentity};
pub use drag::{DragController, DragPayload, DragSession, Slot};
pub use error::{DragError, PersistError, RegistryError};
pub use geometry::{resolve_index, resolve_target, CardBounds, ColumnBounds, Point};
pub use options::BoardOptions;
pub use policy::ContactDatePolicy;
pub use reconciler::{BoardNotice, BoardReconciler, MoveOutcome};
pub use registry::StageRegistry;
pub use remote::RestBackend;
