//! Events, statements and reducers.
//!
//! This crate holds the data that flows through the projection engine:
//! stored [`Event`]s, the [`Statement`]s reducers turn them into, and the
//! [`SearchQuery`] model used to read events back from the event source.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod instance;
pub mod query;
pub mod reducer;
pub mod statement;

pub use bus::{EventBus, Subscription};
pub use event::{Event, NewEvent};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use instance::{InstanceScoped, distinct_instances};
pub use query::{InstanceQuery, QueryClause, SearchQuery};
pub use reducer::{
    AggregateReducer, EventReducer, Projection, ReduceError, ReduceFn, ReducerRegistry,
    decode_payload,
};
pub use statement::{
    Column, Condition, Operation, OperationError, OperationKind, SqlValue, Statement,
};
