//! Small reusable data structures shared by the registry and the backend adapters.

mod debouncer;
mod delayed_queue;
mod ordered_set;
mod subprocess;

pub use debouncer::EventDebouncer;
pub use delayed_queue::DelayedQueue;
pub use ordered_set::OrderedSet;
pub use subprocess::{RestartPolicy, SubprocessSupervisor};
