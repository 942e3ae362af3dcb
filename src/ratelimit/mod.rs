//! Sliding-window counting, admission control and their persistence.

mod counter;
mod limiter;
pub mod persistence;
mod registry;

pub use counter::{WindowCounter, WindowSettings, DEFAULT_RESOLUTION, MIN_TICK_PERIOD};
pub use limiter::{Limiter, LimiterSnapshot};
pub use persistence::{CounterSnapshot, PersistenceOptions};
pub use registry::{LimiterRegistry, RegistrySnapshot};
