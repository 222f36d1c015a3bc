//! Response caching for the background worker.
//!
//! Intercepted requests are classified into a strategy and served from
//! named cache generations:
//! - a versioned precache generation holding the application shell
//! - an unversioned runtime generation filled as requests are served
//!
//! Activating a version evicts every generation it does not expect.

mod layer;
mod request;
mod storage;
mod traits;

pub use layer::{CacheLayer, Generations};
pub use request::{Destination, Request, Response, RoutingRules};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheError, CacheSource, FetchError, Fetcher, HttpFetcher, Served};
