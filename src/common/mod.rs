pub mod addr;
pub mod cache;
pub mod error;
pub mod latch;
pub mod pool;

pub use addr::{Destination, Network};
pub use cache::LruCache;
pub use error::{Error, ResolveError, Result};
pub use latch::{Begin, SingleFlight};
pub use pool::{BufferPool, PooledBuf, RELAY_BUFFER_SIZE};
