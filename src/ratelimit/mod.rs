//! Rate limiting logic and state management.

mod clock;
mod headers;
mod limiter;
mod resolver;
mod state;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use headers::{RateLimitHeaders, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER};
pub use limiter::RateLimiter;
pub use resolver::{Quota, QuotaResolver};
pub use state::{Admission, QuotaState};
pub use store::{MemoryStore, QuotaStore, RedisStore, StoreBackend};
