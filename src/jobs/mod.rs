pub mod relay;

pub use relay::{spawn_pool, JobOutcome, RelayWorker, RetryPolicy};
