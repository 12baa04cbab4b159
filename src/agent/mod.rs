//! Agent-side modules: the per-run sub-process launcher (C5 support),
//! ensemble materialisation (C5 support), the run loop itself (C5), and
//! the pool manager that supervises many run loops in one process (C6).

pub mod materialize;
pub mod pool;
pub mod process;
pub mod runloop;

pub use pool::{PoolManager, PoolReport};
pub use runloop::Agent;
