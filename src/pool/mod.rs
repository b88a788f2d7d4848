//! Lock-free object pooling

pub mod free_list;
pub mod object_pool;

pub use free_list::FreeList;
pub use object_pool::{ObjectPool, PoolId, PoolManager, PoolSource, Poolable};
