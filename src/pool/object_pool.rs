//! Self-maintaining object pools
//!
//! Acquire and release never block on a lock. Growth on an empty pool runs on
//! the caller's thread; steady-state sizing is handled by [`ObjectPool::maintain`],
//! which the upkeep worker calls round-robin through [`PoolManager`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::FreeList;
use crate::error::SimError;
use crate::settings::PoolConfig;

/// Items that track whether they are handed out
pub trait Poolable {
    fn activate(&self);
    fn deactivate(&self);
}

impl<T: Poolable + ?Sized> Poolable for Arc<T> {
    fn activate(&self) {
        (**self).activate()
    }

    fn deactivate(&self) {
        (**self).deactivate()
    }
}

/// Builds new pool items and disposes of trimmed ones
pub trait PoolSource<T>: Send + Sync {
    fn manufacture(&self) -> Result<T, SimError>;

    /// Called when maintenance shrinks the pool
    fn discard(&self, _item: T) {}
}

/// Index of a pool inside its [`PoolManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub usize);

pub struct ObjectPool<T> {
    id: PoolId,
    name: String,
    source: Box<dyn PoolSource<T>>,
    free: FreeList<T>,
    free_count: AtomicUsize,
    total_count: AtomicUsize,
    growth_increment: usize,
    min_free: usize,
    // f32 bit patterns
    low_watermark: AtomicU32,
    high_watermark: AtomicU32,
}

impl<T: Poolable> ObjectPool<T> {
    pub fn new(
        id: PoolId,
        name: impl Into<String>,
        source: Box<dyn PoolSource<T>>,
        config: &PoolConfig,
    ) -> Result<Self, SimError> {
        config.validate()?;
        let pool = Self {
            id,
            name: name.into(),
            source,
            free: FreeList::new(),
            free_count: AtomicUsize::new(0),
            total_count: AtomicUsize::new(0),
            growth_increment: config.growth_increment,
            min_free: config.min_free,
            low_watermark: AtomicU32::new(config.low_watermark.to_bits()),
            high_watermark: AtomicU32::new(config.high_watermark.to_bits()),
        };
        pool.fill(config.initial_count)?;
        log::debug!("Created pool {:?} with {} items", pool.name, config.initial_count);
        Ok(pool)
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take an item, growing the pool if it is empty
    pub fn acquire(&self) -> Result<T, SimError> {
        let item = match self.pop_free() {
            Some(item) => item,
            None => {
                self.fill(self.growth_increment)?;
                let item = self.source.manufacture()?;
                self.total_count.fetch_add(1, Ordering::AcqRel);
                log::debug!(
                    "Pool {:?} ran dry, grew to {}",
                    self.name,
                    self.total_count()
                );
                item
            }
        };
        item.activate();
        Ok(item)
    }

    /// Hand an item back; it is deactivated before it becomes reachable
    pub fn release(&self, item: T) {
        item.deactivate();
        self.push_free(item);
    }

    /// Pre-grow by `count` items
    pub fn fill(&self, count: usize) -> Result<(), SimError> {
        for _ in 0..count {
            let item = self.source.manufacture()?;
            item.deactivate();
            self.total_count.fetch_add(1, Ordering::AcqRel);
            self.push_free(item);
        }
        Ok(())
    }

    /// Nudge the pool one item toward its watermarks
    pub fn maintain(&self) {
        let free = self.free_count();
        let total = self.total_count();
        let ratio = if total == 0 {
            0.0
        } else {
            free as f32 / total as f32
        };
        let (low, high) = self.watermarks();

        if ratio < low || free < self.min_free {
            if let Err(e) = self.fill(1) {
                log::warn!("Pool {:?} could not grow: {e}", self.name);
            }
        } else if ratio > high && free > self.min_free {
            if let Some(item) = self.pop_free() {
                self.total_count.fetch_sub(1, Ordering::AcqRel);
                self.source.discard(item);
            }
        }
    }

    /// Retune the maintenance band; requires `0 < low < high`
    pub fn set_watermarks(&self, low: f32, high: f32) -> Result<(), SimError> {
        if !(low > 0.0 && high > low) {
            return Err(SimError::InvalidConfig(format!(
                "pool watermarks must satisfy 0 < low < high (got {low} / {high})"
            )));
        }
        self.low_watermark.store(low.to_bits(), Ordering::Relaxed);
        self.high_watermark.store(high.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    pub fn watermarks(&self) -> (f32, f32) {
        (
            f32::from_bits(self.low_watermark.load(Ordering::Relaxed)),
            f32::from_bits(self.high_watermark.load(Ordering::Relaxed)),
        )
    }

    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Acquire)
    }

    pub fn total_count(&self) -> usize {
        self.total_count.load(Ordering::Acquire)
    }

    // The count is raised before the push and lowered after the pop so it
    // never dips below the real list length.
    fn push_free(&self, item: T) {
        self.free_count.fetch_add(1, Ordering::AcqRel);
        self.free.push(item);
    }

    fn pop_free(&self) -> Option<T> {
        let item = self.free.pop()?;
        self.free_count.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }
}

struct Registry<T> {
    pools: Vec<Arc<ObjectPool<T>>>,
    by_name: HashMap<String, PoolId>,
}

/// Named pools plus round-robin maintenance
pub struct PoolManager<T> {
    registry: RwLock<Registry<T>>,
    cursor: AtomicUsize,
}

impl<T: Poolable> Default for PoolManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Poolable> PoolManager<T> {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry {
                pools: Vec::new(),
                by_name: HashMap::new(),
            }),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Create and register a pool; an existing pool with the same name is
    /// returned unchanged
    pub fn create_pool(
        &self,
        name: &str,
        source: Box<dyn PoolSource<T>>,
        config: &PoolConfig,
    ) -> Result<Arc<ObjectPool<T>>, SimError> {
        let mut registry = self.registry.write();
        if let Some(id) = registry.by_name.get(name) {
            log::warn!("Pool {name:?} already exists");
            return Ok(Arc::clone(&registry.pools[id.0]));
        }
        let id = PoolId(registry.pools.len());
        let pool = Arc::new(ObjectPool::new(id, name, source, config)?);
        registry.pools.push(Arc::clone(&pool));
        registry.by_name.insert(name.to_string(), id);
        log::info!("Registered pool {name:?} as {id:?}");
        Ok(pool)
    }

    pub fn id_of(&self, name: &str) -> Option<PoolId> {
        self.registry.read().by_name.get(name).copied()
    }

    pub fn get(&self, id: PoolId) -> Option<Arc<ObjectPool<T>>> {
        self.registry.read().pools.get(id.0).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<ObjectPool<T>>> {
        let registry = self.registry.read();
        let id = registry.by_name.get(name)?;
        registry.pools.get(id.0).cloned()
    }

    pub fn acquire(&self, name: &str) -> Result<T, SimError> {
        self.by_name(name)
            .ok_or_else(|| SimError::UnknownPool(name.to_string()))?
            .acquire()
    }

    pub fn release(&self, id: PoolId, item: T) {
        match self.get(id) {
            Some(pool) => pool.release(item),
            None => log::error!("Release to unknown pool {id:?}; item dropped"),
        }
    }

    /// Maintain the next pool in round-robin order
    pub fn maintain_next(&self) {
        let pool = {
            let registry = self.registry.read();
            if registry.pools.is_empty() {
                return;
            }
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % registry.pools.len();
            Arc::clone(&registry.pools[index])
        };
        pool.maintain();
    }

    pub fn len(&self) -> usize {
        self.registry.read().pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (name, free, total) for each pool
    pub fn stats(&self) -> Vec<(String, usize, usize)> {
        self.registry
            .read()
            .pools
            .iter()
            .map(|p| (p.name.clone(), p.free_count(), p.total_count()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[derive(Default)]
    struct Widget {
        active: AtomicBool,
    }

    impl Poolable for Widget {
        fn activate(&self) {
            self.active.store(true, Ordering::SeqCst);
        }

        fn deactivate(&self) {
            self.active.store(false, Ordering::SeqCst);
        }
    }

    struct WidgetSource {
        made: Arc<AtomicUsize>,
        discarded: Arc<AtomicUsize>,
    }

    impl PoolSource<Arc<Widget>> for WidgetSource {
        fn manufacture(&self) -> Result<Arc<Widget>, SimError> {
            self.made.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Widget::default()))
        }

        fn discard(&self, _item: Arc<Widget>) {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn source() -> Box<WidgetSource> {
        Box::new(WidgetSource {
            made: Arc::new(AtomicUsize::new(0)),
            discarded: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn config(initial: usize, min_free: usize) -> PoolConfig {
        PoolConfig {
            initial_count: initial,
            min_free,
            ..Default::default()
        }
    }

    #[test]
    fn test_acquire_marks_active_release_marks_inactive() {
        let pool = ObjectPool::new(PoolId(0), "widgets", source(), &config(2, 0)).unwrap();
        let widget = pool.acquire().unwrap();
        assert!(widget.active.load(Ordering::SeqCst));
        assert_eq!(pool.free_count(), 1);

        let probe = Arc::clone(&widget);
        pool.release(widget);
        assert!(!probe.active.load(Ordering::SeqCst));
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_empty_pool_grows_by_increment_plus_one() {
        let pool = ObjectPool::new(PoolId(0), "widgets", source(), &config(0, 0)).unwrap();
        let _widget = pool.acquire().unwrap();
        assert_eq!(pool.total_count(), POOL_GROWTH + 1);
        assert_eq!(pool.free_count(), POOL_GROWTH);
    }

    const POOL_GROWTH: usize = crate::consts::POOL_GROWTH_INCREMENT;

    #[test]
    fn test_watermarks_grow_and_shrink() {
        let pool = ObjectPool::new(PoolId(0), "widgets", source(), &config(10, 0)).unwrap();
        assert_eq!(pool.watermarks(), (0.2, 0.5));

        // 1 free of 10 is below the 20% mark
        let held: Vec<_> = (0..9).map(|_| pool.acquire().unwrap()).collect();
        pool.maintain();
        assert_eq!(pool.total_count(), 11);
        assert_eq!(pool.free_count(), 2);

        // 11 free of 11 is above the 50% mark
        for widget in held {
            pool.release(widget);
        }
        pool.maintain();
        assert_eq!(pool.total_count(), 10);
        assert_eq!(pool.free_count(), 10);
    }

    #[test]
    fn test_min_free_floor_blocks_shrink() {
        let pool = ObjectPool::new(PoolId(0), "widgets", source(), &config(5, 5)).unwrap();
        pool.maintain();
        assert_eq!(pool.total_count(), 5);

        // Below the floor grows even though the ratio is high
        let _held = pool.acquire().unwrap();
        pool.maintain();
        assert_eq!(pool.free_count(), 5);
        assert_eq!(pool.total_count(), 6);
    }

    #[test]
    fn test_set_watermarks_validates() {
        let pool = ObjectPool::new(PoolId(0), "widgets", source(), &config(1, 0)).unwrap();
        assert!(pool.set_watermarks(0.5, 0.4).is_err());
        assert!(pool.set_watermarks(0.0, 0.4).is_err());
        pool.set_watermarks(0.1, 0.9).unwrap();
        assert_eq!(pool.watermarks(), (0.1, 0.9));
    }

    #[test]
    fn test_concurrent_acquire_release_keeps_counts() {
        let pool = Arc::new(ObjectPool::new(PoolId(0), "widgets", source(), &config(4, 0)).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut held = Vec::new();
                    for i in 0..500 {
                        held.push(pool.acquire().unwrap());
                        if i % 3 == 0 {
                            pool.maintain();
                        }
                        if held.len() > 4 {
                            for widget in held.drain(..) {
                                pool.release(widget);
                            }
                        }
                    }
                    for widget in held {
                        pool.release(widget);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.free_count(), pool.total_count());

        let mut drained = 0;
        while pool.free.pop().is_some() {
            drained += 1;
        }
        assert_eq!(drained, pool.total_count());
    }

    #[test]
    fn test_manager_lookup_and_round_robin() {
        let manager = PoolManager::new();
        let a = manager.create_pool("a", source(), &config(1, 5)).unwrap();
        let b = manager.create_pool("b", source(), &config(1, 5)).unwrap();
        assert_eq!(manager.id_of("b"), Some(b.id()));
        assert!(matches!(manager.acquire("missing"), Err(SimError::UnknownPool(_))));

        manager.maintain_next();
        manager.maintain_next();
        assert_eq!(a.total_count(), 2);
        assert_eq!(b.total_count(), 2);

        let widget = manager.acquire("a").unwrap();
        manager.release(a.id(), widget);
        assert_eq!(a.free_count(), 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Release,
        Maintain,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Acquire), Just(Op::Release), Just(Op::Maintain)]
    }

    proptest! {
        #[test]
        fn prop_free_plus_held_equals_total(ops in prop::collection::vec(op(), 0..200)) {
            let pool = ObjectPool::new(PoolId(0), "widgets", source(), &config(3, 2)).unwrap();
            let mut held = Vec::new();
            for op in ops {
                match op {
                    Op::Acquire => held.push(pool.acquire().unwrap()),
                    Op::Release => {
                        if let Some(widget) = held.pop() {
                            pool.release(widget);
                        }
                    }
                    Op::Maintain => pool.maintain(),
                }
                prop_assert_eq!(pool.free_count() + held.len(), pool.total_count());
                prop_assert!(held.iter().all(|w| w.active.load(Ordering::SeqCst)));
            }
        }
    }
}
