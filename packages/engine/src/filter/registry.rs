// packages/engine/src/filter/registry.rs
//! Bounded agent registry and its process-wide lock
//!
//! Lock order is always flow lock → registry lock. The guards below keep a
//! per-thread count of held registry guards so the flow lock can assert the
//! registry is not held when it is acquired.

use crate::filter::{ContentFilter, MAX_CONTENT_FILTER};
use crate::utils::errors::{EngineError, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use tracing::debug;

thread_local! {
    static REGISTRY_HELD: Cell<u32> = const { Cell::new(0) };
}

/// True while the current thread holds a registry guard
pub fn registry_held() -> bool {
    REGISTRY_HELD.with(|held| held.get() > 0)
}

fn enter() {
    REGISTRY_HELD.with(|held| held.set(held.get() + 1));
}

fn exit() {
    REGISTRY_HELD.with(|held| held.set(held.get().saturating_sub(1)));
}

/// Agent slots indexed by unit - 1
#[derive(Debug)]
pub struct FilterRegistry {
    slots: [Option<ContentFilter>; MAX_CONTENT_FILTER],
    active_count: usize,
    next_instance: u64,
    preserve_connections: bool,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            active_count: 0,
            next_instance: 1,
            preserve_connections: false,
        }
    }
}

#[inline]
fn slot(unit: u32) -> Option<usize> {
    if unit == 0 || unit as usize > MAX_CONTENT_FILTER {
        None
    } else {
        Some(unit as usize - 1)
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, unit: u32) -> Option<&ContentFilter> {
        slot(unit).and_then(|i| self.slots[i].as_ref())
    }

    pub fn get_mut(&mut self, unit: u32) -> Option<&mut ContentFilter> {
        slot(unit).and_then(move |i| self.slots[i].as_mut())
    }

    /// Register a new agent on `unit`, returning its instance id
    pub fn connect(&mut self, unit: u32) -> Result<u64> {
        let i = slot(unit)
            .ok_or_else(|| EngineError::InvalidArgument(format!("bad unit {}", unit)))?;
        if self.slots[i].is_some() {
            return Err(EngineError::AlreadyInUse(format!("unit {}", unit)));
        }

        let instance = self.next_instance;
        self.next_instance += 1;
        self.slots[i] = Some(ContentFilter::new(unit, instance));
        self.active_count += 1;
        self.recompute_behavior();

        debug!("Registered filter unit {} instance {}", unit, instance);
        Ok(instance)
    }

    /// Clear a slot
    pub fn remove(&mut self, unit: u32) -> Option<ContentFilter> {
        let removed = slot(unit).and_then(|i| self.slots[i].take());
        if removed.is_some() {
            self.active_count -= 1;
            self.recompute_behavior();
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContentFilter> {
        self.slots.iter().flatten()
    }

    /// True when `unit` still holds the agent instance an entry was linked to
    pub fn is_current(&self, unit: u32, instance: u64) -> bool {
        self.get(unit).map_or(false, |cfc| cfc.instance == instance)
    }

    /// Connections are preserved only when every active agent asks for it
    pub fn recompute_behavior(&mut self) {
        self.preserve_connections =
            self.active_count > 0 && self.iter().all(|cfc| cfc.preserve_connections);
    }

    pub fn preserve_connections(&self) -> bool {
        self.preserve_connections
    }
}

/// The registry reader/writer lock
#[derive(Debug, Default)]
pub struct RegistryLock {
    inner: RwLock<FilterRegistry>,
}

impl RegistryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RegistryReadGuard<'_> {
        let guard = self.inner.read();
        enter();
        RegistryReadGuard { guard }
    }

    pub fn write(&self) -> RegistryWriteGuard<'_> {
        let guard = self.inner.write();
        enter();
        RegistryWriteGuard { guard }
    }
}

pub struct RegistryReadGuard<'a> {
    guard: RwLockReadGuard<'a, FilterRegistry>,
}

impl Deref for RegistryReadGuard<'_> {
    type Target = FilterRegistry;

    fn deref(&self) -> &FilterRegistry {
        &self.guard
    }
}

impl Drop for RegistryReadGuard<'_> {
    fn drop(&mut self) {
        exit();
    }
}

pub struct RegistryWriteGuard<'a> {
    guard: RwLockWriteGuard<'a, FilterRegistry>,
}

impl Deref for RegistryWriteGuard<'_> {
    type Target = FilterRegistry;

    fn deref(&self) -> &FilterRegistry {
        &self.guard
    }
}

impl DerefMut for RegistryWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut FilterRegistry {
        &mut self.guard
    }
}

impl Drop for RegistryWriteGuard<'_> {
    fn drop(&mut self) {
        exit();
    }
}
