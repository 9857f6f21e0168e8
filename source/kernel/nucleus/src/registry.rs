// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Generational object registry for kernel objects
//! OWNERS: @kernel-team
//! PUBLIC API: Registry<K, T>, Key, Handle, registry_handle!
//! DEPENDS_ON: alloc::vec::Vec
//! INVARIANTS: A removed entry's key never resolves again (generation bump);
//!             `for_each_live` never hands a removed entry to its callback
//!
//! Back-references between kernel objects (tree nodes to threads, domains and
//! signal contexts) are stored as keys instead of pointers. A key that outlives
//! its object simply stops resolving.

use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;

/// Slot index plus generation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Packs the key into one word for transport payloads.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self { index: raw as u32, generation: (raw >> 32) as u32 }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Typed view of a [`Key`].
pub trait Handle: Copy + Eq + fmt::Debug {
    fn from_key(key: Key) -> Self;
    fn key(self) -> Key;
}

/// Declares a `repr(transparent)` handle type over [`Key`].
macro_rules! registry_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name($crate::registry::Key);

        impl $crate::registry::Handle for $name {
            #[inline]
            fn from_key(key: $crate::registry::Key) -> Self {
                Self(key)
            }

            #[inline]
            fn key(self) -> $crate::registry::Key {
                self.0
            }
        }

        impl $name {
            #[inline]
            pub const fn to_raw(self) -> u64 {
                self.0.to_raw()
            }

            #[inline]
            pub const fn from_raw(raw: u64) -> Self {
                Self($crate::registry::Key::from_raw(raw))
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}
pub(crate) use registry_handle;

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational slab keyed by `K`.
pub struct Registry<K, T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: Handle, T> Default for Registry<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Handle, T> Registry<K, T> {
    pub const fn new() -> Self {
        Self { entries: Vec::new(), free: Vec::new(), len: 0, _key: PhantomData }
    }

    pub fn insert(&mut self, value: T) -> K {
        self.insert_with(|_| value)
    }

    /// Inserts a value that needs to know its own key.
    pub fn insert_with(&mut self, make: impl FnOnce(K) -> T) -> K {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.entries.push(Entry { generation: 0, value: None });
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[index as usize];
        let key = K::from_key(Key { index, generation: entry.generation });
        entry.value = Some(make(key));
        self.len += 1;
        key
    }

    /// Like `insert_with`, but nothing is inserted when `make` fails.
    pub fn try_insert_with<E>(&mut self, make: impl FnOnce(K) -> Result<T, E>) -> Result<K, E> {
        let index = self.free.last().copied().unwrap_or(self.entries.len() as u32);
        let generation = self.entries.get(index as usize).map_or(0, |e| e.generation);
        let value = make(K::from_key(Key { index, generation }))?;
        Ok(self.insert(value))
    }

    fn entry(&self, key: K) -> Option<&Entry<T>> {
        let key = key.key();
        self.entries
            .get(key.index())
            .filter(|entry| entry.generation == key.generation && entry.value.is_some())
    }

    pub fn get(&self, key: K) -> Option<&T> {
        self.entry(key).and_then(|entry| entry.value.as_ref())
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let key = key.key();
        self.entries
            .get_mut(key.index())
            .filter(|entry| entry.generation == key.generation)
            .and_then(|entry| entry.value.as_mut())
    }

    pub fn contains(&self, key: K) -> bool {
        self.entry(key).is_some()
    }

    /// Removes the entry; its key and every copy of it stop resolving.
    pub fn remove(&mut self, key: K) -> Option<T> {
        let raw = key.key();
        let entry = self.entries.get_mut(raw.index())?;
        if entry.generation != raw.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(raw.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Snapshot of the live keys in slot order.
    pub fn keys(&self) -> Vec<K> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.value.is_some())
            .map(|(index, entry)| {
                K::from_key(Key { index: index as u32, generation: entry.generation })
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            let key = K::from_key(Key { index: index as u32, generation: entry.generation });
            entry.value.as_ref().map(|value| (key, value))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> {
        self.entries.iter_mut().enumerate().filter_map(|(index, entry)| {
            let key = K::from_key(Key { index: index as u32, generation: entry.generation });
            entry.value.as_mut().map(|value| (key, value))
        })
    }

    /// Visits every entry live at call time and still live when reached.
    ///
    /// The callback may remove any entry, itself included; removed entries
    /// are skipped.
    pub fn for_each_live<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Self, K),
    {
        for key in self.keys() {
            if self.contains(key) {
                f(self, key);
            }
        }
    }
}
