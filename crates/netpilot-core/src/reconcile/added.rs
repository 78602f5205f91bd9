use std::collections::HashMap;

use crate::link::RouteInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Last reference dropped; the route should leave the kernel table.
    Released,
    StillReferenced(usize),
    NotPresent,
}

/// Reference-counted multiset of routes installed in the default table.
#[derive(Debug, Default)]
pub struct AddedRoutes {
    counts: HashMap<RouteInfo, usize>,
}

impl AddedRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the reference count after the add.
    pub fn add(&mut self, route: RouteInfo) -> usize {
        let count = self.counts.entry(route).or_insert(0);
        *count += 1;
        *count
    }

    pub fn remove(&mut self, route: &RouteInfo) -> Release {
        match self.counts.get_mut(route) {
            None => Release::NotPresent,
            Some(count) if *count > 1 => {
                *count -= 1;
                Release::StillReferenced(*count)
            }
            Some(_) => {
                self.counts.remove(route);
                Release::Released
            }
        }
    }

    pub fn contains(&self, route: &RouteInfo) -> bool {
        self.counts.contains_key(route)
    }

    pub fn count(&self, route: &RouteInfo) -> usize {
        self.counts.get(route).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn routes(&self) -> impl Iterator<Item = (&RouteInfo, usize)> {
        self.counts.iter().map(|(route, count)| (route, *count))
    }
}
