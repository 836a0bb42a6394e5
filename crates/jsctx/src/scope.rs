//! Value scope bookkeeping for a context.
//!
//! Every value handed to the host is stored in a per-context table and
//! addressed by a [`ValueRef`]: the id of the scope that was current when the
//! value was created, and its slot in the table. Pushing a scope saves the
//! current id and table length; popping it truncates the table back to that
//! length and restores the saved id. Scope ids are 64-bit and only ever grow,
//! so a stale reference can never match a newer value that reuses its slot.

use crate::error::{Error, Result};

/// Id of the implicit scope owned by the context itself; never popped
pub(crate) const ROOT_SCOPE: u64 = 1;

/// Token returned by `Context::push_value_scope`, required to pop it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueScope(pub(crate) u64);

impl ValueScope {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// A value's address within its context's table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ValueRef {
    pub scope: u64,
    pub index: u32,
}

#[derive(Debug)]
pub(crate) struct ValueTable<T> {
    values: Vec<T>,
    /// Scope id and table length at each push, innermost last
    saved: Vec<ValueRef>,
    latest: u64,
    current: u64,
}

impl<T> ValueTable<T> {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            saved: Vec::new(),
            latest: ROOT_SCOPE,
            current: ROOT_SCOPE,
        }
    }

    pub fn add(&mut self, value: T) -> ValueRef {
        let r = ValueRef {
            scope: self.current,
            index: self.values.len() as u32,
        };
        self.values.push(value);
        r
    }

    /// Resolve a reference, failing if the scope that created it was popped
    pub fn get(&self, r: ValueRef) -> Result<&T> {
        if self.is_live(r) {
            return Ok(&self.values[r.index as usize]);
        }
        Err(Error::StaleValue {
            scope: r.scope,
            index: r.index,
        })
    }

    pub fn is_live(&self, r: ValueRef) -> bool {
        if r.index as usize >= self.values.len() {
            return false;
        }
        // Walk outwards until reaching the scope that owns this slot
        let mut scope = self.current;
        for saved in self.saved.iter().rev() {
            if r.index >= saved.index {
                break;
            }
            scope = saved.scope;
        }
        r.scope == scope
    }

    pub fn push(&mut self) -> ValueScope {
        self.saved.push(ValueRef {
            scope: self.current,
            index: self.values.len() as u32,
        });
        self.latest += 1;
        self.current = self.latest;
        ValueScope(self.current)
    }

    /// Pop the innermost scope, releasing every value created since its push
    pub fn pop(&mut self, scope: ValueScope) -> Result<()> {
        if scope.0 != self.current || self.saved.is_empty() {
            return Err(Error::ScopeMismatch {
                given: scope.0,
                current: self.current,
            });
        }
        if let Some(saved) = self.saved.pop() {
            self.current = saved.scope;
            self.values.truncate(saved.index as usize);
        }
        Ok(())
    }

    /// Number of open scopes above the root
    pub fn depth(&self) -> usize {
        self.saved.len()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_values_stay_live() {
        let mut table = ValueTable::new();
        let a = table.add("a");
        assert_eq!(a.scope, ROOT_SCOPE);
        assert_eq!(*table.get(a).unwrap(), "a");
        assert_eq!(table.depth(), 0);
    }

    #[test]
    fn test_pop_releases_inner_values() {
        let mut table = ValueTable::new();
        let outer = table.add(1);

        let scope = table.push();
        let inner = table.add(2);
        assert_eq!(*table.get(inner).unwrap(), 2);

        table.pop(scope).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.is_live(outer));
        assert!(matches!(
            table.get(inner),
            Err(Error::StaleValue { scope: s, index: 1 }) if s == scope.id()
        ));
    }

    #[test]
    fn test_stale_ref_does_not_alias_reused_slot() {
        let mut table = ValueTable::new();
        let scope = table.push();
        let stale = table.add("inner");
        table.pop(scope).unwrap();

        let fresh = table.add("outer");
        assert_eq!(fresh.index, stale.index);
        assert_eq!(*table.get(fresh).unwrap(), "outer");
        assert!(table.get(stale).is_err());
    }

    #[test]
    fn test_out_of_order_pop_is_rejected() {
        let mut table: ValueTable<u32> = ValueTable::new();
        let a = table.push();
        let b = table.push();

        let err = table.pop(a).unwrap_err();
        assert!(matches!(
            err,
            Error::ScopeMismatch { given, current } if given == a.id() && current == b.id()
        ));
        assert_eq!(table.depth(), 2);

        table.pop(b).unwrap();
        table.pop(a).unwrap();
        assert_eq!(table.depth(), 0);
    }

    #[test]
    fn test_root_scope_cannot_be_popped() {
        let mut table: ValueTable<u32> = ValueTable::new();
        assert!(table.pop(ValueScope(ROOT_SCOPE)).is_err());

        let scope = table.push();
        table.pop(scope).unwrap();
        // Popping the same token twice fails
        assert!(table.pop(scope).is_err());
    }

    #[test]
    fn test_scope_ids_are_unique() {
        let mut table: ValueTable<u32> = ValueTable::new();
        let first = table.push();
        table.pop(first).unwrap();
        let second = table.push();
        assert_ne!(first, second);
    }

    #[test]
    fn test_scope_ids_grow_past_u32() {
        let mut table = ValueTable::new();
        let root = table.add(0);
        table.latest = u64::from(u32::MAX) - 1;

        let a = table.push();
        let stale = table.add(1);
        table.pop(a).unwrap();

        let b = table.push();
        let c = table.push();
        assert_eq!(b.id(), u64::from(u32::MAX));
        assert_eq!(c.id(), u64::from(u32::MAX) + 1);
        assert!(c.id() > ROOT_SCOPE);

        // The reused slot belongs to the new scope, not the popped one
        let fresh = table.add(2);
        assert_eq!(fresh.index, stale.index);
        assert!(!table.is_live(stale));
        assert_eq!(*table.get(fresh).unwrap(), 2);

        table.pop(c).unwrap();
        table.pop(b).unwrap();
        assert_eq!(*table.get(root).unwrap(), 0);
    }

    #[test]
    fn test_values_in_outer_scope_survive_nested_pop() {
        let mut table = ValueTable::new();
        let outer_scope = table.push();
        let kept = table.add(10);
        let inner_scope = table.push();
        let dropped = table.add(20);

        table.pop(inner_scope).unwrap();
        assert_eq!(*table.get(kept).unwrap(), 10);
        assert!(!table.is_live(dropped));

        table.pop(outer_scope).unwrap();
        assert!(!table.is_live(kept));
    }
}
