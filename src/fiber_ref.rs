//! Fiber-local dynamic variables.
//!
//! A [`FiberRef`] is a variable whose value is private to each fiber. When a
//! fiber forks, the child receives a copy of every variable transformed by
//! the variable's `fork` function. When the parent joins the child (or wins a
//! race with it), the child's values are merged back with `join`:
//!
//! ```rust,ignore
//! // Children start counting from zero; joins add the child's count.
//! let counter = FiberRef::make_with(0_u64, |_| 0, |parent, child| parent + child);
//! ```
//!
//! Effects that read or write a variable are built from the handle
//! ([`FiberRef::get`], [`FiberRef::set`], [`FiberRef::locally`], ...) and
//! only touch the state of the fiber that runs them.

use crate::effect::instr::{Instr, Link};
use crate::effect::Effect;
use crate::types::value::{downcast, erase, unit, AnyValue, Value};
use crate::types::FiberId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

type ForkFn = Box<dyn Fn(&AnyValue) -> AnyValue + Send + Sync>;
type JoinFn = Box<dyn Fn(&AnyValue, &AnyValue) -> AnyValue + Send + Sync>;

/// Shared identity and merge behaviour of one variable.
pub(crate) struct FiberRefKey {
    id: u64,
    initial: AnyValue,
    fork: ForkFn,
    join: JoinFn,
}

impl fmt::Debug for FiberRefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRefKey")
            .field("id", &self.id)
            .field("initial", &self.initial)
            .finish_non_exhaustive()
    }
}

/// A handle to a fiber-local variable holding values of type `A`.
pub struct FiberRef<A> {
    key: Arc<FiberRefKey>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for FiberRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberRef({})", self.key.id)
    }
}

impl<A: Value> FiberRef<A> {
    /// Creates a variable whose children copy the parent's value and whose
    /// joins keep the child's value.
    #[must_use]
    pub fn make(initial: A) -> Self {
        Self::make_with(initial, Clone::clone, |_, child| child.clone())
    }

    /// Creates a variable with explicit fork and join transforms.
    #[must_use]
    pub fn make_with<F, J>(initial: A, fork: F, join: J) -> Self
    where
        F: Fn(&A) -> A + Send + Sync + 'static,
        J: Fn(&A, &A) -> A + Send + Sync + 'static,
    {
        let fork: ForkFn = Box::new(move |v| erase(fork(&downcast::<A>(Arc::clone(v)))));
        let join: JoinFn = Box::new(move |parent, child| {
            erase(join(
                &downcast::<A>(Arc::clone(parent)),
                &downcast::<A>(Arc::clone(child)),
            ))
        });
        Self {
            key: Arc::new(FiberRefKey {
                id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
                initial: erase(initial),
                fork,
                join,
            }),
            _marker: PhantomData,
        }
    }

    /// The value every fiber starts with.
    #[must_use]
    pub fn initial(&self) -> A {
        downcast(Arc::clone(&self.key.initial))
    }

    /// Reads the current fiber's value.
    pub fn get<E: Value>(&self) -> Effect<A, E> {
        Effect::from_instr(Instr::FiberRefWith {
            key: Arc::clone(&self.key),
            k: Box::new(Instr::SucceedNow),
        })
    }

    /// Replaces the current fiber's value.
    pub fn set<E: Value>(&self, value: A) -> Effect<(), E> {
        self.modify(move |_| ((), value))
    }

    /// Transforms the current fiber's value.
    pub fn update<E: Value>(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Effect<(), E> {
        self.modify(move |a| ((), f(a)))
    }

    /// Replaces the value, returning the previous one.
    pub fn get_and_set<E: Value>(&self, value: A) -> Effect<A, E> {
        self.modify(move |old| (old, value))
    }

    /// Atomically computes a result and a new value from the current value.
    pub fn modify<B: Value, E: Value>(
        &self,
        f: impl FnOnce(A) -> (B, A) + Send + 'static,
    ) -> Effect<B, E> {
        Effect::from_instr(Instr::FiberRefModify {
            key: Arc::clone(&self.key),
            f: Box::new(move |old| {
                let (b, a) = f(downcast(old));
                (erase(b), erase(a))
            }),
        })
    }

    /// Runs `effect` with the variable set to `value`, restoring the previous
    /// value afterwards whether `effect` succeeds, fails or is interrupted.
    pub fn locally<B: Value, E: Value>(&self, value: A, effect: Effect<B, E>) -> Effect<B, E> {
        Effect::from_instr(Instr::FiberRefLocally {
            key: Arc::clone(&self.key),
            value: erase(value),
            effect: Link::new(effect.into_instr()),
        })
    }

    /// Removes the current fiber's binding so reads see the initial value.
    pub fn delete<E: Value>(&self) -> Effect<(), E> {
        Effect::from_instr(Instr::FiberRefDelete(Arc::clone(&self.key)))
    }

    /// Reads the value and continues with an effect built from it.
    pub fn get_with<B: Value, E: Value>(
        &self,
        f: impl FnOnce(A) -> Effect<B, E> + Send + 'static,
    ) -> Effect<B, E> {
        Effect::from_instr(Instr::FiberRefWith {
            key: Arc::clone(&self.key),
            k: Box::new(move |v| f(downcast(v)).into_instr()),
        })
    }

    /// Reads this variable out of a snapshot of fiber refs.
    #[must_use]
    pub fn get_from(&self, refs: &FiberRefs) -> A {
        downcast(refs.get(&self.key))
    }
}

/// The set of variable bindings owned by one fiber.
#[derive(Clone, Default)]
pub struct FiberRefs {
    bindings: HashMap<u64, (Arc<FiberRefKey>, AnyValue)>,
}

impl FiberRefs {
    /// An empty set of bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of explicit bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// True when no variable is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Binds a typed variable. Used to seed root fibers.
    pub fn insert<A: Value>(&mut self, fiber_ref: &FiberRef<A>, value: A) {
        self.set(&fiber_ref.key, erase(value));
    }

    pub(crate) fn get(&self, key: &Arc<FiberRefKey>) -> AnyValue {
        self.get_opt(key)
            .unwrap_or_else(|| Arc::clone(&key.initial))
    }

    pub(crate) fn get_opt(&self, key: &Arc<FiberRefKey>) -> Option<AnyValue> {
        self.bindings.get(&key.id).map(|(_, v)| Arc::clone(v))
    }

    pub(crate) fn set(&mut self, key: &Arc<FiberRefKey>, value: AnyValue) {
        self.bindings.insert(key.id, (Arc::clone(key), value));
    }

    pub(crate) fn remove(&mut self, key: &Arc<FiberRefKey>) {
        self.bindings.remove(&key.id);
    }

    /// Bindings for a freshly forked child: every value passes through its
    /// variable's fork transform.
    #[must_use]
    pub(crate) fn fork(&self) -> Self {
        let bindings = self
            .bindings
            .iter()
            .map(|(id, (key, value))| (*id, (Arc::clone(key), (key.fork)(value))))
            .collect();
        Self { bindings }
    }

    /// Merges a child's bindings into these, variable by variable.
    pub(crate) fn join(&mut self, child: &Self) {
        for (id, (key, child_value)) in &child.bindings {
            let parent_value = self
                .bindings
                .get(id)
                .map_or_else(|| Arc::clone(&key.initial), |(_, v)| Arc::clone(v));
            let merged = (key.join)(&parent_value, child_value);
            self.bindings.insert(*id, (Arc::clone(key), merged));
        }
    }
}

impl fmt::Debug for FiberRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.bindings.iter().map(|(id, (_, v))| (id, v)))
            .finish()
    }
}

/// Effect that merges `child`'s bindings into the running fiber.
pub(crate) fn inherit_refs(child: FiberRefs) -> Instr {
    Instr::FiberRefModifyAll(Box::new(move |_: FiberId, mut refs: FiberRefs| {
        refs.join(&child);
        (unit(), refs)
    }))
}
