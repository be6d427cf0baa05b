//! Standard derivations over the promise core: `map`/`and_then` (the
//! typed stand-ins for a bare `then` with only one branch supplied),
//! `map_err`/`or_else`/`catch`, `finally`, `all`, `race`, and `follow`.
//! These are external collaborators built purely on the public
//! `then`/scope surface; nothing about them needs privileged access to
//! [`crate::promise::Inner`] beyond what this crate already exposes to
//! itself, so they live here rather than in a separate downstream crate.

use std::cell::{Cell, RefCell};
use std::fmt::Display;
use std::rc::Rc;

use crate::promise::{Disposition, Outcome, Promise, Resolver};
use crate::scope;

impl<T: Clone + 'static, E: Clone + Display + 'static> Promise<T, E> {
    /// An already-fulfilled promise, equivalent to the source's
    /// `Promise.resolve(value)` for a plain (non-thenable) value.
    pub fn resolved(value: T) -> Self {
        Self::settled_value(value)
    }

    /// An already-rejected promise. Enters the unhandled-rejection list
    /// immediately, exactly as a live `reject()` call would, so a
    /// `Promise::rejected(x)` with no `.then`/`.catch` attached before the
    /// next tick reports the same as any other unhandled rejection.
    pub fn rejected(reason: E) -> Self {
        Self::settled_rejected(reason)
    }

    /// Transform the fulfilled value; a rejection passes through
    /// unchanged (same `Rc`, so it remains the same unhandled-rejection
    /// entry further down the chain).
    pub fn map<U: Clone + 'static>(&self, f: impl FnOnce(T) -> U + 'static) -> Promise<U, E> {
        self.propagate_fulfill_map(move |v| Outcome::Value(f(v)))
    }

    /// Chain another promise-producing step onto the fulfilled value.
    pub fn and_then<U: Clone + 'static>(&self, f: impl FnOnce(T) -> Promise<U, E> + 'static) -> Promise<U, E> {
        self.propagate_fulfill_map(move |v| Outcome::Chain(f(v)))
    }

    /// Transform the rejection reason; a fulfilled value passes through
    /// unchanged.
    pub fn map_err<F: Clone + Display + 'static>(&self, f: impl FnOnce(E) -> F + 'static) -> Promise<T, F> {
        self.propagate_reject_map(move |e| Disposition::Settle(Outcome::Reject(f(e))))
    }

    /// Chain another promise-producing step onto the rejection reason.
    pub fn or_else(&self, f: impl FnOnce(E) -> Promise<T, E> + 'static) -> Promise<T, E> {
        self.propagate_reject_map(move |e| Disposition::Settle(Outcome::Chain(f(e))))
    }

    /// Filtered rejection handler, standing in for the source's
    /// `catch(type, cb)` (a constructor `instanceof` test or a string
    /// matched against `reason.name`). A typed target has no runtime type
    /// tags to probe, so the filter is an explicit predicate over `&E`
    /// instead; a non-matching reason re-rejects through `Passthrough`,
    /// which keeps the original `Rc` and does **not** count as handled —
    /// matching the "forwarded, not observed" rule for rejections that
    /// fall through every `catch` on the chain.
    pub fn catch(&self, matches: impl Fn(&E) -> bool + 'static, f: impl FnOnce(E) -> Outcome<T, E> + 'static) -> Promise<T, E> {
        self.propagate_reject_map(move |e| if matches(&e) { Disposition::Settle(f(e)) } else { Disposition::Passthrough })
    }

    /// Run `cb` regardless of outcome, forwarding the original value or
    /// rejection unchanged.
    pub fn finally(&self, cb: impl Fn() + 'static) -> Promise<T, E> {
        self.finally_raw(Rc::new(cb))
    }

    /// Resolves to the fulfilled values of every input promise, in input
    /// order, once all have fulfilled; rejects with the first rejection
    /// observed, in settlement order (not necessarily input order). An
    /// empty input resolves immediately with an empty vec, same as the
    /// source's `Promise.all([])`.
    pub fn all(items: Vec<Promise<T, E>>) -> Promise<Vec<T>, E> {
        let total = items.len();
        if total == 0 {
            return Promise::resolved(Vec::new());
        }
        let results: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new((0..total).map(|_| None).collect()));
        let remaining = Rc::new(Cell::new(total));
        let settled = Rc::new(Cell::new(false));
        Promise::new(move |resolver| {
            for (index, item) in items.into_iter().enumerate() {
                let results = results.clone();
                let remaining = remaining.clone();
                let settled = settled.clone();
                let resolver_ok = resolver.clone();
                let resolver_err = resolver.clone();
                item.then(
                    move |value| {
                        if !settled.get() {
                            results.borrow_mut()[index] = Some(value);
                            remaining.set(remaining.get() - 1);
                            if remaining.get() == 0 {
                                settled.set(true);
                                let collected = results.borrow_mut().iter_mut().map(|slot| slot.take().unwrap()).collect();
                                resolver_ok.resolve(collected);
                            }
                        }
                        Outcome::Value(())
                    },
                    move |reason: E| {
                        if !settled.replace(true) {
                            resolver_err.reject(reason);
                        }
                        Outcome::Value(())
                    },
                );
            }
            Ok(())
        })
    }

    /// Settles with whichever input promise settles first. An empty input
    /// never settles, same as the source's `Promise.race([])`.
    pub fn race(items: Vec<Promise<T, E>>) -> Promise<T, E> {
        Promise::new(move |resolver| {
            let settled = Rc::new(Cell::new(false));
            for item in items {
                let settled = settled.clone();
                let resolver_ok = resolver.clone();
                let resolver_err = resolver.clone();
                item.then(
                    move |value| {
                        if !settled.replace(true) {
                            resolver_ok.resolve(value);
                        }
                        Outcome::Value(())
                    },
                    move |reason| {
                        if !settled.replace(true) {
                            resolver_err.reject(reason);
                        }
                        Outcome::Value(())
                    },
                );
            }
            Ok(())
        })
    }
}

/// Run `body` under a fresh scope that owns its own unhandled-rejection
/// list, returning a promise that resolves with `()` once that scope's
/// tracked work has all settled with nothing left unhandled, or rejects
/// with the first reason that went unhandled inside it.
///
/// `body` takes no `resolve`/`reject` pair and operates purely by
/// constructing promises under the ambient scope `follow` installs;
/// whatever those promises eventually do (or fail to do) about their own
/// rejections is what `follow`'s returned promise reports.
///
/// A rejection that is handled anywhere within `body`'s scope before it
/// finalizes never reaches the returned promise at all — this is what
/// lets `follow` consume an error instead of letting it propagate to the
/// global unhandled-rejection sink.
pub fn follow<E: Clone + Display + 'static>(body: impl FnOnce() + 'static) -> Promise<(), E> {
    let resolver_handle: Rc<RefCell<Option<Resolver<(), E>>>> = Rc::new(RefCell::new(None));
    let resolver_for_ctor = resolver_handle.clone();
    let result: Promise<(), E> = Promise::new(move |resolver| {
        *resolver_for_ctor.borrow_mut() = Some(resolver);
        Ok(())
    });

    let settled = Rc::new(Cell::new(false));
    let resolver_for_sink = resolver_handle.clone();
    let settled_for_sink = settled.clone();
    let sink: Rc<dyn Fn(&crate::scope::UnhandledEntry)> = Rc::new(move |entry| {
        if settled_for_sink.replace(true) {
            return;
        }
        if let Ok(reason) = entry.reason.clone().downcast::<E>() {
            if let Some(resolver) = resolver_for_sink.borrow().as_ref() {
                resolver.reject((*reason).clone());
            }
        }
    });

    let tracked = scope::new_tracked_scope(sink);
    scope::incr_ref(&tracked);
    scope::use_psd(&tracked, body);

    let resolver_for_finalize = resolver_handle.clone();
    let settled_for_finalize = settled;
    scope::set_extra_finalize(
        &tracked,
        Box::new(move || {
            if !settled_for_finalize.replace(true) {
                if let Some(resolver) = resolver_for_finalize.borrow().as_ref() {
                    resolver.resolve(());
                }
            }
        }),
    );
    scope::decr_ref(&tracked);

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler;

    fn drain() {
        scheduler::physical_tick();
    }

    #[test]
    fn all_resolves_in_input_order() {
        let collected = Rc::new(RefCell::new(Vec::new()));
        let collected2 = collected.clone();
        let items = vec![Promise::<i32, String>::resolved(1), Promise::resolved(2), Promise::resolved(3)];
        Promise::all(items).then(
            move |v| {
                *collected2.borrow_mut() = v;
                Outcome::Value(())
            },
            |_: String| Outcome::Value(()),
        );
        drain();
        assert_eq!(*collected.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn all_rejects_with_first_rejection() {
        let seen = Rc::new(RefCell::new(String::new()));
        let seen2 = seen.clone();
        let items = vec![
            Promise::<i32, String>::resolved(1),
            Promise::rejected("boom".to_string()),
        ];
        Promise::all(items).then(
            |_| Outcome::Value(()),
            move |e: String| {
                *seen2.borrow_mut() = e;
                Outcome::Value(())
            },
        );
        drain();
        assert_eq!(*seen.borrow(), "boom");
    }

    #[test]
    fn all_of_empty_resolves_immediately_to_empty_vec() {
        let p: Promise<Vec<i32>, String> = Promise::all(Vec::new());
        assert!(!p.is_pending());
    }

    #[test]
    fn race_settles_with_first_to_fulfill() {
        let winner = Rc::new(RefCell::new(0));
        let winner2 = winner.clone();
        let items = vec![Promise::<i32, String>::resolved(7), Promise::resolved(9)];
        Promise::race(items).then(
            move |v| {
                *winner2.borrow_mut() = v;
                Outcome::Value(())
            },
            |_: String| Outcome::Value(()),
        );
        drain();
        assert_eq!(*winner.borrow(), 7);
    }

    #[test]
    fn catch_non_matching_reason_does_not_mark_handled() {
        let p: Promise<i32, String> = Promise::rejected("other".into());
        p.catch(|e| e == "not-this-one", |e| Outcome::Reject(e));
        drain();
        assert_eq!(scope::current_scope_stats().unhandled_count, 1);
    }

    #[test]
    fn catch_matching_reason_marks_handled() {
        let p: Promise<i32, String> = Promise::rejected("target".into());
        p.catch(|e| e == "target", |_| Outcome::Value(0));
        drain();
        assert_eq!(scope::current_scope_stats().unhandled_count, 0);
    }

    #[test]
    fn follow_rejects_with_unhandled_reason_from_inside_its_scope() {
        let observed = Rc::new(RefCell::new(String::new()));
        let observed2 = observed.clone();
        follow::<String>(|| {
            Promise::<i32, String>::rejected("x".into());
        })
        .then(
            |_| Outcome::Value(()),
            move |e| {
                *observed2.borrow_mut() = e;
                Outcome::Value(())
            },
        );
        drain();
        assert_eq!(*observed.borrow(), "x");
        assert_eq!(scope::current_scope_stats().unhandled_count, 0);
    }

    #[test]
    fn follow_resolves_when_nothing_goes_unhandled() {
        let ok = Rc::new(Cell::new(false));
        let ok2 = ok.clone();
        follow::<String>(|| {
            Promise::<i32, String>::resolved(1);
        })
        .then(
            move |_| {
                ok2.set(true);
                Outcome::Value(())
            },
            |_: String| Outcome::Value(()),
        );
        drain();
        assert!(ok.get());
    }
}
