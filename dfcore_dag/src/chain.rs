//! The pipelined local-operator chain (C6, §4.6): fusing a run of
//! `map`/`filter`/`flat_map`/window/`zip_with_index` operators into a
//! single per-item push function, so a `Local` node never materializes
//! its output — it only ever hands items forward to its child's chain.
//!
//! This is plain synchronous CPU work inside one stage, not an I/O
//! boundary, so the chain is built from boxed `FnMut` closures rather
//! than an async `Sink`: each combinator wraps the next stage's emit
//! function into a new one.

use std::collections::VecDeque;

use dfcore_error::Result;

/// A fused push target: call it once per item, it does whatever the
/// chain from this point on does (transform, filter, forward to more
/// than one downstream call, or materialize into a stage's output).
pub type Emit<T> = Box<dyn FnMut(T) -> Result<()> + Send>;

/// Wraps a plain function as the chain's terminal emit, e.g. writing
/// into a [`dfcore_data::Writer`] or a [`dfcore_net::StreamWriter`].
pub fn emit_fn<T>(f: impl FnMut(T) -> Result<()> + Send + 'static) -> Emit<T> {
    Box::new(f)
}

/// `map(f)`: one-to-one transform (§4.6 "Mandatory LOps").
pub fn map<A, B>(mut f: impl FnMut(A) -> B + Send + 'static, mut next: Emit<B>) -> Emit<A> {
    Box::new(move |item: A| next(f(item)))
}

/// `filter(p)`: zero-or-one, drops items `p` rejects.
pub fn filter<A>(mut p: impl FnMut(&A) -> bool + Send + 'static, mut next: Emit<A>) -> Emit<A> {
    Box::new(move |item: A| if p(&item) { next(item) } else { Ok(()) })
}

/// `flat_map(g)`: zero-or-many, pushing every item `g` yields.
pub fn flat_map<A, B, I>(mut g: impl FnMut(A) -> I + Send + 'static, mut next: Emit<B>) -> Emit<A>
where
    I: IntoIterator<Item = B>,
{
    Box::new(move |item: A| {
        for out in g(item) {
            next(out)?;
        }
        Ok(())
    })
}

/// `zip_with_index`: augments each item with its global position in
/// the local item sequence (§4.6). The counter is per-chain-instance,
/// so a worker's zip starts at the prefix sum it was handed, not at 0
/// (distributing this offset collectively is the caller's job; the
/// chain itself just counts).
pub fn zip_with_index<A>(start: u64, mut next: Emit<(u64, A)>) -> Emit<A> {
    let mut index = start;
    Box::new(move |item: A| {
        let out = (index, item);
        index += 1;
        next(out)
    })
}

/// `window(k, f)`: a dense sliding window of size `k` over the local
/// item sequence; `f` is applied to every full window of `k` items as
/// soon as one completes, and the window advances by one each push.
/// Fewer than `k` items seen overall never produce output (§4.6).
pub fn window<A, B>(k: usize, mut f: impl FnMut(&[A]) -> B + Send + 'static, mut next: Emit<B>) -> Emit<A>
where
    A: Clone + Send + 'static,
{
    assert!(k > 0, "window size must be positive");
    let mut buf: VecDeque<A> = VecDeque::with_capacity(k);
    Box::new(move |item: A| {
        buf.push_back(item);
        if buf.len() > k {
            buf.pop_front();
        }
        if buf.len() == k {
            let snapshot: Vec<A> = buf.iter().cloned().collect();
            next(f(&snapshot))?;
        }
        Ok(())
    })
}

/// `flat_window(k, f)`: like [`window`] but `f` yields zero or more
/// outputs per completed window instead of exactly one.
pub fn flat_window<A, B, I>(k: usize, mut f: impl FnMut(&[A]) -> I + Send + 'static, mut next: Emit<B>) -> Emit<A>
where
    A: Clone + Send + 'static,
    I: IntoIterator<Item = B>,
{
    assert!(k > 0, "window size must be positive");
    let mut buf: VecDeque<A> = VecDeque::with_capacity(k);
    Box::new(move |item: A| {
        buf.push_back(item);
        if buf.len() > k {
            buf.pop_front();
        }
        if buf.len() == k {
            let snapshot: Vec<A> = buf.iter().cloned().collect();
            for out in f(&snapshot) {
                next(out)?;
            }
        }
        Ok(())
    })
}
