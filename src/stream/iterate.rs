//! Ready-made sources: [`iterate`], [`range`], [`range_step`], [`repeat`].

use super::{stream, StreamSource};
use crate::compose::{Eventual, Piped};
use crate::stream::transform::{map, Map};

/// Stream over anything iterable, by move: `iterate(vec![1, 2, 3])`,
/// `iterate(0..10)`.
pub fn iterate<C>(container: C) -> StreamSource<C::Item, C::IntoIter>
where
    C: IntoIterator,
    C::Item: Send + 'static,
    C::IntoIter: Send + 'static,
{
    stream::<C::Item>()
        .context(container.into_iter())
        .on_next(|iter, emitter| match iter.next() {
            Some(value) => emitter.emit(value),
            None => emitter.end(),
        })
}

/// Integer stream `[from, to)` with step 1.
pub fn range(from: i64, to: i64) -> StreamSource<i64, (i64, i64, i64)> {
    range_step(from, to, 1)
}

/// Integer stream from `from` toward `to` by `step`. Ends immediately on a
/// zero step or a step pointing away from `to`.
pub fn range_step(from: i64, to: i64, step: i64) -> StreamSource<i64, (i64, i64, i64)> {
    stream::<i64>()
        .context((from, to, step))
        .on_next(|state, emitter| {
            let (ref mut from, to, step) = *state;
            let exhausted =
                *from == to || step == 0 || (*from > to && step > 0) || (*from < to && step < 0);
            if exhausted {
                emitter.end();
            } else {
                let value = *from;
                *from += step;
                emitter.emit(value);
            }
        })
}

/// An infinite stream of units; pipe transforms on to give it substance
/// (`repeat_unit() | map(...) | until(...)`).
pub fn repeat_unit() -> StreamSource<(), ()> {
    stream::<()>().on_next(|_ctx, emitter| emitter.emit(()))
}

/// An infinite stream that runs a fresh clone of `e` per requested element;
/// each success is one body, and an error terminates the stream.
pub fn repeat<E>(e: E) -> Piped<StreamSource<(), ()>, Map<E>>
where
    E: Eventual<()> + Clone + Send + 'static,
{
    repeat_unit() | map(e)
}

#[cfg(test)]
mod tests {
    use crate::eventual::just;
    use crate::stream::iterate::{iterate, range, range_step, repeat};
    use crate::stream::sink::collect;
    use crate::stream::transform::until;
    use crate::terminal::run;

    #[test]
    fn test_iterate_round_trips() {
        let xs = vec![5, 12, 17, 3];
        let result = run(iterate(xs.clone()) | collect::<Vec<i32>>()).unwrap();
        assert_eq!(result, xs);
    }

    #[test]
    fn test_iterate_empty() {
        let result = run(iterate(Vec::<i32>::new()) | collect::<Vec<i32>>()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_range_basic() {
        let result = run(range(1, 6) | collect::<Vec<i64>>()).unwrap();
        assert_eq!(result, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_range_direction_mismatch_is_empty() {
        let result = run(range_step(0, 10, -1) | collect::<Vec<i64>>()).unwrap();
        assert!(result.is_empty());

        let result = run(range_step(5, 5, 1) | collect::<Vec<i64>>()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_range_negative_step() {
        let result = run(range_step(5, 0, -2) | collect::<Vec<i64>>()).unwrap();
        assert_eq!(result, vec![5, 3, 1]);
    }

    #[test]
    fn test_repeat_produces_fresh_values() {
        let result = run(repeat(just(1))
            | until({
                let mut seen = 0;
                move |_x: &i32| {
                    seen += 1;
                    seen > 4
                }
            })
            | collect::<Vec<i32>>())
        .unwrap();
        assert_eq!(result, vec![1, 1, 1, 1]);
    }
}
