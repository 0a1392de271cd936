//! # Eventuals
//!
//! Composable asynchronous pipelines. An **eventual** is a lazily-executed
//! stage; the `|` operator chains stages into statically typed pipelines
//! where each stage's output feeds the next stage's input, failures
//! short-circuit to the terminal, and a single [`Interrupt`] propagates
//! cancellation to every stage that registered interest.
//!
//! Three families compose:
//!
//! - **Single-value eventuals**: [`just`], [`raise`], [`then`],
//!   [`and_then`], [`conditional`], [`catch`], and the [`eventual`] builder
//!   for integrating external event sources.
//! - **Streams**: sources ([`stream`], [`iterate`], [`range`],
//!   [`repeat`]), per-body transforms ([`map`], [`filter`], [`until`],
//!   take windows), and loop-shaped sinks ([`collect`], [`reduce`],
//!   [`head`], [`loop_`]) with one-element-in-flight backpressure.
//! - **Synchronization**: the cooperative [`Lock`] with
//!   [`acquire`]/[`release`] stages, [`ConditionVariable`],
//!   [`Notification`], and the [`Synchronizable`] mixin.
//!
//! Execution is driven by schedulers: the default runs everything
//! synchronously on the calling thread, while [`StaticThreadPool`] pins a
//! worker per core; [`reschedule`], [`preempt`], [`Schedulable::schedule`],
//! and [`parallel`] hop pipelines between them.
//!
//! ## Quick start
//!
//! ```
//! use eventuals::{just, run, then};
//!
//! let value = run(just(1) | then(|x: i32| x + 2) | then(|x: i32| x.to_string())).unwrap();
//! assert_eq!(value, "3");
//! ```
//!
//! Streams fold the same way:
//!
//! ```
//! use eventuals::{just, map, range, reduce, run, then};
//!
//! let sum = run(range(1, 6)
//!     | map(then(|x: i64| x * x))
//!     | reduce(0i64, |acc: i64, x: i64| just((acc + x, true))))
//! .unwrap();
//! assert_eq!(sum, 55);
//! ```
//!
//! A pipeline is inert until driven: [`run`] blocks the calling thread,
//! while [`promisify`] splits it into a future and a [`Driver`] so the
//! caller chooses when to start and when to await.

pub mod compose;
pub mod conditional;
pub mod condvar;
pub mod continuation;
pub mod error;
pub mod eventual;
pub mod interrupt;
pub mod lock;
pub mod pool;
pub mod scheduler;
pub mod stream;
pub mod terminal;
pub mod then;

pub use compose::{Eventual, EventualStream, Piped, Stage, StreamSink, StreamTransform};
pub use conditional::{catch, conditional};
pub use condvar::{ConditionVariable, Notification};
pub use continuation::Continuation;
pub use error::{Error, Result};
pub use eventual::{eventual, just, raise, EventualHandle};
pub use interrupt::Interrupt;
pub use lock::{acquire, release, Lock, Synchronizable, Synchronized};
pub use pool::{
    parallel, parallel_on, schedule_on, Pinned, PoolConfig, Requirements, Schedulable,
    StaticThreadPool,
};
pub use scheduler::{
    current, default_scheduler, init_default, preempt, reschedule, Context, ContextGuard,
    DirectScheduler, Scheduler,
};
pub use stream::iterate::{iterate, range, range_step, repeat, repeat_unit};
pub use stream::sink::{collect, head, loop_, reduce, SinkHandle, StreamCtl};
pub use stream::transform::{
    filter, map, take_first_n, take_last_n, take_range, until, until_eventual,
};
pub use stream::{stream, Emitter, StreamBuilder, StreamSource};
pub use terminal::{promisify, run, terminal, Driver, PipelineFuture, Terminal};
pub use then::{and_then, closure, let_bind, then};
