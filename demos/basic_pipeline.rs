use eventuals::{catch, conditional, just, promisify, raise, run, then, Interrupt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Chain single-value stages with `|`; nothing runs until driven.
    let value = run(just(40) | then(|x: i32| x + 2) | then(|x: i32| x.to_string()))?;
    println!("pipe-through: {value}");

    // Branch on the value; both branches yield the same type.
    let size = run(just(42)
        | conditional(
            |x: &i32| *x > 10,
            |_| just("big"),
            |_| just("small"),
        ))?;
    println!("conditional: {size}");

    // Recover from a failure mid-pipeline.
    let recovered = run(raise::<i32>("upstream broke") | catch(|_err| just(-1)) | then(|x: i32| x + 1))?;
    println!("catch: {recovered}");

    // Drive explicitly: promisify splits a pipeline into future + driver,
    // and an interrupt can cancel in between.
    let e = eventuals::eventual::<i32>()
        .on_start(|_handle, ()| {
            // Suspended: only the interrupt will finish this one.
        })
        .on_interrupt(|handle| handle.stop());

    let (future, mut driver) = promisify(e);
    let interrupt = Interrupt::new();
    driver.register(&interrupt);
    driver.start();
    interrupt.trigger();

    match futures::executor::block_on(future) {
        Err(eventuals::Error::Stopped) => println!("interrupt: pipeline stopped"),
        other => println!("interrupt: unexpected {other:?}"),
    }

    Ok(())
}
