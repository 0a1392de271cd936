use eventuals::{
    collect, filter, iterate, just, map, parallel, range, reduce, run, take_last_n, then, until,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fold a transformed range: 1 + 4 + 9 + 16 + 25.
    let sum = run(range(1, 6)
        | map(then(|x: i64| x * x))
        | reduce(0i64, |acc: i64, x: i64| just((acc + x, true))))?;
    println!("sum of squares: {sum}");

    // Early termination: nothing past the first match flows.
    let prefix = run(range(0, 1000) | until(|x: &i64| *x == 3) | collect::<Vec<i64>>())?;
    println!("until: {prefix:?}");

    // Filters re-request upstream instead of forwarding.
    let evens = run(range(0, 10) | filter(|x: &i64| x % 2 == 0) | collect::<Vec<i64>>())?;
    println!("evens: {evens:?}");

    // A buffering window: only the tail survives.
    let tail = run(iterate(vec![5, 12, 17, 3]) | take_last_n(2) | collect::<Vec<i32>>())?;
    println!("last two: {tail:?}");

    // Fan bodies out across the static thread pool; completion order is
    // not arrival order, so sort before printing.
    let mut doubled = run(range(1, 9)
        | parallel(|| then(|x: i64| x * 2))
        | collect::<Vec<i64>>())?;
    doubled.sort_unstable();
    println!("parallel doubles: {doubled:?}");

    Ok(())
}
