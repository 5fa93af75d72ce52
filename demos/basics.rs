//! Sequential-looking asynchronous code: a coroutine ticking on timers.
//!
//! Run with `RUST_LOG=debug` to watch the context switches.

use std::rc::Rc;
use std::time::Duration;

use remora::{Looper, async_delay, init_scheduler, start_async};

fn main() {
    env_logger::init();

    let looper = Looper::new("main");
    init_scheduler(Rc::new(looper.scheduler()));

    let timer = looper.clone();
    let ticker = start_async("ticker", move || {
        for beat in 1..=3 {
            println!("tick {beat}");
            async_delay(&timer, Duration::from_millis(300)).wait()?;
        }
        println!("ticker finished");
        Ok(())
    });

    let quitter = looper.clone();
    ticker.then(move |outcome| {
        match outcome {
            Ok(()) => println!("all done"),
            Err(failure) => println!("failed: {failure}"),
        }
        quitter.quit();
    });

    looper.run();
}
