//! Racing awaitables: a slow operation against a timeout.

use std::rc::Rc;
use std::time::Duration;

use remora::{Looper, async_delay, init_scheduler, start_async, wait_any};

fn main() {
    env_logger::init();

    let looper = Looper::new("main");
    init_scheduler(Rc::new(looper.scheduler()));

    let timer = looper.clone();
    let quitter = looper.clone();
    let race = start_async("race", move || {
        let work = async_delay(&timer, Duration::from_millis(500));
        let timeout = async_delay(&timer, Duration::from_millis(200));

        let members = [(work, "work"), (timeout, "timeout")];
        match wait_any(&members) {
            Some(index) => println!("winner: {}", members[index].1),
            None => println!("nothing to race"),
        }

        quitter.quit();
        Ok(())
    });

    looper.run();

    assert!(race.did_complete());
}
