//! Completing an awaitable with work done on another thread.
//!
//! Completers are thread-bound: the worker never touches one. It ships its
//! result over a channel, and a loop-thread action polls the channel and
//! fires the completer on the master, which is the supported dispatch
//! pattern for cross-thread completion.

use std::rc::Rc;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use remora::{Awaitable, Completer, Failure, Looper, init_scheduler, start_async};

fn poll_worker(looper: Looper, receiver: Receiver<u64>, completer: Completer) {
    match receiver.try_recv() {
        Ok(value) => {
            println!("worker produced {value}");
            completer.complete();
        }
        Err(TryRecvError::Empty) => {
            let again = looper.clone();
            looper.schedule_local(Duration::from_millis(10), move || {
                poll_worker(again, receiver, completer)
            });
        }
        Err(TryRecvError::Disconnected) => {
            completer.fail(Failure::msg("worker vanished"));
        }
    }
}

fn main() {
    env_logger::init();

    let looper = Looper::new("main");
    init_scheduler(Rc::new(looper.scheduler()));

    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        sender.send(42).expect("main loop went away");
    });

    let answer = Rc::new(Awaitable::new("answer"));
    poll_worker(looper.clone(), receiver, answer.take_completer());

    let awaited = answer.clone();
    let quitter = looper.clone();
    let consumer = start_async("consumer", move || {
        println!("waiting for the worker...");
        awaited.wait()?;
        println!("worker result has arrived");
        quitter.quit();
        Ok(())
    });

    looper.run();

    assert!(consumer.did_complete());
}
