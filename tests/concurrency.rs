use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use mpi_request::error::Callback;
use mpi_request::request::generalized::CallbackResult;
use mpi_request::traits::*;
use mpi_request::{
    Error, ErrorClass, GeneralizedOps, InitOptions, LockingMode, RawRequest, Request,
    RequestCollection, Status, Universe,
};

fn universe(locking: LockingMode) -> Universe {
    let _ = env_logger::builder().is_test(true).try_init();
    Universe::with_options(
        InitOptions::new()
            .locking(locking)
            .channels(4)
            .endpoints(4),
    )
}

struct Counted(Arc<AtomicUsize>);

impl GeneralizedOps for Counted {
    fn query(&mut self, status: &mut Status) -> CallbackResult {
        status.set_count(1);
        Ok(())
    }

    fn free(&mut self) -> CallbackResult {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cancel(&mut self, _complete: bool) -> CallbackResult {
        Ok(())
    }
}

fn exchange_messages(locking: LockingMode) {
    const ROUNDS: i32 = 50;
    let universe = universe(locking);
    let endpoints = universe.size();

    thread::scope(|s| {
        for rank in 0..endpoints {
            let universe = &universe;
            s.spawn(move || {
                let next = (rank + 1) % endpoints;
                let prev = (rank + endpoints - 1) % endpoints;
                for round in 0..ROUNDS {
                    let receive = universe.immediate_receive(rank, Some(prev), Some(round)).unwrap();
                    let send = universe
                        .immediate_send(rank, next, round, vec![rank as u8; 4])
                        .unwrap();

                    let (data, status) = universe.wait_receive(receive).unwrap();
                    assert_eq!(data, vec![prev as u8; 4]);
                    assert_eq!(status.source_rank(), Some(prev));
                    assert_eq!(status.tag(), Some(round));
                    universe.wait(send).unwrap();
                }
            });
        }
    });
    assert_eq!(universe.live_requests(), 0);
}

#[test]
fn ring_exchange_with_global_lock() {
    exchange_messages(LockingMode::Global);
}

#[test]
fn ring_exchange_with_channel_locks() {
    exchange_messages(LockingMode::PerChannel);
}

#[test]
fn synchronous_sends_across_threads() {
    let universe = universe(LockingMode::PerChannel);
    thread::scope(|s| {
        let universe = &universe;
        s.spawn(move || {
            for tag in 0..20 {
                let send = universe
                    .immediate_synchronous_send(0, 3, tag, vec![tag as u8])
                    .unwrap();
                universe.wait(send).unwrap();
            }
        });
        s.spawn(move || {
            for tag in 0..20 {
                let receive = universe.immediate_receive(3, Some(0), Some(tag)).unwrap();
                assert_eq!(universe.wait_receive(receive).unwrap().0, vec![tag as u8]);
            }
        });
    });
}

#[test]
fn generalized_requests_completed_by_helper_threads() {
    const REQUESTS: usize = 32;
    let universe = universe(LockingMode::PerChannel);
    let freed = Arc::new(AtomicUsize::new(0));

    let mut requests: Vec<RawRequest> = (0..REQUESTS)
        .map(|_| {
            universe
                .generalized_request_start(Counted(freed.clone()))
                .unwrap()
        })
        .collect();

    thread::scope(|s| {
        for chunk in requests.chunks(8) {
            let universe = &universe;
            s.spawn(move || {
                for &request in chunk.iter().rev() {
                    thread::sleep(Duration::from_millis(1));
                    universe.generalized_request_complete(request).unwrap();
                }
            });
        }
    });

    let statuses = universe.wait_all(&mut requests).unwrap();
    assert!(statuses.iter().all(|status| status.count() == 1));
    assert_eq!(freed.load(Ordering::SeqCst), REQUESTS);
    assert_eq!(universe.live_requests(), 0);
}

#[test]
fn several_waiters_on_one_collection() {
    let universe = universe(LockingMode::Global);
    let freed = Arc::new(AtomicUsize::new(0));

    let (requests, completers): (Vec<_>, Vec<_>) = (0..6)
        .map(|_| universe.generalized_request(Counted(freed.clone())).unwrap())
        .unzip();
    let (first, second) = {
        let mut requests = requests.into_iter();
        let first = requests.by_ref().take(3).collect_requests(&universe);
        let second = requests.collect_requests(&universe);
        (first, second)
    };

    let wait = |mut collection: RequestCollection<'_>| {
        let mut completed = 0;
        while let Some(done) = collection.wait_some().unwrap() {
            completed += done.len();
        }
        completed
    };

    let (a, b) = thread::scope(|s| {
        let a = s.spawn(move || wait(first));
        let b = s.spawn(move || wait(second));
        for completer in completers.into_iter().rev() {
            thread::sleep(Duration::from_millis(2));
            completer.complete().unwrap();
        }
        (a.join().unwrap(), b.join().unwrap())
    });
    assert_eq!((a, b), (3, 3));
    assert_eq!(freed.load(Ordering::SeqCst), 6);
}

#[test]
fn barrier_across_threads() {
    let universe = universe(LockingMode::PerChannel);
    thread::scope(|s| {
        for rank in 0..universe.size() {
            let universe = &universe;
            s.spawn(move || {
                for _ in 0..10 {
                    let barrier = Request::from_raw(universe.immediate_barrier(rank).unwrap(), universe);
                    barrier.wait().unwrap();
                }
            });
        }
    });
    assert_eq!(universe.live_requests(), 0);
}

#[derive(Default)]
struct Shared {
    request: AtomicU64,
    completions: AtomicUsize,
    frees: AtomicUsize,
}

/// A generalized request whose `cancel` callback completes the request itself.
struct CompletesOnCancel {
    universe: Arc<Universe>,
    shared: Arc<Shared>,
    /// signalled once the callback runs, then awaited before completing
    rendezvous: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
    outcome: CallbackResult,
}

impl GeneralizedOps for CompletesOnCancel {
    fn query(&mut self, _status: &mut Status) -> CallbackResult {
        Ok(())
    }

    fn free(&mut self) -> CallbackResult {
        self.shared.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cancel(&mut self, _complete: bool) -> CallbackResult {
        if let Some((ref running, ref resume)) = self.rendezvous {
            running.send(()).unwrap();
            resume.recv().unwrap();
        }
        let request = self.shared.request.load(Ordering::SeqCst);
        if self.universe.generalized_request_complete(request).is_ok() {
            self.shared.completions.fetch_add(1, Ordering::SeqCst);
        }
        self.outcome
    }
}

fn start_completing_on_cancel(
    universe: &Arc<Universe>,
    rendezvous: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
    outcome: CallbackResult,
) -> (RawRequest, Arc<Shared>) {
    let shared = Arc::new(Shared::default());
    let request = universe
        .generalized_request_start(CompletesOnCancel {
            universe: universe.clone(),
            shared: shared.clone(),
            rendezvous,
            outcome,
        })
        .unwrap();
    shared.request.store(request, Ordering::SeqCst);
    (request, shared)
}

#[test]
fn cancel_callback_completes_a_request_freed_meanwhile() {
    let universe = Arc::new(universe(LockingMode::Global));
    let (running_tx, running_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel();
    let (request, shared) =
        start_completing_on_cancel(&universe, Some((running_tx, resume_rx)), Ok(()));

    let (done_tx, done_rx) = mpsc::channel();
    let canceller = {
        let universe = universe.clone();
        thread::spawn(move || done_tx.send(universe.cancel(request)).unwrap())
    };

    running_rx.recv().unwrap();
    universe.request_free(request).unwrap();
    resume_tx.send(()).unwrap();

    let cancelled = done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("cancel did not return");
    canceller.join().unwrap();
    assert_eq!(cancelled, Ok(()));
    assert_eq!(shared.completions.load(Ordering::SeqCst), 1);
    assert_eq!(shared.frees.load(Ordering::SeqCst), 1);
    assert_eq!(universe.live_requests(), 0);
}

#[test]
fn failing_cancel_that_completes_reaches_the_waiter() {
    let universe = Arc::new(universe(LockingMode::Global));
    let (request, shared) =
        start_completing_on_cancel(&universe, None, Err(ErrorClass::User(9)));

    let (done_tx, done_rx) = mpsc::channel();
    let waiter = {
        let universe = universe.clone();
        thread::spawn(move || done_tx.send(universe.wait(request)).unwrap())
    };
    thread::sleep(Duration::from_millis(20));

    assert_eq!(universe.cancel(request), Ok(()));
    let waited = done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("wait did not return");
    waiter.join().unwrap();

    assert_eq!(
        waited.unwrap_err(),
        Error::Callback {
            request,
            callback: Callback::Cancel,
            class: ErrorClass::User(9),
        }
    );
    assert_eq!(shared.frees.load(Ordering::SeqCst), 1);
    assert_eq!(universe.live_requests(), 0);
}

#[test]
fn failing_cancel_on_a_freed_handle_is_returned() {
    let universe = Arc::new(universe(LockingMode::Global));
    let (running_tx, running_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel();
    let (request, shared) = start_completing_on_cancel(
        &universe,
        Some((running_tx, resume_rx)),
        Err(ErrorClass::User(4)),
    );

    let canceller = {
        let universe = universe.clone();
        thread::spawn(move || universe.cancel(request))
    };
    running_rx.recv().unwrap();
    universe.request_free(request).unwrap();
    resume_tx.send(()).unwrap();

    assert_eq!(
        canceller.join().unwrap(),
        Err(Error::Callback {
            request,
            callback: Callback::Cancel,
            class: ErrorClass::User(4),
        })
    );
    assert_eq!(shared.frees.load(Ordering::SeqCst), 1);
    assert_eq!(universe.live_requests(), 0);
}

#[test]
fn cancel_races_complete() {
    const ROUNDS: usize = 200;
    let universe = Arc::new(universe(LockingMode::Global));

    for _ in 0..ROUNDS {
        let (request, shared) = start_completing_on_cancel(&universe, None, Ok(()));
        let completed_here = thread::scope(|s| {
            let canceller = s.spawn(|| universe.cancel(request));
            let completer = s.spawn(|| universe.generalized_request_complete(request).is_ok());
            let waited = s.spawn(|| universe.wait(request));

            // the waiter retires the handle, so a late cancel finds it gone
            match canceller.join().unwrap() {
                Ok(()) => {}
                Err(err) => assert_eq!(err, Error::InvalidHandle(request)),
            }
            assert!(waited.join().unwrap().is_ok());
            completer.join().unwrap()
        });

        let completions = shared.completions.load(Ordering::SeqCst) + usize::from(completed_here);
        assert_eq!(completions, 1);
        assert_eq!(shared.frees.load(Ordering::SeqCst), 1);
    }
    assert_eq!(universe.live_requests(), 0);
}

#[test]
fn complete_wait_cancel_and_free_race_on_one_handle() {
    const ROUNDS: usize = 200;
    let universe = universe(LockingMode::Global);
    let freed = Arc::new(AtomicUsize::new(0));

    for _ in 0..ROUNDS {
        let before = freed.load(Ordering::SeqCst);
        let request = universe
            .generalized_request_start(Counted(freed.clone()))
            .unwrap();
        let start = Barrier::new(4);

        thread::scope(|s| {
            let universe = &universe;
            let start = &start;
            let gone = move |result: mpi_request::Result<()>| match result {
                Ok(()) => {}
                Err(err) => assert_eq!(err, Error::InvalidHandle(request)),
            };

            s.spawn(move || {
                start.wait();
                universe.generalized_request_complete(request).unwrap();
            });
            s.spawn(move || {
                start.wait();
                gone(universe.wait(request).map(|_| ()));
            });
            s.spawn(move || {
                start.wait();
                gone(universe.cancel(request));
            });
            s.spawn(move || {
                start.wait();
                gone(universe.request_free(request));
            });
        });

        assert_eq!(freed.load(Ordering::SeqCst), before + 1);
    }
    assert_eq!(universe.live_requests(), 0);
}
