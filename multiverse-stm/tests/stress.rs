use multiverse_stm::{IsolationLevel, Stm, TxnLong};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_counter() {
    let stm = Stm::new();
    let var = stm.new_long(0);

    let threads = 8;
    let increments = 200;

    let mut handles = vec![];
    for _ in 0..threads {
        let stm = stm.clone();
        let var = var.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..increments {
                stm.atomically(|tx| var.increment(tx, 1)).unwrap();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(var.atomic_get().unwrap(), threads * increments);
    assert_eq!(var.atomic_lock_mode(), multiverse_stm::LockMode::None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_batch_increments_are_atomic() {
    // Every transaction bumps all counters; readers must never see them differ.
    let stm = Stm::new();
    let counters: Arc<Vec<TxnLong>> = Arc::new((0..8).map(|_| stm.new_long(0)).collect());
    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let stm = stm.clone();
            let counters = counters.clone();
            thread::spawn(move || {
                for _ in 0..250 {
                    stm.atomically(|tx| {
                        for counter in counters.iter() {
                            counter.increment(tx, 1)?;
                        }
                        Ok(())
                    })
                    .unwrap();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let stm = stm.clone();
            let counters = counters.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let block = stm.factory_builder().readonly(true).build_atomic_block().unwrap();
                while !stop.load(Ordering::Relaxed) {
                    let values = block
                        .execute(|tx| counters.iter().map(|c| c.get(tx)).collect::<Result<Vec<_>, _>>())
                        .unwrap();
                    assert!(values.windows(2).all(|w| w[0] == w[1]), "torn read: {values:?}");
                }
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }

    for counter in counters.iter() {
        assert_eq!(counter.atomic_get().unwrap(), 1000);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_bank_transfer() {
    let stm = Stm::new();
    let num_accounts = 10;
    let initial = 1000i64;
    let accounts: Arc<Vec<TxnLong>> = Arc::new((0..num_accounts).map(|_| stm.new_long(initial)).collect());

    let mut handles = vec![];
    for _ in 0..4 {
        let stm = stm.clone();
        let accounts = accounts.clone();
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            for _ in 0..200 {
                let from = rng.random_range(0..num_accounts);
                let to = rng.random_range(0..num_accounts);
                let amount = rng.random_range(1..=50);

                stm.atomically(|tx| {
                    if from == to {
                        return Ok(());
                    }
                    if accounts[from].get(tx)? >= amount {
                        accounts[from].decrement(tx, amount)?;
                        accounts[to].increment(tx, amount)?;
                    }
                    Ok(())
                })
                .unwrap();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    let total: i64 = stm
        .atomically(|tx| accounts.iter().map(|a| a.get(tx)).sum())
        .unwrap();
    assert_eq!(total, initial * num_accounts as i64);
    assert!(accounts.iter().all(|a| a.atomic_get().unwrap() >= 0));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_commuting_counter_under_contention() {
    let stm = Stm::new();
    let counter = stm.new_long(0);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let stm = stm.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..250 {
                    stm.atomically(|tx| counter.commuting_increment(tx, 1)).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(counter.atomic_get().unwrap(), 2000);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_serializable_keeps_invariant() {
    // Withdraw from either of two accounts only while their sum stays positive.
    let stm = Stm::new();
    let a = stm.new_long(50);
    let b = stm.new_long(50);
    let block = stm
        .factory_builder()
        .isolation_level(IsolationLevel::Serializable)
        .build_atomic_block()
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let block = block.clone();
            let (a, b) = (a.clone(), b.clone());
            thread::spawn(move || {
                for _ in 0..100 {
                    block
                        .execute(|tx| {
                            let sum = a.get(tx)? + b.get(tx)?;
                            if sum > 0 {
                                if i % 2 == 0 { a.decrement(tx, 1) } else { b.decrement(tx, 1) }
                            } else {
                                Ok(())
                            }
                        })
                        .unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(a.atomic_get().unwrap() + b.atomic_get().unwrap(), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_atomic_and_transactional_mix() {
    let stm = Stm::new();
    let counter = stm.new_long(0);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let stm = stm.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..250 {
                    if i % 2 == 0 {
                        counter.atomic_increment_and_get(1).unwrap();
                    } else {
                        stm.atomically(|tx| counter.increment(tx, 1)).unwrap();
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(counter.atomic_get().unwrap(), 1000);
}
