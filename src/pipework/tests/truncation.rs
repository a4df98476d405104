use std::{sync::Mutex, thread, time::Duration};

use pipework::{open, payload, read, select, truncate_all, truncated};

static OMITTED: Mutex<u64> = Mutex::new(0);

#[test]
fn single_pipe_truncation_spares_siblings() {
    let marked = open(|| {
        while !truncated() {
            thread::yield_now();
        }
        Ok(payload(true))
    })
    .unwrap();
    let spared = open(|| {
        thread::sleep(Duration::from_millis(50));
        Ok(payload(truncated()))
    })
    .unwrap();

    pipework::truncate(&marked).unwrap();
    assert!(*read(marked).unwrap().downcast::<bool>().unwrap());
    assert!(!*read(spared).unwrap().downcast::<bool>().unwrap());
}

#[test]
fn truncated_sums_plus_omissions_cover_the_interval() {
    const WORKERS: u64 = 4;
    const SPAN: u64 = 200_000;
    const CHUNK: u64 = SPAN / WORKERS;

    for w in 0..WORKERS {
        let lo = w * CHUNK;
        let hi = lo + CHUNK;
        open(move || {
            let mut sum = 0u64;
            for i in lo..hi {
                if truncated() {
                    *OMITTED.lock().unwrap() += (i..hi).sum::<u64>();
                    break;
                }
                sum += i;
                if i % 1024 == 0 {
                    thread::yield_now();
                }
            }
            Ok(payload(sum))
        })
        .unwrap();
    }

    thread::sleep(Duration::from_millis(5));
    truncate_all().unwrap();

    let mut total = 0u64;
    while let Some(pipe) = select().unwrap() {
        total += *read(pipe).unwrap().downcast::<u64>().unwrap();
    }

    assert_eq!(total + *OMITTED.lock().unwrap(), SPAN * (SPAN - 1) / 2);
}
