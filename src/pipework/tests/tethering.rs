use std::{sync::Mutex, thread, time::Duration};

use pipework::{blocked, busy, open, payload, read, tether, untether};

static SERIAL: Mutex<()> = Mutex::new(());

#[test]
fn untether_then_tether_restores_the_relationship() {
    let _serial = SERIAL.lock().unwrap();

    let pipe = open(|| {
        thread::sleep(Duration::from_millis(50));
        Ok(payload(9u8))
    })
    .unwrap();
    assert!(busy(&pipe).unwrap());

    untether(&pipe).unwrap();
    tether(&pipe).unwrap();

    // a tethered read again, as if nothing happened
    assert_eq!(*read(pipe).unwrap().downcast::<u8>().unwrap(), 9);
}

#[test]
fn blocked_reports_pending_work() {
    let _serial = SERIAL.lock().unwrap();

    assert!(!blocked());
    let pipe = open(|| {
        thread::sleep(Duration::from_millis(200));
        Ok(payload(()))
    })
    .unwrap();
    assert!(blocked());

    read(pipe).unwrap();
    assert!(!blocked());
}
