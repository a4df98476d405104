use std::{sync::Mutex, thread, time::Duration};

use pipework::{live_pipes, open, payload, read, select, sync, untether, Fault};

static SERIAL: Mutex<()> = Mutex::new(());

#[test]
fn an_outside_thread_can_read_an_untethered_pipe() {
    let _serial = SERIAL.lock().unwrap();

    let pipe = open(|| {
        thread::sleep(Duration::from_millis(20));
        Ok(payload(41u32))
    })
    .unwrap();
    untether(&pipe).unwrap();

    // a thread the library never managed; it gets no context from reading
    let delivered = thread::spawn(move || *read(pipe).unwrap().downcast::<u32>().unwrap())
        .join()
        .unwrap();
    assert_eq!(delivered, 41);

    sync().unwrap();
    assert_eq!(live_pipes(), 0);
}

#[test]
fn a_third_thread_may_not_read_a_tethered_pipe() {
    let _serial = SERIAL.lock().unwrap();

    let pipe = open(|| Ok(payload(1u8))).unwrap();
    let refused = thread::spawn(move || read(pipe).unwrap_err()).join().unwrap();
    assert_eq!(refused, Fault::NotDrain);

    // the pipe still belongs to this thread; collect it normally
    let leftover = select().unwrap().expect("still tethered here");
    assert_eq!(*read(leftover).unwrap().downcast::<u8>().unwrap(), 1);

    sync().unwrap();
    assert_eq!(live_pipes(), 0);
}
