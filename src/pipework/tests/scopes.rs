use std::{thread, time::Duration};

use pipework::{enter_scope, exit_scope, open, payload, read, select, Fault};

#[test]
fn each_frame_sees_only_its_own_finishers() {
    const SCOPES: usize = 3;
    const PER_SCOPE: usize = 4;

    for tag in 1..=SCOPES {
        enter_scope().unwrap();
        for _ in 0..PER_SCOPE {
            open(move || {
                thread::sleep(Duration::from_millis(10 * tag as u64));
                Ok(payload(tag))
            })
            .unwrap();
        }
    }

    for expected in (1..=SCOPES).rev() {
        let mut seen = 0;
        while let Some(pipe) = select().unwrap() {
            let tag = *read(pipe).unwrap().downcast::<usize>().unwrap();
            assert_eq!(tag, expected);
            seen += 1;
        }
        assert_eq!(seen, PER_SCOPE);
        exit_scope().unwrap();
    }

    // back at the sentinel frame: nothing left anywhere
    assert!(select().unwrap().is_none());
    assert_eq!(exit_scope(), Err(Fault::ScopeUnderflow));
}

#[test]
fn scoped_wraps_enter_and_exit() {
    let delivered = pipework::scoped(|| {
        open(|| Ok(payload(11u8))).unwrap();
        let pipe = select().unwrap().expect("scoped worker yields");
        *read(pipe).unwrap().downcast::<u8>().unwrap()
    })
    .unwrap();
    assert_eq!(delivered, 11);
}

#[test]
fn unexited_scopes_do_not_block_the_yield() {
    let pipe = open(|| {
        enter_scope()?;
        open(|| Ok(payload(3u8)))?;
        // returning with the scope still open: the runtime vacates it
        Ok(payload(1u8))
    })
    .unwrap();
    assert_eq!(*read(pipe).unwrap().downcast::<u8>().unwrap(), 1);
}

#[test]
fn exiting_a_scope_orphans_its_residents() {
    enter_scope().unwrap();
    let resident = open(|| {
        thread::sleep(Duration::from_millis(30));
        Ok(payload(77u64))
    })
    .unwrap();
    exit_scope().unwrap();

    // the resident became an untethered root; an untethered read still works
    assert_eq!(*read(resident).unwrap().downcast::<u64>().unwrap(), 77);
    assert!(select().unwrap().is_none());
}
