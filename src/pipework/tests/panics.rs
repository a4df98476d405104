use pipework::{open, read, Fault, Payload};

#[test]
fn a_panicking_worker_surfaces_as_a_fault() {
    let pipe = open(|| -> Result<Payload, Fault> { panic!("boom") }).unwrap();
    assert_eq!(read(pipe).unwrap_err(), Fault::Panicked);
}
