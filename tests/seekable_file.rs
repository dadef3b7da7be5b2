//! End-to-end scenario: `write("AAA")`, `seek(0)`, `write("B")` on a seekable
//! file endpoint must flush to disk as `BAA` — the second write overwrites
//! the front of the first rather than appending after it.
mod support;

use std::io::{Read, SeekFrom};
use std::time::Duration;

use reactor::{Config, Context, Handler, Reactor};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct FileTag;

struct Writer;

impl Handler for Writer {
    type Tag = FileTag;

    fn user_event(&mut self, ctx: &mut Context<'_, FileTag>, _event: Box<dyn std::any::Any + Send>) {
        if let Some(mut io) = ctx.find_io_by_tag(&FileTag) {
            io.write(b"AAA");
            io.seek(SeekFrom::Start(0));
            io.write(b"B");
        }
    }
}

#[test]
fn seek_then_write_overwrites_the_front() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scratch.bin");
    std::fs::write(&path, [0u8; 3]).unwrap();

    let mut reactor = Reactor::new(Writer, Config::default()).unwrap();
    reactor.open(&path, "r+", FileTag, true).unwrap();
    reactor.add_user_event(Box::new(()));

    let (join, handle) = support::spawn(reactor);

    // Give the loop a few passes to deliver the user event and flush the
    // file endpoint's output buffer.
    std::thread::sleep(Duration::from_millis(200));

    handle.stop().unwrap();
    join.join().unwrap();

    let mut contents = Vec::new();
    std::fs::File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
    assert_eq!(contents, b"BAA");
}
