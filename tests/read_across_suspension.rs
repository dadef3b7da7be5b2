//! End-to-end scenario: a single `ctx.read(10)` call must accumulate bytes
//! across two separate writes from the peer, suspending the `server_init`
//! coroutine in between, and deliver exactly one completion with all ten
//! bytes in order.
mod support;

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use reactor::{Config, Context, Handler, Reactor};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
enum Tag {
    Listener,
    Peer,
}

struct Collector {
    received: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Handler for Collector {
    type Tag = Tag;

    fn server_init(&mut self, ctx: &mut Context<'_, Tag>, _listener_tag: Tag, _addr: SocketAddr, _port: u16) {
        ctx.set_meta_info(Tag::Peer);
        if let Ok(bytes) = ctx.read(10) {
            *self.received.lock().unwrap() = Some(bytes);
        }
    }
}

#[test]
fn read_accumulates_across_two_writes() {
    let received = Arc::new(Mutex::new(None));
    let handler = Collector {
        received: received.clone(),
    };

    let mut reactor = Reactor::new(handler, Config::default()).unwrap();
    let bound = reactor.listen("127.0.0.1:0".parse().unwrap(), Tag::Listener).unwrap();
    let (join, handle) = support::spawn(reactor);

    let mut stream = TcpStream::connect(bound).unwrap();
    stream.write_all(b"01234").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"56789").unwrap();

    support::wait_until(Duration::from_secs(2), || received.lock().unwrap().is_some());

    assert_eq!(received.lock().unwrap().as_deref(), Some(b"0123456789".as_ref()));

    handle.stop().unwrap();
    join.join().unwrap();
}
