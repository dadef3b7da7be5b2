//! End-to-end scenario: a server accepts one connection, reads 4 bytes
//! through a suspendable `recv_data`-style callback (here `server_init`
//! itself, since nothing has to happen before the read) and writes them
//! straight back.
mod support;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use reactor::{Config, Context, Handler, Reactor};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
enum Tag {
    Listener,
    Peer,
}

struct Echo;

impl Handler for Echo {
    type Tag = Tag;

    fn server_init(&mut self, ctx: &mut Context<'_, Tag>, _listener_tag: Tag, _addr: SocketAddr, _port: u16) {
        ctx.set_meta_info(Tag::Peer);
        if let Ok(bytes) = ctx.read(4) {
            ctx.write(&bytes);
        }
    }
}

#[test]
fn echoes_four_bytes_back() {
    let mut reactor = Reactor::new(Echo, Config::default()).unwrap();
    let bound = reactor.listen("127.0.0.1:0".parse().unwrap(), Tag::Listener).unwrap();

    let (join, handle) = support::spawn(reactor);

    let mut stream = TcpStream::connect(bound).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.write_all(b"ping").unwrap();

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    handle.stop().unwrap();
    join.join().unwrap();
}
