use std::cell::RefCell;
use std::rc::Rc;

use conveyor::{AsyncIoStream, Code, InputStream, NetworkAddress, OutputStream, WaitScope};

mod util;
use util::{init_with_io, wait_until};

#[test]
fn socket_pair_round_trip() {
    let context = init_with_io();
    let wait_scope = WaitScope::new(&context.event_loop);

    let (writer, reader) = context.network.socket_pair().unwrap();

    let mut writer = AsyncIoStream::new(Box::new(writer));
    let mut reader = AsyncIoStream::new(Box::new(reader));

    let written = Rc::new(RefCell::new(None));
    let write_result = written.clone();
    let _write_sink = writer
        .write_done()
        .then(move |n| {
            *write_result.borrow_mut() = Some(n);
        })
        .sink();

    let received = Rc::new(RefCell::new(None));
    let read_result = received.clone();
    let _read_sink = reader
        .read_done()
        .then(move |(buffer, n)| {
            *read_result.borrow_mut() = Some((buffer, n));
        })
        .sink();

    writer.write(vec![1, 2, 3, 4, 5, 6, 7]).unwrap();
    reader.read(vec![0u8; 7], 7).unwrap();

    wait_until(&wait_scope, || received.borrow().is_some(), "read completion");

    assert_eq!(*written.borrow(), Some(7));
    let (buffer, n) = received.borrow_mut().take().unwrap();
    assert_eq!(n, 7);
    assert_eq!(buffer, vec![1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn raw_read_would_block_when_empty() {
    let context = init_with_io();
    let _wait_scope = WaitScope::new(&context.event_loop);

    let (_writer, mut reader) = context.network.socket_pair().unwrap();

    let mut buf = [0u8; 16];
    let error = reader.read(&mut buf).unwrap_err();
    assert_eq!(error.code(), Code::WouldBlock);
    assert!(error.is_recoverable());
}

#[test]
fn raw_write_then_read() {
    let context = init_with_io();
    let _wait_scope = WaitScope::new(&context.event_loop);

    let (mut writer, mut reader) = context.network.socket_pair().unwrap();

    assert_eq!(writer.write(b"ping").unwrap(), 4);

    let mut buf = [0u8; 16];
    let n = reader.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
}

#[test]
fn read_disconnect_fires_on_peer_close() {
    let context = init_with_io();
    let wait_scope = WaitScope::new(&context.event_loop);

    let (writer, mut reader) = context.network.socket_pair().unwrap();

    let disconnected = Rc::new(RefCell::new(false));
    let flag = disconnected.clone();
    let _sink = reader
        .on_read_disconnected()
        .then(move |()| {
            *flag.borrow_mut() = true;
        })
        .sink();

    drop(writer);

    wait_until(&wait_scope, || *disconnected.borrow(), "read disconnect");
}

#[test]
fn resolve_listen_connect_accept() {
    let context = init_with_io();
    let wait_scope = WaitScope::new(&context.event_loop);

    let mut bind_addr = context.network.resolve_address("127.0.0.1", 0);
    wait_scope.poll().unwrap();
    let bind_addr = bind_addr.take().unwrap();

    let mut server = context.network.listen(&bind_addr).unwrap();
    let server_addr = NetworkAddress::from(server.local_addr().unwrap());

    let accepted = Rc::new(RefCell::new(Vec::new()));
    let accept_log = accepted.clone();
    let _accept_sink = server
        .accept()
        .then(move |stream| {
            accept_log.borrow_mut().push(stream);
        })
        .sink();

    let connected = Rc::new(RefCell::new(None));
    let connect_log = connected.clone();
    let _connect_sink = context
        .network
        .connect(&server_addr)
        .then(move |stream| {
            *connect_log.borrow_mut() = Some(stream);
        })
        .sink();

    wait_until(
        &wait_scope,
        || connected.borrow().is_some() && !accepted.borrow().is_empty(),
        "connection establishment",
    );

    // Bytes flow from the connecting side to the accepted side.
    let mut client = connected.borrow_mut().take().unwrap();
    let mut serviced = accepted.borrow_mut().remove(0);

    assert_eq!(client.write(b"hello").unwrap(), 5);
    let mut buf = [0u8; 16];
    wait_until(
        &wait_scope,
        || match serviced.read(&mut buf) {
            Ok(n) => {
                assert_eq!(&buf[..n], b"hello");
                true
            }
            Err(error) => {
                assert!(error.is_recoverable());
                false
            }
        },
        "server payload",
    );
}

#[test]
fn datagram_round_trip() {
    let context = init_with_io();
    let wait_scope = WaitScope::new(&context.event_loop);

    let mut any = context.network.resolve_address("127.0.0.1", 0);
    wait_scope.poll().unwrap();
    let any = any.take().unwrap();

    let mut receiver = context.network.datagram(&any).unwrap();
    let receiver_addr = NetworkAddress::from(receiver.local_addr().unwrap());
    let mut sender = context.network.datagram(&any).unwrap();

    assert_eq!(sender.write(b"datagram", &receiver_addr).unwrap(), 8);

    let mut buf = [0u8; 64];
    let mut got = None;
    wait_until(
        &wait_scope,
        || match receiver.read(&mut buf) {
            Ok(n) => {
                got = Some(n);
                true
            }
            Err(error) => {
                assert!(error.is_recoverable());
                false
            }
        },
        "datagram delivery",
    );
    assert_eq!(&buf[..got.unwrap()], b"datagram");
}

#[test]
fn second_read_task_is_refused() {
    let context = init_with_io();
    let _wait_scope = WaitScope::new(&context.event_loop);

    let (_writer, reader) = context.network.socket_pair().unwrap();
    let mut reader = AsyncIoStream::new(Box::new(reader));

    reader.read(vec![0u8; 8], 1).unwrap();
    let error = reader.read(vec![0u8; 8], 1).unwrap_err();
    assert!(error.is_recoverable());
}
