use crate::infrastructure::{tcp_pair, ScriptedServer};
use eyre::Result;
use proctest::{ManagedSocket, Waiter};
use std::io::{Read, Write};
use std::time::Duration;

/// A greeting sent line by line over TCP is found in order
#[test]
fn test_wait_for_server_greeting() -> Result<()> {
    proctest::logging::init();

    let server = ScriptedServer::start(
        vec!["220 service ready", "250-SIZE 1024", "250 OK"],
        Duration::from_millis(100),
    )?;
    let mut socket = ManagedSocket::new(server.connect()?)?;

    Waiter::default().wait_for(
        &mut socket,
        Duration::from_secs(5),
        &["220 service ready", "SIZE", "250 OK"],
    )?;
    server.join()?;
    Ok(())
}

/// Request/response over a managed socket
#[test]
fn test_request_response() -> Result<()> {
    let (client, mut server) = tcp_pair()?;
    let mut socket = ManagedSocket::new(client)?;

    socket.send(b"PING\n")?;
    let mut request = [0u8; 5];
    server.read_exact(&mut request)?;
    assert_eq!(&request, b"PING\n");

    server.write_all(b"PONG\n")?;
    Waiter::default().wait_for(&mut socket, Duration::from_secs(5), &["PONG"])?;
    Ok(())
}

/// Closing twice, then dropping, never fails
#[test]
fn test_close_is_idempotent() -> Result<()> {
    let (client, mut server) = tcp_pair()?;
    let mut socket = ManagedSocket::new(client)?;

    socket.close()?;
    socket.close()?;
    drop(socket);

    // The peer sees the connection go away
    let mut rest = Vec::new();
    assert_eq!(server.read_to_end(&mut rest)?, 0);
    Ok(())
}

/// Data received before the peer hung up stays readable
#[test]
fn test_output_survives_peer_hangup() -> Result<()> {
    let (client, mut server) = tcp_pair()?;
    let mut socket = ManagedSocket::new(client)?;

    server.write_all(b"goodbye\n")?;
    drop(server);

    Waiter::default().wait_for(&mut socket, Duration::from_secs(5), &["goodbye"])?;
    assert_eq!(socket.read(), "goodbye\n");
    Ok(())
}
