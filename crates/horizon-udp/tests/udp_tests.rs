//! Integration tests for the UDP service against loopback peers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use horizon_udp::network_info::LoopbackOnly;
use horizon_udp::{
    ChannelSink, ServiceConfig, SocketEvent, SocketId, SocketProperties, UdpError, UdpService,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn service() -> (UdpService, Receiver<SocketEvent>) {
    let (sink, events) = ChannelSink::new();
    let config = ServiceConfig::builder()
        .thread_name("udp-test-loop")
        .interface_selector(LoopbackOnly)
        .multicast_poll_interval(Duration::from_millis(20))
        .build();
    let service = UdpService::new(config, Arc::new(sink));
    service.start().unwrap();
    (service, events)
}

fn bound_socket(service: &UdpService) -> (SocketId, SocketAddr) {
    let id = service.create(SocketProperties::default()).unwrap().socket_id;
    let local = service.bind(id, "127.0.0.1", 0).unwrap().wait_timeout(TIMEOUT).unwrap();
    (id, local)
}

fn peer() -> UdpSocket {
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(TIMEOUT)).unwrap();
    peer
}

/// Spawn a peer that echoes `count` datagrams back to their sender.
fn echo_peer(count: usize) -> (u16, thread::JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:1212")
        .or_else(|_| UdpSocket::bind("127.0.0.1:0"))
        .unwrap();
    socket.set_read_timeout(Some(TIMEOUT)).unwrap();
    let port = socket.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 2048];
        for _ in 0..count {
            let Ok((n, source)) = socket.recv_from(&mut buf) else {
                return;
            };
            socket.send_to(&buf[..n], source).unwrap();
        }
    });
    (port, handle)
}

fn next_receive(events: &Receiver<SocketEvent>) -> horizon_udp::ReceiveEvent {
    match events.recv_timeout(TIMEOUT).unwrap() {
        SocketEvent::Receive(event) => event,
        other => panic!("expected a datagram, got {other:?}"),
    }
}

#[test]
fn test_echo_hello() {
    let (service, events) = service();
    let (echo_port, echo) = echo_peer(1);

    let id = service.create(SocketProperties::default()).unwrap().socket_id;
    service.bind(id, "0.0.0.0", 0).unwrap().wait_timeout(TIMEOUT).unwrap();

    let sent = service
        .send(id, "127.0.0.1", echo_port, b"Hello".to_vec())
        .unwrap()
        .wait_timeout(TIMEOUT);
    assert_eq!(sent, Ok(5));

    let event = next_receive(&events);
    assert_eq!(event.socket_id, id);
    assert_eq!(event.data, b"Hello");
    assert_eq!(event.remote_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(event.remote_port, echo_port);
    echo.join().unwrap();
}

#[test]
fn test_send_before_bind_fails() {
    let (service, _events) = service();
    let id = service.create(SocketProperties::default()).unwrap().socket_id;

    let err = service.send(id, "127.0.0.1", 9, b"x".to_vec()).unwrap_err();
    assert_eq!(err, UdpError::NotBound(id));
    assert_eq!(
        service.forward(id, "127.0.0.1", 9, b"x".to_vec()).unwrap_err(),
        UdpError::NotBound(id)
    );
}

#[test]
fn test_sends_complete_in_submission_order() {
    let (service, _events) = service();
    let (id, _) = bound_socket(&service);
    let peer = peer();
    let port = peer.local_addr().unwrap().port();

    let pending: Vec<_> = (0..20u8)
        .map(|i| service.send(id, "127.0.0.1", port, vec![i; 4]).unwrap())
        .collect();
    for waiting in pending {
        assert_eq!(waiting.wait_timeout(TIMEOUT), Ok(4));
    }

    let mut buf = [0u8; 16];
    for i in 0..20u8 {
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[i; 4]);
    }
}

#[test]
fn test_forward_sends_without_completion() {
    let (service, _events) = service();
    let (id, local) = bound_socket(&service);
    let peer = peer();

    service
        .forward(id, "127.0.0.1", peer.local_addr().unwrap().port(), b"fire".to_vec())
        .unwrap();

    let mut buf = [0u8; 16];
    let (n, source) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"fire");
    assert_eq!(source.port(), local.port());
}

#[test]
fn test_unknown_id_is_not_found() {
    let (service, _events) = service();
    let id = SocketId::from_raw(999);
    let not_found = Err(UdpError::NotFound(id));

    assert_eq!(service.info(id).err(), Some(UdpError::NotFound(id)));
    assert_eq!(service.update(id, SocketProperties::new().name("x")), not_found);
    assert_eq!(service.set_paused(id, true).err(), Some(UdpError::NotFound(id)));
    assert_eq!(service.bind(id, "0.0.0.0", 0).err(), Some(UdpError::NotFound(id)));
    assert_eq!(service.send(id, "127.0.0.1", 9, vec![1]).err(), Some(UdpError::NotFound(id)));
    assert_eq!(service.close(id).err(), Some(UdpError::NotFound(id)));
    assert_eq!(service.join_group(id, "239.1.2.3"), not_found);
    assert_eq!(service.leave_group(id, "239.1.2.3"), not_found);
    assert_eq!(service.set_multicast_ttl(id, 2), not_found);
    assert_eq!(service.set_broadcast(id, true), not_found);
    assert_eq!(service.set_multicast_loopback(id, true).err(), Some(UdpError::NotFound(id)));
    assert_eq!(service.joined_groups(id).err(), Some(UdpError::NotFound(id)));
}

#[test]
fn test_close_invalidates_id_and_spares_others() {
    let (service, events) = service();
    let (closed, _) = bound_socket(&service);
    let (open, open_local) = bound_socket(&service);

    service.close(closed).unwrap().wait_timeout(TIMEOUT).unwrap();
    assert_eq!(service.info(closed).err(), Some(UdpError::NotFound(closed)));
    assert_eq!(
        service.send(closed, "127.0.0.1", 9, vec![1]).err(),
        Some(UdpError::NotFound(closed))
    );

    let peer = peer();
    peer.send_to(b"still here", open_local).unwrap();
    let event = next_receive(&events);
    assert_eq!(event.socket_id, open);
    assert_eq!(event.data, b"still here");

    let sent = service
        .send(open, "127.0.0.1", peer.local_addr().unwrap().port(), b"reply".to_vec())
        .unwrap()
        .wait_timeout(TIMEOUT);
    assert_eq!(sent, Ok(5));
}

#[test]
fn test_buffer_size_limits_delivery() {
    let (service, events) = service();
    let id = service.create(SocketProperties::default()).unwrap().socket_id;
    service.update(id, SocketProperties::new().buffer_size(512)).unwrap();
    assert_eq!(service.info(id).unwrap().buffer_size, 512);

    let local = service.bind(id, "127.0.0.1", 0).unwrap().wait_timeout(TIMEOUT).unwrap();
    peer().send_to(&[0xAB; 600], local).unwrap();

    match events.recv_timeout(TIMEOUT).unwrap() {
        SocketEvent::Receive(event) => assert!(event.data.len() <= 512),
        SocketEvent::ReceiveError(event) => assert_eq!(event.socket_id, id),
    }
}

#[test]
fn test_double_bind_is_invalid_state() {
    let (service, _events) = service();
    let (id, _) = bound_socket(&service);
    assert!(matches!(
        service.bind(id, "127.0.0.1", 0),
        Err(UdpError::InvalidState(_))
    ));
}

#[test]
fn test_invalid_addresses() {
    let (service, _events) = service();
    let (id, _) = bound_socket(&service);
    assert!(matches!(
        service.send(id, "not a host name!", 9, vec![1]),
        Err(UdpError::InvalidAddress(_))
    ));
    assert!(matches!(
        service.join_group(id, "10.0.0.1"),
        Err(UdpError::InvalidAddress(_))
    ));
}

#[test]
fn test_pause_holds_delivery_until_resume() {
    let (service, events) = service();
    let (id, local) = bound_socket(&service);

    service.set_paused(id, true).unwrap().wait_timeout(TIMEOUT).unwrap();
    assert!(service.info(id).unwrap().paused);

    let peer = peer();
    peer.send_to(b"while paused", local).unwrap();
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());

    service.set_paused(id, false).unwrap().wait_timeout(TIMEOUT).unwrap();
    assert!(!service.info(id).unwrap().paused);
    assert_eq!(next_receive(&events).data, b"while paused");

    peer.send_to(b"after resume", local).unwrap();
    assert_eq!(next_receive(&events).data, b"after resume");
}

#[test]
fn test_stop_and_restart_keeps_sockets() {
    let (service, events) = service();
    let (id, local) = bound_socket(&service);
    let peer = peer();
    let peer_port = peer.local_addr().unwrap().port();

    service.stop().unwrap();
    assert!(!service.is_running());
    service.stop().unwrap();

    // Queued while stopped, sent once the loop is back.
    let pending = service.send(id, "127.0.0.1", peer_port, b"queued".to_vec()).unwrap();
    assert!(pending.try_result().is_none());

    service.restart().unwrap();
    assert!(service.is_running());
    service.start().unwrap();

    assert_eq!(pending.wait_timeout(TIMEOUT), Ok(6));
    let mut buf = [0u8; 16];
    let (n, _) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"queued");

    peer.send_to(b"inbound", local).unwrap();
    assert_eq!(next_receive(&events).data, b"inbound");
}

#[test]
fn test_multicast_membership() {
    let (service, _events) = service();
    let id = service.create(SocketProperties::default()).unwrap().socket_id;
    service.bind(id, "0.0.0.0", 0).unwrap().wait_timeout(TIMEOUT).unwrap();

    // Hosts without a multicast-capable route cannot join.
    match service.join_group(id, "239.255.42.99") {
        Ok(()) => {}
        Err(UdpError::Io { .. }) => return,
        Err(e) => panic!("unexpected error {e}"),
    }
    service.join_group(id, "239.255.42.99").unwrap();
    assert_eq!(
        service.joined_groups(id).unwrap(),
        ["239.255.42.99".parse::<IpAddr>().unwrap()]
    );

    service.leave_group(id, "239.255.42.99").unwrap();
    assert!(service.joined_groups(id).unwrap().is_empty());
    service.leave_group(id, "239.255.42.99").unwrap();
}

#[test]
fn test_multicast_options() {
    let (service, _events) = service();
    let id = service.create(SocketProperties::default()).unwrap().socket_id;

    assert_eq!(service.set_multicast_loopback(id, false), Ok(false));
    assert_eq!(service.set_multicast_loopback(id, true), Ok(true));
    service.set_multicast_ttl(id, 8).unwrap();
    service.set_broadcast(id, true).unwrap();
    assert!(service.joined_groups(id).unwrap().is_empty());

    // Options survive bind.
    service.bind(id, "0.0.0.0", 0).unwrap().wait_timeout(TIMEOUT).unwrap();
    service.set_broadcast(id, false).unwrap();
}

#[test]
fn test_create_reports_loopback_addresses() {
    let (service, _events) = service();
    let created = service
        .create(SocketProperties::new().name("telemetry").buffer_size(2048))
        .unwrap();
    assert_eq!(created.ipv4, Ipv4Addr::LOCALHOST);
    assert_eq!(created.ipv6, Ipv6Addr::LOCALHOST);

    let info = service.info(created.socket_id).unwrap();
    assert_eq!(info.name, "telemetry");
    assert_eq!(info.buffer_size, 2048);
    assert!(!info.paused);
    assert_eq!(info.local_address, None);
    assert_eq!(info.local_port, None);
}

#[test]
fn test_info_reports_bound_address() {
    let (service, _events) = service();
    let (id, local) = bound_socket(&service);
    let info = service.info(id).unwrap();
    assert_eq!(info.local_address, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    assert_eq!(info.local_port, Some(local.port()));
}

#[test]
fn test_close_all_and_listing() {
    let (service, _events) = service();
    let ids: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| service.create(SocketProperties::new().name(*name)).unwrap().socket_id)
        .collect();

    let listed = service.sockets();
    assert_eq!(listed.iter().map(|info| info.socket_id).collect::<Vec<_>>(), ids);
    assert_eq!(
        listed.iter().map(|info| info.name.as_str()).collect::<Vec<_>>(),
        ["a", "b", "c"]
    );

    assert_eq!(service.close_all(), 3);
    assert!(service.sockets().is_empty());
    assert_eq!(service.close_all(), 0);

    // Ids are never reused.
    let next = service.create(SocketProperties::default()).unwrap().socket_id;
    assert!(ids.iter().all(|id| *id < next));
}

#[test]
fn test_close_fails_queued_sends_while_stopped() {
    let (service, _events) = service();
    let (id, _) = bound_socket(&service);
    service.stop().unwrap();

    let pending = service.send(id, "127.0.0.1", 9, b"never".to_vec()).unwrap();
    // No loop is running, so the close happens right here.
    let closed = service.close(id).unwrap();
    assert_eq!(closed.wait_timeout(Duration::from_millis(100)), Ok(()));
    assert!(matches!(
        pending.wait_timeout(Duration::from_millis(100)),
        Err(UdpError::InvalidState(_))
    ));

    // The leftover write interest is harmless to the next loop.
    service.start().unwrap();
    let (other, _) = bound_socket(&service);
    assert!(service.info(other).is_ok());
}

/// Group traffic sent over the loopback interface. Hosts that cannot route
/// multicast over loopback skip these.
#[cfg(target_os = "linux")]
mod multicast_traffic {
    use super::*;

    /// Sends to one group and port from 127.0.0.1.
    struct GroupSender {
        socket: UdpSocket,
        target: SocketAddr,
    }

    impl GroupSender {
        fn send(&self, data: &[u8]) {
            self.socket.send_to(data, self.target).unwrap();
        }
    }

    /// A socket bound to the wildcard address that joined `group`, and a
    /// sender whose first datagram has already arrived.
    fn joined_socket(
        service: &UdpService,
        events: &Receiver<SocketEvent>,
        group: Ipv4Addr,
    ) -> Option<(SocketId, GroupSender)> {
        let id = service.create(SocketProperties::default()).unwrap().socket_id;
        let local = service.bind(id, "0.0.0.0", 0).unwrap().wait_timeout(TIMEOUT).unwrap();
        service.join_group(id, &group.to_string()).ok()?;

        let socket = UdpSocket::bind("127.0.0.1:0").ok()?;
        socket2::SockRef::from(&socket)
            .set_multicast_if_v4(&Ipv4Addr::LOCALHOST)
            .ok()?;
        socket.set_multicast_loop_v4(true).ok()?;
        let sender = GroupSender {
            socket,
            target: (group, local.port()).into(),
        };
        sender.socket.send_to(b"ready", sender.target).ok()?;
        match events.recv_timeout(Duration::from_secs(1)) {
            Ok(SocketEvent::Receive(event)) if event.data == b"ready" => Some((id, sender)),
            Ok(other) => panic!("unexpected first event {other:?}"),
            Err(_) => None,
        }
    }

    fn assert_quiet(events: &Receiver<SocketEvent>) {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(300)) {
            panic!("unexpected event {event:?}");
        }
    }

    #[test]
    fn test_group_datagram_delivered_once() {
        let (service, events) = service();
        let Some((id, sender)) = joined_socket(&service, &events, Ipv4Addr::new(239, 255, 42, 98)) else {
            return;
        };
        assert_quiet(&events);

        sender.send(b"once");
        let event = next_receive(&events);
        assert_eq!(event.socket_id, id);
        assert_eq!(event.data, b"once");
        assert_eq!(event.remote_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_quiet(&events);
    }

    #[test]
    fn test_loopback_off_drops_own_datagrams() {
        let (service, events) = service();
        let Some((id, sender)) = joined_socket(&service, &events, Ipv4Addr::new(239, 255, 42, 97)) else {
            return;
        };

        // The sender uses 127.0.0.1, the address this socket reports as its own.
        assert_eq!(service.set_multicast_loopback(id, false), Ok(false));
        sender.send(b"own");
        assert_quiet(&events);

        assert_eq!(service.set_multicast_loopback(id, true), Ok(true));
        sender.send(b"welcome");
        assert_eq!(next_receive(&events).data, b"welcome");
    }

    #[test]
    fn test_pause_keeps_latest_group_datagram() {
        let (service, events) = service();
        let Some((id, sender)) = joined_socket(&service, &events, Ipv4Addr::new(239, 255, 42, 96)) else {
            return;
        };

        service.set_paused(id, true).unwrap().wait_timeout(TIMEOUT).unwrap();
        // Long enough for the reader to notice the pause.
        thread::sleep(Duration::from_millis(200));
        for data in [&b"one"[..], b"two", b"three"] {
            sender.send(data);
        }
        assert_quiet(&events);

        service.set_paused(id, false).unwrap().wait_timeout(TIMEOUT).unwrap();
        assert_eq!(next_receive(&events).data, b"three");
        sender.send(b"four");
        assert_eq!(next_receive(&events).data, b"four");
        assert_quiet(&events);
    }
}
