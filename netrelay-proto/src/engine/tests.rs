use std::{
    io::{self, Write},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use assert_matches::assert_matches;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing_subscriber::EnvFilter;

use super::*;
use crate::{
    codec::{Compression, IdentityFactory},
    tunnel::{Route, Tunnel},
};

const HOST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 40000);
const FAR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 7), 80);
const HOST_ISN: u32 = 1000;

#[test]
fn syn_without_route_is_refused() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), false);
    let mut entry = t.claimed();

    let syn = t.from_host(HOST_ISN, 0, TcpFlags::SYN, &[]);
    assert_matches!(
        t.engine.handle_host_packet(&mut entry, &syn, t.now),
        Err(Error::NoRoute(_))
    );
    assert_eq!(entry.local_state(), LocalState::Closed);
    let sent = t.sink.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(sent[0].seq, 0);
    assert_eq!(sent[0].ack, HOST_ISN + 1);
    assert!(t.tunnel.control.lock().unwrap().is_empty());
}

#[test]
fn host_opens_through_peer() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let mut entry = t.claimed();

    let wake = t
        .engine
        .handle_host_packet(&mut entry, &t.from_host(HOST_ISN, 0, TcpFlags::SYN, &[]), t.now)
        .unwrap();
    assert!(wake.tunnel);
    assert_eq!(entry.local_state(), LocalState::SynRcvd);
    assert_eq!(entry.remote_state(), RemoteState::ConnRequestSent);
    let control = t.tunnel.control.lock().unwrap().clone();
    assert_matches!(
        control.as_slice(),
        [ControlMessage::Open { local_id: 1, source, destination, .. }]
            if *source == HOST && *destination == FAR
    );
    // Nothing reaches the host until the destination accepted
    assert!(t.sink.take().is_empty());

    t.engine
        .confirm_opened(&mut entry, 9, Compression::NONE, t.now)
        .unwrap();
    let sent = t.sink.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(sent[0].ack, HOST_ISN + 1);
    assert_eq!(sent[0].source, FAR);
    assert_eq!(sent[0].destination, HOST);
    let isn = sent[0].seq;

    t.engine
        .handle_host_packet(
            &mut entry,
            &t.from_host(HOST_ISN + 1, isn.wrapping_add(1), TcpFlags::ACK, &[]),
            t.now,
        )
        .unwrap();
    assert_eq!(entry.local_state(), LocalState::Established);
    assert_eq!(entry.remote_state(), RemoteState::ConnEstablished);
    assert_eq!(entry.remote_id(), 9);
}

#[test]
fn lost_syn_ack_is_repeated() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let mut entry = t.claimed();
    let syn = t.from_host(HOST_ISN, 0, TcpFlags::SYN, &[]);
    t.engine.handle_host_packet(&mut entry, &syn, t.now).unwrap();

    // Not confirmed yet: a retransmitted SYN is swallowed
    t.engine.handle_host_packet(&mut entry, &syn, t.now).unwrap();
    assert!(t.sink.take().is_empty());

    t.engine
        .confirm_opened(&mut entry, 9, Compression::NONE, t.now)
        .unwrap();
    let first = t.sink.take();
    t.engine.handle_host_packet(&mut entry, &syn, t.now).unwrap();
    let second = t.sink.take();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].seq, first[0].seq);
    assert_eq!(second[0].flags, TcpFlags::SYN | TcpFlags::ACK);
}

#[test]
fn oversized_segment_gets_corrective_ack() {
    let _guard = subscribe();
    let mut config = RelayConfig::default();
    config.buffer_sizes(1024, 4096).unwrap();
    let t = Harness::new(config, true);
    let (mut entry, isn) = t.established();
    let space = usize::from(entry.advertised_window());
    assert_eq!(space, 4096);

    let data = vec![7; space + 1];
    let packet = t.from_host(HOST_ISN + 1, isn, TcpFlags::ACK, &data);
    assert_eq!(
        t.engine.handle_host_packet(&mut entry, &packet, t.now).unwrap(),
        Wake::NONE
    );
    let sent = t.sink.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, TcpFlags::ACK);
    assert_eq!(sent[0].ack, HOST_ISN + 1);
    assert_eq!(entry.inbound.total_bytes(), 0);
    assert_eq!(entry.next_expected(), HOST_ISN + 1);

    // Exactly the free space is fine
    let packet = t.from_host(HOST_ISN + 1, isn, TcpFlags::ACK, &data[..space]);
    t.engine.handle_host_packet(&mut entry, &packet, t.now).unwrap();
    assert_eq!(entry.inbound.total_bytes(), space);
    assert_eq!(entry.advertised_window(), 0);
}

#[test]
fn out_of_order_segments_reach_peer_in_order() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let (mut entry, isn) = t.established();
    let data = (0..100).collect::<Vec<u8>>();
    let start = HOST_ISN + 1;

    let wake = t
        .engine
        .handle_host_packet(
            &mut entry,
            &t.from_host(start + 50, isn, TcpFlags::ACK, &data[50..]),
            t.now,
        )
        .unwrap();
    assert!(wake.tunnel);
    assert_eq!(entry.inbound.ready_bytes(), 0);
    assert!(entry.inbound.has_holes());
    // Duplicate ACK for the missing data
    assert_eq!(t.sink.take()[0].ack, start);

    t.engine
        .handle_host_packet(
            &mut entry,
            &t.from_host(start, isn, TcpFlags::ACK, &data[..50]),
            t.now,
        )
        .unwrap();
    assert_eq!(entry.inbound.ready_bytes(), 100);
    assert_eq!(t.sink.take().last().unwrap().ack, start + 100);

    t.engine.drain_to_tunnel(&mut entry, t.now).unwrap();
    assert_eq!(t.tunnel.received(), data);
    assert!(entry.inbound.is_empty());
}

#[test]
fn host_fin_closes_peer_after_data() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let (mut entry, isn) = t.established();

    let packet = t.from_host(
        HOST_ISN + 1,
        isn,
        TcpFlags::ACK | TcpFlags::PSH | TcpFlags::FIN,
        b"bye",
    );
    t.engine.handle_host_packet(&mut entry, &packet, t.now).unwrap();
    assert_eq!(entry.local_state(), LocalState::CloseWait);
    let sent = t.sink.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ack, HOST_ISN + 5);
    // The close request waits behind the data
    assert!(t.tunnel.control.lock().unwrap().is_empty());

    t.engine.drain_to_tunnel(&mut entry, t.now).unwrap();
    assert_eq!(t.tunnel.received(), b"bye");
    assert_matches!(
        t.tunnel.control.lock().unwrap().last(),
        Some(ControlMessage::Close { local_id: 1, remote_id: 9 })
    );
    assert_eq!(entry.remote_state(), RemoteState::DisconnRequestSent);
    // FIN already acknowledged by the engine
    assert!(t.sink.take().is_empty());
}

#[test]
fn fin_wait_sequence() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let (mut entry, isn) = t.established();

    t.engine.close_to_host(&mut entry, t.now).unwrap();
    assert_eq!(entry.local_state(), LocalState::FinWait1);
    assert_eq!(entry.remote_state(), RemoteState::DisconnRequestReceived);
    let fin = t.sink.take();
    assert_eq!(fin[0].flags, TcpFlags::FIN | TcpFlags::ACK);
    assert_eq!(fin[0].seq, isn);

    t.engine
        .handle_host_packet(
            &mut entry,
            &t.from_host(HOST_ISN + 1, isn + 1, TcpFlags::ACK, &[]),
            t.now,
        )
        .unwrap();
    assert_eq!(entry.local_state(), LocalState::FinWait2);
    assert!(entry.outbound.is_empty());

    let host_fin = t.from_host(HOST_ISN + 1, isn + 1, TcpFlags::ACK | TcpFlags::FIN, &[]);
    t.engine.handle_host_packet(&mut entry, &host_fin, t.now).unwrap();
    assert_eq!(entry.local_state(), LocalState::TimeWait);
    assert_eq!(entry.remote_state(), RemoteState::Disconnected);
    let sent = t.sink.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ack, HOST_ISN + 2);

    // Retransmitted FIN: only the ACK is repeated
    t.engine.handle_host_packet(&mut entry, &host_fin, t.now).unwrap();
    assert_eq!(entry.local_state(), LocalState::TimeWait);
    let sent = t.sink.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, TcpFlags::ACK);
    assert_eq!(sent[0].ack, HOST_ISN + 2);

    let linger = Duration::from_secs(1);
    assert!(!t.engine.is_reclaimable(&entry, t.now, linger));
    assert!(t.engine.is_reclaimable(&entry, t.now + Duration::from_secs(2), linger));
}

#[test]
fn ack_for_unsent_data_is_corrected() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let (mut entry, isn) = t.established();

    let packet = t.from_host(HOST_ISN + 1, isn + 100, TcpFlags::ACK, b"data");
    assert_eq!(
        t.engine.handle_host_packet(&mut entry, &packet, t.now).unwrap(),
        Wake::NONE
    );
    let sent = t.sink.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, TcpFlags::ACK);
    assert_eq!(sent[0].seq, isn);
    assert_eq!(sent[0].ack, HOST_ISN + 1);
    assert_eq!(entry.local_state(), LocalState::Established);
    assert_eq!(entry.inbound.total_bytes(), 0);

    t.engine.drain_to_tunnel(&mut entry, t.now).unwrap();
    assert!(t.tunnel.received().is_empty());
}

#[test]
fn early_fin_waits_for_missing_data() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let (mut entry, isn) = t.established();

    let fin = t.from_host(HOST_ISN + 4, isn, TcpFlags::ACK | TcpFlags::FIN, &[]);
    t.engine.handle_host_packet(&mut entry, &fin, t.now).unwrap();
    assert_eq!(entry.local_state(), LocalState::Established);
    let sent = t.sink.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ack, HOST_ISN + 1);
    // Only the FIN is stored, no bytes
    assert_eq!(entry.inbound.ready_bytes(), 0);
    assert!(!entry.inbound.is_ready());

    t.engine.drain_to_tunnel(&mut entry, t.now).unwrap();
    assert!(t.tunnel.received().is_empty());
    assert!(t.tunnel.control.lock().unwrap().is_empty());

    let gap = t.from_host(HOST_ISN + 1, isn, TcpFlags::ACK, b"abc");
    t.engine.handle_host_packet(&mut entry, &gap, t.now).unwrap();
    assert_eq!(entry.local_state(), LocalState::Established);
    t.sink.take();

    t.engine.drain_to_tunnel(&mut entry, t.now).unwrap();
    assert_eq!(t.tunnel.received(), b"abc");
    assert_eq!(entry.local_state(), LocalState::CloseWait);
    assert_eq!(entry.remote_state(), RemoteState::DisconnRequestSent);
    assert_matches!(
        t.tunnel.control.lock().unwrap().as_slice(),
        [ControlMessage::Close { local_id: 1, remote_id: 9 }]
    );
    assert_eq!(t.sink.take().last().unwrap().ack, HOST_ISN + 5);
}

#[test]
fn simultaneous_close() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let (mut entry, isn) = t.established();

    t.engine.close_to_host(&mut entry, t.now).unwrap();
    assert_eq!(entry.local_state(), LocalState::FinWait1);
    assert_eq!(t.sink.take()[0].flags, TcpFlags::FIN | TcpFlags::ACK);

    // The host's FIN crosses ours and does not acknowledge it
    let host_fin = t.from_host(HOST_ISN + 1, isn, TcpFlags::ACK | TcpFlags::FIN, &[]);
    t.engine.handle_host_packet(&mut entry, &host_fin, t.now).unwrap();
    assert_eq!(entry.local_state(), LocalState::Closing);
    assert_eq!(entry.remote_state(), RemoteState::Disconnected);
    assert_eq!(t.sink.take().last().unwrap().ack, HOST_ISN + 2);
    assert!(!entry.outbound.is_empty());

    let ack = t.from_host(HOST_ISN + 2, isn + 1, TcpFlags::ACK, &[]);
    t.engine.handle_host_packet(&mut entry, &ack, t.now).unwrap();
    assert_eq!(entry.local_state(), LocalState::TimeWait);
    assert!(entry.outbound.is_empty());
}

#[test]
fn peer_open_confirmed_after_host_fin() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let mut entry = t.engine.new_entry(2, t.now);
    entry.claim(HOST, FAR);
    t.engine
        .open_to_host(&mut entry, t.tunnel.clone(), 5, Compression::NONE, t.now)
        .unwrap();
    let isn = t.sink.take()[0].seq;

    // The tunnel cannot take the confirmation yet
    t.tunnel.blocked.store(true, Ordering::Relaxed);
    let syn_ack = t.from_host(5000, isn + 1, TcpFlags::SYN | TcpFlags::ACK, &[]);
    t.engine.handle_host_packet(&mut entry, &syn_ack, t.now).unwrap();
    assert_eq!(entry.local_state(), LocalState::Established);
    assert_eq!(entry.remote_state(), RemoteState::ConnRequestReceived);

    let flags = TcpFlags::ACK | TcpFlags::PSH | TcpFlags::FIN;
    let last = t.from_host(5001, isn + 1, flags, b"bye");
    t.engine.handle_host_packet(&mut entry, &last, t.now).unwrap();
    assert_eq!(entry.local_state(), LocalState::CloseWait);
    assert!(t.tunnel.control.lock().unwrap().is_empty());

    t.tunnel.unblock();
    t.engine.drain_to_tunnel(&mut entry, t.now).unwrap();
    assert_eq!(t.tunnel.received(), b"bye");
    assert_eq!(entry.remote_state(), RemoteState::DisconnRequestSent);
    let control = t.tunnel.control.lock().unwrap().clone();
    assert_matches!(
        control.as_slice(),
        [
            ControlMessage::Opened { local_id: 2, remote_id: 5, .. },
            ControlMessage::Close { local_id: 2, remote_id: 5 },
        ]
    );
}

#[test]
fn peer_opens_to_host() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let mut entry = t.engine.new_entry(2, t.now);
    entry.claim(HOST, FAR);

    t.engine
        .open_to_host(&mut entry, t.tunnel.clone(), 5, Compression::NONE, t.now)
        .unwrap();
    assert_eq!(entry.local_state(), LocalState::SynSent);
    assert_eq!(entry.remote_state(), RemoteState::ConnRequestReceived);
    let syn = t.sink.take();
    assert_eq!(syn.len(), 1);
    assert_eq!(syn[0].flags, TcpFlags::SYN);
    let isn = syn[0].seq;

    t.engine
        .handle_host_packet(
            &mut entry,
            &t.from_host(5000, isn + 1, TcpFlags::SYN | TcpFlags::ACK, &[]),
            t.now,
        )
        .unwrap();
    assert_eq!(entry.local_state(), LocalState::Established);
    assert_eq!(entry.remote_state(), RemoteState::ConnEstablished);
    let ack = t.sink.take();
    assert_eq!(ack[0].flags, TcpFlags::ACK);
    assert_eq!(ack[0].ack, 5001);
    let control = t.tunnel.control.lock().unwrap().clone();
    assert_matches!(
        control.as_slice(),
        [ControlMessage::Opened { local_id: 2, remote_id: 5, .. }]
    );
    assert!(entry.outbound.is_empty());
}

#[test]
fn syn_follows_retransmission_schedule() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let mut entry = t.engine.new_entry(2, t.now);
    entry.claim(HOST, FAR);
    t.engine
        .open_to_host(&mut entry, t.tunnel.clone(), 5, Compression::NONE, t.now)
        .unwrap();
    let isn = t.sink.take()[0].seq;

    t.engine
        .deliver_to_host(&mut entry, t.now + Duration::from_millis(500))
        .unwrap();
    assert!(t.sink.take().is_empty());
    t.engine
        .deliver_to_host(&mut entry, t.now + Duration::from_secs(1))
        .unwrap();
    let resent = t.sink.take();
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].seq, isn);
    t.engine
        .deliver_to_host(&mut entry, t.now + Duration::from_secs(2))
        .unwrap();
    assert!(t.sink.take().is_empty());

    assert_matches!(
        t.engine
            .deliver_to_host(&mut entry, t.now + Duration::from_secs(61)),
        Err(Error::TimedOut)
    );
    assert_eq!(entry.local_state(), LocalState::Closed);
    assert_matches!(
        t.tunnel.control.lock().unwrap().last(),
        Some(ControlMessage::Reset { local_id: 2, remote_id: 5 })
    );
}

#[test]
fn peer_data_is_segmented_and_retransmitted() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let (mut entry, isn) = t.established();
    let data = vec![1; 3000];

    let wake = t
        .engine
        .data_to_host(&mut entry, &data, TcpFlags::ACK | TcpFlags::PSH, t.now)
        .unwrap();
    assert!(wake.host);
    assert_eq!(entry.outbound.len(), 3);
    assert_eq!(entry.outbound[0].len(), 1460);
    assert!(!entry.outbound[0].flags().contains(TcpFlags::PSH));
    assert!(entry.outbound[2].flags().contains(TcpFlags::PSH));

    t.engine.deliver_to_host(&mut entry, t.now).unwrap();
    let sent = t.sink.take();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].seq, isn);
    assert_eq!(sent[1].seq, isn + 1460);
    assert_eq!(sent[2].payload.len(), 80);
    assert_eq!(entry.out_seq, isn + 3000);

    // Host acknowledges the first segment only
    t.engine
        .handle_host_packet(
            &mut entry,
            &t.from_host(HOST_ISN + 1, isn + 1460, TcpFlags::ACK, &[]),
            t.now,
        )
        .unwrap();
    assert_eq!(entry.outbound.len(), 2);

    let later = t.now + Duration::from_secs(1);
    t.engine.deliver_to_host(&mut entry, later).unwrap();
    let resent = t.sink.take();
    assert_eq!(resent.len(), 2);
    assert_eq!(resent[0].seq, isn + 1460);
    assert!(entry.rto > RelayConfig::default().rto_lower_bound);
}

#[test]
fn closed_window_is_probed() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let (mut entry, isn) = t.established();

    t.engine
        .data_to_host(&mut entry, b"abc", TcpFlags::ACK, t.now)
        .unwrap();
    t.engine.deliver_to_host(&mut entry, t.now).unwrap();
    assert_eq!(t.sink.take().len(), 1);
    let zero_window = TcpPacket {
        window: 0,
        ..t.from_host(HOST_ISN + 1, isn + 3, TcpFlags::ACK, &[])
    };
    t.engine.handle_host_packet(&mut entry, &zero_window, t.now).unwrap();
    assert_eq!(entry.receiver_window, 0);
    assert!(entry.outbound.is_empty());

    t.engine
        .data_to_host(&mut entry, b"xyz", TcpFlags::ACK, t.now)
        .unwrap();
    t.engine.deliver_to_host(&mut entry, t.now).unwrap();
    let probe = t.sink.take();
    assert_eq!(probe.len(), 1);
    assert_eq!(probe[0].seq, isn + 3);
    assert_eq!(probe[0].payload, b"x");

    // Not again within the RTO
    t.engine.deliver_to_host(&mut entry, t.now).unwrap();
    assert!(t.sink.take().is_empty());
}

#[test]
fn peer_reset_resets_host() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let (mut entry, isn) = t.established();

    t.engine.reset_to_host(&mut entry, t.now).unwrap();
    assert_eq!(entry.local_state(), LocalState::Closed);
    assert_eq!(entry.remote_state(), RemoteState::Disconnected);
    let sent = t.sink.take();
    assert_eq!(sent[0].flags, TcpFlags::RST);
    assert_eq!(sent[0].seq, isn);

    // Anything further from the host is answered with a reset
    t.engine
        .handle_host_packet(
            &mut entry,
            &t.from_host(HOST_ISN + 1, isn, TcpFlags::ACK, b"late"),
            t.now,
        )
        .unwrap();
    let sent = t.sink.take();
    assert_eq!(sent[0].flags, TcpFlags::RST);
    assert_eq!(sent[0].seq, isn);
}

#[test]
fn host_reset_notifies_peer() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let (mut entry, isn) = t.established();

    t.engine
        .handle_host_packet(
            &mut entry,
            &t.from_host(HOST_ISN + 1, isn, TcpFlags::RST | TcpFlags::ACK, &[]),
            t.now,
        )
        .unwrap();
    assert_eq!(entry.local_state(), LocalState::Closed);
    assert_matches!(
        t.tunnel.control.lock().unwrap().last(),
        Some(ControlMessage::Reset { local_id: 1, remote_id: 9 })
    );
}

#[test]
fn blocked_tunnel_keeps_pending_data() {
    let _guard = subscribe();
    let mut config = RelayConfig::default();
    config.max_payload(4).unwrap();
    let t = Harness::new(config, true);
    let (mut entry, isn) = t.established();

    t.engine
        .handle_host_packet(
            &mut entry,
            &t.from_host(HOST_ISN + 1, isn, TcpFlags::ACK | TcpFlags::PSH, b"abcdefghij"),
            t.now,
        )
        .unwrap();
    t.tunnel.block_after(1);
    t.engine.drain_to_tunnel(&mut entry, t.now).unwrap();
    assert_eq!(t.tunnel.received(), b"abcd");
    assert!(entry.pending.is_some());

    t.tunnel.unblock();
    t.engine.drain_to_tunnel(&mut entry, t.now).unwrap();
    assert_eq!(t.tunnel.received(), b"abcdefghij");
    assert!(entry.pending.is_none());
    assert!(entry.inbound.is_empty());
}

#[test]
fn establishment_times_out() {
    let _guard = subscribe();
    let t = Harness::new(RelayConfig::default(), true);
    let mut entry = t.claimed();
    t.engine
        .handle_host_packet(&mut entry, &t.from_host(HOST_ISN, 0, TcpFlags::SYN, &[]), t.now)
        .unwrap();

    t.engine
        .drain_to_tunnel(&mut entry, t.now + Duration::from_secs(5))
        .unwrap();
    assert_matches!(
        t.engine
            .drain_to_tunnel(&mut entry, t.now + Duration::from_secs(11)),
        Err(Error::TimedOut)
    );
    assert_eq!(entry.local_state(), LocalState::Closed);
    let sent = t.sink.take();
    assert_eq!(sent[0].flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(sent[0].seq, 0);
}

#[test]
fn reassembly_ignores_arrival_order() {
    let _guard = subscribe();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let data = (0..2000).map(|i| (i % 251) as u8).collect::<Vec<u8>>();

    for _ in 0..20 {
        let t = Harness::new(RelayConfig::default(), true);
        let (mut entry, isn) = t.established();
        let mut pieces = data
            .chunks(137)
            .enumerate()
            .map(|(i, chunk)| (HOST_ISN + 1 + (i * 137) as u32, chunk))
            .collect::<Vec<_>>();
        pieces.shuffle(&mut rng);

        for (seq, chunk) in pieces {
            let packet = t.from_host(seq, isn, TcpFlags::ACK, chunk);
            t.engine.handle_host_packet(&mut entry, &packet, t.now).unwrap();
        }
        assert_eq!(entry.inbound.ready_bytes(), data.len());
        t.engine.drain_to_tunnel(&mut entry, t.now).unwrap();
        assert_eq!(t.tunnel.received(), data);
    }
}

struct Harness {
    engine: Engine,
    sink: Arc<RecordingSink>,
    tunnel: Arc<MockTunnel>,
    now: Instant,
}

impl Harness {
    fn new(config: RelayConfig, routed: bool) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let tunnel = Arc::new(MockTunnel::default());
        let route = routed.then(|| Route {
            peer: SocketAddr::from(([198, 51, 100, 1], 7000)),
            priority: 1,
            compression: Compression::NONE,
        });
        let engine = Engine::new(
            Arc::new(config),
            sink.clone(),
            Arc::new(StaticMapper(route)),
            Arc::new(FixedConnector(tunnel.clone())),
            Arc::new(IdentityFactory),
        );
        Self {
            engine,
            sink,
            tunnel,
            now: Instant::now(),
        }
    }

    fn claimed(&self) -> Entry {
        let mut entry = self.engine.new_entry(1, self.now);
        entry.claim(HOST, FAR);
        entry
    }

    /// A host-initiated connection through the full handshake; returns our next sequence number
    fn established(&self) -> (Entry, u32) {
        let mut entry = self.claimed();
        let syn = self.from_host(HOST_ISN, 0, TcpFlags::SYN, &[]);
        self.engine
            .handle_host_packet(&mut entry, &syn, self.now)
            .unwrap();
        self.engine
            .confirm_opened(&mut entry, 9, Compression::NONE, self.now)
            .unwrap();
        let isn = self.sink.take()[0].seq.wrapping_add(1);
        self.engine
            .handle_host_packet(
                &mut entry,
                &self.from_host(HOST_ISN + 1, isn, TcpFlags::ACK, &[]),
                self.now,
            )
            .unwrap();
        assert_eq!(entry.local_state(), LocalState::Established);
        self.tunnel.control.lock().unwrap().clear();
        (entry, isn)
    }

    fn from_host<'a>(
        &self,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &'a [u8],
    ) -> TcpPacket<'a> {
        TcpPacket {
            source: HOST,
            destination: FAR,
            seq,
            ack,
            flags,
            window: 65535,
            payload,
        }
    }
}

/// A packet the engine injected, parsed back
#[derive(Debug)]
struct Sent {
    source: SocketAddrV4,
    destination: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: Vec<u8>,
}

#[derive(Default)]
struct RecordingSink {
    packets: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    fn take(&self) -> Vec<Sent> {
        let packets = std::mem::take(&mut *self.packets.lock().unwrap());
        packets
            .iter()
            .map(|raw| {
                let packet = TcpPacket::parse(raw, true).unwrap();
                Sent {
                    source: packet.source,
                    destination: packet.destination,
                    seq: packet.seq,
                    ack: packet.ack,
                    flags: packet.flags,
                    payload: packet.payload.to_vec(),
                }
            })
            .collect()
    }
}

impl PacketSink for RecordingSink {
    fn inject(&self, packet: &[u8]) -> io::Result<()> {
        self.packets.lock().unwrap().push(packet.to_vec());
        Ok(())
    }
}

#[derive(Debug)]
struct MockTunnel {
    status: Mutex<TunnelStatus>,
    /// Data messages accepted before reporting `WouldBlock`
    budget: Mutex<Option<usize>>,
    blocked: AtomicBool,
    control: Mutex<Vec<ControlMessage>>,
    data: Mutex<Vec<u8>>,
}

impl MockTunnel {
    fn received(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    fn block_after(&self, messages: usize) {
        *self.budget.lock().unwrap() = Some(messages);
    }

    fn unblock(&self) {
        *self.budget.lock().unwrap() = None;
        self.blocked.store(false, Ordering::Relaxed);
    }
}

impl Default for MockTunnel {
    fn default() -> Self {
        Self {
            status: Mutex::new(TunnelStatus::Connected),
            budget: Mutex::new(None),
            blocked: AtomicBool::new(false),
            control: Mutex::new(Vec::new()),
            data: Mutex::new(Vec::new()),
        }
    }
}

impl Tunnel for MockTunnel {
    fn status(&self) -> TunnelStatus {
        *self.status.lock().unwrap()
    }

    fn accepts_data(&self) -> bool {
        !self.blocked.load(Ordering::Relaxed)
    }

    fn send_control(&self, message: &ControlMessage) -> Result<(), TunnelError> {
        self.control.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn send_data(&self, message: &DataMessage<'_>) -> Result<(), TunnelError> {
        let mut budget = self.budget.lock().unwrap();
        match budget.as_mut() {
            Some(0) => {
                self.blocked.store(true, Ordering::Relaxed);
                return Err(TunnelError::WouldBlock);
            }
            Some(left) => *left -= 1,
            None => {}
        }
        self.data.lock().unwrap().extend_from_slice(message.data);
        Ok(())
    }
}

struct StaticMapper(Option<Route>);

impl AddressMapper for StaticMapper {
    fn route(&self, _: SocketAddrV4, _: SocketAddrV4) -> Option<Route> {
        self.0
    }
}

struct FixedConnector(Arc<MockTunnel>);

impl Connector for FixedConnector {
    fn connect(&self, _: SocketAddr) -> Result<Arc<dyn Tunnel>, TunnelError> {
        Ok(self.0.clone())
    }
}

fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}
