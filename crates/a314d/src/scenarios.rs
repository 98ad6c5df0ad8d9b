//! End-to-end scenarios against the in-memory bus: a test plays the Amiga
//! by loading the A2R ring and raising interrupts, and plays clients over
//! duplex streams through the real framing and I/O tasks.

use tokio::io::{duplex, DuplexStream};

use a314_wire::framing::{Frame, MessageFramed};
use a314_wire::layout::{self, r_event};
use a314_wire::message::Message;
use a314_wire::packet::{
    decode_all, Packet, PacketBody, CONNECT_OK, CONNECT_UNKNOWN_SERVICE,
};

use crate::bridge::{Bridge, BridgeError};
use crate::clients::{ClientEvent, ClientId};
use crate::config::OnDemandStart;
use crate::testutil::FakeBus;

const BASE: u32 = 0x2_0000;

struct TestClient {
    id: ClientId,
    framed: MessageFramed<DuplexStream>,
}

impl TestClient {
    async fn send(&mut self, msg: Message) {
        self.framed.send(&msg).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        self.framed.recv().await.unwrap().unwrap().parse().unwrap()
    }
}

/// A bridge with the base address already discovered.
fn setup() -> Bridge<FakeBus> {
    setup_with_services(Vec::new())
}

fn setup_with_services(services: Vec<OnDemandStart>) -> Bridge<FakeBus> {
    let mut bus = FakeBus::new();
    bus.publish_base(BASE);
    bus.push_event(r_event::BASE_ADDRESS);

    let mut bridge = Bridge::new(bus, services);
    bridge.handle_irq().unwrap();
    assert_eq!(bridge.comm().base_address(), Some(BASE));
    bridge
}

fn connect_client(bridge: &mut Bridge<FakeBus>) -> TestClient {
    let (local, remote) = duplex(64 * 1024);
    let id = bridge.clients_mut().add(local);
    TestClient {
        id,
        framed: MessageFramed::new(remote),
    }
}

/// Move one client event through the core, then run the flush step the
/// event loop runs after client traffic.
async fn pump(bridge: &mut Bridge<FakeBus>) {
    let event = bridge.expect_event().await;
    bridge.handle_client_event(event).unwrap();
    bridge.flush_and_post().unwrap();
}

/// Load packets into the A2R ring and raise the interrupt, as the Amiga
/// would.
fn deliver_packets(bridge: &mut Bridge<FakeBus>, packets: &[Packet]) {
    let mut bytes = Vec::new();
    for p in packets {
        p.encode_into(&mut bytes);
    }
    bridge.bus_mut().load_a2r(BASE, &bytes);
    bridge.bus_mut().push_event(r_event::A2R_TAIL);
    bridge.handle_irq().unwrap();
}

/// Everything the Amiga would have consumed from the R2A ring since the
/// last call.
fn amiga_received(bridge: &mut Bridge<FakeBus>) -> Vec<Packet> {
    let bytes = bridge.bus_mut().consume_r2a(BASE);
    decode_all(&bytes).unwrap()
}

/// Register "echo" and connect channel 7 to it; the client ends up with
/// stream id 1 and the Amiga with its connect response consumed.
async fn established(bridge: &mut Bridge<FakeBus>) -> TestClient {
    let mut client = connect_client(bridge);

    client
        .send(Message::RegisterReq {
            name: b"echo".to_vec(),
        })
        .await;
    pump(bridge).await;
    assert_eq!(client.recv().await, Message::RegisterRes { ok: true });

    deliver_packets(
        bridge,
        &[Packet::new(7, PacketBody::Connect(b"echo".to_vec()))],
    );
    assert_eq!(
        client.recv().await,
        Message::Connect {
            stream_id: 1,
            service: b"echo".to_vec()
        }
    );

    client
        .send(Message::ConnectResponse {
            stream_id: 1,
            payload: vec![CONNECT_OK],
        })
        .await;
    pump(bridge).await;

    assert_eq!(
        amiga_received(bridge),
        vec![Packet::new(7, PacketBody::ConnectResponse(vec![CONNECT_OK]))]
    );
    client
}

#[tokio::test]
async fn register_and_connect() {
    let mut bridge = setup();
    let client = established(&mut bridge).await;

    let ch = bridge.channels().get(7).unwrap();
    assert_eq!(ch.association, Some(client.id));
    assert_eq!(ch.stream_id, 1);
}

#[tokio::test]
async fn data_flows_both_ways() {
    let mut bridge = setup();
    let mut client = established(&mut bridge).await;

    client
        .send(Message::Data {
            stream_id: 1,
            payload: b"hello".to_vec(),
        })
        .await;
    pump(&mut bridge).await;
    assert_eq!(
        amiga_received(&mut bridge),
        vec![Packet::new(7, PacketBody::Data(b"hello".to_vec()))]
    );

    deliver_packets(
        &mut bridge,
        &[Packet::new(7, PacketBody::Data(b"world".to_vec()))],
    );
    assert_eq!(
        client.recv().await,
        Message::Data {
            stream_id: 1,
            payload: b"world".to_vec()
        }
    );
}

#[tokio::test]
async fn half_close_then_full_close() {
    let mut bridge = setup();
    let mut client = established(&mut bridge).await;

    // Client half-closes: EOS goes out, the channel stays.
    client.send(Message::Eos { stream_id: 1 }).await;
    pump(&mut bridge).await;
    assert_eq!(
        amiga_received(&mut bridge),
        vec![Packet::new(7, PacketBody::Eos)]
    );
    let ch = bridge.channels().get(7).unwrap();
    assert!(ch.got_eos_from_client);
    assert_eq!(ch.association, Some(client.id));

    // The Amiga closes its side too: the channel dissociates and goes away.
    deliver_packets(&mut bridge, &[Packet::new(7, PacketBody::Eos)]);
    assert_eq!(client.recv().await, Message::Eos { stream_id: 1 });
    assert!(!bridge.channels().contains(7));
}

#[tokio::test]
async fn unknown_service_is_refused() {
    let mut bridge = setup();

    deliver_packets(
        &mut bridge,
        &[Packet::new(9, PacketBody::Connect(b"missing".to_vec()))],
    );

    assert_eq!(
        amiga_received(&mut bridge),
        vec![Packet::new(
            9,
            PacketBody::ConnectResponse(vec![CONNECT_UNKNOWN_SERVICE])
        )]
    );
    // Nothing left to say on that channel, so it is gone after the send.
    assert!(!bridge.channels().contains(9));
}

#[tokio::test]
async fn flush_wraps_at_the_ring_boundary() {
    let mut bridge = setup();
    let mut client = established(&mut bridge).await;

    // Park the R2A pointers at 200, as if the ring had cycled a while.
    let mut status = bridge.bus_mut().status(BASE);
    status[layout::R2A_HEAD] = 200;
    status[layout::R2A_TAIL] = 200;
    bridge.bus_mut().set_status(BASE, status);
    bridge.bus_mut().push_event(r_event::R2A_HEAD);
    bridge.handle_irq().unwrap();

    // 150 bytes of packets: two data packets of 72 payload bytes each.
    let first: Vec<u8> = (0..72).collect();
    let second: Vec<u8> = (72..144).collect();
    client
        .send(Message::Data {
            stream_id: 1,
            payload: first.clone(),
        })
        .await;
    pump(&mut bridge).await;
    client
        .send(Message::Data {
            stream_id: 1,
            payload: second.clone(),
        })
        .await;
    pump(&mut bridge).await;

    let mut expected = Vec::new();
    Packet::new(7, PacketBody::Data(first)).encode_into(&mut expected);
    Packet::new(7, PacketBody::Data(second)).encode_into(&mut expected);
    assert_eq!(expected.len(), 150);

    // 56 bytes fit before the wrap, 94 land at the start of the ring.
    let ring = (BASE + layout::R2A_RING_OFFSET) as usize;
    let sram = &bridge.bus_mut().sram;
    assert_eq!(&sram[ring + 200..ring + 256], &expected[..56]);
    assert_eq!(&sram[ring..ring + 94], &expected[56..]);
    assert_eq!(bridge.bus_mut().status(BASE)[layout::R2A_TAIL], 94);
}

#[tokio::test]
async fn base_address_republish_resets_everything() {
    let mut bridge = setup();
    let mut client = established(&mut bridge).await;

    // A second channel onto the same service: stream id 3.
    deliver_packets(
        &mut bridge,
        &[Packet::new(8, PacketBody::Connect(b"echo".to_vec()))],
    );
    assert_eq!(
        client.recv().await,
        Message::Connect {
            stream_id: 3,
            service: b"echo".to_vec()
        }
    );
    client
        .send(Message::ConnectResponse {
            stream_id: 3,
            payload: vec![CONNECT_OK],
        })
        .await;
    pump(&mut bridge).await;

    // Firmware restart: base address republished.
    bridge.bus_mut().push_event(r_event::BASE_ADDRESS);
    bridge.handle_irq().unwrap();

    let mut resets = vec![client.recv().await, client.recv().await];
    resets.sort_by_key(|m| m.stream_id());
    assert_eq!(
        resets,
        vec![
            Message::Reset { stream_id: 1 },
            Message::Reset { stream_id: 3 }
        ]
    );
    assert!(bridge.channels().is_empty());
    assert_eq!(bridge.comm().base_address(), Some(BASE));
}

#[tokio::test]
async fn no_data_reaches_the_client_after_amiga_eos() {
    let mut bridge = setup();
    let mut client = established(&mut bridge).await;

    deliver_packets(&mut bridge, &[Packet::new(7, PacketBody::Eos)]);
    assert_eq!(client.recv().await, Message::Eos { stream_id: 1 });

    // Late data is dropped. A memory read answered afterwards proves the
    // data never entered the client's queue.
    deliver_packets(
        &mut bridge,
        &[Packet::new(7, PacketBody::Data(b"late".to_vec()))],
    );
    client
        .send(Message::ReadMemReq {
            address: BASE,
            length: 2,
        })
        .await;
    pump(&mut bridge).await;
    assert!(matches!(client.recv().await, Message::ReadMemRes { .. }));
}

#[tokio::test]
async fn client_disconnect_resets_its_channels() {
    let mut bridge = setup();
    let client = established(&mut bridge).await;
    drop(client);

    // The EOF lands as a Closed event.
    pump(&mut bridge).await;
    assert_eq!(
        amiga_received(&mut bridge),
        vec![Packet::new(7, PacketBody::Reset)]
    );
    assert!(!bridge.channels().contains(7));

    // The service registration died with the client.
    deliver_packets(
        &mut bridge,
        &[Packet::new(9, PacketBody::Connect(b"echo".to_vec()))],
    );
    assert_eq!(
        amiga_received(&mut bridge),
        vec![Packet::new(
            9,
            PacketBody::ConnectResponse(vec![CONNECT_UNKNOWN_SERVICE])
        )]
    );
}

#[tokio::test]
async fn backpressure_holds_packets_until_the_ring_drains() {
    let mut bridge = setup();
    let mut client = established(&mut bridge).await;

    // Two maximum-size packets cannot both fit in one 255-byte window.
    client
        .send(Message::Data {
            stream_id: 1,
            payload: vec![0xAA; 200],
        })
        .await;
    pump(&mut bridge).await;
    client
        .send(Message::Data {
            stream_id: 1,
            payload: vec![0xBB; 200],
        })
        .await;
    pump(&mut bridge).await;

    assert_eq!(
        amiga_received(&mut bridge),
        vec![Packet::new(7, PacketBody::Data(vec![0xAA; 200]))]
    );
    // The second packet is still queued.
    assert!(bridge.channels().get(7).unwrap().has_queued_packets());

    // The Amiga acknowledges consumption; the next IRQ flushes the rest.
    bridge.bus_mut().push_event(r_event::R2A_HEAD);
    bridge.handle_irq().unwrap();
    assert_eq!(
        amiga_received(&mut bridge),
        vec![Packet::new(7, PacketBody::Data(vec![0xBB; 200]))]
    );
    assert!(!bridge.channels().get(7).unwrap().has_queued_packets());
}

#[tokio::test]
async fn connect_on_open_channel_is_fatal() {
    let mut bridge = setup();
    let _client = established(&mut bridge).await;

    let mut bytes = Vec::new();
    Packet::new(7, PacketBody::Connect(b"echo".to_vec())).encode_into(&mut bytes);
    bridge.bus_mut().load_a2r(BASE, &bytes);
    bridge.bus_mut().push_event(r_event::A2R_TAIL);

    assert!(matches!(
        bridge.handle_irq(),
        Err(BridgeError::ChannelReused(7))
    ));
}

#[tokio::test]
async fn malformed_ring_contents_are_fatal() {
    let mut bridge = setup();

    bridge.bus_mut().load_a2r(BASE, &[0, 99, 1]);
    bridge.bus_mut().push_event(r_event::A2R_TAIL);

    assert!(matches!(bridge.handle_irq(), Err(BridgeError::Peer(_))));
}

#[tokio::test]
async fn unknown_client_message_is_dropped_not_fatal() {
    let mut bridge = setup();
    let mut client = connect_client(&mut bridge);

    bridge
        .handle_client_event(ClientEvent::Frame {
            client: client.id,
            frame: Frame {
                kind: 99,
                stream_id: 0,
                payload: Vec::new(),
            },
        })
        .unwrap();

    // The connection is still serviced afterwards.
    client
        .send(Message::RegisterReq {
            name: b"still-here".to_vec(),
        })
        .await;
    pump(&mut bridge).await;
    assert_eq!(client.recv().await, Message::RegisterRes { ok: true });
}

#[tokio::test]
async fn stream_ids_stay_unique_per_client() {
    let mut bridge = setup();
    let mut client = established(&mut bridge).await;

    for (channel, expected_stream) in [(8u8, 3u32), (9, 5), (10, 7)] {
        deliver_packets(
            &mut bridge,
            &[Packet::new(channel, PacketBody::Connect(b"echo".to_vec()))],
        );
        assert_eq!(
            client.recv().await,
            Message::Connect {
                stream_id: expected_stream,
                service: b"echo".to_vec()
            }
        );
    }

    // Every association on the client maps to a distinct stream id.
    let mut ids: Vec<u32> = [7u8, 8, 9, 10]
        .iter()
        .map(|&ch| bridge.channels().get(ch).unwrap().stream_id)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);
}

#[tokio::test]
async fn on_demand_service_is_spawned_and_associated() {
    let entry = OnDemandStart {
        service_name: "ondemand".into(),
        program: "/bin/true".into(),
        arguments: vec!["/bin/true".into()],
    };
    let mut bridge = setup_with_services(vec![entry]);

    deliver_packets(
        &mut bridge,
        &[Packet::new(5, PacketBody::Connect(b"ondemand".to_vec()))],
    );

    let ch = bridge.channels().get(5).unwrap();
    assert!(ch.association.is_some());
    assert_eq!(ch.stream_id, 1);
}

#[tokio::test]
async fn on_demand_spawn_failure_refuses_the_connect() {
    let entry = OnDemandStart {
        service_name: "broken".into(),
        program: "/nonexistent/program".into(),
        arguments: vec!["/nonexistent/program".into()],
    };
    let mut bridge = setup_with_services(vec![entry]);

    deliver_packets(
        &mut bridge,
        &[Packet::new(5, PacketBody::Connect(b"broken".to_vec()))],
    );

    assert_eq!(
        amiga_received(&mut bridge),
        vec![Packet::new(
            5,
            PacketBody::ConnectResponse(vec![CONNECT_UNKNOWN_SERVICE])
        )]
    );
}
