//! Bridge scenarios over real sockets on localhost, plus the big
//! out-of-order defragmentation case.

use rand::prelude::*;
use shmbus_core::{BrokerServer, BusClient, Ring, RingView, Topic};
use shmbus_repl::wire::UDP_HEADER;
use shmbus_repl::{Defragmentator, FragmentIter, TcpSource, TcpTarget, UdpSource, UdpTarget};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn unique(tag: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("shmbus_repl_{tag}_{}_{ts}", std::process::id())
}

fn cleanup(channel: &str, topics: &[&str]) {
    BrokerServer::remove_channel(channel);
    for topic in topics {
        Topic::try_remove(channel, topic);
    }
}

/// Scenario: 100 monotonically increasing records cross the TCP bridge and
/// arrive in order on the replica channel.
#[test]
fn tcp_replication_preserves_order_and_payload() {
    let source_channel = unique("tcp_src");
    let target_channel = unique("tcp_dst");
    const TOPIC: &str = "test_topic";

    // Source side: broker, topic, bridge.
    let source_broker = BrokerServer::new(&source_channel).unwrap();
    let source_topic = source_broker.create_topic(TOPIC, 256, 1 << 20).unwrap();
    let source = TcpSource::bind(&source_channel, 0).unwrap();
    let port = source.local_addr().port();

    // Target side: broker, bridge, replicated topic.
    let target_broker = std::sync::Arc::new(BrokerServer::new(&target_channel).unwrap());
    let target = TcpTarget::new(target_broker.clone(), "127.0.0.1", port, 256, 1 << 20);
    target.replicate_topic(TOPIC).unwrap();

    // The bridge's own cursor must exist before publishing, or early
    // records fall before its start index.
    let deadline = Instant::now() + Duration::from_secs(10);
    while source_topic.subscriber_count() == 0 {
        assert!(Instant::now() < deadline, "bridge never subscribed at the source");
        std::thread::sleep(Duration::from_millis(10));
    }

    // Local consumer on the replica channel, subscribed before the flow.
    let client = BusClient::new(&target_channel).unwrap();
    client.connect().unwrap();
    let mut cursor = client.subscribe(TOPIC).unwrap();

    for value in 0..100u64 {
        source_topic.publish_value(4, &value).unwrap();
    }

    for expected in 0..100u64 {
        let accessor = cursor
            .try_read_for(Duration::from_secs(5))
            .unwrap()
            .unwrap_or_else(|| panic!("record {expected} never arrived"));
        assert_eq!(accessor.tag(), 4);
        assert_eq!(accessor.read_as::<u64>(), expected);
    }

    drop(cursor);
    drop(client);
    drop(target);
    drop(source);
    drop(source_topic);
    drop(source_broker);
    drop(target_broker);
    cleanup(&source_channel, &[TOPIC]);
    cleanup(&target_channel, &[TOPIC]);
}

/// Scenario: a 1 MiB frame fragmented at MTU 1500, fully shuffled, still
/// reassembles into a single byte-identical ring entry.
#[test]
fn megabyte_frame_survives_total_reorder() {
    const FRAME: usize = 1_048_576;
    const MTU: usize = 1500;

    let mut rng = StdRng::seed_from_u64(7);
    let mut body = vec![0u8; FRAME];
    rng.fill_bytes(&mut body);

    let mut mem = vec![0u64; Ring::size_of(16, 2 * FRAME as u64).div_ceil(8)];
    let base = mem.as_mut_ptr() as *mut u8;
    let ring = unsafe { Ring::init(base, 16, 2 * FRAME as u64) };
    let view = unsafe { RingView::attach(base) };
    let mut cursor = view.open_cursor(0);

    let mut fragments: Vec<_> = FragmentIter::new(&body, 9, 1234, MTU)
        .map(|(h, c)| (h, c.to_vec()))
        .collect();
    assert_eq!(fragments.len(), FRAME.div_ceil(MTU - UDP_HEADER));
    fragments.shuffle(&mut rng);

    let mut defrag = Defragmentator::new(&ring, MTU);
    let mut completions = 0;
    for (header, chunk) in &fragments {
        if defrag.process(*header, chunk).unwrap() {
            completions += 1;
        }
    }
    assert_eq!(completions, 1);

    assert!(cursor.try_read(&view));
    let accessor = view.entry(&cursor);
    assert_eq!(accessor.tag(), 9);
    assert_eq!(accessor.size() as usize, FRAME);
    assert_eq!(accessor.bytes(), body.as_slice());
    assert!(!cursor.try_read(&view));
}

/// Small and large payloads cross the UDP bridge on loopback; the large one
/// exercises fragmentation end to end.
#[test]
fn udp_replication_roundtrip() {
    let source_channel = unique("udp_src");
    let target_channel = unique("udp_dst");
    const TOPIC: &str = "frames";
    const MTU: usize = 1500;

    let source_broker = BrokerServer::new(&source_channel).unwrap();
    let source_topic = source_broker.create_topic(TOPIC, 64, 1 << 21).unwrap();

    let target_broker = std::sync::Arc::new(BrokerServer::new(&target_channel).unwrap());
    let target =
        UdpTarget::bind(&target_broker, "127.0.0.1", 0, TOPIC, 64, 1 << 21, MTU).unwrap();
    let endpoint = format!("127.0.0.1:{}", target.local_addr().port());

    let source = UdpSource::new(&source_channel, MTU).unwrap();
    source.replicate_topic(TOPIC, &endpoint).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while source_topic.subscriber_count() == 0 {
        assert!(Instant::now() < deadline, "bridge never subscribed at the source");
        std::thread::sleep(Duration::from_millis(10));
    }

    let client = BusClient::new(&target_channel).unwrap();
    client.connect().unwrap();
    let mut cursor = client.subscribe(TOPIC).unwrap();

    let mut rng = StdRng::seed_from_u64(21);
    let mut large = vec![0u8; 100_000];
    rng.fill_bytes(&mut large);

    for value in 0..10u64 {
        source_topic.publish_value(1, &value).unwrap();
        // Loopback keeps up at a gentle pace.
        std::thread::sleep(Duration::from_millis(2));
    }
    {
        let mut scope = source_topic.publish(large.len() as u64, 2).unwrap();
        scope.bytes_mut()[..large.len()].copy_from_slice(&large);
        scope.commit(large.len() as u64).unwrap();
    }

    for expected in 0..10u64 {
        let accessor = cursor
            .try_read_for(Duration::from_secs(5))
            .unwrap()
            .unwrap_or_else(|| panic!("datagram {expected} never arrived"));
        assert_eq!(accessor.read_as::<u64>(), expected);
    }
    let accessor = cursor
        .try_read_for(Duration::from_secs(5))
        .unwrap()
        .expect("fragmented frame never arrived");
    assert_eq!(accessor.tag(), 2);
    assert_eq!(accessor.bytes(), large.as_slice());

    drop(cursor);
    drop(client);
    drop(source);
    drop(target);
    drop(source_topic);
    drop(source_broker);
    drop(target_broker);
    cleanup(&source_channel, &[TOPIC]);
    cleanup(&target_channel, &[TOPIC]);
}
