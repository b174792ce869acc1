//! Large-message ring soak: ~3 MB frames at 18 Hz while a consumer reads
//! concurrently. The bus must preserve every byte; the frames prove it with
//! their digests.

use rand::SeedableRng;
use rand::rngs::StdRng;
use shmbus_core::{BrokerServer, BusClient, Topic};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const FRAME_COUNT: u64 = 60;
const BODY_BYTES: usize = 3 * 1024 * 1024;
const PERIOD: Duration = Duration::from_millis(55); // ~18 Hz

#[test]
fn soak_large_frames_keep_their_digest() {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let channel = format!("shmbus_soak_{}_{ts}", std::process::id());
    const TOPIC: &str = "frames";

    let broker = BrokerServer::new(&channel).unwrap();
    let topic = broker.create_topic(TOPIC, 256, 8 * 1024 * 1024).unwrap();

    let client = BusClient::new(&channel).unwrap();
    client.connect().unwrap();
    let mut cursor = client.subscribe(TOPIC).unwrap();

    let producer = {
        let topic = topic.clone();
        std::thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(42);
            let frame_len = shmbus_testframe::frame_size(BODY_BYTES) as u64;
            for _ in 0..FRAME_COUNT {
                let started = Instant::now();
                let mut scope = topic.publish(frame_len, 1).expect("publish failed");
                shmbus_testframe::fill(&mut rng, &mut scope.bytes_mut()[..frame_len as usize]);
                scope.commit(frame_len).expect("commit failed");
                drop(scope);
                if let Some(rest) = PERIOD.checked_sub(started.elapsed()) {
                    std::thread::sleep(rest);
                }
            }
        })
    };

    let mut verified = 0u64;
    let deadline = Instant::now() + Duration::from_secs(30);
    while verified < FRAME_COUNT {
        assert!(Instant::now() < deadline, "soak timed out at frame {verified}");
        let Some(accessor) = cursor
            .try_read_for(Duration::from_secs(1))
            .expect("cursor failed")
        else {
            continue;
        };
        assert!(
            shmbus_testframe::verify(accessor.bytes()),
            "frame {verified} failed its digest check"
        );
        verified += 1;
    }

    producer.join().unwrap();

    drop(cursor);
    drop(client);
    drop(topic);
    drop(broker);
    BrokerServer::remove_channel(&channel);
    Topic::try_remove(&channel, TOPIC);
}
