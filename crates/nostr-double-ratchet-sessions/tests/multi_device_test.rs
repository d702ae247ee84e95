mod common;

use common::{wait_until, MemoryRelay, TestDevice};
use nostr::Keys;
use nostr_double_ratchet_sessions::{session_storage_key, Result};
use std::time::Duration;

#[tokio::test]
async fn sent_messages_are_mirrored_to_sibling_devices() -> Result<()> {
    let relay = MemoryRelay::new();
    let alice_keys = Keys::generate();
    let alice_phone = TestDevice::new(&relay, &alice_keys, "alice-phone");
    let alice_laptop = TestDevice::new(&relay, &alice_keys, "alice-laptop");
    let bob = TestDevice::new(&relay, &Keys::generate(), "bob-laptop");

    alice_laptop.dir.init().await?;
    alice_phone.dir.init().await?;
    bob.dir.init().await?;

    let alice = alice_keys.public_key();
    assert!(wait_until(1000, || alice_phone.dir.ready_session_count(&alice) == 1).await);
    assert!(
        wait_until(1000, || alice_laptop
            .dir
            .get_peer_devices(&alice)
            .contains(&"alice-phone".to_string()))
        .await
    );

    alice_phone
        .dir
        .send_text(bob.pubkey(), "hello from my phone".to_string())
        .await?;

    assert!(wait_until(1000, || bob.contents() == vec!["hello from my phone"]).await);
    assert!(wait_until(1000, || alice_laptop.contents() == vec!["hello from my phone"]).await);

    let mirrored = alice_laptop.received.lock().unwrap().clone();
    assert_eq!(mirrored[0].1, alice);
    let delivered = bob.received.lock().unwrap().clone();
    assert_eq!(delivered[0].1, alice);

    // The sending device never receives its own copy.
    assert!(alice_phone.contents().is_empty());
    Ok(())
}

#[tokio::test]
async fn sibling_devices_discover_each_other() -> Result<()> {
    let relay = MemoryRelay::new();
    let keys = Keys::generate();
    let phone = TestDevice::new(&relay, &keys, "phone");
    let laptop = TestDevice::new(&relay, &keys, "laptop");

    phone.dir.init().await?;
    laptop.dir.init().await?;

    let me = keys.public_key();
    assert!(wait_until(1000, || phone.dir.get_peer_devices(&me) == vec!["laptop"]).await);
    assert!(wait_until(1000, || laptop.dir.get_peer_devices(&me) == vec!["phone"]).await);

    // Neither device ever holds a session with itself.
    assert!(phone.dir.get_device_slot(&me, "phone").is_none());
    assert!(laptop.dir.get_device_slot(&me, "laptop").is_none());
    Ok(())
}

#[tokio::test]
async fn fan_out_without_sibling_session_still_reaches_recipient() -> Result<()> {
    let relay = MemoryRelay::new();
    let alice_keys = Keys::generate();
    let alice_phone = TestDevice::new(&relay, &alice_keys, "alice-phone");
    let bob = TestDevice::new(&relay, &Keys::generate(), "bob-laptop");
    alice_phone.dir.init().await?;
    bob.dir.init().await?;

    let ids = alice_phone
        .dir
        .send_text(bob.pubkey(), "only for bob".to_string())
        .await?;

    assert_eq!(ids.len(), 1);
    assert!(wait_until(1000, || bob.contents() == vec!["only for bob"]).await);
    Ok(())
}

#[tokio::test]
async fn revoked_device_is_dropped_everywhere() -> Result<()> {
    let relay = MemoryRelay::new();
    let keys = Keys::generate();
    let phone = TestDevice::new(&relay, &keys, "phone");
    let laptop = TestDevice::new(&relay, &keys, "laptop");
    let bob = TestDevice::new(&relay, &Keys::generate(), "bob-laptop");
    phone.dir.init().await?;
    laptop.dir.init().await?;
    bob.dir.init().await?;

    let me = keys.public_key();
    assert!(wait_until(1000, || phone.dir.get_peer_devices(&me) == vec!["laptop"]).await);
    bob.dir.send_text(me, "hi".to_string()).await?;
    assert!(wait_until(1000, || phone.contents() == vec!["hi"]).await);
    assert!(wait_until(1000, || laptop.contents() == vec!["hi"]).await);

    phone.dir.revoke_device("laptop").await?;

    assert!(phone.dir.get_peer_devices(&me).is_empty());
    assert!(phone.dir.is_device_revoked(&me, "laptop"));
    assert!(phone.storage.get(&session_storage_key(&me, "laptop")).await?.is_none());
    assert!(wait_until(1000, || bob.dir.get_peer_devices(&me) == vec!["phone"]).await);
    assert!(bob.dir.is_device_revoked(&me, "laptop"));

    bob.dir.send_text(me, "after".to_string()).await?;
    phone.dir.send_text(bob.pubkey(), "from phone".to_string()).await?;
    assert!(wait_until(1000, || phone.contents() == vec!["hi", "after"]).await);
    assert!(wait_until(1000, || bob.contents() == vec!["from phone"]).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(laptop.contents(), vec!["hi"]);
    // The revoked device still knows who it is.
    assert!(!laptop.dir.is_device_revoked(&me, "laptop"));
    Ok(())
}

#[tokio::test]
async fn new_device_receives_recent_history() -> Result<()> {
    let relay = MemoryRelay::new();
    let bob_keys = Keys::generate();
    let alice = TestDevice::new(&relay, &Keys::generate(), "alice-phone");
    let bob_laptop = TestDevice::new(&relay, &bob_keys, "bob-laptop");
    alice.dir.init().await?;
    bob_laptop.dir.init().await?;

    let bob = bob_keys.public_key();
    alice.dir.send_text(bob, "one".to_string()).await?;
    alice.dir.send_text(bob, "two".to_string()).await?;
    assert!(wait_until(1000, || bob_laptop.contents() == vec!["one", "two"]).await);

    let bob_phone = TestDevice::new(&relay, &bob_keys, "bob-phone");
    bob_phone.dir.init().await?;

    assert!(wait_until(1000, || bob_phone.contents() == vec!["one", "two"]).await);
    let replayed = bob_phone.received.lock().unwrap().clone();
    assert!(replayed.iter().all(|(_, from)| *from == alice.pubkey()));
    assert!(wait_until(1000, || alice.dir.get_peer_devices(&bob) == vec!["bob-laptop", "bob-phone"]).await);

    // Devices already known are not sent the history again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob_laptop.contents(), vec!["one", "two"]);
    Ok(())
}
