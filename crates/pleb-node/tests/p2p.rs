//! P2P integration tests over real libp2p on loopback.
//!
//! Starts two in-process nodes:
//!   Node A: listens, no peers
//!   Node B: names A as an explicit peer
//!
//! Verifies gossip delivery from A to B and a chat line from B to A. A third
//! test runs a bootstrap node and three satellites through DHT rendezvous.
//!
//! Run with:
//!   cargo test -p pleb-node --test p2p

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pleb_core::PeerRecord;
use pleb_crypto::NodeIdentity;
use libp2p::PeerId;
use pleb_node::topology::{bootstrap_target, start_network, Tasks};
use pleb_p2p::chat::render_line;
use pleb_p2p::{
    open_chat, serve_chat, Discovery, NetworkHandle, P2pConfig, P2pHandle, RendezvousLoop,
    TopicHandle,
};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const DEADLINE: Duration = Duration::from_secs(30);

fn loopback_config() -> P2pConfig {
    P2pConfig {
        listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".into()],
        ..P2pConfig::default()
    }
}

/// Start A, then B with A as explicit peer. Returns `(a, b, a's dial string)`.
async fn two_nodes(
    cancel: &CancellationToken,
    tasks: &mut Tasks,
) -> (P2pHandle, P2pHandle, String) {
    let a_identity = NodeIdentity::from_seed(&[1u8; 32]).unwrap();
    let a = start_network(&loopback_config(), &a_identity, cancel, tasks).unwrap();
    let listen = timeout(DEADLINE, a.listen_addresses()).await.unwrap().unwrap();
    let a_addr = listen
        .dial_hints(&a.local_peer_id())
        .into_iter()
        .next()
        .expect("A has an IPv4 listen address");

    let b_config = loopback_config().with_explicit_peer(a_addr.clone());
    let b_identity = NodeIdentity::from_seed(&[2u8; 32]).unwrap();
    let b = start_network(&b_config, &b_identity, cancel, tasks).unwrap();
    (a, b, a_addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gossip_message_reaches_explicit_peer() {
    let cancel = CancellationToken::new();
    let mut tasks = Tasks::new();
    let (a, b, _) = two_nodes(&cancel, &mut tasks).await;

    let topic_a = TopicHandle::join(Arc::new(a.clone()), "demo").await.unwrap();
    let topic_b = TopicHandle::join(Arc::new(b.clone()), "demo").await.unwrap();
    let mut sub = topic_b.subscribe(cancel.clone()).await.unwrap();

    // Publishing fails until the peers have exchanged subscriptions.
    let msg = timeout(DEADLINE, async {
        loop {
            let _ = topic_a.publish("hello from libp2p go").await;
            if let Ok(Ok(msg)) = timeout(Duration::from_secs(1), sub.next()).await {
                break msg;
            }
        }
    })
    .await
    .expect("no gossip message within deadline");

    assert_eq!(msg.sender(), a.local_peer_id());
    assert_eq!(msg.text(), "hello from libp2p go");
    assert!(b.connectedness(a.local_peer_id()).await.unwrap().is_connected());

    cancel.cancel();
    while tasks.join_next().await.is_some() {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_line_reaches_listener() {
    let cancel = CancellationToken::new();
    let mut tasks = Tasks::new();
    let (a, b, a_addr) = two_nodes(&cancel, &mut tasks).await;

    // A listens and renders into `screen`.
    let (render, mut screen) = tokio::io::duplex(4096);
    let render = std::sync::Mutex::new(Some(render));
    let (_a_console, a_input) = broadcast::channel::<String>(8);
    {
        let cancel = cancel.clone();
        let a = a.clone();
        tasks.spawn(async move {
            let make = move || {
                let out = render.lock().unwrap().take().expect("one chat stream");
                (out, tokio::io::sink())
            };
            serve_chat(&a, a_input, make, cancel).await?;
            Ok(())
        });
    }

    // B opens the chat and types a line. Opening fails until A accepts.
    let (b_console, _) = broadcast::channel::<String>(8);
    let record = PeerRecord::parse(&a_addr).unwrap();
    let chat = timeout(DEADLINE, async {
        loop {
            let output = (tokio::io::sink(), tokio::io::sink());
            match open_chat(&b, &record, b_console.subscribe(), output, cancel.clone()).await {
                Ok(chat) => break chat,
                Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        }
    })
    .await
    .expect("chat stream not opened within deadline");
    b_console.send("ping\n".to_string()).unwrap();

    let expected = render_line("ping");
    let mut buf = vec![0u8; expected.len()];
    timeout(DEADLINE, screen.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(String::from_utf8(buf).unwrap(), expected);

    cancel.cancel();
    chat.wait().await;
    while tasks.join_next().await.is_some() {}
}

/// True once every node has an open connection to every other node.
async fn full_mesh(nodes: &[P2pHandle]) -> bool {
    for node in nodes {
        let connected: HashSet<PeerId> =
            node.connected_peers().await.unwrap().into_iter().collect();
        let missing = nodes
            .iter()
            .map(|n| n.local_peer_id())
            .filter(|p| *p != node.local_peer_id())
            .any(|p| !connected.contains(&p));
        if missing {
            return false;
        }
    }
    true
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn satellites_find_each_other_through_the_dht() {
    let cancel = CancellationToken::new();
    let mut tasks = Tasks::new();

    let boot_identity = NodeIdentity::from_seed(&[9u8; 32]).unwrap();
    let boot = start_network(&loopback_config(), &boot_identity, &cancel, &mut tasks).unwrap();
    let listen = timeout(DEADLINE, boot.listen_addresses()).await.unwrap().unwrap();
    let target = bootstrap_target(&listen, &boot.local_peer_id()).expect("loopback TCP address");

    // Satellites only know the bootstrap node.
    let mut nodes = vec![boot];
    for seed in 10u8..13 {
        let identity = NodeIdentity::from_seed(&[seed; 32]).unwrap();
        let config = loopback_config().with_explicit_peer(target.clone());
        nodes.push(start_network(&config, &identity, &cancel, &mut tasks).unwrap());
    }
    for node in &nodes {
        let node = node.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            RendezvousLoop::new("plebbit")
                .with_interval(Duration::from_secs(2))
                .run(&node, &node, cancel)
                .await;
            Ok(())
        });
    }

    timeout(DEADLINE, async {
        while !full_mesh(&nodes).await {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await
    .expect("no full mesh within deadline");

    // Provider lookups resolve every other satellite to dialable addresses.
    let satellite = &nodes[1];
    let wanted: Vec<PeerId> = nodes[2..].iter().map(|n| n.local_peer_id()).collect();
    let records = timeout(DEADLINE, async {
        loop {
            if let Ok(records) = satellite.find_peers("plebbit").await {
                let resolved = wanted.iter().all(|peer| {
                    records
                        .iter()
                        .any(|r| r.peer_id == *peer && r.has_addresses())
                });
                if resolved {
                    break records;
                }
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await
    .expect("provider records never resolved");
    assert!(records.len() >= wanted.len());

    cancel.cancel();
    while tasks.join_next().await.is_some() {}
}
