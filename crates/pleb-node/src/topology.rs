//! Node topologies: wiring identity, network, topic, chat and discovery into
//! the runnable modes.
//!
//! Every mode follows the same shape: build the network, spawn its tasks into
//! one `JoinSet`, then `supervise` until Ctrl-C or a fatal task error.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use libp2p::PeerId;
use pleb_core::constants::{CANNED_PAYLOAD, DISCOVERY_INTERVAL, PUBLISH_INTERVAL};
use pleb_core::{Capabilities, ListenDescriptor, PeerRecord, TransportKind};
use pleb_crypto::NodeIdentity;
use pleb_p2p::topic::{consume, run_interactive_publish, run_periodic_publish};
use pleb_p2p::{
    open_chat, serve_chat, NetworkHandle, P2pConfig, P2pError, P2pHandle, P2pNetwork,
    RendezvousLoop, Subscription, TopicHandle,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{Args, Mode, NodeArgs};
use crate::console;

/// How long tasks get to wind down after cancellation before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub type Tasks = JoinSet<anyhow::Result<()>>;

/// Publish and discovery periods. Tests shorten them.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub publish_every: Duration,
    pub discover_every: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            publish_every: PUBLISH_INTERVAL,
            discover_every: DISCOVERY_INTERVAL,
        }
    }
}

/// Run the mode selected on the command line until `cancel` fires or a task
/// fails.
pub async fn run(
    args: Args,
    identity: NodeIdentity,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let timing = Timing::default();
    match args.mode {
        Mode::Pubsub { topic } => run_pubsub(&args.node, identity, &topic, timing, cancel).await,
        Mode::Console { topic } => run_console(&args.node, identity, &topic, timing, cancel).await,
        Mode::Chat => run_chat(&args.node, identity, timing, cancel).await,
        Mode::Bootstrap {
            namespace,
            satellites,
            topic,
        } => {
            let plan = BootstrapPlan {
                namespace,
                satellites,
                topic,
            };
            run_bootstrap(&args.node, identity, &plan, timing, cancel).await
        }
    }
}

/// Single pubsub peer: canned payload every interval, print the topic.
pub async fn run_pubsub(
    node: &NodeArgs,
    identity: NodeIdentity,
    topic: &str,
    timing: Timing,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut tasks = Tasks::new();
    let handle = start_network(&node.p2p_config(true), &identity, &cancel, &mut tasks)?;
    announce(&handle).await?;
    spawn_rendezvous(node, &handle, timing, &cancel, &mut tasks);

    let topic = join_topic(&handle, topic).await?;
    spawn_consumer(&mut tasks, topic.subscribe(cancel.clone()).await?);
    spawn_periodic(&mut tasks, topic, CANNED_PAYLOAD.as_bytes().to_vec(), timing, &cancel);

    supervise(tasks, cancel).await
}

/// Interactive console peer: each stdin line is published verbatim.
pub async fn run_console(
    node: &NodeArgs,
    identity: NodeIdentity,
    topic: &str,
    timing: Timing,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut tasks = Tasks::new();
    let handle = start_network(&node.p2p_config(true), &identity, &cancel, &mut tasks)?;
    announce(&handle).await?;
    spawn_rendezvous(node, &handle, timing, &cancel, &mut tasks);

    let topic = join_topic(&handle, topic).await?;
    spawn_consumer(&mut tasks, topic.subscribe(cancel.clone()).await?);

    let input = console::spawn_stdin(cancel.clone());
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            run_interactive_publish(&topic, input, cancel).await;
            Ok(())
        });
    }

    supervise(tasks, cancel).await
}

/// Chat peer. Without `--peer` it listens; with it, it opens one chat.
pub async fn run_chat(
    node: &NodeArgs,
    identity: NodeIdentity,
    timing: Timing,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut tasks = Tasks::new();
    let handle = start_network(&node.p2p_config(false), &identity, &cancel, &mut tasks)?;
    spawn_rendezvous(node, &handle, timing, &cancel, &mut tasks);
    let input = console::spawn_stdin(cancel.clone());

    match &node.peer {
        Some(peer) => {
            let record = PeerRecord::parse(peer).context("parsing --peer")?;
            let chat = open_chat(&handle, &record, input, stdout_pair(), cancel.clone())
                .await
                .with_context(|| format!("opening chat with {}", record.peer_id))?;
            tasks.spawn(async move {
                chat.wait().await;
                Ok(())
            });
        }
        None => {
            announce(&handle).await?;
            info!("waiting for incoming connection");
            let cancel = cancel.clone();
            tasks.spawn(async move {
                serve_chat(&handle, input, stdout_pair, cancel)
                    .await
                    .context("serving chat")
            });
        }
    }

    supervise(tasks, cancel).await
}

#[derive(Debug, Clone)]
pub struct BootstrapPlan {
    pub namespace: String,
    pub satellites: usize,
    pub topic: String,
}

/// Bootstrap node plus `plan.satellites` in-process pubsub peers.
///
/// The bootstrap node only advertises and discovers; it never joins the
/// topic. Each satellite dials it, runs discovery under the same namespace
/// and publishes a payload naming itself.
pub async fn run_bootstrap(
    node: &NodeArgs,
    identity: NodeIdentity,
    plan: &BootstrapPlan,
    timing: Timing,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut tasks = Tasks::new();
    let config = node.p2p_config(false).with_capabilities(Capabilities::all());
    let bootstrap = start_network(&config, &identity, &cancel, &mut tasks)?;
    let listen = announce(&bootstrap).await?;
    let target = bootstrap_target(&listen, &bootstrap.local_peer_id())
        .context("bootstrap node has no IPv4 listen address")?;
    spawn_discovery(&plan.namespace, &bootstrap, timing, &cancel, &mut tasks);

    let ip = node.listen_ip.unwrap_or(IpAddr::from([0, 0, 0, 0]));
    for n in 0..plan.satellites {
        let sat_identity = NodeIdentity::generate();
        let sat_config = P2pConfig::listening_on(ip, 0)
            .with_capabilities(Capabilities::all())
            .with_explicit_peer(target.clone());
        let sat = start_network(&sat_config, &sat_identity, &cancel, &mut tasks)
            .with_context(|| format!("starting satellite {n}"))?;
        info!(satellite = n, peer = %sat.local_peer_id(), "satellite started");
        spawn_discovery(&plan.namespace, &sat, timing, &cancel, &mut tasks);

        let topic = join_topic(&sat, &plan.topic).await?;
        spawn_consumer(&mut tasks, topic.subscribe(cancel.clone()).await?);
        let payload = format!("{CANNED_PAYLOAD} {}", sat.local_peer_id()).into_bytes();
        spawn_periodic(&mut tasks, topic, payload, timing, &cancel);
    }

    supervise(tasks, cancel).await
}

/// Build the network and spawn its event loop into `tasks`.
pub fn start_network(
    config: &P2pConfig,
    identity: &NodeIdentity,
    cancel: &CancellationToken,
    tasks: &mut Tasks,
) -> anyhow::Result<P2pHandle> {
    let (network, handle) = P2pNetwork::new(config, identity).context("building P2P network")?;
    let cancel = cancel.clone();
    tasks.spawn(async move {
        network.run(cancel).await;
        Ok(())
    });
    Ok(handle)
}

/// Print listen addresses, the peer id and a `--peer` hint per IPv4 address.
pub async fn announce<N: NetworkHandle>(network: &N) -> anyhow::Result<ListenDescriptor> {
    let listen = network
        .listen_addresses()
        .await
        .context("reading listen addresses")?;
    let peer_id = network.local_peer_id();

    for addr in &listen.addresses {
        println!("{}", addr.addr);
    }
    println!("{peer_id}");
    for hint in listen.dial_hints(&peer_id) {
        println!("\nrun '--peer {hint}' in another terminal to connect to this peer\n");
    }
    Ok(listen)
}

/// The address satellites use to reach the bootstrap node: a loopback TCP
/// hint when there is one, otherwise the first IPv4 hint.
pub fn bootstrap_target(listen: &ListenDescriptor, peer_id: &PeerId) -> Option<String> {
    let hints = listen.dial_hints(peer_id);
    let loopback_tcp = listen
        .addresses
        .iter()
        .filter(|a| a.transport == TransportKind::Tcp)
        .find(|a| a.addr.to_string().starts_with("/ip4/127."))
        .map(|a| format!("{}/p2p/{}", a.addr, peer_id));
    loopback_tcp.or_else(|| hints.into_iter().next())
}

/// Wait for cancellation or the first failed task, then cancel everything
/// and give the rest a grace period to stop.
pub async fn supervise(mut tasks: Tasks, cancel: CancellationToken) -> anyhow::Result<()> {
    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            joined = tasks.join_next() => match joined {
                None => break Ok(()),
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => break Err(e),
                Some(Err(e)) if e.is_cancelled() => {}
                Some(Err(e)) => break Err(anyhow::anyhow!("task panicked: {e}")),
            },
        }
    };

    cancel.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = tasks.len(), "tasks did not stop in time; aborting");
        tasks.shutdown().await;
    }
    outcome
}

async fn join_topic(handle: &P2pHandle, name: &str) -> anyhow::Result<TopicHandle<P2pHandle>> {
    TopicHandle::join(Arc::new(handle.clone()), name)
        .await
        .with_context(|| format!("joining topic {name}"))
}

fn spawn_consumer(tasks: &mut Tasks, mut sub: Subscription) {
    tasks.spawn(async move {
        let mut out = tokio::io::stdout();
        match consume(&mut sub, &mut out).await {
            P2pError::Cancelled => Ok(()),
            e => Err(anyhow::Error::new(e).context(format!("reading topic {}", sub.topic()))),
        }
    });
}

fn spawn_periodic(
    tasks: &mut Tasks,
    topic: TopicHandle<P2pHandle>,
    payload: Vec<u8>,
    timing: Timing,
    cancel: &CancellationToken,
) {
    let cancel = cancel.clone();
    tasks.spawn(async move {
        run_periodic_publish(&topic, payload, timing.publish_every, cancel).await;
        Ok(())
    });
}

fn spawn_rendezvous(
    node: &NodeArgs,
    handle: &P2pHandle,
    timing: Timing,
    cancel: &CancellationToken,
    tasks: &mut Tasks,
) {
    if let Some(namespace) = &node.rendezvous {
        spawn_discovery(namespace, handle, timing, cancel, tasks);
    }
}

fn spawn_discovery(
    namespace: &str,
    handle: &P2pHandle,
    timing: Timing,
    cancel: &CancellationToken,
    tasks: &mut Tasks,
) {
    let rendezvous = RendezvousLoop::new(namespace).with_interval(timing.discover_every);
    let handle = handle.clone();
    let cancel = cancel.clone();
    tasks.spawn(async move {
        rendezvous.run(&handle, &handle, cancel).await;
        Ok(())
    });
}

fn stdout_pair() -> (tokio::io::Stdout, tokio::io::Stdout) {
    (tokio::io::stdout(), tokio::io::stdout())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "12D3KooWDDnkUmiUsQXTsRz7R3e66A4B5WGr5qg4ApeEmxrmkDB8";

    #[test]
    fn bootstrap_target_prefers_loopback_tcp() {
        let listen = ListenDescriptor::new([
            "/ip4/192.168.1.5/udp/4001/quic-v1".parse().unwrap(),
            "/ip6/::1/tcp/4001".parse().unwrap(),
            "/ip4/127.0.0.1/tcp/4001".parse().unwrap(),
        ]);
        let peer = PEER.parse().unwrap();
        assert_eq!(
            bootstrap_target(&listen, &peer).unwrap(),
            format!("/ip4/127.0.0.1/tcp/4001/p2p/{PEER}")
        );
    }

    #[test]
    fn bootstrap_target_falls_back_to_first_ipv4() {
        let listen = ListenDescriptor::new(["/ip4/10.0.0.2/udp/9/quic-v1".parse().unwrap()]);
        let peer = PEER.parse().unwrap();
        assert_eq!(
            bootstrap_target(&listen, &peer).unwrap(),
            format!("/ip4/10.0.0.2/udp/9/quic-v1/p2p/{PEER}")
        );
        assert!(bootstrap_target(&ListenDescriptor::default(), &peer).is_none());
    }

    #[tokio::test]
    async fn supervise_returns_first_fatal_error_and_cancels() {
        let cancel = CancellationToken::new();
        let mut tasks = Tasks::new();
        {
            let cancel = cancel.clone();
            tasks.spawn(async move {
                cancel.cancelled().await;
                Ok(())
            });
        }
        tasks.spawn(async { Err(anyhow::anyhow!("subscription closed")) });

        let err = supervise(tasks, cancel.clone()).await.unwrap_err();
        assert!(err.to_string().contains("subscription closed"));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn supervise_is_clean_on_cancel() {
        let cancel = CancellationToken::new();
        let mut tasks = Tasks::new();
        {
            let cancel = cancel.clone();
            tasks.spawn(async move {
                cancel.cancelled().await;
                Ok(())
            });
        }
        cancel.cancel();
        supervise(tasks, cancel).await.unwrap();
    }
}
