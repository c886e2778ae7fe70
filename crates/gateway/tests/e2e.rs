//! End-to-end: real hub, gateway and node agents over sockets.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{client, eth, hexutil, CommandKind, Role, WireMessage};
use gateway::{router, GatewayConfig, GatewayState};
use hub::{Hub, HubConfig};
use node::{EngineKind, NodeAgent, NodeConfig};

async fn start_hub() -> (Arc<Hub>, String) {
    let hub = Arc::new(Hub::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = hub::router(hub.clone(), HubConfig::default());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (hub, format!("ws://{}/ws", addr))
}

async fn start_gateway(hub_url: &str, config: GatewayConfig) -> String {
    let hello = WireMessage::hello(config.session.clone(), config.party.clone(), Role::Gateway);
    let (sender, inbound, _closer) = client::connect(hub_url, hello).await.unwrap().into_parts();
    let (state, _pump) = GatewayState::new(config, sender, inbound);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn wait_for_members(hub: &Hub, count: usize) {
    for _ in 0..300 {
        let members = hub
            .snapshot()
            .await
            .iter()
            .find(|s| s.session == common::DEFAULT_SESSION)
            .map(|s| s.members.len())
            .unwrap_or(0);
        if members == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never reached {count} members");
}

struct RunningNode {
    agent: NodeAgent,
    shutdown: CancellationToken,
    closer: CancellationToken,
}

impl RunningNode {
    async fn start(hub_url: &str, party: &str, dir: &Path, sign_timeout: Duration) -> Self {
        let mut config = NodeConfig::new(party, dir);
        config.sign_timeout = sign_timeout;
        let hello = WireMessage::hello(config.session.clone(), party, Role::Node);
        let (sender, inbound, closer) = client::connect(hub_url, hello).await.unwrap().into_parts();

        let agent = NodeAgent::new(config, EngineKind::Simulated.build(), sender);
        let shutdown = CancellationToken::new();
        let runner = agent.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = runner.run(inbound, token).await;
        });
        Self {
            agent,
            shutdown,
            closer,
        }
    }

    fn stop(&self) {
        self.shutdown.cancel();
        self.closer.cancel();
    }

    async fn wait_idle(&self) {
        for _ in 0..500 {
            if !self.agent.status().await.busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never returned to idle", self.agent.config().party);
    }
}

struct Cluster {
    hub: Arc<Hub>,
    hub_url: String,
    gateway: String,
    http: reqwest::Client,
    nodes: Vec<RunningNode>,
    dirs: Vec<TempDir>,
}

const PARTIES: [&str; 3] = ["P1", "P2", "P3"];

impl Cluster {
    async fn start(gateway_config: GatewayConfig, node_sign_timeout: Duration) -> Self {
        let (hub, hub_url) = start_hub().await;
        let dirs: Vec<TempDir> = PARTIES.iter().map(|_| tempfile::tempdir().unwrap()).collect();
        let mut nodes = Vec::new();
        for (party, dir) in PARTIES.iter().zip(&dirs) {
            nodes.push(RunningNode::start(&hub_url, party, dir.path(), node_sign_timeout).await);
        }
        let gateway = start_gateway(&hub_url, gateway_config).await;
        wait_for_members(&hub, PARTIES.len() + 1).await;
        Self {
            hub,
            hub_url,
            gateway,
            http: reqwest::Client::new(),
            nodes,
            dirs,
        }
    }

    async fn post(&self, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = self.http.post(format!("{}{}", self.gateway, path));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn keygen(&self) -> String {
        let (status, body) = self.post("/keygen", None).await;
        assert_eq!(status, StatusCode::OK, "keygen failed: {body}");
        body["address"].as_str().unwrap().to_string()
    }

    async fn sign(&self, digest: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
        let (status, body) = self
            .post("/signHash", Some(json!({"hash_hex": hex::encode(digest)})))
            .await;
        assert_eq!(status, StatusCode::OK, "signing failed: {body}");
        let r = hexutil::decode_left_padded32("r", body["r"].as_str().unwrap()).unwrap();
        let s = hexutil::decode_left_padded32("s", body["s"].as_str().unwrap()).unwrap();
        (r, s)
    }
}

#[tokio::test]
async fn test_keygen_then_sign_verifies_against_address() {
    let cluster = Cluster::start(GatewayConfig::default(), Duration::from_secs(30)).await;

    let (status, body) = cluster.post("/keygen", None).await;
    assert_eq!(status, StatusCode::OK, "keygen failed: {body}");
    assert_eq!(body["ok"], true);
    assert_eq!(body["threshold"], 1);
    assert_eq!(body["parties"], json!(["P1", "P2", "P3"]));
    let address = body["address"].as_str().unwrap().to_string();
    assert!(address.starts_with("0x") && address.len() == 42);
    assert_eq!(
        eth::address_from_public_key_hex(body["pubkey"].as_str().unwrap()).unwrap(),
        address
    );

    let identity: Value = cluster
        .http
        .get(format!("{}/address", cluster.gateway))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(identity["address"], address.as_str());

    let digest = eth::keccak256(b"hello cluster");
    let (r, s) = cluster.sign(&digest).await;
    assert!(eth::verify_prehash_address(&address, &digest, &r, &s).unwrap());

    // Every node wrote a share for the same address.
    for node in &cluster.nodes {
        let share = node.agent.store().load().await.unwrap();
        assert_eq!(share.address, address);
        assert_eq!(share.parties, vec!["P1", "P2", "P3"]);
    }
}

#[tokio::test]
async fn test_rekeygen_replaces_the_share() {
    let cluster = Cluster::start(GatewayConfig::default(), Duration::from_secs(30)).await;
    let digest = eth::keccak256(b"rotate");

    let first = cluster.keygen().await;
    let (r, s) = cluster.sign(&digest).await;
    assert!(eth::verify_prehash_address(&first, &digest, &r, &s).unwrap());

    let second = cluster.keygen().await;
    assert!(!eth::same_address(&first, &second));

    let (r, s) = cluster.sign(&digest).await;
    assert!(eth::verify_prehash_address(&second, &digest, &r, &s).unwrap());
    assert!(!eth::verify_prehash_address(&first, &digest, &r, &s).unwrap());
}

#[tokio::test]
async fn test_bad_hash_is_rejected_before_any_command() {
    let cluster = Cluster::start(GatewayConfig::default(), Duration::from_secs(30)).await;

    let (status, body) = cluster.post("/signHash", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["err"], "missing hash_hex");

    let (status, body) = cluster
        .post("/signHash", Some(json!({"hash_hex": "0xabcd"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["err"], "invalid hash_hex");

    let resp = cluster
        .http
        .post(format!(
            "{}/signHash?hash_hex={}",
            cluster.gateway,
            "11".repeat(33)
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let sessions = cluster.hub.snapshot().await;
    let session = sessions
        .iter()
        .find(|s| s.session == common::DEFAULT_SESSION)
        .unwrap();
    assert_eq!(session.last_command, None);
}

#[tokio::test]
async fn test_sign_timeout_then_nodes_recover() {
    let config = GatewayConfig {
        sign_timeout: Duration::from_millis(300),
        ..GatewayConfig::default()
    };
    let mut cluster = Cluster::start(config, Duration::from_secs(1)).await;
    let address = cluster.keygen().await;

    // Without P3 the remaining nodes wait for its share until their ceiling.
    cluster.nodes[2].stop();
    wait_for_members(&cluster.hub, 3).await;

    let digest = eth::keccak256(b"slow");
    let (status, body) = cluster
        .post("/signHash", Some(json!({"hash_hex": hex::encode(digest)})))
        .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["err"], "timeout");

    cluster.nodes[0].wait_idle().await;
    cluster.nodes[1].wait_idle().await;
    // Let their failure reports pass through the hub before P3 rejoins.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let restarted = RunningNode::start(
        &cluster.hub_url,
        "P3",
        cluster.dirs[2].path(),
        Duration::from_secs(30),
    )
    .await;
    cluster.nodes[2] = restarted;
    wait_for_members(&cluster.hub, 4).await;

    let (r, s) = cluster.sign(&digest).await;
    assert!(eth::verify_prehash_address(&address, &digest, &r, &s).unwrap());
}

/// A scripted participant answering commands with canned results.
async fn fake_party(hub_url: &str, party: &'static str, addr: Option<&'static str>) {
    let hello = WireMessage::hello(common::DEFAULT_SESSION, party, Role::Node);
    let (sender, mut inbound, closer) = client::connect(hub_url, hello).await.unwrap().into_parts();
    tokio::spawn(async move {
        let _closer = closer;
        while let Some(msg) = inbound.recv().await {
            let reply_kind = if msg.is_command(CommandKind::Keygen) {
                CommandKind::KeygenResult
            } else if msg.is_command(CommandKind::Sign) {
                CommandKind::SignResult
            } else {
                continue;
            };
            let Some(addr) = addr else { continue };
            let mut reply = WireMessage::command(common::DEFAULT_SESSION, party, reply_kind)
                .with_parties(vec![common::DEFAULT_GATEWAY_PARTY.into()])
                .with_msg_id(msg.msg_id.clone());
            if reply_kind == CommandKind::KeygenResult {
                reply.ok = true;
                reply.addr_hex = addr.into();
                reply.pubkey_hex = "0x04".into();
            } else {
                reply.err = format!("{} cannot sign", party);
            }
            let _ = sender.send(reply);
        }
    });
}

async fn fake_cluster(
    config: GatewayConfig,
    parties: [(&'static str, Option<&'static str>); 3],
) -> (String, reqwest::Client) {
    let (hub, hub_url) = start_hub().await;
    for (party, addr) in parties {
        fake_party(&hub_url, party, addr).await;
    }
    let gateway = start_gateway(&hub_url, config).await;
    wait_for_members(&hub, 4).await;
    (gateway, reqwest::Client::new())
}

const ADDR_A: &str = "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf";
const ADDR_B: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

#[tokio::test]
async fn test_address_mismatch_names_the_party() {
    let (gateway, http) = fake_cluster(
        GatewayConfig::default(),
        [("P1", Some(ADDR_A)), ("P2", Some(ADDR_A)), ("P3", Some(ADDR_B))],
    )
    .await;

    let resp = http.post(format!("{}/keygen", gateway)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["err"], "address mismatch");
    assert_eq!(body["party"], "P3");
    assert_eq!(body["b"], ADDR_B);

    // Disagreement never becomes the served identity.
    let identity: Value = http
        .get(format!("{}/address", gateway))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(identity["address"], "");
}

#[tokio::test]
async fn test_keygen_timeout_reports_counts() {
    let config = GatewayConfig {
        keygen_timeout: Duration::from_millis(300),
        ..GatewayConfig::default()
    };
    let (gateway, http) = fake_cluster(
        config,
        [("P1", Some(ADDR_A)), ("P2", Some(ADDR_A)), ("P3", None)],
    )
    .await;

    let resp = http.post(format!("{}/keygen", gateway)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert_eq!(body["err"], "timeout");
    assert_eq!(body["received"], 2);
    assert_eq!(body["expected"], 3);
}

#[tokio::test]
async fn test_sign_failure_surfaces_party_error() {
    let (gateway, http) = fake_cluster(
        GatewayConfig::default(),
        [("P1", Some(ADDR_A)), ("P2", Some(ADDR_A)), ("P3", Some(ADDR_A))],
    )
    .await;

    let resp = http
        .post(format!("{}/signHash", gateway))
        .json(&json!({"hash_hex": "22".repeat(32)}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert!(body["err"].as_str().unwrap().ends_with("cannot sign"));
    assert!(["P1", "P2", "P3"].contains(&body["party"].as_str().unwrap()));
}
