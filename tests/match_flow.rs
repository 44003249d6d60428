//! End-to-end match scenarios over real TCP sockets.
//!
//! Each test stands up a full server with its own log directory, connects
//! scripted peers, and drives the wire protocol the way an AI client would.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use curling_server::config::Config;
use curling_server::logging::{self, LogSink};
use curling_server::network;

fn free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn test_config(port0: u16, port1: u16, tweak: impl FnOnce(&mut Value)) -> Config {
    let identity = json!({ "type": "identity" });
    let mut value = json!({
        "server": {
            "port": { "team0": port0, "team1": port1 },
            "timeout_dc_ok": 5000,
            "send_trajectory": true,
            "steps_per_trajectory_frame": 10
        },
        "game": {
            "rule": "normal",
            "setting": {
                "max_end": 1,
                "five_rock_rule": true,
                "thinking_time": { "team0": 600000, "team1": 600000 }
            },
            "simulator": { "type": "friction" },
            "players": {
                "team0": [identity.clone(), identity.clone(), identity.clone(), identity.clone()],
                "team1": [identity.clone(), identity.clone(), identity.clone(), identity]
            }
        }
    });
    tweak(&mut value);
    serde_json::from_value(value).unwrap()
}

struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    log_dir: PathBuf,
    match_dir: PathBuf,
}

fn start_server(config: Config) -> TestServer {
    let log_dir =
        std::env::temp_dir().join(format!("curling-server-e2e-{}", uuid::Uuid::new_v4()));
    let launch_time = logging::now_local();
    let game_id = uuid::Uuid::new_v4().to_string();
    let match_dir_name = format!("{}_{}", logging::iso8601_basic(launch_time), game_id);
    let match_dir = log_dir.join(&match_dir_name);

    let log = Arc::new(LogSink::new(&log_dir, &match_dir_name, false, false).unwrap());
    let date_time = logging::iso8601_extended(launch_time);

    let handle = tokio::spawn(async move {
        network::start(config, log, date_time, game_id).await.unwrap();
    });

    TestServer {
        handle,
        log_dir,
        match_dir,
    }
}

struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn connect(port: u16) -> Peer {
        for _ in 0..500 {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
                let (read, write) = stream.into_split();
                return Peer {
                    reader: BufReader::new(read),
                    writer: write,
                };
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("could not connect to port {port}");
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(30), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a message")
            .unwrap();
        assert!(n > 0, "server closed the connection unexpectedly");
        serde_json::from_str(line.trim_end()).expect("server sent invalid JSON")
    }

    /// True when the server has closed this connection.
    async fn recv_eof(&mut self) -> bool {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(30), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        n == 0
    }

    async fn send(&mut self, value: &Value) {
        self.writer
            .write_all(format!("{value}\n").as_bytes())
            .await
            .unwrap();
    }
}

async fn handshake(peer: &mut Peer, team: u64, name: &str) -> Value {
    let dc = peer.recv().await;
    assert_eq!(dc["cmd"], "dc");
    assert_eq!(dc["version"]["major"], 2);
    assert_eq!(dc["version"]["minor"], 0);
    assert!(dc["game_id"].is_string());
    assert!(dc["date_time"].is_string());

    peer.send(&json!({ "cmd": "dc_ok", "name": name })).await;

    let is_ready = peer.recv().await;
    assert_eq!(is_ready["cmd"], "is_ready");
    assert_eq!(is_ready["team"], team);
    is_ready
}

async fn send_ready(peer: &mut Peer) {
    peer.send(&json!({ "cmd": "ready_ok", "player_order": [0, 1, 2, 3] }))
        .await;
}

fn draw_shot() -> Value {
    json!({
        "cmd": "move",
        "move": {
            "type": "shot",
            "velocity": { "x": 0.0, "y": 2.51 },
            "rotation": "ccw"
        }
    })
}

fn short_shot() -> Value {
    json!({
        "cmd": "move",
        "move": {
            "type": "shot",
            "velocity": { "x": 0.0, "y": 0.5 },
            "rotation": "cw"
        }
    })
}

fn read_log_records(path: &PathBuf) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn happy_path_plays_to_game_over() {
    let (port0, port1) = (free_port(), free_port());
    let server = start_server(test_config(port0, port1, |_| {}));

    let mut peer0 = Peer::connect(port0).await;
    let mut peer1 = Peer::connect(port1).await;

    handshake(&mut peer0, 0, "alpha").await;
    handshake(&mut peer1, 1, "beta").await;
    send_ready(&mut peer0).await;
    send_ready(&mut peer1).await;

    let new_game0 = peer0.recv().await;
    assert_eq!(new_game0["cmd"], "new_game");
    assert_eq!(new_game0["name"]["team0"], "alpha");
    assert_eq!(new_game0["name"]["team1"], "beta");
    let new_game1 = peer1.recv().await;
    assert_eq!(new_game1["cmd"], "new_game");

    let mut moves_made = 0u32;
    loop {
        let update0 = peer0.recv().await;
        let update1 = peer1.recv().await;
        assert_eq!(update0["cmd"], "update");
        assert_eq!(update0, update1);

        if moves_made == 0 {
            assert!(update0["last_move"].is_null());
        } else {
            // send_trajectory is on, so the wire copy carries it.
            assert!(update0["last_move"]["trajectory"].is_object());
            assert!(update0["last_move"]["free_guard_zone_foul"].is_boolean());
        }

        if !update0["state"]["game_result"].is_null() {
            assert_eq!(update0["state"]["game_result"]["reason"], "score");
            break;
        }

        assert!(moves_made < 64, "game did not finish");
        let next_team = update0["next_team"].as_u64().unwrap();
        // Team 0 throws away, team 1 draws to the house; team 1 wins on score.
        if next_team == 0 {
            peer0.send(&short_shot()).await;
        } else {
            peer1.send(&draw_shot()).await;
        }
        moves_made += 1;
    }

    assert_eq!(moves_made, 16);

    let game_over0 = peer0.recv().await;
    assert_eq!(game_over0["cmd"], "game_over");
    let game_over1 = peer1.recv().await;
    assert_eq!(game_over1["cmd"], "game_over");

    drop(peer0);
    drop(peer1);
    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("server did not terminate")
        .unwrap();

    // One game log and one sidecar per shot.
    assert!(server.match_dir.join("game.dcl2").exists());
    for shot in 0..16 {
        let name = format!("shot_e000s{shot:02}.json");
        assert!(server.match_dir.join(&name).exists(), "missing {name}");
    }

    let game_records = read_log_records(&server.match_dir.join("game.dcl2"));
    let cmds: Vec<&str> = game_records
        .iter()
        .map(|r| r["log"]["cmd"].as_str().unwrap())
        .collect();
    // Replay preamble order: dc, meta x2, dc_ok x2, is_ready, ready_ok x2,
    // new_game, then updates and moves.
    assert_eq!(
        cmds[..9].to_vec(),
        vec!["dc", "meta", "meta", "dc_ok", "dc_ok", "is_ready", "ready_ok", "ready_ok", "new_game"]
    );
    assert_eq!(*cmds.last().unwrap(), "game_over");

    // The game log never carries trajectories.
    for record in &game_records {
        if record["log"]["cmd"] == "update" && !record["log"]["last_move"].is_null() {
            assert!(record["log"]["last_move"].get("trajectory").is_none());
        }
    }

    std::fs::remove_dir_all(&server.log_dir).unwrap();
}

#[tokio::test]
async fn silent_peer_loses_on_time() {
    let (port0, port1) = (free_port(), free_port());
    let server = start_server(test_config(port0, port1, |value| {
        value["game"]["setting"]["thinking_time"] =
            json!({ "team0": 300, "team1": 300 });
    }));

    let mut peer0 = Peer::connect(port0).await;
    let mut peer1 = Peer::connect(port1).await;
    handshake(&mut peer0, 0, "sleepy").await;
    handshake(&mut peer1, 1, "beta").await;
    send_ready(&mut peer0).await;
    send_ready(&mut peer1).await;
    let _ = peer0.recv().await; // new_game
    let _ = peer1.recv().await;

    let first0 = peer0.recv().await;
    assert_eq!(first0["next_team"], 0);
    let _ = peer1.recv().await;

    // Peer 0 never answers; the server concedes on its behalf.
    let update0 = peer0.recv().await;
    assert_eq!(update0["cmd"], "update");
    assert_eq!(update0["state"]["game_result"]["winner"], 1);
    assert_eq!(update0["state"]["game_result"]["reason"], "time_limit");
    let update1 = peer1.recv().await;
    assert_eq!(update1, update0);

    assert_eq!(peer0.recv().await["cmd"], "game_over");
    assert_eq!(peer1.recv().await["cmd"], "game_over");

    drop(peer0);
    drop(peer1);
    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("server did not terminate")
        .unwrap();
    std::fs::remove_dir_all(&server.log_dir).unwrap();
}

#[tokio::test]
async fn duplicate_player_order_stops_the_server() {
    let (port0, port1) = (free_port(), free_port());
    let server = start_server(test_config(port0, port1, |_| {}));

    let mut peer0 = Peer::connect(port0).await;
    let mut peer1 = Peer::connect(port1).await;
    handshake(&mut peer0, 0, "cheat").await;
    handshake(&mut peer1, 1, "beta").await;

    peer0
        .send(&json!({ "cmd": "ready_ok", "player_order": [0, 0, 1, 2] }))
        .await;

    assert!(peer0.recv_eof().await);
    assert!(peer1.recv_eof().await);

    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("server did not terminate")
        .unwrap();

    // The reason lands in the run-wide log; the barrier never fired, so
    // there is no game log and no sidecars.
    let records = read_log_records(&server.log_dir.join("server.log"));
    assert!(records.iter().any(|r| {
        r["tag"] == "err"
            && r["log"]
                .as_str()
                .is_some_and(|m| m.contains("player_order is overlapping"))
    }));
    assert!(!server.match_dir.join("game.dcl2").exists());

    std::fs::remove_dir_all(&server.log_dir).unwrap();
}

#[tokio::test]
async fn disconnect_mid_turn_stops_the_server() {
    let (port0, port1) = (free_port(), free_port());
    let server = start_server(test_config(port0, port1, |_| {}));

    let mut peer0 = Peer::connect(port0).await;
    let mut peer1 = Peer::connect(port1).await;
    handshake(&mut peer0, 0, "alpha").await;
    handshake(&mut peer1, 1, "quitter").await;
    send_ready(&mut peer0).await;
    send_ready(&mut peer1).await;
    let _ = peer0.recv().await; // new_game
    let _ = peer1.recv().await;

    let update0 = peer0.recv().await;
    assert_eq!(update0["next_team"], 0);
    let _ = peer1.recv().await;
    peer0.send(&short_shot()).await;

    // Now it is peer 1's turn; peer 1 hangs up instead of moving.
    let update0 = peer0.recv().await;
    assert_eq!(update0["next_team"], 1);
    let _ = peer1.recv().await;
    drop(peer1);

    assert!(peer0.recv_eof().await);

    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("server did not terminate")
        .unwrap();

    let records = read_log_records(&server.log_dir.join("server.log"));
    assert!(records.iter().any(|r| {
        r["tag"] == "err"
            && r["log"]
                .as_str()
                .is_some_and(|m| m.contains("disconnected at inappropriate time"))
    }));

    std::fs::remove_dir_all(&server.log_dir).unwrap();
}

#[tokio::test]
async fn is_ready_reflects_config_patch() {
    let (port0, port1) = (free_port(), free_port());
    let server = start_server(test_config(port0, port1, |value| {
        value["game_is_ready_patch"] = json!([
            { "op": "replace", "path": "/setting/max_end", "value": 2 }
        ]);
    }));

    let mut peer0 = Peer::connect(port0).await;
    let is_ready = handshake(&mut peer0, 0, "alpha").await;
    assert_eq!(is_ready["game"]["setting"]["max_end"], 2);

    drop(peer0);
    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("server did not terminate")
        .unwrap();
    std::fs::remove_dir_all(&server.log_dir).unwrap();
}

#[tokio::test]
async fn trajectory_stays_on_disk_when_disabled_on_the_wire() {
    let (port0, port1) = (free_port(), free_port());
    let server = start_server(test_config(port0, port1, |value| {
        value["server"]["send_trajectory"] = json!(false);
    }));

    let mut peer0 = Peer::connect(port0).await;
    let mut peer1 = Peer::connect(port1).await;
    handshake(&mut peer0, 0, "alpha").await;
    handshake(&mut peer1, 1, "beta").await;
    send_ready(&mut peer0).await;
    send_ready(&mut peer1).await;
    let _ = peer0.recv().await; // new_game
    let _ = peer1.recv().await;

    let update0 = peer0.recv().await;
    assert_eq!(update0["next_team"], 0);
    let _ = peer1.recv().await;
    peer0.send(&draw_shot()).await;

    let update0 = peer0.recv().await;
    let update1 = peer1.recv().await;
    assert_eq!(update0, update1);
    assert!(!update0["last_move"].is_null());
    assert!(update0["last_move"]["free_guard_zone_foul"].is_boolean());
    // No trajectory on the wire...
    assert!(update0["last_move"].get("trajectory").is_none());

    // ...but the sidecar has the whole thing.
    let sidecar_path = server.match_dir.join("shot_e000s00.json");
    assert!(sidecar_path.exists());
    let sidecar: Value =
        serde_json::from_str(&std::fs::read_to_string(&sidecar_path).unwrap()).unwrap();
    assert_eq!(sidecar["tag"], "sht");
    assert!(sidecar["log"]["trajectory"]["start"]["team0"].is_array());
    assert!(sidecar["log"]["trajectory"]["finish"]["team1"].is_array());
    assert!(sidecar["log"]["trajectory"]["frames"].is_array());

    drop(peer0);
    drop(peer1);
    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("server did not terminate")
        .unwrap();
    std::fs::remove_dir_all(&server.log_dir).unwrap();
}
