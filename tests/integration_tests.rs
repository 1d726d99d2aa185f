//! Integration tests for the lock-step session
//!
//! These tests run real coordinators and followers over loopback UDP.

use leader::network::Coordinator;
use peer::ai::ScriptedAi;
use peer::network::{Follower, FollowerStatus, PeerOptions};
use peer::relay::decision_channels;
use shared::net::{recv_until, send_message, MAX_DATAGRAM};
use shared::wire::{self, Message, MessageKind};
use shared::{Direction, Pid, SessionConfig};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;

fn quick_config() -> SessionConfig {
    SessionConfig {
        follower_response_time: Duration::from_millis(200),
        min_game_speed: Duration::from_millis(10),
        lobby_timeout: Duration::from_millis(500),
        collision_is_death: false,
        disable_game_over: true,
        seed: Some(538),
        ..SessionConfig::default()
    }
}

async fn next_of_kind(socket: &UdpSocket, kind: MessageKind) -> Message {
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    let deadline = Instant::now() + Duration::from_secs(3);

    loop {
        let (len, _) = recv_until(socket, &mut buffer, deadline)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no {} before the deadline", kind.as_str()));
        let message = wire::decode(&buffer[..len]).unwrap();
        if message.kind() == kind {
            return message;
        }
    }
}

async fn join_players(coordinator: SocketAddr, names: &[&str]) -> Vec<UdpSocket> {
    let mut players = Vec::new();
    for name in names {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let join = Message::Join {
            nickname: name.to_string(),
        };
        send_message(&socket, &join, coordinator).await.unwrap();
        players.push(socket);
    }
    players
}

/// LOBBY AND ROUND TESTS
mod coordinator_tests {
    use super::*;

    #[tokio::test]
    async fn lobby_start_sends_each_player_its_game_start() {
        let coordinator = Coordinator::bind("127.0.0.1:0", 40, 40, quick_config())
            .await
            .unwrap();
        let addr = coordinator.local_addr().unwrap();
        let task = tokio::spawn(coordinator.run());

        let players = join_players(addr, &["a", "b", "c"]).await;
        send_message(&players[0], &Message::Start, addr).await.unwrap();

        let mut pids = BTreeSet::new();
        for player in &players {
            match next_of_kind(player, MessageKind::GameStart).await {
                Message::GameStart { round, game_start } => {
                    assert_eq!(round, 1);
                    assert_eq!(game_start.starting_positions.len(), 3);
                    assert_eq!(game_start.nicknames.len(), 3);
                    assert_eq!(
                        game_start.addresses.get(&player.local_addr().unwrap().to_string()),
                        Some(&game_start.pid)
                    );
                    pids.insert(game_start.pid);
                }
                other => panic!("expected gameStart, got {:?}", other),
            }
        }

        assert_eq!(pids, [Pid(1), Pid(2), Pid(3)].into_iter().collect());
        task.abort();
    }

    #[tokio::test]
    async fn straggler_round_still_reports_every_player() {
        let coordinator = Coordinator::bind("127.0.0.1:0", 40, 40, quick_config())
            .await
            .unwrap();
        let addr = coordinator.local_addr().unwrap();
        let task = tokio::spawn(coordinator.run());

        let players = join_players(addr, &["a", "b", "late"]).await;
        send_message(&players[0], &Message::Start, addr).await.unwrap();

        let mut pids = Vec::new();
        for player in &players {
            let message = next_of_kind(player, MessageKind::GameStart).await;
            pids.push(message.player_pid().unwrap());
        }

        let round = match next_of_kind(&players[0], MessageKind::RoundStart).await {
            Message::RoundStart { round } => round,
            other => panic!("expected roundstart, got {:?}", other),
        };
        assert_eq!(round, 2);

        // Only the first two players answer
        for (player, pid) in players.iter().zip(&pids).take(2) {
            let reply = Message::MyMove {
                round,
                pid: *pid,
                direction: Direction::Up,
            };
            send_message(player, &reply, addr).await.unwrap();
        }

        let window = match next_of_kind(&players[2], MessageKind::Moves).await {
            Message::Moves { round: moves_round, moves } => {
                assert_eq!(moves_round, round);
                moves
            }
            other => panic!("expected moves, got {:?}", other),
        };

        assert_eq!(window.len(), quick_config().history_depth());
        let last = window.last().unwrap();
        assert_eq!(last.len(), 3);
        assert_eq!(last[&pids[0]].direction, Direction::Up);
        assert_eq!(last[&pids[1]].direction, Direction::Up);
        task.abort();
    }
}

/// FAILOVER TESTS
mod failover_tests {
    use super::*;

    async fn wait_for<F>(
        status: &mut watch::Receiver<FollowerStatus>,
        limit: Duration,
        check: F,
    ) -> FollowerStatus
    where
        F: Fn(&FollowerStatus) -> bool,
    {
        tokio::time::timeout(limit, async {
            loop {
                {
                    let current = status.borrow_and_update();
                    if check(&current) {
                        return current.clone();
                    }
                }
                status.changed().await.expect("follower stopped");
            }
        })
        .await
        .expect("follower never reached the expected state")
    }

    #[tokio::test]
    async fn followers_elect_a_new_leader_and_keep_playing() {
        let config = quick_config();
        let coordinator = Coordinator::bind("127.0.0.1:0", 40, 40, config.clone())
            .await
            .unwrap();
        let old_leader = coordinator.local_addr().unwrap();
        let leader_task = tokio::spawn(coordinator.run());

        let mut joins = Vec::new();
        for (seed, name) in ["ann", "bob", "cat"].iter().enumerate() {
            let (decider, port) = decision_channels();
            let ai = ScriptedAi::new(40, 40, config.min_game_speed, None, Some(seed as u64));
            tokio::spawn(ai.run(port));

            let options = PeerOptions {
                bind_ip: "127.0.0.1".parse().unwrap(),
                leader_addr: old_leader,
                is_leader: false,
                nickname: name.to_string(),
                width: 40,
                height: 40,
            };
            joins.push(tokio::spawn(Follower::join(options, config.clone(), decider)));
        }

        let mut statuses = Vec::new();
        for join in joins {
            let follower = join.await.unwrap().unwrap();
            statuses.push(follower.subscribe());
            tokio::spawn(follower.run());
        }

        // Let a few rounds go by under the first leader
        wait_for(&mut statuses[0], Duration::from_secs(5), |status| status.round >= 4).await;
        leader_task.abort();

        let mut settled = Vec::new();
        for status in statuses.iter_mut() {
            let taken_over = wait_for(status, Duration::from_secs(5), |status| {
                status.epoch >= 1 && status.leader != old_leader
            })
            .await;

            // Rounds keep coming from the new leader
            let resumed = taken_over.round + 2;
            let later = wait_for(status, Duration::from_secs(5), |status| status.round >= resumed).await;
            assert_ne!(later.leader, old_leader);
            settled.push(later);
        }

        // Everyone follows the same winner in the same epoch, and only it leads
        let winner = &settled[0];
        for status in &settled {
            assert_eq!(status.leader, winner.leader);
            assert_eq!(status.epoch, winner.epoch);
        }
        assert_eq!(settled.iter().filter(|status| status.is_leader).count(), 1);
    }
}
