//! Built-in decider that plays without an external engine.
//!
//! It keeps its own picture of the grid from the events it is sent, tries its
//! directions in a preferred order and takes the first one that does not run
//! into a wall or a trail. The preference order is reshuffled every
//! [`RESHUFFLE_EVERY`] rounds.

use crate::relay::{Decision, DecisionEvent, DecisionPort};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use shared::{Direction, Grid, Pid, Position, SessionError, Snapshot};
use std::time::Duration;

pub const RESHUFFLE_EVERY: u64 = 30;

pub struct ScriptedAi {
    pid: Option<Pid>,
    grid: Grid,
    positions: Snapshot,
    order: [Direction; 4],
    rng: StdRng,
    min_game_speed: Duration,
    /// Set for the leader-elect: how long to let others join before `Start`.
    start_delay: Option<Duration>,
}

impl ScriptedAi {
    pub fn new(
        width: i32,
        height: i32,
        min_game_speed: Duration,
        start_delay: Option<Duration>,
        seed: Option<u64>,
    ) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut order = Direction::ALL;
        order.shuffle(&mut rng);

        Self {
            pid: None,
            grid: Grid::new(width, height),
            positions: Snapshot::new(),
            order,
            rng,
            min_game_speed,
            start_delay,
        }
    }

    pub async fn run(mut self, mut port: DecisionPort) -> Result<(), SessionError> {
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
            info!(target: "client", "AI is starting the game");
            port.decide(Decision::Start).await?;
        }

        while let Some(event) = port.events.recv().await {
            match event {
                DecisionEvent::GameStart { game_start, .. } => {
                    self.pid = Some(game_start.pid);
                    self.learn(&game_start.starting_positions);
                }
                DecisionEvent::RoundStart { round } => {
                    tokio::time::sleep(self.min_game_speed).await;
                    if round % RESHUFFLE_EVERY == 0 {
                        self.order.shuffle(&mut self.rng);
                    }
                    let direction = self.choose();
                    debug!(target: "client", "AI picked {:?} for round {}", direction, round);
                    port.decide(Decision::Move(direction)).await?;
                }
                DecisionEvent::Moves { moves, .. } => {
                    for snapshot in &moves {
                        self.learn(snapshot);
                    }
                }
                DecisionEvent::GameOver { .. } => break,
            }
        }

        Ok(())
    }

    fn learn(&mut self, snapshot: &Snapshot) {
        for (pid, position) in snapshot {
            self.grid.occupy(position, *pid);
            self.positions.insert(*pid, *position);
        }
    }

    fn current(&self) -> Option<&Position> {
        self.pid.and_then(|pid| self.positions.get(&pid))
    }

    /// First direction in preference order whose step lands on a free cell.
    pub fn choose(&mut self) -> Direction {
        if let Some(here) = self.current().copied() {
            let free = self.order.iter().copied().find(|direction| {
                let next = here.step(*direction, self.grid.width(), self.grid.height());
                (next.x, next.y) != (here.x, here.y) && !self.grid.is_blocked(next.x, next.y)
            });
            if let Some(direction) = free {
                return direction;
            }
        }

        Direction::ALL[self.rng.gen_range(0..Direction::ALL.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::decision_channels;
    use shared::GameStart;
    use std::collections::BTreeMap;

    fn game_start(pid: Pid, at: Position) -> GameStart {
        let mut starting_positions = BTreeMap::new();
        starting_positions.insert(pid, at);
        GameStart {
            pid,
            starting_positions,
            nicknames: BTreeMap::new(),
            addresses: BTreeMap::new(),
        }
    }

    #[test]
    fn test_avoids_blocked_cells() {
        let mut ai = ScriptedAi::new(30, 30, Duration::ZERO, None, Some(3));
        ai.pid = Some(Pid(1));
        ai.order = [Direction::Left, Direction::Up, Direction::Right, Direction::Down];

        // Wall on the left of (1, 10)
        let mut snapshot = Snapshot::new();
        snapshot.insert(Pid(1), Position::new(1, 10, Direction::Left));
        ai.learn(&snapshot);
        assert_eq!(ai.choose(), Direction::Up);

        // Someone else's trail above
        let mut other = Snapshot::new();
        other.insert(Pid(2), Position::new(1, 11, Direction::Right));
        ai.learn(&other);
        assert_eq!(ai.choose(), Direction::Right);
    }

    #[tokio::test]
    async fn test_answers_each_round() {
        let ai = ScriptedAi::new(30, 30, Duration::ZERO, None, Some(9));
        let (mut decider, port) = decision_channels();
        let task = tokio::spawn(ai.run(port));

        decider
            .notify(DecisionEvent::GameStart {
                round: 1,
                game_start: game_start(Pid(1), Position::new(15, 15, Direction::Up)),
            })
            .await
            .unwrap();

        for round in 2..5 {
            decider
                .notify(DecisionEvent::RoundStart { round })
                .await
                .unwrap();
            assert!(matches!(
                decider.next_decision().await.unwrap(),
                Decision::Move(_)
            ));
        }

        decider
            .notify(DecisionEvent::GameOver {
                round: 5,
                finish: vec![Pid(1)],
            })
            .await
            .unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_leader_elect_sends_start() {
        let ai = ScriptedAi::new(30, 30, Duration::ZERO, Some(Duration::from_millis(10)), None);
        let (mut decider, port) = decision_channels();
        tokio::spawn(ai.run(port));

        assert_eq!(decider.next_decision().await.unwrap(), Decision::Start);
    }
}
