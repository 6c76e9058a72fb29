//! Match Statistics
//!
//! The in-memory results blob built when a match enters STATS. Nothing is
//! persisted; the blob lives until the match is disposed.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::game::state::{CombatStats, Match, Team, UserId};

/// Per-player line on the results screen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSummary {
    /// Account id.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Side.
    pub team: Team,
    /// Character class.
    pub character_class: String,
    /// Health at the end.
    pub final_health: u32,
    /// Still standing at the end.
    pub survived: bool,
    /// Counters.
    pub stats: CombatStats,
}

/// Results blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStats {
    /// Match id.
    pub match_id: String,
    /// Map id.
    pub map_id: String,
    /// Winning side.
    pub winner: Option<Team>,
    /// Turns played.
    pub turns: u32,
    /// GAME entry time.
    pub started_at: Option<DateTime<Utc>>,
    /// STATS entry time.
    pub ended_at: DateTime<Utc>,
    /// Length of the GAME phase in seconds.
    pub duration_secs: i64,
    /// One line per player, team A first, roster order within a team.
    pub players: Vec<PlayerSummary>,
}

impl MatchStats {
    /// Snapshot the match as it stands.
    pub fn build(m: &Match, ended_at: DateTime<Utc>) -> Self {
        let players = m
            .teams
            .values()
            .flat_map(|team| team.members.iter())
            .filter_map(|id| m.player(id))
            .map(|p| PlayerSummary {
                user_id: p.user_id.clone(),
                username: p.username.clone(),
                team: p.team,
                character_class: p.character_class.clone(),
                final_health: p.health,
                survived: p.is_alive(),
                stats: p.stats,
            })
            .collect();

        Self {
            match_id: m.match_id.clone(),
            map_id: m.map_id.clone(),
            winner: m.winner,
            turns: m.turn,
            started_at: m.started_at,
            ended_at,
            duration_secs: m
                .started_at
                .map(|start| (ended_at - start).num_seconds().max(0))
                .unwrap_or(0),
            players,
        }
    }

    /// Summed counters for one side.
    pub fn team_totals(&self, team: Team) -> CombatStats {
        self.players
            .iter()
            .filter(|p| p.team == team)
            .fold(CombatStats::default(), |mut acc, p| {
                acc.damage_dealt += p.stats.damage_dealt;
                acc.damage_taken += p.stats.damage_taken;
                acc.healing_done += p.stats.healing_done;
                acc.spells_cast += p.stats.spells_cast;
                acc.cells_moved += p.stats.cells_moved;
                acc.turns_played += p.stats.turns_played;
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::game::state::tests::open_match;

    #[test]
    fn test_build_orders_by_team() {
        let mut m = open_match(&["a1", "a2"], &["b1"]);
        m.winner = Some(Team::B);
        m.turn = 7;
        let end = Utc::now();
        m.started_at = Some(end - Duration::seconds(90));
        m.player_mut("a2").unwrap().health = 0;
        m.player_mut("b1").unwrap().stats.damage_dealt = 12;

        let stats = MatchStats::build(&m, end);
        let ids: Vec<&str> = stats.players.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "b1"]);
        assert!(!stats.players[1].survived);
        assert_eq!(stats.duration_secs, 90);
        assert_eq!(stats.turns, 7);
        assert_eq!(stats.team_totals(Team::B).damage_dealt, 12);
        assert_eq!(stats.team_totals(Team::A).damage_dealt, 0);
    }
}
