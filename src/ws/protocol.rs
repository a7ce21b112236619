//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue / match modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Single player welcome, short countdown, bot-filled
    Practice,
    /// Unranked public queue
    Casual,
    /// Ticket-gated queue with placement points
    Ranked,
    /// Private room started by its admin
    Custom,
}

impl GameMode {
    /// Modes that can be entered through the public queue
    pub const QUEUED: [GameMode; 3] = [GameMode::Practice, GameMode::Casual, GameMode::Ranked];

    pub fn as_str(&self) -> &'static str {
        match self {
            GameMode::Practice => "practice",
            GameMode::Casual => "casual",
            GameMode::Ranked => "ranked",
            GameMode::Custom => "custom",
        }
    }
}

impl std::fmt::Display for GameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action a combatant can submit for a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Skip the round
    #[default]
    None,
    /// Cheap single-damage shot, stopped by Defend
    Attack,
    /// Expensive shot that pierces Defend
    HeavyAttack,
    /// Try to block incoming attacks
    Defend,
    /// Gain ammo
    Reload,
}

impl ActionKind {
    pub fn is_attack(&self) -> bool {
        matches!(self, ActionKind::Attack | ActionKind::HeavyAttack)
    }
}

/// Quick mission objectives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionKind {
    /// Submit no action this round
    DoNothing,
    /// Deal damage this round
    LandHit,
    /// Block an incoming attack this round
    BlockAttack,
    /// Reload this round
    Reload,
}

/// Match-wide rule variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierKind {
    /// Default rules
    Classic,
    /// Simultaneous hits on one target all land
    Bloodbath,
    /// Reload grants double ammo
    Overcharged,
    /// Defend odds are worse
    Brittle,
    /// Everyone starts with ammo
    Armory,
    /// Heavy attacks are cheaper
    Bargain,
}

/// Round state machine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    WaitingForPlayers,
    Decision,
    Execution,
    Finished,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Join the queue for a mode
    Enqueue { mode: GameMode },

    /// Leave the queue
    CancelSearch,

    /// Submit (or overwrite) this round's action
    SubmitAction {
        kind: ActionKind,
        /// Target seat for attacks
        target: Option<usize>,
    },

    /// Toggle readiness (custom room lobby or match loading screen)
    ToggleReady,

    /// Open a custom room with the caller as admin
    CreateRoom,

    /// Join an existing custom room
    JoinRoom { room_id: Uuid },

    /// Leave the current custom room
    LeaveRoom,

    /// Admin starts the custom room
    StartRoom,

    /// Leave the current match and return to the lobby
    LeaveMatch,

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        user_id: Uuid,
        display_name: String,
        server_time: u64,
    },

    /// Queue size and countdown for the mode the player waits in
    QueueStatus {
        mode: GameMode,
        size: usize,
        seconds_remaining: Option<u32>,
    },

    /// Lobby feedback text
    LobbyNotice { message: String },

    /// Custom room membership changed
    RoomUpdate {
        room_id: Uuid,
        admin: Uuid,
        members: Vec<RoomMember>,
    },

    /// Player was placed in a match instance
    MatchFound {
        match_id: Uuid,
        instance: String,
        mode: GameMode,
        modifier: ModifierKind,
        /// Seat of the receiving player
        seat: usize,
        combatants: Vec<CombatantInfo>,
    },

    /// Phase change, with whether the receiver may submit an action
    Phase {
        phase: PhaseKind,
        round: u32,
        priority_seat: Option<usize>,
        actions_enabled: bool,
    },

    /// Per-second decision timer
    TimerTick { seconds_remaining: u32 },

    /// Quick mission assigned to the receiver
    MissionAssigned { kind: MissionKind, round: u32 },

    /// Kill feed and resolution events
    RoundEvents { round: u32, events: Vec<GameEvent> },

    /// Full state of every combatant (targeted refresh after reconnect)
    CombatantState {
        round: u32,
        combatants: Vec<CombatantInfo>,
    },

    /// A single survivor remains
    Victory { seat: usize, name: String },

    /// Nobody survived
    Draw,

    /// Sorted leaderboard as column arrays
    Leaderboard(LeaderboardColumns),

    /// Match aborted before round 1
    MatchAborted { reason: String },

    /// The instance is closing, go back to the lobby
    ReturnToLobby,

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

/// Room member for lobby display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMember {
    pub user_id: Uuid,
    pub display_name: String,
    pub ready: bool,
}

/// Public combatant state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombatantInfo {
    pub seat: usize,
    pub name: String,
    pub is_bot: bool,
    pub health: u8,
    pub ammo: u8,
    pub alive: bool,
    pub elimination_order: u32,
    pub afk: bool,
}

/// Resolution events (kill feed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GameEvent {
    /// Modifier chosen for the match
    ModifierSelected { modifier: ModifierKind },

    /// Defend attempt resolved
    Defended { seat: usize, success: bool },

    /// Reload resolved
    Reloaded { seat: usize, ammo: u8 },

    /// Attack fired (costs ammo even if it deals nothing)
    Shot {
        attacker: usize,
        target: usize,
        heavy: bool,
    },

    /// Attack stopped by Defend
    Blocked { attacker: usize, defender: usize },

    /// Attack dealt damage
    Hit {
        attacker: usize,
        target: usize,
        damage: u8,
    },

    /// Combatant eliminated
    Eliminated {
        seat: usize,
        killer: Option<usize>,
        order: u32,
    },

    /// Priority holder spared from a full draw
    Revived { seat: usize },

    /// Quick mission evaluated
    MissionResolved {
        seat: usize,
        kind: MissionKind,
        success: bool,
    },

    /// Combatant went AFK or came back
    AfkChanged { seat: usize, afk: bool },
}

/// Leaderboard rows sent column-wise
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaderboardColumns {
    pub names: Vec<String>,
    pub kills: Vec<u32>,
    pub shots: Vec<u32>,
    pub reloads: Vec<u32>,
    pub damage: Vec<u32>,
    pub blocks: Vec<u32>,
    pub points: Vec<i64>,
    pub disconnected: Vec<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_use_snake_case_tags() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"submit_action","kind":"heavy_attack","target":2}"#)
                .unwrap();

        match msg {
            ClientMsg::SubmitAction { kind, target } => {
                assert_eq!(kind, ActionKind::HeavyAttack);
                assert_eq!(target, Some(2));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let msg: ClientMsg = serde_json::from_str(r#"{"type":"enqueue","mode":"ranked"}"#).unwrap();
        assert!(matches!(msg, ClientMsg::Enqueue { mode: GameMode::Ranked }));
    }

    #[test]
    fn leaderboard_serializes_as_columns() {
        let msg = ServerMsg::Leaderboard(LeaderboardColumns {
            names: vec!["Ana".into()],
            points: vec![50],
            disconnected: vec![false],
            ..Default::default()
        });

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "leaderboard");
        assert_eq!(json["names"][0], "Ana");
        assert_eq!(json["points"][0], 50);
    }
}
