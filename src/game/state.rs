//! Session state machine
//!
//! Pure and synchronous: every operation either applies its full effect or
//! returns an error and leaves the state as it was. Concurrency is the
//! owning actor's problem, not this module's.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::constants::rules;
use crate::game::dice::DieRoller;
use crate::game::error::{GameError, Violation};

/// Unique participant identifier
pub type ParticipantId = Uuid;

/// Unique session identifier
pub type SessionId = Uuid;

/// Gameplay verbs a participant can submit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Roll,
    Hold,
}

/// Rules a session is created with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rules {
    pub target_score: u32,
    pub min_participants: usize,
    pub max_participants: usize,
    pub die_faces: u32,
    pub forfeit_face: u32,
}

impl Rules {
    /// Default rules with a custom target; zero falls back to the default target
    pub fn with_target(target_score: u32) -> Self {
        let target_score = if target_score == 0 {
            rules::DEFAULT_TARGET_SCORE
        } else {
            target_score
        };
        Self {
            target_score,
            ..Self::default()
        }
    }
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            target_score: rules::DEFAULT_TARGET_SCORE,
            min_participants: rules::MIN_PARTICIPANTS,
            max_participants: rules::MAX_PARTICIPANTS,
            die_faces: rules::DIE_FACES,
            forfeit_face: rules::FORFEIT_FACE,
        }
    }
}

/// A player's identity and standing within one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub total: u32,
    pub active: bool,
}

impl Participant {
    pub fn new(id: ParticipantId, name: String) -> Self {
        Self {
            id,
            name,
            total: 0,
            active: true,
        }
    }
}

/// Read-only, serializable view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub participants: Vec<Participant>,
    pub current_turn: usize,
    pub current_participant: Option<ParticipantId>,
    pub accumulator: u32,
    pub last_outcome: Option<u32>,
    pub target: u32,
    pub capacity: usize,
    pub started: bool,
    pub over: bool,
    pub winner: Option<ParticipantId>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// State of one Pig game
#[derive(Debug, Clone)]
pub struct SessionState {
    id: SessionId,
    rules: Rules,
    participants: Vec<Participant>,
    current_turn: usize,
    accumulator: u32,
    last_outcome: Option<u32>,
    started: bool,
    over: bool,
    winner: Option<ParticipantId>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl SessionState {
    pub fn new(id: SessionId, rules: Rules) -> Self {
        let now = Utc::now();
        Self {
            id,
            rules,
            participants: Vec::with_capacity(rules.max_participants),
            current_turn: 0,
            accumulator: 0,
            last_outcome: None,
            started: false,
            over: false,
            winner: None,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn active_count(&self) -> usize {
        self.participants.iter().filter(|p| p.active).count()
    }

    pub fn has_capacity(&self) -> bool {
        self.participants.len() < self.rules.max_participants
    }

    pub fn current_turn(&self) -> usize {
        self.current_turn
    }

    /// Participant whose turn it is (None until someone joined)
    pub fn current_participant(&self) -> Option<&Participant> {
        self.participants.get(self.current_turn)
    }

    pub fn accumulator(&self) -> u32 {
        self.accumulator
    }

    pub fn last_outcome(&self) -> Option<u32> {
        self.last_outcome
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_over(&self) -> bool {
        self.over
    }

    pub fn winner(&self) -> Option<ParticipantId> {
        self.winner
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            participants: self.participants.clone(),
            current_turn: self.current_turn,
            current_participant: self.current_participant().map(|p| p.id),
            accumulator: self.accumulator,
            last_outcome: self.last_outcome,
            target: self.rules.target_score,
            capacity: self.rules.max_participants,
            started: self.started,
            over: self.over,
            winner: self.winner,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    /// Record activity that did not change the game itself
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Append a participant to the turn order
    pub fn add_participant(&mut self, id: ParticipantId, name: String) -> Result<(), GameError> {
        if self.over {
            return Err(Violation::GameOver.into());
        }
        if !self.has_capacity() {
            return Err(Violation::SessionFull.into());
        }
        if self.participant(id).is_some() {
            return Err(Violation::DuplicateParticipant.into());
        }

        self.participants.push(Participant::new(id, name));
        self.touch();
        Ok(())
    }

    /// Whether `start` would transition the session now
    pub fn can_start(&self) -> bool {
        !self.started && !self.over && self.participants.len() >= self.rules.min_participants
    }

    /// Start the game. Returns `false` if it was already started.
    pub fn start(&mut self) -> Result<bool, GameError> {
        if self.started {
            return Ok(false);
        }
        if self.over {
            return Err(Violation::GameOver.into());
        }
        if self.participants.len() < self.rules.min_participants {
            return Err(Violation::NotEnoughParticipants.into());
        }

        self.started = true;
        self.touch();
        Ok(true)
    }

    /// Roll the die for `id`. Returns the drawn value.
    pub fn apply_roll(
        &mut self,
        id: ParticipantId,
        die: &mut dyn DieRoller,
    ) -> Result<u32, GameError> {
        self.validate_turn(id)?;

        let value = die.roll(self.rules.die_faces);
        self.last_outcome = Some(value);
        if value == self.rules.forfeit_face {
            self.advance_turn();
        } else {
            self.accumulator += value;
        }
        self.touch();
        Ok(value)
    }

    /// Bank the accumulator for `id`. Returns the banked amount.
    pub fn apply_hold(&mut self, id: ParticipantId) -> Result<u32, GameError> {
        let index = self.validate_turn(id)?;

        let banked = self.accumulator;
        let participant = &mut self.participants[index];
        participant.total = participant.total.saturating_add(banked);
        let total = participant.total;
        self.accumulator = 0;

        if total >= self.rules.target_score {
            self.over = true;
            self.winner = Some(id);
        } else {
            self.advance_turn();
        }
        self.touch();
        Ok(banked)
    }

    /// Flag a participant as gone. Its seat and total stay in the turn order.
    pub fn mark_departed(&mut self, id: ParticipantId) -> Result<(), GameError> {
        let index = self
            .participants
            .iter()
            .position(|p| p.id == id)
            .ok_or(GameError::ParticipantNotFound(id))?;

        if !self.participants[index].active {
            return Ok(());
        }
        self.participants[index].active = false;
        self.touch();

        if self.over {
            return Ok(());
        }

        if index == self.current_turn {
            self.advance_turn();
        }

        // Ends the game even if it never formally started
        if !self.over && self.participants.len() >= 2 && self.active_count() <= 1 {
            self.over = true;
            self.accumulator = 0;
            self.winner = self.participants.iter().find(|p| p.active).map(|p| p.id);
        }
        Ok(())
    }

    /// Verify the structural invariants; a failure means a bug, not bad input
    pub fn check_invariants(&self) -> Result<(), GameError> {
        let breach = |msg: String| Err(GameError::InvariantBreach(msg));

        if !self.participants.is_empty() && self.current_turn >= self.participants.len() {
            return breach(format!(
                "turn index {} out of range for {} participants",
                self.current_turn,
                self.participants.len()
            ));
        }
        if !self.over {
            if let Some(current) = self.current_participant() {
                if !current.active {
                    return breach(format!("turn held by departed participant {}", current.id));
                }
            }
            if self.winner.is_some() {
                return breach("winner set on a running session".to_string());
            }
        } else {
            if self.accumulator != 0 {
                return breach("accumulator not cleared after game end".to_string());
            }
            match self.winner {
                Some(winner) if self.participant(winner).is_none() => {
                    return breach(format!("winner {} is not a participant", winner));
                }
                None if self.active_count() > 0 => {
                    return breach("session over without a winner".to_string());
                }
                _ => {}
            }
        }
        if self.participants.len() > self.rules.max_participants {
            return breach("participant count above capacity".to_string());
        }
        Ok(())
    }

    /// Check that `id` may act now; returns its index
    fn validate_turn(&self, id: ParticipantId) -> Result<usize, GameError> {
        if self.over {
            return Err(Violation::GameOver.into());
        }
        if !self.started {
            return Err(Violation::NotStarted.into());
        }
        if self.participant(id).is_none() {
            return Err(GameError::ParticipantNotFound(id));
        }

        let current = &self.participants[self.current_turn];
        if current.id != id {
            return Err(Violation::NotYourTurn.into());
        }
        if !current.active {
            return Err(Violation::ParticipantInactive.into());
        }
        Ok(self.current_turn)
    }

    /// Pass the turn to the next active participant. With nobody left the
    /// session is forced over and the winner stays as it was.
    fn advance_turn(&mut self) {
        self.accumulator = 0;
        let count = self.participants.len();
        if count == 0 {
            return;
        }

        for step in 1..=count {
            let index = (self.current_turn + step) % count;
            if self.participants[index].active {
                self.current_turn = index;
                return;
            }
        }
        self.over = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::dice::ScriptedDie;

    fn started_session(names: &[&str], target: u32) -> (SessionState, Vec<ParticipantId>) {
        let mut state = SessionState::new(Uuid::new_v4(), Rules::with_target(target));
        let ids: Vec<ParticipantId> = names.iter().map(|_| Uuid::new_v4()).collect();
        for (id, name) in ids.iter().zip(names) {
            state.add_participant(*id, name.to_string()).unwrap();
        }
        state.start().unwrap();
        (state, ids)
    }

    #[test]
    fn test_new_session() {
        let state = SessionState::new(Uuid::new_v4(), Rules::with_target(50));
        assert_eq!(state.rules().target_score, 50);
        assert_eq!(state.participant_count(), 0);
        assert!(!state.is_started());
        assert!(!state.is_over());
        assert!(state.winner().is_none());
        assert!(state.current_participant().is_none());
    }

    #[test]
    fn test_zero_target_uses_default() {
        let rules = Rules::with_target(0);
        assert_eq!(rules.target_score, rules::DEFAULT_TARGET_SCORE);
    }

    #[test]
    fn test_add_participant() {
        let mut state = SessionState::new(Uuid::new_v4(), Rules::default());
        let id = Uuid::new_v4();
        state.add_participant(id, "Alice".to_string()).unwrap();

        let p = state.participant(id).unwrap();
        assert_eq!(p.name, "Alice");
        assert_eq!(p.total, 0);
        assert!(p.active);
    }

    #[test]
    fn test_add_duplicate_participant() {
        let mut state = SessionState::new(Uuid::new_v4(), Rules::default());
        let id = Uuid::new_v4();
        state.add_participant(id, "Alice".to_string()).unwrap();

        let result = state.add_participant(id, "Alice again".to_string());
        assert_eq!(result, Err(Violation::DuplicateParticipant.into()));
        assert_eq!(state.participant_count(), 1);
    }

    #[test]
    fn test_add_participant_to_full_session() {
        let mut state = SessionState::new(Uuid::new_v4(), Rules::default());
        for i in 0..rules::MAX_PARTICIPANTS {
            state.add_participant(Uuid::new_v4(), format!("P{}", i)).unwrap();
        }

        let result = state.add_participant(Uuid::new_v4(), "Late".to_string());
        assert_eq!(result, Err(Violation::SessionFull.into()));
    }

    #[test]
    fn test_add_participant_after_game_over() {
        let (mut state, ids) = started_session(&["A", "B"], 20);
        state.mark_departed(ids[1]).unwrap();
        assert!(state.is_over());

        let result = state.add_participant(Uuid::new_v4(), "Late".to_string());
        assert_eq!(result, Err(Violation::GameOver.into()));
    }

    #[test]
    fn test_start_requires_two_participants() {
        let mut state = SessionState::new(Uuid::new_v4(), Rules::default());
        state.add_participant(Uuid::new_v4(), "Solo".to_string()).unwrap();

        assert!(!state.can_start());
        assert_eq!(state.start(), Err(Violation::NotEnoughParticipants.into()));
        assert!(!state.is_started());
    }

    #[test]
    fn test_start_is_idempotent() {
        let (mut state, _) = started_session(&["A", "B"], 100);
        assert!(state.is_started());
        assert_eq!(state.start(), Ok(false));
        assert!(!state.can_start());
    }

    #[test]
    fn test_roll_before_start() {
        let mut state = SessionState::new(Uuid::new_v4(), Rules::default());
        let id = Uuid::new_v4();
        state.add_participant(id, "A".to_string()).unwrap();

        let result = state.apply_roll(id, &mut ScriptedDie::new([4]));
        assert_eq!(result, Err(Violation::NotStarted.into()));
        assert_eq!(state.last_outcome(), None);
    }

    #[test]
    fn test_roll_adds_to_accumulator() {
        let (mut state, ids) = started_session(&["A", "B"], 100);
        let mut die = ScriptedDie::new([5, 3]);

        assert_eq!(state.apply_roll(ids[0], &mut die), Ok(5));
        assert_eq!(state.accumulator(), 5);
        assert_eq!(state.current_turn(), 0);

        assert_eq!(state.apply_roll(ids[0], &mut die), Ok(3));
        assert_eq!(state.accumulator(), 8);
        assert_eq!(state.last_outcome(), Some(3));
        assert_eq!(state.current_turn(), 0);
    }

    #[test]
    fn test_roll_forfeit_face_passes_turn() {
        let (mut state, ids) = started_session(&["A", "B"], 100);
        let mut die = ScriptedDie::new([6, 1]);

        state.apply_roll(ids[0], &mut die).unwrap();
        assert_eq!(state.apply_roll(ids[0], &mut die), Ok(1));

        assert_eq!(state.accumulator(), 0);
        assert_eq!(state.current_turn(), 1);
        assert_eq!(state.last_outcome(), Some(1));
        assert_eq!(state.participant(ids[0]).unwrap().total, 0);
    }

    #[test]
    fn test_roll_not_your_turn() {
        let (mut state, ids) = started_session(&["A", "B"], 100);
        let result = state.apply_roll(ids[1], &mut ScriptedDie::new([4]));
        assert_eq!(result, Err(Violation::NotYourTurn.into()));
        assert_eq!(state.accumulator(), 0);
    }

    #[test]
    fn test_roll_unknown_participant() {
        let (mut state, _) = started_session(&["A", "B"], 100);
        let stranger = Uuid::new_v4();
        let result = state.apply_roll(stranger, &mut ScriptedDie::new([4]));
        assert_eq!(result, Err(GameError::ParticipantNotFound(stranger)));
    }

    #[test]
    fn test_hold_banks_and_passes_turn() {
        let (mut state, ids) = started_session(&["A", "B"], 100);
        let mut die = ScriptedDie::new([4, 6]);
        state.apply_roll(ids[0], &mut die).unwrap();
        state.apply_roll(ids[0], &mut die).unwrap();

        assert_eq!(state.apply_hold(ids[0]), Ok(10));
        assert_eq!(state.participant(ids[0]).unwrap().total, 10);
        assert_eq!(state.accumulator(), 0);
        assert_eq!(state.current_turn(), 1);
    }

    #[test]
    fn test_hold_not_your_turn() {
        let (mut state, ids) = started_session(&["A", "B"], 100);
        state.apply_roll(ids[0], &mut ScriptedDie::new([5])).unwrap();

        assert_eq!(state.apply_hold(ids[1]), Err(Violation::NotYourTurn.into()));
        assert_eq!(state.accumulator(), 5);
        assert_eq!(state.participant(ids[1]).unwrap().total, 0);
    }

    #[test]
    fn test_hold_reaching_target_wins() {
        let (mut state, ids) = started_session(&["A", "B"], 10);
        let mut die = ScriptedDie::new([6, 4]);
        state.apply_roll(ids[0], &mut die).unwrap();
        state.apply_roll(ids[0], &mut die).unwrap();
        state.apply_hold(ids[0]).unwrap();

        assert!(state.is_over());
        assert_eq!(state.winner(), Some(ids[0]));
        assert_eq!(state.current_turn(), 0);
        assert_eq!(state.accumulator(), 0);
        assert!(state.check_invariants().is_ok());

        // Every further action is a rule violation
        let roll = state.apply_roll(ids[0], &mut die);
        assert_eq!(roll, Err(Violation::GameOver.into()));
        assert_eq!(state.apply_hold(ids[1]), Err(Violation::GameOver.into()));
    }

    #[test]
    fn test_turn_rotation_skips_departed() {
        let (mut state, ids) = started_session(&["A", "B", "C"], 100);
        state.mark_departed(ids[1]).unwrap();
        assert!(!state.is_over());

        state.apply_hold(ids[0]).unwrap();
        assert_eq!(state.current_turn(), 2);
        state.apply_hold(ids[2]).unwrap();
        assert_eq!(state.current_turn(), 0);
    }

    #[test]
    fn test_turn_progression_wraps() {
        let (mut state, ids) = started_session(&["A", "B", "C"], 100);
        let mut die = ScriptedDie::new(std::iter::empty()).with_fallback(1);
        for round in 0..6 {
            let expected = ids[round % 3];
            assert_eq!(state.current_participant().unwrap().id, expected);
            state.apply_roll(expected, &mut die).unwrap();
        }
    }

    #[test]
    fn test_departure_of_turn_holder_passes_turn() {
        let (mut state, ids) = started_session(&["A", "B", "C"], 100);
        state.apply_roll(ids[0], &mut ScriptedDie::new([5])).unwrap();
        state.mark_departed(ids[0]).unwrap();

        assert!(!state.participant(ids[0]).unwrap().active);
        assert_eq!(state.current_turn(), 1);
        assert_eq!(state.accumulator(), 0);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_departure_leaving_one_active_ends_game() {
        let (mut state, ids) = started_session(&["A", "B"], 100);
        state.mark_departed(ids[0]).unwrap();

        assert!(state.is_over());
        assert_eq!(state.winner(), Some(ids[1]));
        assert_eq!(state.participant_count(), 2);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_departure_ends_unstarted_game() {
        let mut state = SessionState::new(Uuid::new_v4(), Rules::default());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        state.add_participant(a, "A".to_string()).unwrap();
        state.add_participant(b, "B".to_string()).unwrap();

        state.mark_departed(b).unwrap();

        assert!(!state.is_started());
        assert!(state.is_over());
        assert_eq!(state.winner(), Some(a));
    }

    #[test]
    fn test_last_participant_leaving_forces_over() {
        let mut state = SessionState::new(Uuid::new_v4(), Rules::default());
        let id = Uuid::new_v4();
        state.add_participant(id, "Solo".to_string()).unwrap();

        state.mark_departed(id).unwrap();

        assert!(state.is_over());
        assert!(state.winner().is_none());
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_departure_after_win_keeps_winner() {
        let (mut state, ids) = started_session(&["A", "B", "C"], 5);
        state.apply_roll(ids[0], &mut ScriptedDie::new([6])).unwrap();
        state.apply_hold(ids[0]).unwrap();
        assert_eq!(state.winner(), Some(ids[0]));

        state.mark_departed(ids[0]).unwrap();
        state.mark_departed(ids[1]).unwrap();

        assert_eq!(state.winner(), Some(ids[0]));
        assert!(!state.participant(ids[0]).unwrap().active);
    }

    #[test]
    fn test_mark_departed_unknown() {
        let (mut state, _) = started_session(&["A", "B"], 100);
        let stranger = Uuid::new_v4();
        assert_eq!(
            state.mark_departed(stranger),
            Err(GameError::ParticipantNotFound(stranger))
        );
    }

    #[test]
    fn test_mark_departed_twice_is_noop() {
        let (mut state, ids) = started_session(&["A", "B", "C"], 100);
        state.mark_departed(ids[2]).unwrap();
        state.mark_departed(ids[2]).unwrap();
        assert_eq!(state.active_count(), 2);
        assert!(!state.is_over());
    }

    #[test]
    fn test_totals_never_decrease() {
        let (mut state, ids) = started_session(&["A", "B"], 1_000);
        let mut die = crate::game::dice::RandomDie::seeded(99);
        let mut previous = vec![0u32; 2];

        for step in 0..500 {
            let current = state.current_participant().unwrap().id;
            if step % 3 == 2 {
                state.apply_hold(current).unwrap();
            } else {
                state.apply_roll(current, &mut die).unwrap();
            }
            if state.is_over() {
                break;
            }
            for (i, id) in ids.iter().enumerate() {
                let total = state.participant(*id).unwrap().total;
                assert!(total >= previous[i]);
                previous[i] = total;
            }
            assert!(state.check_invariants().is_ok());
        }
    }

    #[test]
    fn test_failed_operation_leaves_state_unchanged() {
        let (mut state, ids) = started_session(&["A", "B"], 100);
        state.apply_roll(ids[0], &mut ScriptedDie::new([4])).unwrap();
        let before = state.clone();

        let _ = state.apply_roll(ids[1], &mut ScriptedDie::new([6]));
        let _ = state.apply_hold(ids[1]);

        assert_eq!(state.accumulator(), before.accumulator());
        assert_eq!(state.current_turn(), before.current_turn());
        assert_eq!(state.last_outcome(), before.last_outcome());
        assert_eq!(state.participants(), before.participants());
        assert_eq!(state.last_activity(), before.last_activity());
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let (mut state, ids) = started_session(&["A", "B"], 30);
        state.apply_roll(ids[0], &mut ScriptedDie::new([4])).unwrap();

        let snap = state.snapshot();
        assert_eq!(snap.session_id, state.id());
        assert_eq!(snap.participants.len(), 2);
        assert_eq!(snap.current_participant, Some(ids[0]));
        assert_eq!(snap.accumulator, 4);
        assert_eq!(snap.last_outcome, Some(4));
        assert_eq!(snap.target, 30);
        assert!(snap.started);
        assert!(!snap.over);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["participants"][0]["name"], "A");
        assert!(json["winner"].is_null());
    }

    #[test]
    fn test_check_invariants_on_fresh_state() {
        let state = SessionState::new(Uuid::new_v4(), Rules::default());
        assert!(state.check_invariants().is_ok());
    }
}
