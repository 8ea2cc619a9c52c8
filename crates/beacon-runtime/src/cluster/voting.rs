use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use beacon_core::config::TieBreak;
use beacon_core::error::StoreResult;
use beacon_core::store::{child_path, Properties, Resource, ResourceStore, Session};
use beacon_core::time::{chrono_duration, Clock};

use super::paths::DiscoveryPaths;
use super::view::{read_established_view, EstablishedView};

const INITIATOR: &str = "initiator";
const CREATED_AT: &str = "createdAt";
const PARTICIPANTS: &str = "participants";
const CHOSEN: &str = "chosen";
const VOTED_AT: &str = "votedAt";

/// Lifecycle of a voting round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VotingState {
    Init,
    CollectingVotes,
    Decided,
    Abandoned,
}

impl fmt::Display for VotingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::CollectingVotes => "COLLECTING_VOTES",
            Self::Decided => "DECIDED",
            Self::Abandoned => "ABANDONED",
        };
        f.write_str(s)
    }
}

/// A leader voting round as stored under `ongoingVotings/<roundId>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VotingRound {
    pub round_id: String,
    pub initiator: String,
    pub created_at: DateTime<Utc>,
    pub participants: BTreeSet<String>,
    /// Voter id to the candidate it chose.
    pub votes: BTreeMap<String, String>,
}

impl VotingRound {
    fn from_resources(round: &Resource, votes: &[Resource]) -> Option<Self> {
        let created_at = Utc
            .timestamp_millis_opt(round.get_i64(CREATED_AT)?)
            .single()?;
        Some(Self {
            round_id: round.name().to_string(),
            initiator: round.get_str(INITIATOR)?.to_string(),
            created_at,
            participants: round.get_strings(PARTICIPANTS).into_iter().collect(),
            votes: votes
                .iter()
                .filter_map(|v| Some((v.name().to_string(), v.get_str(CHOSEN)?.to_string())))
                .collect(),
        })
    }

    /// The agreed candidate once every participant voted for it.
    pub fn winner(&self) -> Option<&str> {
        if self.participants.is_empty() {
            return None;
        }
        let mut chosen = None;
        for participant in &self.participants {
            let vote = self.votes.get(participant)?;
            match chosen {
                None => chosen = Some(vote.as_str()),
                Some(c) if c == vote => {}
                Some(_) => return None,
            }
        }
        chosen.filter(|c| self.participants.contains(*c))
    }

    /// Whether the round is older than `timeout`.
    pub fn is_timed_out(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.created_at > chrono_duration(timeout)
    }

    pub fn state(&self, now: DateTime<Utc>, timeout: Duration) -> VotingState {
        if self.winner().is_some() {
            VotingState::Decided
        } else if self.is_timed_out(now, timeout) {
            VotingState::Abandoned
        } else if self.votes.is_empty() {
            VotingState::Init
        } else {
            VotingState::CollectingVotes
        }
    }

    pub fn matches(&self, live: &BTreeSet<String>) -> bool {
        &self.participants == live
    }
}

/// What one analysis pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VotingAction {
    /// Deleted a round that did not decide in time.
    Abandoned { round_id: String },
    /// Started a new round.
    Started { round_id: String },
    /// Cast or updated our vote.
    Voted { round_id: String, chosen: String },
    /// Our vote stands; waiting for other participants.
    Waiting { round_id: Option<String> },
    /// A round decided; its initiator will promote it.
    AwaitingPromotion { round_id: String },
    /// We promoted a decided round to the established view.
    Promoted { round_id: String, leader: String },
}

/// Leader election through votes in the shared store.
///
/// Every instance runs [`analyze_votings`] on each liveness check. When
/// the established view differs from the live instances, the instance
/// the tie-break rule elects starts a round over the live set, everyone
/// whose live set matches votes for the same elected candidate, and the
/// initiator promotes the round once all participants agreed.
///
/// [`analyze_votings`]: VotingHandler::analyze_votings
pub struct VotingHandler {
    store: Arc<dyn ResourceStore>,
    paths: DiscoveryPaths,
    clock: Arc<dyn Clock>,
    sling_id: String,
    tie_break: TieBreak,
    timeout: Duration,
    lock: Mutex<()>,
}

impl VotingHandler {
    /// Create a voting handler for the local instance.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        paths: DiscoveryPaths,
        clock: Arc<dyn Clock>,
        sling_id: impl Into<String>,
        tie_break: TieBreak,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            paths,
            clock,
            sling_id: sling_id.into(),
            tie_break,
            timeout,
            lock: Mutex::new(()),
        }
    }

    /// Load all ongoing rounds ordered by id.
    pub async fn ongoing_rounds(&self) -> StoreResult<Vec<VotingRound>> {
        let mut rounds = Vec::new();
        for round in self.store.list_children(&self.paths.ongoing_votings()).await? {
            let votes = self
                .store
                .list_children(&self.paths.votes(round.name()))
                .await?;
            match VotingRound::from_resources(&round, &votes) {
                Some(parsed) => rounds.push(parsed),
                None => tracing::debug!(round = %round.name(), "Ignoring malformed voting"),
            }
        }
        Ok(rounds)
    }

    /// Drive the voting forward given the instances with fresh heartbeats.
    pub async fn analyze_votings(&self, live: &BTreeSet<String>) -> StoreResult<Vec<VotingAction>> {
        let _guard = self.lock.lock().await;
        let now = self.clock.now();
        let mut actions = Vec::new();

        let mut rounds = self.ongoing_rounds().await?;

        for round in rounds.iter().filter(|r| r.is_timed_out(now, self.timeout)) {
            let mut session = Session::new(self.store.clone());
            session.delete(self.paths.voting(&round.round_id));
            match session.commit().await {
                Ok(()) => {
                    tracing::info!(round = %round.round_id, "Abandoned timed out voting");
                    actions.push(VotingAction::Abandoned {
                        round_id: round.round_id.clone(),
                    });
                }
                Err(e) => {
                    tracing::debug!(round = %round.round_id, "Could not delete voting: {}", e);
                    session.refresh();
                }
            }
        }
        rounds.retain(|r| !r.is_timed_out(now, self.timeout));

        if let Some(decided) = rounds.iter().find(|r| r.winner().is_some()) {
            actions.push(self.handle_decided(decided).await?);
            return Ok(actions);
        }

        let established = read_established_view(self.store.as_ref(), &self.paths).await?;
        if established.as_ref().is_some_and(|e| &e.members == live) {
            return Ok(actions);
        }

        if !live.contains(&self.sling_id) {
            return Ok(actions);
        }

        let Some(chosen) = self.tie_break.elect(live.iter().map(String::as_str)) else {
            return Ok(actions);
        };
        let chosen = chosen.to_string();

        let round_id = match rounds.iter().find(|r| r.matches(live)) {
            Some(round) => {
                if round.votes.get(&self.sling_id) == Some(&chosen) {
                    actions.push(VotingAction::Waiting {
                        round_id: Some(round.round_id.clone()),
                    });
                    return Ok(actions);
                }
                self.vote(&round.round_id, &chosen).await?;
                actions.push(VotingAction::Voted {
                    round_id: round.round_id.clone(),
                    chosen: chosen.clone(),
                });
                round.round_id.clone()
            }
            None if chosen == self.sling_id => {
                let round_id = self.start_round(live, &chosen).await?;
                actions.push(VotingAction::Started {
                    round_id: round_id.clone(),
                });
                round_id
            }
            None => {
                actions.push(VotingAction::Waiting { round_id: None });
                return Ok(actions);
            }
        };

        // Our vote may have completed the round.
        let rounds = self.ongoing_rounds().await?;
        if let Some(round) = rounds
            .iter()
            .find(|r| r.round_id == round_id && r.winner().is_some())
        {
            actions.push(self.handle_decided(round).await?);
        }

        Ok(actions)
    }

    async fn handle_decided(&self, round: &VotingRound) -> StoreResult<VotingAction> {
        let leader = round.winner().unwrap_or_default().to_string();
        if round.initiator != self.sling_id {
            return Ok(VotingAction::AwaitingPromotion {
                round_id: round.round_id.clone(),
            });
        }
        self.promote(round, &leader).await?;
        Ok(VotingAction::Promoted {
            round_id: round.round_id.clone(),
            leader,
        })
    }

    async fn start_round(&self, live: &BTreeSet<String>, chosen: &str) -> StoreResult<String> {
        let round_id = Uuid::new_v4().to_string();
        let now = self.clock.now_millis();

        let mut round = Properties::new();
        round.insert(INITIATOR.into(), Value::from(self.sling_id.clone()));
        round.insert(CREATED_AT.into(), Value::from(now));
        round.insert(
            PARTICIPANTS.into(),
            Value::Array(live.iter().cloned().map(Value::from).collect()),
        );

        let mut session = Session::new(self.store.clone());
        session.create(self.paths.voting(&round_id), round);
        session.put(
            child_path(&self.paths.votes(&round_id), &self.sling_id),
            vote_properties(chosen, now),
        );
        if let Err(e) = session.commit().await {
            session.refresh();
            return Err(e);
        }

        tracing::info!(round = %round_id, participants = live.len(), "Started new voting");
        Ok(round_id)
    }

    async fn vote(&self, round_id: &str, chosen: &str) -> StoreResult<()> {
        let mut session = Session::new(self.store.clone());
        session.put(
            child_path(&self.paths.votes(round_id), &self.sling_id),
            vote_properties(chosen, self.clock.now_millis()),
        );
        if let Err(e) = session.commit().await {
            session.refresh();
            return Err(e);
        }
        tracing::debug!(round = %round_id, chosen = %chosen, "Voted");
        Ok(())
    }

    /// Make `round` the established view, archiving the current one and
    /// clearing all ongoing votings.
    async fn promote(&self, round: &VotingRound, leader: &str) -> StoreResult<()> {
        let mut session = Session::new(self.store.clone());

        for previous in session.list_children(&self.paths.previous_view()).await? {
            session.delete(previous.path);
        }
        for established in session.list_children(&self.paths.established_view()).await? {
            session.create(
                child_path(&self.paths.previous_view(), established.name()),
                established.properties.clone(),
            );
            session.delete(established.path);
        }

        let view = EstablishedView {
            view_id: round.round_id.clone(),
            leader_id: leader.to_string(),
            members: round.participants.clone(),
            promoted_at: Some(self.clock.now()),
            promoted_by: Some(self.sling_id.clone()),
        };
        session.create(
            child_path(&self.paths.established_view(), &view.view_id),
            view.to_properties(),
        );

        for voting in session.list_children(&self.paths.ongoing_votings()).await? {
            session.delete(voting.path);
        }

        if let Err(e) = session.commit().await {
            session.refresh();
            return Err(e);
        }

        tracing::info!(round = %round.round_id, leader = %leader, "Promoted voting to established view");
        Ok(())
    }
}

fn vote_properties(chosen: &str, at_millis: i64) -> Properties {
    let mut vote = Properties::new();
    vote.insert(CHOSEN.into(), Value::from(chosen));
    vote.insert(VOTED_AT.into(), Value::from(at_millis));
    vote
}
