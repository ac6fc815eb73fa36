use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RankError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("replay error: {0}")]
    Replay(String),
    #[error("insufficient items: pair selection needs at least 2 photos, have {available}")]
    InsufficientItems { available: usize },
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Catalog-assigned photo identity. Opaque to the engine; the catalog
/// source decides the format.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PhotoId(pub String);

impl PhotoId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PhotoId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Photo {
    pub id: PhotoId,
    pub display_url: String,
    pub title: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl Photo {
    /// Validates a catalog record before it enters the engine.
    ///
    /// # Errors
    /// Returns [`RankError::Validation`] when required fields are missing
    /// or dimensions are zero.
    pub fn validate(&self) -> Result<(), RankError> {
        if self.id.as_str().trim().is_empty() {
            return Err(RankError::Validation(
                "photo id MUST be non-empty".to_string(),
            ));
        }

        if self.display_url.trim().is_empty() {
            return Err(RankError::Validation(format!(
                "photo {} is missing a display_url",
                self.id
            )));
        }

        if self.width == Some(0) || self.height == Some(0) {
            return Err(RankError::Validation(format!(
                "photo {} has zero-sized dimensions",
                self.id
            )));
        }

        Ok(())
    }
}

/// A persisted vote: the winner of one pairwise comparison.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchEvent {
    pub event_seq: i64,
    pub event_id: Ulid,
    pub winner_id: PhotoId,
    pub loser_id: PhotoId,
    pub occurred_at: OffsetDateTime,
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchEventInput {
    pub event_id: Option<Ulid>,
    pub winner_id: PhotoId,
    pub loser_id: PhotoId,
    pub occurred_at: OffsetDateTime,
}

impl MatchEventInput {
    /// Validates a vote payload before append. Malformed events are
    /// rejected here and never reach replay.
    ///
    /// # Errors
    /// Returns [`RankError::Validation`] when a participant id is empty,
    /// both sides are the same photo, or the timestamp is not UTC.
    pub fn validate(&self) -> Result<(), RankError> {
        if self.winner_id.as_str().trim().is_empty() || self.loser_id.as_str().trim().is_empty() {
            return Err(RankError::Validation(
                "winner_id and loser_id MUST be non-empty".to_string(),
            ));
        }

        if self.winner_id == self.loser_id {
            return Err(RankError::Validation(format!(
                "a photo cannot beat itself: {}",
                self.winner_id
            )));
        }

        if self.occurred_at.offset() != UtcOffset::UTC {
            return Err(RankError::Validation(
                "occurred_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Tunable rating parameters, versioned and stored alongside the event log.
/// Changing the tuning is a data change, not a code change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatingConfig {
    pub config_version: u32,
    pub initial_rating: f64,
    pub initial_uncertainty: f64,
    pub min_uncertainty: f64,
    /// Step size per match is `uncertainty / 400.0 * k_scale`.
    pub k_scale: f64,
    /// A win whose pre-match expectation was below this counts as an upset.
    pub upset_threshold: f64,
    pub upset_uncertainty_boost: f64,
    pub uncertainty_decay: f64,
    pub placement_skip_probability: f64,
    pub exploration_probability: f64,
    pub anchor_min_matches: u32,
    pub anchor_rating_band: f64,
    pub refinement_pool_size: usize,
    pub volatile_uncertainty: f64,
    pub equivalent_rating_gap: f64,
    pub repeat_retry_limit: u32,
}

impl RatingConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            initial_rating: 1000.0,
            initial_uncertainty: 350.0,
            min_uncertainty: 50.0,
            k_scale: 80.0,
            upset_threshold: 0.25,
            upset_uncertainty_boost: 50.0,
            uncertainty_decay: 0.95,
            placement_skip_probability: 0.10,
            exploration_probability: 0.15,
            anchor_min_matches: 4,
            anchor_rating_band: 100.0,
            refinement_pool_size: 6,
            volatile_uncertainty: 150.0,
            equivalent_rating_gap: 25.0,
            repeat_retry_limit: 4,
        }
    }

    /// Validates numeric bounds and pool invariants.
    ///
    /// # Errors
    /// Returns [`RankError::Configuration`] when one or more fields are
    /// outside allowed bounds.
    pub fn validate(&self) -> Result<(), RankError> {
        if self.config_version == 0 {
            return Err(RankError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }

        if !(1.0..=100_000.0).contains(&self.initial_rating) {
            return Err(RankError::Configuration(
                "initial_rating MUST be in [1.0, 100000.0]".to_string(),
            ));
        }

        if !(1.0..=10_000.0).contains(&self.initial_uncertainty) {
            return Err(RankError::Configuration(
                "initial_uncertainty MUST be in [1.0, 10000.0]".to_string(),
            ));
        }

        if !(1.0..=self.initial_uncertainty).contains(&self.min_uncertainty) {
            return Err(RankError::Configuration(
                "min_uncertainty MUST be in [1.0, initial_uncertainty]".to_string(),
            ));
        }

        if !(1.0..=10_000.0).contains(&self.k_scale) {
            return Err(RankError::Configuration(
                "k_scale MUST be in [1.0, 10000.0]".to_string(),
            ));
        }

        if !(0.0..=0.5).contains(&self.upset_threshold) {
            return Err(RankError::Configuration(
                "upset_threshold MUST be in [0.0, 0.5]".to_string(),
            ));
        }

        if !(0.0..=self.initial_uncertainty).contains(&self.upset_uncertainty_boost) {
            return Err(RankError::Configuration(
                "upset_uncertainty_boost MUST be in [0.0, initial_uncertainty]".to_string(),
            ));
        }

        if self.uncertainty_decay <= 0.0 || self.uncertainty_decay >= 1.0 {
            return Err(RankError::Configuration(
                "uncertainty_decay MUST be in (0.0, 1.0)".to_string(),
            ));
        }

        for (name, value) in [
            (
                "placement_skip_probability",
                self.placement_skip_probability,
            ),
            ("exploration_probability", self.exploration_probability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RankError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        for (name, value) in [
            ("anchor_rating_band", self.anchor_rating_band),
            ("volatile_uncertainty", self.volatile_uncertainty),
            ("equivalent_rating_gap", self.equivalent_rating_gap),
        ] {
            if !(0.0..=100_000.0).contains(&value) {
                return Err(RankError::Configuration(format!(
                    "{name} MUST be in [0.0, 100000.0]"
                )));
            }
        }

        if self.refinement_pool_size == 0 {
            return Err(RankError::Configuration(
                "refinement_pool_size MUST be >= 1".to_string(),
            ));
        }

        if self.repeat_retry_limit == 0 {
            return Err(RankError::Configuration(
                "repeat_retry_limit MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a stored configuration from JSON.
    ///
    /// # Errors
    /// Returns [`RankError::Configuration`] when JSON decoding fails or
    /// decoded values violate bounds.
    pub fn from_json(value: &Value) -> Result<Self, RankError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            RankError::Configuration(format!("invalid rating config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Skill estimate for one photo: a rating plus a heuristic uncertainty that
/// widens on surprising results and narrows on expected ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RatingState {
    pub rating: f64,
    pub uncertainty: f64,
    pub matches: u32,
    pub wins: u32,
    pub losses: u32,
}

impl RatingState {
    #[must_use]
    pub fn seed(config: &RatingConfig) -> Self {
        Self {
            rating: config.initial_rating,
            uncertainty: config.initial_uncertainty,
            matches: 0,
            wins: 0,
            losses: 0,
        }
    }
}

/// Snapshot entry derived from the full event log. Never persisted;
/// recomputed on every log change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedPhoto {
    pub id: PhotoId,
    pub rating: f64,
    pub uncertainty: f64,
    pub matches: u32,
    pub wins: u32,
    pub losses: u32,
}

/// Probability that side `a` beats side `b`, logistic in the rating gap.
#[must_use]
pub fn expected_score(rating_a: f64, rating_b: f64) -> f64 {
    1.0 / (1.0 + 10.0_f64.powf((rating_b - rating_a) / 400.0))
}

/// Per-match step size. Scales with the side's own current uncertainty so
/// unsettled photos move fast and settled ones barely move.
#[must_use]
pub fn step_size(uncertainty: f64, config: &RatingConfig) -> f64 {
    uncertainty / 400.0 * config.k_scale
}

/// Applies a single match outcome to both participants. Pure: inputs are
/// untouched, updated copies are returned as (winner, loser).
#[must_use]
pub fn rate_match(
    winner: &RatingState,
    loser: &RatingState,
    config: &RatingConfig,
) -> (RatingState, RatingState) {
    let winner_expected = expected_score(winner.rating, loser.rating);
    let loser_expected = 1.0 - winner_expected;
    let upset = winner_expected < config.upset_threshold;

    let mut next_winner = *winner;
    let mut next_loser = *loser;

    next_winner.rating = winner.rating + step_size(winner.uncertainty, config) * (1.0 - winner_expected);
    next_loser.rating = loser.rating + step_size(loser.uncertainty, config) * (0.0 - loser_expected);

    next_winner.uncertainty = shift_uncertainty(winner.uncertainty, upset, config);
    next_loser.uncertainty = shift_uncertainty(loser.uncertainty, upset, config);

    next_winner.matches += 1;
    next_winner.wins += 1;
    next_loser.matches += 1;
    next_loser.losses += 1;

    (next_winner, next_loser)
}

// An upset is evidence the model misjudged both sides: widen and re-examine.
// An expected result narrows geometrically toward the floor, never to zero.
fn shift_uncertainty(uncertainty: f64, upset: bool, config: &RatingConfig) -> f64 {
    if upset {
        (uncertainty + config.upset_uncertainty_boost).min(config.initial_uncertainty)
    } else {
        (uncertainty * config.uncertainty_decay).max(config.min_uncertainty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplaySummary {
    pub entries: Vec<RankedPhoto>,
    pub processed_events: usize,
    pub skipped_events: usize,
}

/// Folds the full event log into a ranked snapshot, starting every photo
/// at the configured prior.
///
/// Events are ordered by `(occurred_at, event_seq)` before folding, so any
/// two logs that are permutations of each other under that order replay to
/// the same snapshot. The fold is strictly sequential: each update depends
/// on the ratings produced by all earlier events.
///
/// Events referencing ids absent from `photos` are skipped and counted,
/// never fatal. Output entries are in input-photo order; standings order is
/// the caller's concern.
///
/// # Errors
/// Returns [`RankError::Configuration`] for an invalid config and
/// [`RankError::Replay`] when the catalog contains duplicate ids.
pub fn replay_snapshot(
    photos: &[Photo],
    events: &[MatchEvent],
    config: &RatingConfig,
) -> Result<ReplaySummary, RankError> {
    config.validate()?;

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(photos.len());
    for (idx, photo) in photos.iter().enumerate() {
        if index.insert(photo.id.as_str(), idx).is_some() {
            return Err(RankError::Replay(format!(
                "duplicate photo id in catalog: {}",
                photo.id
            )));
        }
    }

    let mut states: Vec<RatingState> = photos.iter().map(|_| RatingState::seed(config)).collect();

    let mut ordered: Vec<&MatchEvent> = events.iter().collect();
    ordered.sort_by_key(|event| (event.occurred_at, event.event_seq));

    let mut processed_events = 0_usize;
    let mut skipped_events = 0_usize;

    for event in ordered {
        let winner_idx = index.get(event.winner_id.as_str()).copied();
        let loser_idx = index.get(event.loser_id.as_str()).copied();

        let (Some(winner_idx), Some(loser_idx)) = (winner_idx, loser_idx) else {
            tracing::warn!(
                event_seq = event.event_seq,
                winner_id = %event.winner_id,
                loser_id = %event.loser_id,
                "skipping event referencing unknown participant"
            );
            skipped_events += 1;
            continue;
        };

        if winner_idx == loser_idx {
            tracing::warn!(
                event_seq = event.event_seq,
                winner_id = %event.winner_id,
                "skipping self-match event"
            );
            skipped_events += 1;
            continue;
        }

        let (next_winner, next_loser) = rate_match(&states[winner_idx], &states[loser_idx], config);
        states[winner_idx] = next_winner;
        states[loser_idx] = next_loser;
        processed_events += 1;
    }

    let entries = photos
        .iter()
        .zip(states)
        .map(|(photo, state)| RankedPhoto {
            id: photo.id.clone(),
            rating: state.rating,
            uncertainty: state.uncertainty,
            matches: state.matches,
            wins: state.wins,
            losses: state.losses,
        })
        .collect();

    Ok(ReplaySummary {
        entries,
        processed_events,
        skipped_events,
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    Placement,
    Exploration,
    Refinement,
}

impl MatchPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Placement => "placement",
            Self::Exploration => "exploration",
            Self::Refinement => "refinement",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "placement" => Some(Self::Placement),
            "exploration" => Some(Self::Exploration),
            "refinement" => Some(Self::Refinement),
            _ => None,
        }
    }
}

/// The sampler's pick: two photos in presentation order plus the policy
/// that chose them and a human-readable rationale. The rationale is for
/// observability only; nothing downstream branches on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchProposal {
    pub left: PhotoId,
    pub right: PhotoId,
    pub policy: MatchPolicy,
    pub rationale: String,
}

impl MatchProposal {
    #[must_use]
    pub fn involves_same_photos(&self, a: &PhotoId, b: &PhotoId) -> bool {
        (self.left == *a && self.right == *b) || (self.left == *b && self.right == *a)
    }
}

/// Picks the next pair to present.
///
/// A single draw dispatches between the three policies: placement runs
/// whenever unplaced photos exist (skipped with a small fixed probability),
/// exploration fires with its own fixed probability, refinement takes the
/// remainder. A candidate identical to `recent_pair` is redrawn up to
/// `repeat_retry_limit` times, then accepted anyway rather than looping.
/// Left/right order is randomized independently of selection.
///
/// # Errors
/// Returns [`RankError::InsufficientItems`] when the snapshot holds fewer
/// than two photos and [`RankError::Configuration`] for an invalid config.
pub fn select_pair(
    snapshot: &[RankedPhoto],
    recent_pair: Option<(&PhotoId, &PhotoId)>,
    config: &RatingConfig,
    rng: &mut impl Rng,
) -> Result<MatchProposal, RankError> {
    config.validate()?;

    if snapshot.len() < 2 {
        return Err(RankError::InsufficientItems {
            available: snapshot.len(),
        });
    }

    let mut proposal = draw_candidate(snapshot, config, rng);
    if let Some((recent_a, recent_b)) = recent_pair {
        let mut attempts = 0_u32;
        while proposal.involves_same_photos(recent_a, recent_b)
            && attempts < config.repeat_retry_limit
        {
            proposal = draw_candidate(snapshot, config, rng);
            attempts += 1;
        }
    }

    if rng.random::<f64>() < 0.5 {
        std::mem::swap(&mut proposal.left, &mut proposal.right);
    }

    Ok(proposal)
}

// Callers hold the >= 2 guarantee, so every branch below yields a pair.
fn draw_candidate(
    snapshot: &[RankedPhoto],
    config: &RatingConfig,
    rng: &mut impl Rng,
) -> MatchProposal {
    let roll = rng.random::<f64>();
    let has_unplaced = snapshot.iter().any(|entry| entry.matches == 0);

    if has_unplaced && roll >= config.placement_skip_probability {
        if let Some(proposal) = placement_pair(snapshot, config, rng) {
            return proposal;
        }
    }

    if roll < config.exploration_probability {
        if let Some(proposal) = exploration_pair(snapshot, rng) {
            return proposal;
        }
    }

    refinement_pair(snapshot, config, rng)
        .expect("snapshot holds >= 2 photos, so refinement always yields a pair")
}

/// Onboards a never-matched photo against a stable, near-average anchor.
/// Degrades to any already-matched photo, then to any other photo, when no
/// anchor qualifies. Returns `None` when no photo has zero matches or the
/// snapshot is too small.
#[must_use]
pub fn placement_pair(
    snapshot: &[RankedPhoto],
    config: &RatingConfig,
    rng: &mut impl Rng,
) -> Option<MatchProposal> {
    if snapshot.len() < 2 {
        return None;
    }

    let unplaced: Vec<usize> = (0..snapshot.len())
        .filter(|&idx| snapshot[idx].matches == 0)
        .collect();
    let subject = *pick_uniform(&unplaced, rng)?;

    let anchors: Vec<usize> = (0..snapshot.len())
        .filter(|&idx| {
            idx != subject
                && snapshot[idx].matches >= config.anchor_min_matches
                && (snapshot[idx].rating - config.initial_rating).abs()
                    <= config.anchor_rating_band
        })
        .collect();
    let matched: Vec<usize> = (0..snapshot.len())
        .filter(|&idx| idx != subject && snapshot[idx].matches > 0)
        .collect();
    let others: Vec<usize> = (0..snapshot.len()).filter(|&idx| idx != subject).collect();

    let opponent = *pick_uniform(&anchors, rng)
        .or_else(|| pick_uniform(&matched, rng))
        .or_else(|| pick_uniform(&others, rng))?;

    Some(MatchProposal {
        left: snapshot[subject].id.clone(),
        right: snapshot[opponent].id.clone(),
        policy: MatchPolicy::Placement,
        rationale: "classifying new asset".to_string(),
    })
}

/// Two distinct photos uniformly at random, ignoring rating and
/// uncertainty. Keeps refinement from converging on a closed subset.
#[must_use]
pub fn exploration_pair(snapshot: &[RankedPhoto], rng: &mut impl Rng) -> Option<MatchProposal> {
    if snapshot.len() < 2 {
        return None;
    }

    let first = rng.random_range(0..snapshot.len());
    let mut second = rng.random_range(0..snapshot.len() - 1);
    if second >= first {
        second += 1;
    }

    Some(MatchProposal {
        left: snapshot[first].id.clone(),
        right: snapshot[second].id.clone(),
        policy: MatchPolicy::Exploration,
        rationale: "exploration mode".to_string(),
    })
}

/// Hones the least-settled photos: side A drawn from the most uncertain
/// pool, side B the photo rated closest to A (first-seen tie-break).
#[must_use]
pub fn refinement_pair(
    snapshot: &[RankedPhoto],
    config: &RatingConfig,
    rng: &mut impl Rng,
) -> Option<MatchProposal> {
    if snapshot.len() < 2 {
        return None;
    }

    let mut by_uncertainty: Vec<usize> = (0..snapshot.len()).collect();
    by_uncertainty.sort_by(|&a, &b| {
        snapshot[b]
            .uncertainty
            .partial_cmp(&snapshot[a].uncertainty)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let pool_len = config.refinement_pool_size.min(by_uncertainty.len());
    let subject = by_uncertainty[rng.random_range(0..pool_len)];

    let mut opponent: Option<usize> = None;
    let mut best_gap = f64::INFINITY;
    for (idx, entry) in snapshot.iter().enumerate() {
        if idx == subject {
            continue;
        }
        let gap = (entry.rating - snapshot[subject].rating).abs();
        if gap < best_gap {
            best_gap = gap;
            opponent = Some(idx);
        }
    }
    let opponent = opponent?;

    let volatile = snapshot[subject].uncertainty > config.volatile_uncertainty
        || snapshot[opponent].uncertainty > config.volatile_uncertainty;
    let rationale = if volatile {
        "refinement: volatile rating".to_string()
    } else if best_gap <= config.equivalent_rating_gap {
        "refinement: statistically equivalent".to_string()
    } else {
        "refinement".to_string()
    };

    Some(MatchProposal {
        left: snapshot[subject].id.clone(),
        right: snapshot[opponent].id.clone(),
        policy: MatchPolicy::Refinement,
        rationale,
    })
}

fn pick_uniform<'a, T>(candidates: &'a [T], rng: &mut impl Rng) -> Option<&'a T> {
    if candidates.is_empty() {
        return None;
    }
    Some(&candidates[rng.random_range(0..candidates.len())])
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`RankError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, RankError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| RankError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(RankError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`RankError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, RankError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| RankError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
