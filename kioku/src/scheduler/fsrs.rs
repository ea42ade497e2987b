//! FSRS scheduling as a pure function over a card's stored state.
//!
//! Both replicas run this exact code, so a review produces bit-identical
//! card state on the client and on the server: no randomness, no fuzz, no
//! clock reads beyond the `reviewed_at` argument. The forgetting curve is
//! exponential: retrievability after `t` days at stability `S` is
//! `exp(ln 0.9 * t / S)`, i.e. retention drops to 90% once `t = S`.

use super::{Rating, State, number_to_rating, number_to_state, rating_to_number, state_to_number};
use crate::{
    Error, LibraryError, SchedulerErrorKind,
    model::{Card, MAX_SCHEDULED_DAYS, RatingId, ReviewLog},
};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// FSRS weight table.
///
/// - `w[0..=3]`: initial stability per rating (Again, Hard, Good, Easy).
/// - `w[4]`, `w[5]`: initial difficulty intercept and per-rating slope.
/// - `w[6]`: difficulty delta per rating step; `w[7]`: mean-reversion weight.
/// - `w[8..=10]`: recall stability growth parameters.
/// - `w[11..=14]`: post-lapse stability parameters.
/// - `w[15]`: hard penalty; `w[16]`: easy bonus.
pub const DEFAULT_WEIGHTS: [f64; 17] = [
    0.4, 0.6, 2.4, 5.8, 4.93, 0.94, 0.86, 0.01, 1.49, 0.14, 0.94, 2.18, 0.05, 0.34, 1.26, 0.29,
    2.61,
];

/// Interval scaling per rating (Again, Hard, Good, Easy). Applied to the new
/// stability before rounding to whole days; the 1-day minimum keeps a lapsed
/// card on the next day's queue.
const INTERVAL_FACTOR: [f64; 4] = [0.0, 0.8, 1.0, 1.3];

const MIN_DIFFICULTY: f64 = 1.0;
const MAX_DIFFICULTY: f64 = 10.0;
const MIN_STABILITY: f64 = 0.01;

#[derive(Clone, Debug)]
pub struct Fsrs {
    pub weights: [f64; 17],
    pub maximum_interval_days: i64,
}

impl Default for Fsrs {
    fn default() -> Self {
        Self {
            weights: DEFAULT_WEIGHTS,
            maximum_interval_days: MAX_SCHEDULED_DAYS,
        }
    }
}

impl Fsrs {
    /// Applies one review to `card` and returns the next card state together
    /// with the review log entry. The log's `id` is left nil; the caller
    /// assigns one when persisting.
    pub fn schedule(
        &self,
        card: &Card,
        rating: RatingId,
        reviewed_at: DateTime<Utc>,
        duration_ms: i64,
    ) -> Result<(Card, ReviewLog), Error> {
        let previous_state = number_to_state(card.state).ok_or(Error::Library(
            LibraryError::Scheduler(SchedulerErrorKind::InvalidState(card.state)),
        ))?;
        let rating_enum = number_to_rating(rating).ok_or(Error::Library(
            LibraryError::Scheduler(SchedulerErrorKind::InvalidRating(rating)),
        ))?;

        let elapsed_days = card
            .last_review
            .map_or(0, |last| (reviewed_at - last).num_days().max(0));

        let (stability, difficulty) = if previous_state == State::New {
            (
                self.initial_stability(rating_enum),
                self.initial_difficulty(rating_enum),
            )
        } else {
            let retrievability = self.retrievability(elapsed_days, card.stability);
            let difficulty = self.next_difficulty(card.difficulty, rating_enum);
            let stability = match rating_enum {
                Rating::Again => {
                    self.lapse_stability(card.stability, card.difficulty, retrievability)
                }
                Rating::Hard | Rating::Good | Rating::Easy => self.recall_stability(
                    card.stability,
                    card.difficulty,
                    retrievability,
                    rating_enum,
                ),
            };
            (stability, difficulty)
        };

        let scheduled_days = self.next_interval(stability, rating_enum);
        let state = next_state(previous_state, rating_enum);

        let new_card = Card {
            state: state_to_number(state),
            due: reviewed_at + Duration::days(scheduled_days),
            stability,
            difficulty,
            elapsed_days,
            scheduled_days,
            reps: card.reps + 1,
            lapses: card.lapses + i64::from(rating_enum == Rating::Again),
            last_review: Some(reviewed_at),
            updated_at: reviewed_at,
            ..card.clone()
        };
        let review_log = ReviewLog {
            id: Uuid::nil(),
            user_id: card.user_id,
            card_id: card.id,
            rating: rating_to_number(rating_enum),
            previous_state: card.state,
            elapsed_days,
            scheduled_days,
            stability,
            difficulty,
            reviewed_at,
            duration_ms,
            created_at: reviewed_at,
            sync_version: 0,
        };
        Ok((new_card, review_log))
    }

    /// `R(t) = exp(ln 0.9 * t / S)`: the fraction of cards still remembered
    /// after `t` days at stability `S`.
    pub fn retrievability(&self, elapsed_days: i64, stability: f64) -> f64 {
        if stability < MIN_STABILITY {
            return 1.0;
        }
        (0.9_f64.ln() * elapsed_days as f64 / stability).exp()
    }

    fn initial_stability(&self, rating: Rating) -> f64 {
        self.weights[(rating_to_number(rating) - 1) as usize]
    }

    fn initial_difficulty(&self, rating: Rating) -> f64 {
        let grade = f64::from(rating_to_number(rating));
        (self.weights[4] - (grade - 3.0) * self.weights[5]).clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
    }

    /// Linear pull per rating step, then mean reversion toward the initial
    /// Good difficulty so difficulty cannot drift without bound.
    fn next_difficulty(&self, difficulty: f64, rating: Rating) -> f64 {
        let grade = f64::from(rating_to_number(rating));
        let pulled = difficulty - self.weights[6] * (grade - 3.0);
        let target = self.weights[4];
        (self.weights[7] * target + (1.0 - self.weights[7]) * pulled)
            .clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
    }

    /// Stability after a successful recall. The growth term is non-negative,
    /// so stability never shrinks on Hard/Good/Easy.
    fn recall_stability(
        &self,
        stability: f64,
        difficulty: f64,
        retrievability: f64,
        rating: Rating,
    ) -> f64 {
        let hard_penalty = if rating == Rating::Hard {
            self.weights[15]
        } else {
            1.0
        };
        let easy_bonus = if rating == Rating::Easy {
            self.weights[16]
        } else {
            1.0
        };
        let growth = self.weights[8].exp()
            * (11.0 - difficulty)
            * stability.powf(-self.weights[9])
            * ((self.weights[10] * (1.0 - retrievability)).exp() - 1.0)
            * hard_penalty
            * easy_bonus;
        (stability * (1.0 + growth)).max(MIN_STABILITY)
    }

    /// Stability after a lapse (Again).
    fn lapse_stability(&self, stability: f64, difficulty: f64, retrievability: f64) -> f64 {
        (self.weights[11]
            * difficulty.powf(-self.weights[12])
            * ((stability + 1.0).powf(self.weights[13]) - 1.0)
            * (self.weights[14] * (1.0 - retrievability)).exp())
        .max(MIN_STABILITY)
    }

    fn next_interval(&self, stability: f64, rating: Rating) -> i64 {
        let factor = INTERVAL_FACTOR[(rating_to_number(rating) - 1) as usize];
        let days = (stability * factor).round() as i64;
        days.clamp(1, self.maximum_interval_days)
    }
}

/// State transition table. A new card initialises into Learning (or straight
/// into Review on Easy) and the transition is applied in the same review, so
/// New + Good lands in Review.
fn next_state(state: State, rating: Rating) -> State {
    match (state, rating) {
        (State::Review, Rating::Again) => State::Relearning,
        (State::Review, _) => State::Review,
        (_, Rating::Good | Rating::Easy) => State::Review,
        (State::New, Rating::Again | Rating::Hard) => State::Learning,
        (state, Rating::Again | Rating::Hard) => state,
    }
}
