//! Review scheduling. The FSRS implementation lives in [`fsrs`]; this module
//! holds the state/rating vocabulary shared with the data model, which stores
//! both as plain integers (see `Card::state` and `ReviewLog::rating`).

mod fsrs;

pub use fsrs::{DEFAULT_WEIGHTS, Fsrs};

use crate::model::{RatingId, StateId};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum::Display, strum_macros::EnumIter)]
pub enum State {
    New,
    Learning,
    Review,
    Relearning,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum::Display, strum_macros::EnumIter)]
pub enum Rating {
    Again,
    Hard,
    Good,
    Easy,
}

pub fn number_to_rating(num: RatingId) -> Option<Rating> {
    match num {
        1 => Some(Rating::Again),
        2 => Some(Rating::Hard),
        3 => Some(Rating::Good),
        4 => Some(Rating::Easy),
        _ => None,
    }
}

pub fn rating_to_number(rating: Rating) -> RatingId {
    match rating {
        Rating::Again => 1,
        Rating::Hard => 2,
        Rating::Good => 3,
        Rating::Easy => 4,
    }
}

pub fn number_to_state(num: StateId) -> Option<State> {
    match num {
        0 => Some(State::New),
        1 => Some(State::Learning),
        2 => Some(State::Review),
        3 => Some(State::Relearning),
        _ => None,
    }
}

pub fn state_to_number(state: State) -> StateId {
    match state {
        State::New => 0,
        State::Learning => 1,
        State::Review => 2,
        State::Relearning => 3,
    }
}
