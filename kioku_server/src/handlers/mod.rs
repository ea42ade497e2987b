use axum::{Json, http::HeaderMap, http::StatusCode, response::IntoResponse};
use kioku::{
    CardErrorKind, DeckErrorKind, Error, LibraryError, NoteErrorKind, NoteTypeErrorKind,
    SchedulerErrorKind, SyncErrorKind, schema::ErrorResponse,
};
use serde_json::json;
use uuid::Uuid;

pub mod review;
pub mod sync;

/// Authentication lives in a fronting collaborator; it forwards the
/// authenticated user in this header.
const USER_HEADER: &str = "x-user-id";

pub fn require_user(headers: &HeaderMap) -> Result<Uuid, (StatusCode, Json<ErrorResponse>)> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new(
                "UNAUTHENTICATED",
                "Missing or malformed user header.".to_string(),
            )),
        ))
}

#[allow(
    clippy::needless_pass_by_value,
    reason = "can easily call `.map_err()`"
)]
pub fn error_to_response(e: Error) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &e {
        Error::Library(library_error) => match library_error {
            LibraryError::NoteType(NoteTypeErrorKind::HasNotes(_)) => {
                (StatusCode::CONFLICT, "NOTE_TYPE_HAS_NOTES")
            }
            LibraryError::NoteType(NoteTypeErrorKind::NotFound(_))
            | LibraryError::Deck(DeckErrorKind::NotFound(_))
            | LibraryError::Note(NoteErrorKind::NotFound(_))
            | LibraryError::Card(CardErrorKind::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            LibraryError::Sync(SyncErrorKind::OwnershipViolation) => {
                (StatusCode::FORBIDDEN, "FORBIDDEN")
            }
            LibraryError::Scheduler(SchedulerErrorKind::InvalidRating(_)) => {
                (StatusCode::BAD_REQUEST, "INVALID_RATING")
            }
            LibraryError::Scheduler(SchedulerErrorKind::InvalidState(_)) => {
                (StatusCode::BAD_REQUEST, "INVALID_STATE")
            }
            LibraryError::Sync(
                SyncErrorKind::Validation(_)
                | SyncErrorKind::MissingParent(_)
                | SyncErrorKind::BadDocument(_),
            ) => (StatusCode::BAD_REQUEST, "INVALID_BATCH"),
            LibraryError::Card(CardErrorKind::DeckMismatch { .. }) => {
                (StatusCode::BAD_REQUEST, "DECK_MISMATCH")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        },
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };
    (status, Json(ErrorResponse::new(code, format!("{}", e))))
}

pub async fn health_check_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "message": "Kioku sync server"
    }))
}
