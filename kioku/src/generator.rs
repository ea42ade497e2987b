//! Deterministic expansion of a note into its cards.
//!
//! Both replicas run this on every note create/update: the client generates
//! cards locally so they exist offline, and the server regenerates them on
//! push to check agreement. A note always yields exactly one card, or exactly
//! two when its note type is reversible (the second with swapped faces and
//! `is_reversed = true`).

use crate::{
    Error, LibraryError, NoteErrorKind,
    model::{Card, Note, NoteFieldType, NoteFieldValue, NoteType},
};
use chrono::{DateTime, Utc};
use fancy_regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^{}]+)\}\}").unwrap());

/// Substitutes `{{FieldName}}` placeholders with the note's field values.
/// Unknown placeholders render as the empty string.
pub fn render_template(template: &str, values: &HashMap<&str, &str>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut cursor = 0;
    for capture in PLACEHOLDER.captures_iter(template).flatten() {
        let whole = capture.get(0).unwrap();
        let name = capture.get(1).unwrap().as_str().trim();
        rendered.push_str(&template[cursor..whole.start()]);
        rendered.push_str(values.get(name).copied().unwrap_or(""));
        cursor = whole.end();
    }
    rendered.push_str(&template[cursor..]);
    rendered
}

/// The rendered faces of a note, before they are attached to cards.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedFaces {
    pub front: String,
    pub back: String,
}

fn field_values_by_name<'a>(
    field_types: &'a [NoteFieldType],
    field_values: &'a [NoteFieldValue],
) -> Result<HashMap<&'a str, &'a str>, Error> {
    let mut values = HashMap::new();
    for field_type in field_types {
        let value = field_values
            .iter()
            .find(|v| v.note_field_type_id == field_type.id)
            .ok_or_else(|| {
                Error::Library(LibraryError::Note(NoteErrorKind::MissingFieldValue {
                    name: field_type.name.clone(),
                }))
            })?;
        values.insert(field_type.name.as_str(), value.value.as_str());
    }
    Ok(values)
}

/// Renders the note's faces: element 0 is the normal card, element 1 (present
/// only for reversible note types) the reversed card.
pub fn render_faces(
    note_type: &NoteType,
    field_types: &[NoteFieldType],
    field_values: &[NoteFieldValue],
) -> Result<Vec<RenderedFaces>, Error> {
    let values = field_values_by_name(field_types, field_values)?;
    let front = render_template(&note_type.front_template, &values);
    let back = render_template(&note_type.back_template, &values);
    let mut faces = vec![RenderedFaces {
        front: front.clone(),
        back: back.clone(),
    }];
    if note_type.is_reversible {
        faces.push(RenderedFaces {
            front: back,
            back: front,
        });
    }
    Ok(faces)
}

/// Materializes fresh cards for a newly created note. Cards start in the new
/// state, due immediately, and share the note's deck.
pub fn generate_cards(
    note: &Note,
    note_type: &NoteType,
    field_types: &[NoteFieldType],
    field_values: &[NoteFieldValue],
    at: DateTime<Utc>,
) -> Result<Vec<Card>, Error> {
    let faces = render_faces(note_type, field_types, field_values)?;
    Ok(faces
        .into_iter()
        .enumerate()
        .map(|(i, face)| {
            Card::new(
                note.user_id,
                note.id,
                note.deck_id,
                face.front,
                face.back,
                i == 1,
                at,
            )
        })
        .collect())
}

/// Recomputes `front`/`back` on a note's existing cards after a note update.
/// Ids and scheduling state are preserved; only the faces and `updated_at`
/// change. Returns the cards that actually changed.
pub fn refresh_cards(
    cards: &[Card],
    note_type: &NoteType,
    field_types: &[NoteFieldType],
    field_values: &[NoteFieldValue],
    at: DateTime<Utc>,
) -> Result<Vec<Card>, Error> {
    let faces = render_faces(note_type, field_types, field_values)?;
    let mut refreshed = Vec::new();
    for card in cards {
        let Some(face) = faces.get(usize::from(card.is_reversed)) else {
            continue;
        };
        if card.front != face.front || card.back != face.back {
            refreshed.push(Card {
                front: face.front.clone(),
                back: face.back.clone(),
                updated_at: at,
                ..card.clone()
            });
        }
    }
    Ok(refreshed)
}
