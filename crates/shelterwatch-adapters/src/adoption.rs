//! Adoption wording in extracted text.

use shelterwatch_core::{ItemDraft, ItemStatus};

/// Phrases meaning the animal already went to a new owner.
pub const ADOPTED_KEYWORDS: &[&str] = &[
    "譲渡済み",
    "譲渡しました",
    "譲渡決定",
    "新しい飼い主さんが決まりました",
    "飼い主が決まりました",
    "譲渡先決定",
    "里親決定",
    "引き取られました",
    "already adopted",
    "adoption completed",
    "found a new home",
];

pub fn is_adopted(text: &str) -> bool {
    let lowered = text.to_lowercase();
    ADOPTED_KEYWORDS.iter().any(|k| lowered.contains(k))
}

pub fn status_from_text(text: &str) -> ItemStatus {
    if is_adopted(text) {
        ItemStatus::Adopted
    } else {
        ItemStatus::Available
    }
}

/// Status to persist for a draft: an explicit status wins, then the wording of
/// its status text or name. Descriptive fields are not scanned; they talk about
/// adoption in the future tense.
pub fn resolve_status(draft: &ItemDraft) -> ItemStatus {
    if let Some(status) = draft.status {
        return status;
    }
    let adopted = [draft.status_text.as_deref(), draft.name.as_deref()]
    .into_iter()
    .flatten()
    .any(is_adopted);

    if adopted {
        ItemStatus::Adopted
    } else {
        ItemStatus::Available
    }
}
