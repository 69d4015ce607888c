//! Undo registration.
//!
//! Mutations register the action that reverses them. [`UndoHistory`] keeps
//! the registered actions on undo/redo stacks; replaying an action is the
//! caller's job, and whatever the replay registers lands on the opposite
//! stack.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{DeckError, DocumentId, SlideId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UndoEntryId(pub u64);

impl fmt::Display for UndoEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UndoAction {
    DeleteSlides {
        document: DocumentId,
        slides: Vec<SlideId>,
    },
    UndeleteSlides {
        document: DocumentId,
        slides: Vec<SlideId>,
    },
    MoveSlide {
        document: DocumentId,
        slide: SlideId,
        previous: Option<SlideId>,
        next: Option<SlideId>,
    },
}

impl UndoAction {
    pub fn document(&self) -> DocumentId {
        match self {
            UndoAction::DeleteSlides { document, .. }
            | UndoAction::UndeleteSlides { document, .. }
            | UndoAction::MoveSlide { document, .. } => *document,
        }
    }
}

pub trait UndoRegistrar: Send + Sync {
    fn register(&self, action: UndoAction) -> UndoEntryId;

    /// Drops a registration that no longer applies. Returns whether it was
    /// still present.
    fn remove(&self, entry: UndoEntryId) -> bool;
}

/// Registrar for callers that keep no history.
#[derive(Debug, Default)]
pub struct NoopUndo {
    next_id: Mutex<u64>,
}

impl UndoRegistrar for NoopUndo {
    fn register(&self, _action: UndoAction) -> UndoEntryId {
        let mut next = self.next_id.lock();
        *next += 1;
        UndoEntryId(*next)
    }

    fn remove(&self, _entry: UndoEntryId) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Replay {
    #[default]
    None,
    Undoing,
    Redoing,
}

#[derive(Debug, Default)]
struct HistoryState {
    next_id: u64,
    undo_stack: Vec<(UndoEntryId, UndoAction)>,
    redo_stack: Vec<(UndoEntryId, UndoAction)>,
    replay: Replay,
}

#[derive(Debug, Default)]
pub struct UndoHistory {
    state: Mutex<HistoryState>,
}

impl UndoHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the most recent undo action. Registrations made until
    /// [`UndoHistory::end_replay`] go to the redo stack.
    pub fn pop_undo(&self) -> Result<UndoAction, DeckError> {
        let mut state = self.state.lock();
        let (_, action) = state
            .undo_stack
            .pop()
            .ok_or(DeckError::HistoryEmpty("undo stack"))?;
        state.replay = Replay::Undoing;
        Ok(action)
    }

    /// Takes the most recent redo action. Registrations made until
    /// [`UndoHistory::end_replay`] go back to the undo stack.
    pub fn pop_redo(&self) -> Result<UndoAction, DeckError> {
        let mut state = self.state.lock();
        let (_, action) = state
            .redo_stack
            .pop()
            .ok_or(DeckError::HistoryEmpty("redo stack"))?;
        state.replay = Replay::Redoing;
        Ok(action)
    }

    pub fn end_replay(&self) {
        self.state.lock().replay = Replay::None;
    }

    pub fn undo_len(&self) -> usize {
        self.state.lock().undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.state.lock().redo_stack.len()
    }

    pub fn peek_undo(&self) -> Option<UndoAction> {
        self.state
            .lock()
            .undo_stack
            .last()
            .map(|(_, action)| action.clone())
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.undo_stack.clear();
        state.redo_stack.clear();
    }
}

impl UndoRegistrar for UndoHistory {
    fn register(&self, action: UndoAction) -> UndoEntryId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = UndoEntryId(state.next_id);
        match state.replay {
            Replay::Undoing => state.redo_stack.push((id, action)),
            Replay::Redoing => state.undo_stack.push((id, action)),
            Replay::None => {
                state.undo_stack.push((id, action));
                state.redo_stack.clear();
            }
        }
        id
    }

    fn remove(&self, entry: UndoEntryId) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for stack in [&mut state.undo_stack, &mut state.redo_stack] {
            if let Some(index) = stack.iter().position(|(id, _)| *id == entry) {
                stack.remove(index);
                return true;
            }
        }
        false
    }
}
