//! Drag-and-drop reordering on top of the repository's raw position updates.
//!
//! The store never renumbers on its own. These helpers splice the moved entity
//! into its destination and rewrite every affected sibling to `0..n-1`.

use crate::error::{StoreError, StoreResult};
use crate::models::{Card, Id, List};
use crate::repo::{CardRepo, ListRepo};

/// Siblings touched by a card move, in final order.
#[derive(Debug, Clone, Default)]
pub struct CardMove {
    pub destination: Vec<Card>,
    /// Empty when the card stayed in its list.
    pub source: Vec<Card>,
}

/// Remove `item` from `order` and reinsert it at `index` (clamped). Returns the final index.
pub fn splice<T: PartialEq + Copy>(order: &mut Vec<T>, item: T, index: usize) -> usize {
    order.retain(|x| *x != item);
    let at = index.min(order.len());
    order.insert(at, item);
    at
}

pub fn move_card<R: CardRepo + ?Sized>(
    repo: &R,
    card_id: Id,
    dest_list_id: Id,
    index: usize,
) -> StoreResult<CardMove> {
    let card = repo.get_card(card_id)?.ok_or(StoreError::NotFound)?;
    let source_list_id = card.list_id;

    let dest_cards = repo.cards_by_list(dest_list_id)?;
    let mut order: Vec<Id> = dest_cards.iter().map(|c| c.id).collect();
    let at = splice(&mut order, card_id, index);
    repo.update_card_position(card_id, dest_list_id, at as i64)?;

    for (pos, id) in order.iter().enumerate() {
        let current = dest_cards.iter().find(|c| c.id == *id).map(|c| c.position);
        if *id != card_id && current != Some(pos as i64) {
            repo.update_card_position(*id, dest_list_id, pos as i64)?;
        }
    }

    let source = if source_list_id != dest_list_id {
        renumber_cards(repo, source_list_id)?
    } else {
        Vec::new()
    };
    Ok(CardMove { destination: repo.cards_by_list(dest_list_id)?, source })
}

/// Rewrite a list's card positions to `0..n-1`, keeping their current order.
pub fn renumber_cards<R: CardRepo + ?Sized>(repo: &R, list_id: Id) -> StoreResult<Vec<Card>> {
    let cards = repo.cards_by_list(list_id)?;
    for (pos, card) in cards.iter().enumerate() {
        if card.position != pos as i64 {
            repo.update_card_position(card.id, list_id, pos as i64)?;
        }
    }
    repo.cards_by_list(list_id)
}

/// Reorder a list within its board.
pub fn move_list<R: ListRepo + ?Sized>(repo: &R, list_id: Id, index: usize) -> StoreResult<Vec<List>> {
    let list = repo.get_list(list_id)?.ok_or(StoreError::NotFound)?;
    let siblings = repo.lists_by_board(list.board_id)?;
    let mut order: Vec<Id> = siblings.iter().map(|l| l.id).collect();
    splice(&mut order, list_id, index);
    for (pos, id) in order.iter().enumerate() {
        let current = siblings.iter().find(|l| l.id == *id).map(|l| l.position);
        if current != Some(pos as i64) {
            repo.update_list_position(*id, pos as i64)?;
        }
    }
    repo.lists_by_board(list.board_id)
}
