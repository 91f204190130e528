use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use taskboard::{
    error::StoreError,
    models::{NewCard, NewList, UpdateCard},
    reorder, schema,
    workspace::workspace_db_key,
    FsKv, KvStore, MemoryKv, SharedKv,
};
// Bring trait method namespaces into scope so calls on BoardStore resolve.
use taskboard::{BoardRepo, BoardStore, CardRepo, ListRepo};

/// Helper that returns a fresh store over its own in-memory slot.
fn store() -> (BoardStore, SharedKv) {
    let kv: SharedKv = Arc::new(MemoryKv::new());
    (BoardStore::open(kv.clone(), Some("ws_test")).unwrap(), kv)
}

fn card(list_id: i64, title: &str, position: i64) -> NewCard {
    NewCard { list_id, title: title.into(), position, ..Default::default() }
}

#[test]
fn names_are_trimmed_and_ids_unique() {
    let (s, _) = store();
    let b = s.create_board("  Work  ").unwrap();
    assert_eq!(b.name, "Work");
    let l1 = s.create_list(NewList { board_id: b.id, name: " Doing ".into(), position: 0 }).unwrap();
    let l2 = s.create_list(NewList { board_id: b.id, name: "Done".into(), position: 1 }).unwrap();
    assert_eq!(l1.name, "Doing");
    assert_ne!(l1.id, l2.id);

    let c1 = s.create_card(card(l1.id, "\tfirst\n", 0)).unwrap();
    let c2 = s.create_card(card(l1.id, "second", 1)).unwrap();
    assert_eq!(c1.title, "first");
    assert_ne!(c1.id, c2.id);

    // blank names never reach the table
    assert!(matches!(s.create_board("   "), Err(StoreError::Validation(_))));
    assert!(matches!(
        s.create_list(NewList { board_id: b.id, name: "".into(), position: 2 }),
        Err(StoreError::Validation(_))
    ));
    assert!(matches!(s.create_card(card(l1.id, " ", 2)), Err(StoreError::Validation(_))));
    assert_eq!(s.lists_by_board(b.id).unwrap().len(), 2);
    assert_eq!(s.cards_by_list(l1.id).unwrap().len(), 2);
}

#[test]
fn delete_board_cascades_transitively() {
    let (s, _) = store();
    let keep = s.create_board("Keep").unwrap();
    let gone = s.create_board("Gone").unwrap();
    let kept_list = s.create_list(NewList { board_id: keep.id, name: "K".into(), position: 0 }).unwrap();
    let kept_card = s.create_card(card(kept_list.id, "stays", 0)).unwrap();

    let mut lists = Vec::new();
    let mut cards = Vec::new();
    for i in 0..3 {
        let l = s.create_list(NewList { board_id: gone.id, name: format!("L{i}"), position: i }).unwrap();
        for j in 0..2 {
            cards.push(s.create_card(card(l.id, &format!("C{i}{j}"), j)).unwrap().id);
        }
        lists.push(l.id);
    }

    let removed = s.delete_board(gone.id).unwrap();
    assert_eq!(removed.boards, vec![gone.id]);
    assert_eq!(removed.lists.len(), 3);
    assert_eq!(removed.cards.len(), 6);

    assert!(s.get_board(gone.id).unwrap().is_none());
    for id in lists {
        assert!(s.get_list(id).unwrap().is_none());
        assert!(s.cards_by_list(id).unwrap().is_empty());
    }
    for id in cards {
        assert!(s.get_card(id).unwrap().is_none());
    }
    assert_eq!(s.get_card(kept_card.id).unwrap().unwrap().title, "stays");
    assert_eq!(s.lists_by_board(keep.id).unwrap().len(), 1);
}

#[test]
fn move_card_to_front_scenario() {
    let (s, _) = store();
    let board = s.create_board("Mi Tablero").unwrap();
    let todo = s.create_list(NewList { board_id: board.id, name: "To Do".into(), position: 0 }).unwrap();
    let _a = s.create_card(card(todo.id, "A", 0)).unwrap();
    let b = s.create_card(card(todo.id, "B", 1)).unwrap();

    reorder::move_card(&s, b.id, todo.id, 0).unwrap();

    let cards = s.cards_by_list(todo.id).unwrap();
    assert_eq!(cards.iter().map(|c| c.title.as_str()).collect::<Vec<_>>(), vec!["B", "A"]);
    assert_eq!(cards.iter().map(|c| c.position).collect::<Vec<_>>(), vec![0, 1]);
}

#[test]
fn reorder_sequences_leave_dense_positions() {
    let (s, _) = store();
    let board = s.create_board("Plan").unwrap();
    let left = s.create_list(NewList { board_id: board.id, name: "Left".into(), position: 0 }).unwrap();
    let right = s.create_list(NewList { board_id: board.id, name: "Right".into(), position: 1 }).unwrap();
    // sparse, colliding starting positions
    let ids: Vec<i64> = [5, 5, 9, 40, 41]
        .iter()
        .enumerate()
        .map(|(i, pos)| s.create_card(card(left.id, &format!("c{i}"), *pos)).unwrap().id)
        .collect();

    let mut expected_left = ids.clone();
    let mut expected_right: Vec<i64> = Vec::new();
    let moves = [(ids[4], left.id, 0), (ids[0], left.id, 99), (ids[2], right.id, 0), (ids[1], right.id, 0), (ids[3], left.id, 1)];
    for (card_id, dest, index) in moves {
        expected_left.retain(|id| *id != card_id);
        expected_right.retain(|id| *id != card_id);
        let target = if dest == left.id { &mut expected_left } else { &mut expected_right };
        reorder::splice(target, card_id, index);

        let outcome = reorder::move_card(&s, card_id, dest, index).unwrap();
        assert_eq!(
            outcome.destination.iter().map(|c| c.position).collect::<Vec<_>>(),
            (0..outcome.destination.len() as i64).collect::<Vec<_>>()
        );
    }

    for (list_id, expected) in [(left.id, expected_left), (right.id, expected_right)] {
        let cards = s.cards_by_list(list_id).unwrap();
        assert_eq!(cards.iter().map(|c| c.id).collect::<Vec<_>>(), expected);
        assert_eq!(cards.iter().map(|c| c.position).collect::<Vec<_>>(), (0..cards.len() as i64).collect::<Vec<_>>());
    }
}

#[test]
fn move_list_renumbers_siblings() {
    let (s, _) = store();
    let board = s.create_board("Lists").unwrap();
    let names = ["a", "b", "c"];
    let ids: Vec<i64> = names
        .iter()
        .enumerate()
        .map(|(i, n)| s.create_list(NewList { board_id: board.id, name: (*n).into(), position: i as i64 * 10 }).unwrap().id)
        .collect();
    let lists = reorder::move_list(&s, ids[2], 0).unwrap();
    assert_eq!(lists.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(), vec!["c", "a", "b"]);
    assert_eq!(lists.iter().map(|l| l.position).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(matches!(reorder::move_list(&s, 9999, 0), Err(StoreError::NotFound)));
    assert!(matches!(reorder::move_card(&s, 9999, ids[0], 0), Err(StoreError::NotFound)));
}

#[test]
fn round_trip_through_persisted_bytes() {
    let (s, kv) = store();
    let board = s.create_board("Trip").unwrap();
    let list = s.create_list(NewList { board_id: board.id, name: "Bags".into(), position: 0 }).unwrap();
    s.create_card(NewCard { description: Some("passport".into()), ..card(list.id, "Docs", 1) }).unwrap();
    s.create_card(card(list.id, "Tickets", 0)).unwrap();

    let image = s.export().unwrap();
    assert_eq!(kv.get(&workspace_db_key("ws_test")).unwrap().unwrap(), image);

    let fresh: SharedKv = Arc::new(MemoryKv::new());
    fresh.set(&workspace_db_key("ws_copy"), &image).unwrap();
    let copy = BoardStore::open(fresh, Some("ws_copy")).unwrap();

    assert_eq!(copy.boards().unwrap(), s.boards().unwrap());
    for b in s.boards().unwrap() {
        let lists = s.lists_by_board(b.id).unwrap();
        assert_eq!(copy.lists_by_board(b.id).unwrap(), lists);
        for l in lists {
            assert_eq!(copy.cards_by_list(l.id).unwrap(), s.cards_by_list(l.id).unwrap());
        }
    }
}

#[test]
fn corrupt_bytes_surface_init_error_then_reset_recovers() {
    let kv: SharedKv = Arc::new(MemoryKv::new());
    kv.set(&workspace_db_key("ws_bad"), b"definitely not a database").unwrap();

    let err = BoardStore::open(kv.clone(), Some("ws_bad")).err().unwrap();
    assert!(matches!(err, StoreError::Init(_)));
    assert!(err.needs_reset());

    let s = BoardStore::reset(kv.clone(), Some("ws_bad")).unwrap();
    let boards = s.boards().unwrap();
    assert_eq!(boards.len(), 1);
    assert_eq!(boards[0].name, schema::DEFAULT_BOARD_NAME);

    // the recreated image now loads cleanly
    assert_eq!(BoardStore::open(kv, Some("ws_bad")).unwrap().boards().unwrap().len(), 1);
}

#[test]
fn open_or_reset_recovers_silently() {
    let kv: SharedKv = Arc::new(MemoryKv::new());
    kv.set("trello-db", &[0u8; 512]).unwrap();
    let s = BoardStore::open_or_reset(kv, None).unwrap();
    assert_eq!(s.db_key(), "trello-db");
    assert_eq!(s.boards().unwrap().len(), 1);
}

#[test]
fn updates_on_missing_ids_are_no_ops() {
    let (s, kv) = store();
    let before = kv.get(&workspace_db_key("ws_test")).unwrap();
    assert!(!s.update_board(404, "x").unwrap());
    assert!(!s.update_list(404, "x").unwrap());
    assert!(!s.update_list_position(404, 3).unwrap());
    assert!(!s.update_card(404, UpdateCard { title: "x".into(), ..Default::default() }).unwrap());
    assert!(!s.update_card_position(404, 1, 0).unwrap());
    assert_eq!(s.boards().unwrap().len(), 1);
    assert_eq!(kv.get(&workspace_db_key("ws_test")).unwrap(), before);
}

#[test]
fn card_images_are_validated_and_stored_as_data_uris() {
    let (s, _) = store();
    let board = s.create_board("Pics").unwrap();
    let list = s.create_list(NewList { board_id: board.id, name: "Gallery".into(), position: 0 }).unwrap();

    let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    png.resize(64, 0);
    let uri = format!("data:image/png;base64,{}", STANDARD.encode(&png));
    let c = s.create_card(NewCard { image: Some(uri.clone()), ..card(list.id, "pic", 0) }).unwrap();
    assert_eq!(s.get_card(c.id).unwrap().unwrap().image, Some(uri));

    let text = format!("data:text/plain;base64,{}", STANDARD.encode(b"hello"));
    assert!(matches!(
        s.create_card(NewCard { image: Some(text), ..card(list.id, "txt", 1) }),
        Err(StoreError::Validation(_))
    ));

    // clearing the image
    assert!(s.update_card(c.id, UpdateCard { title: "pic".into(), description: None, image: Some(String::new()) }).unwrap());
    assert_eq!(s.get_card(c.id).unwrap().unwrap().image, None);
}

#[test]
fn fs_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let board_id = {
        let kv: SharedKv = Arc::new(FsKv::new(dir.path()));
        let s = BoardStore::open(kv, Some("ws_disk")).unwrap();
        s.create_board("On disk").unwrap().id
    };
    let kv: SharedKv = Arc::new(FsKv::new(dir.path()));
    let s = BoardStore::open(kv, Some("ws_disk")).unwrap();
    assert_eq!(s.get_board(board_id).unwrap().unwrap().name, "On disk");
    assert_eq!(s.boards().unwrap().len(), 2);
}
