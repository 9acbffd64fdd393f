//! Session behavior against the scripted guest.

#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::missing_docs_in_private_items)]

mod common;

use std::time::Duration;

use common::{FakeGuest, fast_config};
use proptest::prelude::*;
use tether::{Error, Reply, Session, SessionState, SymbolMask};
use tether_proto::READY;

fn frozen(guest: &FakeGuest) -> Session<impl tether::Connector> {
    let mut session = Session::connect(guest.connector(), fast_config()).unwrap();
    assert_eq!(session.state(), SessionState::Unknown);
    session.freeze().unwrap();
    assert_eq!(session.state(), SessionState::Frozen);
    session
}

#[test]
fn freeze_deploys_primitives_then_helper() {
    let guest = FakeGuest::new();
    let _session = frozen(&guest);

    let state = guest.state.lock().unwrap();
    assert_eq!(state.includes.first().unwrap(), "C:/Home/SerDir.HC");
    assert_eq!(state.includes.last().unwrap(), "C:/Home/SerPrint.HC");
    assert!(state.files.contains_key("C:/Home/SerPrint.HC"));
}

#[test]
fn operations_need_freeze() {
    let guest = FakeGuest::new();
    let mut session = Session::connect(guest.connector(), fast_config()).unwrap();
    assert!(matches!(session.list_dir("C:/Home/*"), Err(Error::NotFrozen)));
    assert!(session.is_ready(Duration::from_millis(500)));
    assert!(matches!(session.send(";").unwrap(), Reply::Plain(p) if p.is_empty()));
}

#[test]
fn evaluates_integer_expression() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);
    assert_eq!(session.evaluate_expression("2+2").unwrap(), 4);
}

#[test]
fn guest_fault_leaves_session_usable() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);

    match session.evaluate_expression("100/0") {
        Err(Error::GuestException(name)) => assert_eq!(name, "DivZero"),
        other => panic!("expected a guest exception, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Frozen);
    assert_eq!(session.evaluate_expression("6*7").unwrap(), 42);
}

#[test]
fn file_round_trip() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);

    session.write_file("C:/Home/x", b"hello").unwrap();
    assert_eq!(guest.file("C:/Home/x").unwrap(), b"hello");
    assert_eq!(
        session.read_file("C:/Home/x", Duration::from_secs(2)).unwrap(),
        b"hello"
    );

    let binary: Vec<u8> = (0u8..=255).filter(|&b| b != READY).collect();
    session.write_file("C:/Home/bin", &binary).unwrap();
    assert_eq!(
        session.read_file("C:/Home/bin", Duration::from_secs(2)).unwrap(),
        binary
    );
    assert!(session.file_exists("C:/Home/bin").unwrap());
    assert!(!session.file_exists("C:/Home/missing").unwrap());
}

#[test]
fn end_of_data_byte_is_refused_before_writing() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);

    let err = session.write_file("C:/Home/x", b"a\x04b").unwrap_err();
    assert!(matches!(err, Error::UnsendableData { offset: 1 }));
    assert_eq!(guest.file("C:/Home/x"), None);
    assert_eq!(session.state(), SessionState::Frozen);
    assert_eq!(session.evaluate_expression("2+3").unwrap(), 5);
}

#[test]
fn listing_drops_pseudo_entries() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);
    session.write_file("C:/Home/Notes.TXT", b"n").unwrap();

    let entries = session.list_dir("C:/Home/*").unwrap();
    assert!(entries.contains(&"C:/Home/Notes.TXT".to_owned()));
    assert!(entries.contains(&"C:/Home/SerPrint.HC".to_owned()));
    assert!(entries.iter().all(|e| !e.ends_with("/.") && !e.ends_with("/..")));
}

#[test]
fn denied_paths_are_refused_locally() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);
    let err = session
        .read_file("C:/Adam/AutoComplete/ACDefs.DATA", Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, Error::Denied(_)));
    assert_eq!(session.state(), SessionState::Frozen);
}

#[test]
fn near_terminator_bytes_stay_in_one_frame() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);

    let payload = session.exec("NEAR").unwrap();
    assert_eq!(payload.len(), 1 + 7 + 1 + 3);
    // Frame count intact: the next exchange lines up.
    assert_eq!(session.evaluate_expression("1+1").unwrap(), 2);
}

#[test]
fn symbols() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);

    assert!(session.symbol_exists("Print").unwrap());
    assert!(!session.symbol_exists("NoSuchFn").unwrap());
    let listed = session.list_symbols(SymbolMask::FUNCTIONS).unwrap();
    assert_eq!(listed, vec![("Print".to_owned(), "function".to_owned())]);
}

#[test]
fn string_eval_reports_thrown_code() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);

    assert_eq!(session.evaluate_string("GStrAdd(\"hi\");").unwrap(), "hi");
    assert!(matches!(
        session.evaluate_string("throw;"),
        Err(Error::GuestException(name)) if name == "exception"
    ));
    assert_eq!(session.state(), SessionState::Frozen);
}

#[test]
fn multi_line_commands_are_rejected() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);
    assert!(matches!(
        session.send("Print(1);\nPrint(2);"),
        Err(Error::InvalidCommand(_))
    ));
    assert!(session.is_ready(Duration::from_millis(500)));
}

#[test]
fn foreign_ack_kills_the_session() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);

    assert!(matches!(session.send("DESYNC"), Err(Error::ProtocolDesync(_))));
    assert_eq!(session.state(), SessionState::Dead);
    assert!(matches!(session.send(";"), Err(Error::SessionDead)));

    session.reconnect().unwrap();
    assert_eq!(session.state(), SessionState::Unknown);
    assert!(session.is_ready(Duration::from_millis(500)));
}

#[test]
fn timeout_then_failed_probe_marks_dead() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);

    let reply = session
        .send_with_timeout("while(1);", Duration::from_millis(150))
        .unwrap();
    assert!(reply.is_timeout());
    assert_eq!(session.state(), SessionState::Unknown);

    assert!(!session.is_ready(Duration::from_millis(200)));
    assert_eq!(session.state(), SessionState::Dead);
}

#[test]
fn late_reply_is_never_taken_for_the_next_command() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);

    let reply = session
        .send_with_timeout("SLOW", Duration::from_millis(100))
        .unwrap();
    assert!(reply.is_timeout());
    assert_eq!(session.state(), SessionState::Unknown);

    // The overdue frames are on the wire by now.
    std::thread::sleep(Duration::from_millis(400));
    assert!(matches!(session.send("SECOND"), Err(Error::ProtocolDesync(_))));
    assert_eq!(session.state(), SessionState::Dead);
    assert!(!session.is_ready(Duration::from_secs(1)));

    session.reconnect().unwrap();
    assert!(session.is_ready(Duration::from_secs(1)));
    assert!(matches!(session.send("SECOND").unwrap(), Reply::Plain(p) if p.is_empty()));
}

#[test]
fn liveness_check_after_timeout_does_not_revive_the_session() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);

    assert!(
        session
            .send_with_timeout("SLOW", Duration::from_millis(100))
            .unwrap()
            .is_timeout()
    );
    std::thread::sleep(Duration::from_millis(400));
    assert!(!session.is_ready(Duration::from_secs(1)));
    assert_eq!(session.state(), SessionState::Dead);
}

#[test]
fn closed_peer_is_connection_closed() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);

    session.unfreeze().unwrap();
    assert_eq!(session.state(), SessionState::Unfrozen);
    assert!(matches!(session.send(";"), Err(Error::ConnectionClosed)));
    assert_eq!(session.state(), SessionState::Dead);
}

#[test]
fn launched_program_blocks_exchanges_until_joined() {
    let guest = FakeGuest::new();
    let mut session = frozen(&guest);

    // No bridge configured: the fake loop returns at once.
    session.launch("#include \"C:/AI/AgentLoop.HC\";").unwrap();
    assert!(session.is_launched());
    assert!(matches!(session.send(";"), Err(Error::Busy)));
    assert!(!session.is_ready(Duration::from_millis(200)));
    assert_eq!(session.state(), SessionState::Frozen);

    let out = session.join_launched(Duration::from_secs(2)).unwrap();
    assert_eq!(out.as_deref(), Some(&b""[..]));
    assert!(!session.is_launched());
    assert_eq!(session.join_launched(Duration::from_secs(1)).unwrap(), None);
    assert_eq!(session.evaluate_expression("3*3").unwrap(), 9);
}

/// Arbitrary file contents without the end-of-data byte.
fn sendable_bytes() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(
        any::<u8>().prop_filter("end-of-data byte", |b| *b != READY),
        0..1024,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn sendable_files_read_back_identically(data in sendable_bytes()) {
        let guest = FakeGuest::new();
        let mut session = frozen(&guest);
        session.write_file("C:/Home/Prop.BIN", &data).unwrap();
        let back = session.read_file("C:/Home/Prop.BIN", Duration::from_secs(2)).unwrap();
        prop_assert_eq!(back, data);
    }

    #[test]
    fn data_with_end_of_data_byte_is_refused_at_first_offset(
        head in proptest::collection::vec(any::<u8>(), 0..64),
        tail in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let guest = FakeGuest::new();
        let mut session = frozen(&guest);
        let mut data = head;
        data.push(READY);
        data.extend(tail);
        let first = data.iter().position(|&b| b == READY).unwrap();

        let err = session.write_file("C:/Home/Prop.BIN", &data).unwrap_err();
        let is_unsendable_at_first =
            matches!(err, Error::UnsendableData { offset } if offset == first);
        prop_assert!(is_unsendable_at_first);
        prop_assert_eq!(guest.file("C:/Home/Prop.BIN"), None);
        prop_assert_eq!(session.state(), SessionState::Frozen);
    }

    #[test]
    fn every_command_consumes_exactly_its_own_frames(
        sums in proptest::collection::vec((0i64..10_000, 0i64..10_000), 1..8),
    ) {
        let guest = FakeGuest::new();
        let mut session = frozen(&guest);
        for (a, b) in sums {
            prop_assert_eq!(session.evaluate_expression(&format!("{a}+{b}")).unwrap(), a + b);
        }
        prop_assert!(session.is_ready(Duration::from_millis(500)));
    }
}
