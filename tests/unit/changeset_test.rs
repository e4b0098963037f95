//! Tests for change records and event conversion

use durable_relay::core::{
    event_name, Changeset, DecodedValue, Encoding, Event, Operation, TxnUnwrapper, Watermark,
};

const UPDATE_JSON: &str = r#"{
    "watermark": {"lsn": 4294967456, "server_time_ms": 1700000000123},
    "operation": "UPDATE",
    "data": {
        "table": "accounts",
        "old": {"id": {"encoding": "i", "data": 9}},
        "new": {
            "id": {"encoding": "i", "data": 9},
            "avatar": {"encoding": "b", "data": "AAEC"},
            "bio": {"encoding": "u", "data": null}
        },
        "txn_lsn": 4294967460
    }
}"#;

#[test]
fn test_changeset_parses_wire_form() {
    let cs: Changeset = serde_json::from_str(UPDATE_JSON).unwrap();
    assert_eq!(cs.watermark, Watermark::new(0x1_0000_00A0, 1_700_000_000_123));
    assert_eq!(cs.watermark.to_string(), "1/A0");
    assert_eq!(cs.operation, Operation::Update);

    let new = cs.data.new.as_ref().unwrap();
    assert_eq!(new["avatar"].encoding, Encoding::Binary);
    assert_eq!(new["avatar"].decode().unwrap(), DecodedValue::Bytes(vec![0, 1, 2]));
    assert_eq!(new["bio"].decode().unwrap(), DecodedValue::Unchanged);
    assert_eq!(cs.data.txn_lsn, Some(0x1_0000_00A4));
}

#[test]
fn test_event_from_changeset() {
    let cs: Changeset = serde_json::from_str(UPDATE_JSON).unwrap();
    let event = Event::from_changeset("pg", &cs).unwrap();

    assert_eq!(event.name, "pg/accounts.updated");
    assert_eq!(event.ts, 1_700_000_000_123);
    assert_eq!(event.data["old"]["id"]["data"], 9);
    assert!(event.data.get("truncated_tables").is_none());
    assert_eq!(event.payload().unwrap(), cs.data);
}

#[test]
fn test_event_name_without_table() {
    let begin = Changeset::new(Watermark::new(1, 0), Operation::Begin);
    assert_eq!(event_name("pg", &begin), "pg/tx-began");
}

#[test]
fn test_unwrapper_keeps_truncate_inside_multi_statement_txn() {
    let mut unwrapper = TxnUnwrapper::new();
    let mut out = Vec::new();
    for (lsn, op) in [
        (1, Operation::Begin),
        (2, Operation::Truncate),
        (3, Operation::Insert),
        (4, Operation::Commit),
        (5, Operation::Begin),
        (6, Operation::Delete),
        (7, Operation::Commit),
    ] {
        out.extend(unwrapper.process(Changeset::new(Watermark::new(lsn, 0), op)));
    }
    let lsns: Vec<u64> = out.iter().map(|c| c.watermark.lsn).collect();
    assert_eq!(lsns, vec![1, 2, 3, 4, 6]);
}

#[test]
fn test_truncate_payload_lists_tables() {
    let json = r#"{
        "watermark": {"lsn": 90, "server_time_ms": 1700000000500},
        "operation": "TRUNCATE",
        "data": {"truncated_tables": ["orders", "order_items"]}
    }"#;
    let cs: Changeset = serde_json::from_str(json).unwrap();
    assert_eq!(cs.operation, Operation::Truncate);
    assert!(cs.operation.is_dml());
    assert_eq!(cs.data.truncated_tables, vec!["orders", "order_items"]);

    let event = Event::from_changeset("pg", &cs).unwrap();
    assert_eq!(event.name, "pg/truncated");
    assert_eq!(event.data["truncated_tables"][1], "order_items");
}
