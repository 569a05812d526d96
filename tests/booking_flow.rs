use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use intake::tenant::{TenantManager, TenantSettings};
use intake::wire;

// ── Test infrastructure ──────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("intake_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, TenantSettings::default()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "intake".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(format!("branch_{}", Ulid::new()))
        .user("intake")
        .password("intake");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

/// A Monday far enough out that bookings are always in the future.
const BOOKING_DATE: &str = "2031-06-02";
/// Link expiry instant, also comfortably in the future.
const LINK_EXPIRY: i64 = 1_900_000_000_000;

async fn seed_candidate_and_link(client: &tokio_postgres::Client) -> (Ulid, String) {
    let cid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO candidates (id, first_name, status) VALUES ('{cid}', 'Robin', 'invite_sent')"
        ))
        .await
        .unwrap();

    let link_id = Ulid::new();
    let out = client
        .simple_query(&format!(
            "INSERT INTO links (id, candidate_id, kind, expires_at) VALUES ('{link_id}', '{cid}', 'interview', {LINK_EXPIRY})"
        ))
        .await
        .unwrap();
    let out = rows(out);
    assert_eq!(out.len(), 1);
    let token = out[0].get("token").unwrap().to_string();
    (cid, token)
}

// ── Tests ────────────────────────────────────────────────

#[tokio::test]
async fn full_booking_flow() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let (cid, token) = seed_candidate_and_link(&client).await;

    // Availability summary: one JSON row with the defaults
    let out = rows(
        client
            .simple_query(&format!("SELECT * FROM availability WHERE token = '{token}'"))
            .await
            .unwrap(),
    );
    assert_eq!(out.len(), 1);
    let payload: serde_json::Value =
        serde_json::from_str(out[0].get("availability").unwrap()).unwrap();
    assert_eq!(payload["slot_duration_min"], 30);
    assert_eq!(payload["first_name"], "Robin");

    // Slot listing for the target date
    let out = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM slots WHERE token = '{token}' AND date = '{BOOKING_DATE}'"
            ))
            .await
            .unwrap(),
    );
    assert!(!out.is_empty());
    assert_eq!(out[0].get("time").unwrap(), "09:00");
    assert_eq!(out[0].get("blocked").unwrap(), "f");

    // Book the 10:30 slot
    let out = rows(
        client
            .simple_query(&format!(
                "INSERT INTO bookings (token, date, time) VALUES ('{token}', '{BOOKING_DATE}', '10:30')"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(out.len(), 1);
    let interview_id = out[0].get("interview_id").unwrap().to_string();
    let code = out[0].get("confirmation_code").unwrap();
    assert_eq!(code.len(), 6);

    // The link is single-use: immediate reuse fails with the generic error
    let err = client
        .simple_query(&format!(
            "INSERT INTO bookings (token, date, time) VALUES ('{token}', '{BOOKING_DATE}', '14:00')"
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid or expired"));

    // The interview shows up for the operator
    let out = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM interviews WHERE date = '{BOOKING_DATE}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].get("id").unwrap(), interview_id);
    assert_eq!(out[0].get("candidate_id").unwrap(), cid.to_string());
    assert_eq!(out[0].get("time").unwrap(), "10:30");
    assert_eq!(out[0].get("status").unwrap(), "scheduled");
}

#[tokio::test]
async fn double_booking_rejected_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let (_cid_a, token_a) = seed_candidate_and_link(&client).await;
    let (_cid_b, token_b) = seed_candidate_and_link(&client).await;

    client
        .simple_query(&format!(
            "INSERT INTO bookings (token, date, time) VALUES ('{token_a}', '{BOOKING_DATE}', '10:00')"
        ))
        .await
        .unwrap();

    let err = client
        .simple_query(&format!(
            "INSERT INTO bookings (token, date, time) VALUES ('{token_b}', '{BOOKING_DATE}', '10:15')"
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("slot just taken"));

    // The losing caller re-lists and picks a clean slot
    client
        .simple_query(&format!(
            "INSERT INTO bookings (token, date, time) VALUES ('{token_b}', '{BOOKING_DATE}', '11:15')"
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn holiday_blocks_listing_and_booking() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let (_cid, token) = seed_candidate_and_link(&client).await;

    client
        .batch_execute(&format!(
            r#"INSERT INTO blocks (config) VALUES ('{{"bank_holidays":["{BOOKING_DATE}"]}}')"#
        ))
        .await
        .unwrap();

    let out = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM slots WHERE token = '{token}' AND date = '{BOOKING_DATE}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].get("blocked").unwrap(), "t");
    assert_eq!(out[0].get("reason").unwrap(), "holiday");

    let err = client
        .simple_query(&format!(
            "INSERT INTO bookings (token, date, time) VALUES ('{token}', '{BOOKING_DATE}', '10:00')"
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("holiday"));
}

#[tokio::test]
async fn unknown_token_fails_generically_everywhere() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let phantom = "A".repeat(43);
    for sql in [
        format!("SELECT * FROM availability WHERE token = '{phantom}'"),
        format!("SELECT * FROM slots WHERE token = '{phantom}' AND date = '{BOOKING_DATE}'"),
        format!(
            "INSERT INTO bookings (token, date, time) VALUES ('{phantom}', '{BOOKING_DATE}', '10:00')"
        ),
    ] {
        let err = client.simple_query(&sql).await.unwrap_err();
        assert!(
            err.to_string().contains("invalid or expired"),
            "expected the generic token error for {sql}"
        );
    }
}

#[tokio::test]
async fn operator_surface_round_trip() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let (cid, _token) = seed_candidate_and_link(&client).await;

    // Candidate status update
    client
        .batch_execute(&format!(
            "UPDATE candidates SET status = 'rejected', reason = 'failed screening' WHERE id = '{cid}'"
        ))
        .await
        .unwrap();

    // Schedule config write, then verify it drives the listing
    client
        .batch_execute(
            r#"INSERT INTO schedules (kind, config) VALUES ('interview', '{"slot_duration_min":60,"buffer_min":0}')"#,
        )
        .await
        .unwrap();

    let (_cid2, token2) = seed_candidate_and_link(&client).await;
    let out = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM slots WHERE token = '{token2}' AND date = '{BOOKING_DATE}'"
            ))
            .await
            .unwrap(),
    );
    // 09:00-17:00 in clean 60-minute steps
    assert_eq!(out.len(), 8);

    // Run-now sweeps acknowledge even when there is nothing to do
    client.batch_execute("SWEEP INTERVIEWS").await.unwrap();
    client.batch_execute("SWEEP LINKS").await.unwrap();

    // Listen on the candidate channel is acknowledged
    client.batch_execute(&format!("LISTEN candidate_{cid}")).await.unwrap();
}

#[tokio::test]
async fn malformed_schedule_config_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let err = client
        .batch_execute(r#"INSERT INTO schedules (kind, config) VALUES ('interview', 'not json')"#)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bad schedule config"));

    let err = client
        .batch_execute(
            r#"INSERT INTO schedules (kind, config) VALUES ('interview', '{"slot_duration_min":0}')"#,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("slot duration"));
}
