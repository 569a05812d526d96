use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use intake::tenant::{TenantManager, TenantSettings};
use intake::wire;

const BOOKING_DATE: &str = "2031-06-02";
const LINK_EXPIRY: i64 = 1_900_000_000_000;

async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("intake_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, TenantSettings::default()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "intake".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, db: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("intake")
        .password("intake");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// Mint one candidate + single-use link, returning the secret.
async fn mint_link(client: &tokio_postgres::Client) -> String {
    let cid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO candidates (id, first_name, status) VALUES ('{cid}', 'Bench', 'invite_sent')"
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
    out.into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(r) => r.get("token").map(str::to_string),
            _ => None,
        })
        .expect("link secret row")
}

#[tokio::main]
async fn main() {
    let addr = start_server().await;
    println!("stress: server on {addr}");

    let db = format!("bench_{}", Ulid::new());
    let admin = connect(addr, &db).await;

    // Wide-open schedule so the calendar never runs out of slots
    admin
        .batch_execute(
            r#"INSERT INTO schedules (kind, config) VALUES ('interview', '{"schedule":{"monday":{"enabled":true,"windows":[{"start":"00:00","end":"23:59"}]}},"slot_duration_min":5,"buffer_min":0,"min_notice_hours":0}')"#,
        )
        .await
        .unwrap();

    // Phase 1: slot listings under concurrency
    let token = mint_link(&admin).await;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = connect(addr, &db).await;
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(250);
            for _ in 0..250 {
                let started = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM slots WHERE token = '{token}' AND date = '{BOOKING_DATE}'"
                    ))
                    .await
                    .unwrap();
                latencies.push(started.elapsed());
            }
            latencies
        }));
    }
    let mut listing_latencies = Vec::new();
    for h in handles {
        listing_latencies.extend(h.await.unwrap());
    }
    print_latency("slot listing (8 conns x 250)", &mut listing_latencies);

    // Phase 2: sequential bookings, each with a fresh single-use link
    let mut booking_latencies = Vec::with_capacity(200);
    let mut minute = 0u32;
    for _ in 0..200 {
        let token = mint_link(&admin).await;
        let time = format!("{:02}:{:02}", minute / 60, minute % 60);
        minute += 5;
        let started = Instant::now();
        admin
            .simple_query(&format!(
                "INSERT INTO bookings (token, date, time) VALUES ('{token}', '{BOOKING_DATE}', '{time}')"
            ))
            .await
            .unwrap();
        booking_latencies.push(started.elapsed());
    }
    print_latency("booking commit (200 sequential)", &mut booking_latencies);

    // Phase 3: contended bookings — many racers, one slot each round
    let mut winners = 0u32;
    let mut losers = 0u32;
    for round in 0..20 {
        let time = format!("{:02}:{:02}", 18 + round / 12, (round % 12) * 5);
        let mut racers = Vec::new();
        for _ in 0..8 {
            let client = connect(addr, &db).await;
            let token = mint_link(&admin).await;
            let time = time.clone();
            racers.push(tokio::spawn(async move {
                client
                    .simple_query(&format!(
                        "INSERT INTO bookings (token, date, time) VALUES ('{token}', '2031-06-09', '{time}')"
                    ))
                    .await
                    .is_ok()
            }));
        }
        let mut round_winners = 0;
        for r in racers {
            if r.await.unwrap() {
                round_winners += 1;
            } else {
                losers += 1;
            }
        }
        assert_eq!(round_winners, 1, "exactly one racer must win each slot");
        winners += round_winners;
    }
    println!("  contention: {winners} winners, {losers} losers across 20 rounds");

    println!("stress: done");
}
