use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

/// 30-minute slots in a 24-hour day.
const SLOTS_PER_DAY: u64 = 48;

async fn connect(host: &str, port: u16, salon: &str, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(salon)
        .user(user)
        .password(std::env::var("SALOND_PASSWORD").unwrap_or_else(|_| "salond".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

async fn connect_customer(host: &str, port: u16, salon: &str) -> tokio_postgres::Client {
    connect(host, port, salon, &format!("customer:{}", Ulid::new())).await
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// A fresh salon open around the clock, with one 30-minute service and one
/// staff member who offers it.
#[derive(Clone)]
struct Salon {
    name: String,
    service: Ulid,
    staff: Ulid,
}

impl Salon {
    async fn open(host: &str, port: u16) -> Salon {
        let name = format!("bench_{}", Ulid::new());
        let admin = connect(host, port, &name, &format!("admin:{}", Ulid::new())).await;
        let service = Ulid::new();
        let staff = Ulid::new();
        let statements = [
            "INSERT INTO salon_config VALUES (NULL, NULL, NULL, NULL)".to_string(),
            format!("INSERT INTO services VALUES ('{service}', 'Trim', 30, 2500)"),
            format!(
                "INSERT INTO staff VALUES ('{staff}', '{}', 'Bench', '00:00', '24:00', '', '{service}')",
                Ulid::new()
            ),
        ];
        for sql in &statements {
            admin.batch_execute(sql).await.unwrap();
        }
        Salon { name, service, staff }
    }

    /// Slot `n` counts 30-minute slots forward from the base date.
    fn booking_sql(&self, n: u64) -> String {
        let base = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap_or_default();
        let date = base + Days::new(n / SLOTS_PER_DAY);
        let minute = (n % SLOTS_PER_DAY) * 30;
        format!(
            "INSERT INTO bookings VALUES ('{}', '{}', '{}', '{date}', '{:02}:{:02}')",
            Ulid::new(),
            self.service,
            self.staff,
            minute / 60,
            minute % 60
        )
    }
}

async fn phase1_sequential(host: &str, port: u16) {
    let salon = Salon::open(host, port).await;
    let client = connect_customer(host, port, &salon.name).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        client.batch_execute(&salon.booking_sql(i)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many customers race for the same slot, round after round. Every round
/// must have exactly one winner.
async fn phase2_contended(host: &str, port: u16) {
    let salon = Salon::open(host, port).await;
    let n_racers = 16;
    let rounds = 100;

    let mut clients = Vec::with_capacity(n_racers);
    for _ in 0..n_racers {
        clients.push(Arc::new(connect_customer(host, port, &salon.name).await));
    }

    let mut bad_rounds = 0;
    let start = Instant::now();
    for round in 0..rounds {
        let handles: Vec<_> = clients
            .iter()
            .map(|client| {
                let client = client.clone();
                let sql = salon.booking_sql(round);
                tokio::spawn(async move { client.batch_execute(&sql).await.is_ok() })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap_or(false) {
                winners += 1;
            }
        }
        if winners != 1 {
            bad_rounds += 1;
            eprintln!("  round {round}: {winners} winners");
        }
    }

    let elapsed = start.elapsed();
    let attempts = n_racers as u64 * rounds;
    println!(
        "  {rounds} rounds x {n_racers} racers = {attempts} attempts in {:.2}s = {:.0} ops/sec, {bad_rounds} bad rounds",
        elapsed.as_secs_f64(),
        attempts as f64 / elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let salon = Salon::open(host, port).await;
    let setup_client = connect_customer(host, port, &salon.name).await;
    // Every other slot on the first day.
    for i in (0..SLOTS_PER_DAY).step_by(2) {
        setup_client.batch_execute(&salon.booking_sql(i)).await.unwrap();
    }
    drop(setup_client);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5u64 {
        let host = host.to_string();
        let salon = salon.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect_customer(&host, port, &salon.name).await;
            let mut i = SLOTS_PER_DAY * (1 + w * 1000);
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&salon.booking_sql(i)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let salon = salon.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect_customer(&host, port, &salon.name).await;
            let sql = format!(
                "SELECT * FROM availability WHERE staff_id = '{}' AND date = '2030-01-01' AND service_id = '{}'",
                salon.staff, salon.service
            );
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;
    let salon = Salon::open(host, port).await;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for c in 0..n_conns {
        let host = host.to_string();
        let salon = salon.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect_customer(&host, port, &salon.name).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&salon.booking_sql(c * ops_per_conn + i))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SALOND_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SALOND_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SALOND_PORT");

    println!("=== salond stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended slot races");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] availability latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
