use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls};

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("innkeeper")
        .user("bench")
        .password(std::env::var("INNKEEPER_PASSWORD").unwrap_or_else(|_| "innkeeper".into()));

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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// Room ids for one run start here so repeated runs against a live server don't collide.
struct IdSpace {
    next: i64,
}

impl IdSpace {
    fn new() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        Self { next: millis * 1000 }
    }

    fn take(&mut self) -> i64 {
        self.next += 1;
        self.next
    }
}

fn night(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).unwrap() + Days::new(offset)
}

fn booking_sql(room_id: i64, user_id: i64, from: NaiveDate, to: NaiveDate) -> String {
    format!(
        "INSERT INTO bookings (room_id, user_id, date_from, date_to) VALUES ({room_id}, {user_id}, '{from}', '{to}')"
    )
}

async fn add_room(client: &tokio_postgres::Client, id: i64, hotel_id: i64, units: u32) {
    client
        .batch_execute(&format!(
            "INSERT INTO rooms (id, hotel_id, nightly_price, total_units) VALUES ({id}, {hotel_id}, 9900, {units})"
        ))
        .await
        .unwrap();
}

async fn phase1_sequential(host: &str, port: u16, ids: &mut IdSpace) {
    let client = connect(host, port).await;
    let room = ids.take();
    add_room(&client, room, room, 1).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n as u64 {
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(room, 1, night(i), night(i + 1)))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16, ids: &mut IdSpace) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let room = ids.take();

        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            add_room(&client, room, room, 1).await;

            for j in 0..n_per_task {
                client
                    .batch_execute(&booking_sql(room, 1, night(j), night(j + 1)))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_contended(host: &str, port: u16, ids: &mut IdSpace) {
    let units = 5;
    let n_clients = 50;
    let room = ids.take();

    let setup = connect(host, port).await;
    add_room(&setup, room, room, units).await;

    let admitted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for user in 0..n_clients {
        let host = host.to_string();
        let admitted = admitted.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            match client
                .simple_query(&booking_sql(room, user, night(0), night(3)))
                .await
            {
                Ok(_) => admitted.fetch_add(1, Ordering::Relaxed),
                Err(_) => rejected.fetch_add(1, Ordering::Relaxed),
            };
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let admitted = admitted.load(Ordering::Relaxed);
    let rejected = rejected.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients racing for {units} units: {admitted} admitted, {rejected} rejected in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    assert_eq!(admitted, units as usize, "room oversold or undersold");
}

async fn phase4_read_under_load(host: &str, port: u16, ids: &mut IdSpace) {
    let hotel = ids.take();
    let setup = connect(host, port).await;
    let mut rooms = Vec::new();
    for _ in 0..20 {
        let room = ids.take();
        add_room(&setup, room, hotel, 10).await;
        rooms.push(room);
    }
    drop(setup);

    // Writers keep booking rooms of the same hotel the readers query.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for (w, &room) in rooms.iter().take(5).enumerate() {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .batch_execute(&booking_sql(room, w as i64, night(i % 365), night(i % 365 + 2)))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader as u64 {
                let from = night((r + i) % 365);
                let to = night((r + i) % 365 + 7);
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        "SELECT * FROM available_rooms WHERE hotel_id = {hotel} AND date_from = '{from}' AND date_to = '{to}' AND per_page = 20"
                    ))
                    .await
                    .unwrap();
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

    print_latency("available_rooms query", &mut all_latencies);
}

async fn phase5_connection_storm(host: &str, port: u16, ids: &mut IdSpace) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        let room = ids.take();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            add_room(&client, room, room, 10).await;

            for i in 0..ops_per_conn {
                let created = client
                    .simple_query(&booking_sql(room, 1, night(i), night(i + 1)))
                    .await
                    .unwrap();
                let id = created.iter().find_map(|msg| match msg {
                    tokio_postgres::SimpleQueryMessage::Row(row) => {
                        row.get("id").map(str::to_string)
                    }
                    _ => None,
                });
                if let Some(id) = id {
                    client
                        .batch_execute(&format!(
                            "DELETE FROM bookings WHERE id = {id} AND user_id = 1"
                        ))
                        .await
                        .unwrap();
                }
            }
            client
                .batch_execute(&format!("DELETE FROM rooms WHERE id = {room}"))
                .await
                .unwrap();
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} book+cancel each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("INNKEEPER_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("INNKEEPER_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid INNKEEPER_PORT");

    println!("=== innkeeper stress benchmark ===");
    println!("target: {host}:{port}\n");

    let mut ids = IdSpace::new();

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port, &mut ids).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent(&host, port, &mut ids).await;

    println!("\n[phase 3] contention on a single room");
    phase3_contended(&host, port, &mut ids).await;

    println!("\n[phase 4] availability search under write load");
    phase4_read_under_load(&host, port, &mut ids).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&host, port, &mut ids).await;

    println!("\n=== benchmark complete ===");
}
