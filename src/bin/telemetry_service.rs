use clap::{App, Arg, ArgMatches};
use kubos_telemetry::config::{
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_PRODUCER_PORT, DEFAULT_SUBSCRIBER_PORT, MIN_POLL_TIMEOUT_MS,
};
use kubos_telemetry::{BrokerConfig, TelemetryBroker};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

const DEFAULT_STATS_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let subscriber_port = DEFAULT_SUBSCRIBER_PORT.to_string();
    let producer_port = DEFAULT_PRODUCER_PORT.to_string();
    let max_frame = DEFAULT_MAX_FRAME_SIZE.to_string();
    let defaults = BrokerConfig::default();
    let max_subscribers = defaults.max_subscribers.to_string();
    let max_producers = defaults.max_producers.to_string();
    let stats_interval = DEFAULT_STATS_INTERVAL_SECS.to_string();
    let accept_timeout = defaults.accept_timeout_ms.to_string();
    let recv_timeout = defaults.recv_timeout_ms.to_string();

    let matches = App::new("telemetry-service")
        .version("0.1.0")
        .about("📡 Telemetry broker - fans published telemetry out to subscribers")
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDR")
                .help("Address both listeners bind to")
                .takes_value(true)
                .default_value("127.0.0.1")
                .validator(|v| parse_check::<IpAddr>(&v, "Bind address must be an IP address")),
        )
        .arg(
            Arg::with_name("subscriber-port")
                .short("s")
                .long("subscriber-port")
                .value_name("PORT")
                .help("Port subscribers connect to")
                .takes_value(true)
                .default_value(&subscriber_port)
                .validator(|v| parse_check::<u16>(&v, "Port must be a number between 0 and 65535")),
        )
        .arg(
            Arg::with_name("producer-port")
                .short("p")
                .long("producer-port")
                .value_name("PORT")
                .help("Port producers publish on")
                .takes_value(true)
                .default_value(&producer_port)
                .validator(|v| parse_check::<u16>(&v, "Port must be a number between 0 and 65535")),
        )
        .arg(
            Arg::with_name("max-subscribers")
                .long("max-subscribers")
                .value_name("COUNT")
                .help("Maximum simultaneous subscriber connections")
                .takes_value(true)
                .default_value(&max_subscribers)
                .validator(|v| parse_check::<usize>(&v, "Limit must be a number")),
        )
        .arg(
            Arg::with_name("max-producers")
                .long("max-producers")
                .value_name("COUNT")
                .help("Maximum simultaneous producer connections")
                .takes_value(true)
                .default_value(&max_producers)
                .validator(|v| parse_check::<usize>(&v, "Limit must be a number")),
        )
        .arg(
            Arg::with_name("max-frame-size")
                .long("max-frame-size")
                .value_name("BYTES")
                .help("Largest accepted message payload")
                .takes_value(true)
                .default_value(&max_frame)
                .validator(|v| parse_check::<usize>(&v, "Frame size must be a number")),
        )
        .arg(
            Arg::with_name("accept-timeout")
                .long("accept-timeout")
                .value_name("MS")
                .help("How long an accept waits before re-checking for shutdown")
                .takes_value(true)
                .default_value(&accept_timeout)
                .validator(|v| poll_check(&v)),
        )
        .arg(
            Arg::with_name("recv-timeout")
                .long("recv-timeout")
                .value_name("MS")
                .help("How long a connection handler waits for data before re-checking for shutdown")
                .takes_value(true)
                .default_value(&recv_timeout)
                .validator(|v| poll_check(&v)),
        )
        .arg(
            Arg::with_name("stats-interval")
                .long("stats-interval")
                .value_name("SECONDS")
                .help("How often broker counters are logged, 0 to disable")
                .takes_value(true)
                .default_value(&stats_interval)
                .validator(|v| parse_check::<u64>(&v, "Interval must be a number of seconds")),
        )
        .get_matches();

    let config = BrokerConfig {
        bind_addr: parsed(&matches, "bind", defaults.bind_addr),
        subscriber_port: parsed(&matches, "subscriber-port", DEFAULT_SUBSCRIBER_PORT),
        producer_port: parsed(&matches, "producer-port", DEFAULT_PRODUCER_PORT),
        max_subscribers: parsed(&matches, "max-subscribers", defaults.max_subscribers),
        max_producers: parsed(&matches, "max-producers", defaults.max_producers),
        max_frame_size: parsed(&matches, "max-frame-size", DEFAULT_MAX_FRAME_SIZE),
        accept_timeout_ms: parsed(&matches, "accept-timeout", defaults.accept_timeout_ms),
        recv_timeout_ms: parsed(&matches, "recv-timeout", defaults.recv_timeout_ms),
        ..BrokerConfig::default()
    };
    let stats_every = parsed(&matches, "stats-interval", DEFAULT_STATS_INTERVAL_SECS);

    println!("📡 Telemetry Service");
    println!("====================");

    let broker = match TelemetryBroker::bind(config) {
        Ok(broker) => broker,
        Err(e) => {
            error!("❌ {}", e);
            return Err(e.into());
        }
    };
    info!("🌐 Subscribers connect on {}", broker.subscriber_addr());
    info!("🌐 Producers publish on {}", broker.producer_addr());

    let broker = broker.spawn();

    if stats_every == 0 {
        tokio::signal::ctrl_c().await?;
    } else {
        let mut interval = time::interval(Duration::from_secs(stats_every));
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = broker.stats();
                    info!(
                        subscribers = stats.active_subscribers,
                        routed = stats.packets_routed,
                        deliveries = stats.deliveries,
                        failures = stats.delivery_failures,
                        refused = stats.connections_refused,
                        "📊 broker stats"
                    );
                }
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    break;
                }
            }
        }
    }

    info!("🛑 Shutting down telemetry service");
    broker.shutdown().await?;
    println!("🚀 Telemetry service stopped");

    Ok(())
}

fn parse_check<T: FromStr>(value: &str, message: &str) -> Result<(), String> {
    match value.parse::<T>() {
        Ok(_) => Ok(()),
        Err(_) => Err(message.into()),
    }
}

fn poll_check(value: &str) -> Result<(), String> {
    match value.parse::<u64>() {
        Ok(ms) if ms >= MIN_POLL_TIMEOUT_MS => Ok(()),
        _ => Err(format!("Timeout must be at least {} ms", MIN_POLL_TIMEOUT_MS)),
    }
}

/// Values are validated by clap, so the fallback only covers a missing flag.
fn parsed<T: FromStr>(matches: &ArgMatches<'_>, name: &str, fallback: T) -> T {
    matches
        .value_of(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}
