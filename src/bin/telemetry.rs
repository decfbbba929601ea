use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use kubos_telemetry::config::{DEFAULT_PRODUCER_PORT, DEFAULT_SUBSCRIBER_PORT};
use kubos_telemetry::transport;
use kubos_telemetry::{ClientConfig, ClientConnection, ClientError, TelemetryClient, TelemetryData, TelemetryPacket};
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_HOST: &str = "127.0.0.1";
// 10 polls of 100 ms
const READ_BUDGET_MS: u64 = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber_port = DEFAULT_SUBSCRIBER_PORT.to_string();
    let producer_port = DEFAULT_PRODUCER_PORT.to_string();

    let matches = App::new("telemetry")
        .version("0.1.0")
        .about("🛰️  Telemetry broker operator tool")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Broker host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("subscriber-port")
                .long("subscriber-port")
                .value_name("PORT")
                .help("Broker subscriber port")
                .takes_value(true)
                .default_value(&subscriber_port)
                .global(true),
        )
        .arg(
            Arg::with_name("producer-port")
                .long("producer-port")
                .value_name("PORT")
                .help("Broker producer port")
                .takes_value(true)
                .default_value(&producer_port)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("publish")
                .about("📤 Publish one telemetry sample")
                .arg(
                    Arg::with_name("topic")
                        .short("t")
                        .long("topic")
                        .value_name("TOPIC")
                        .help("Topic id")
                        .takes_value(true)
                        .required(true)
                        .validator(|v| match v.parse::<u16>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Topic must be a number between 0 and 65535".into()),
                        }),
                )
                .arg(
                    Arg::with_name("subsystem")
                        .short("s")
                        .long("subsystem")
                        .value_name("ID")
                        .help("Producing subsystem id")
                        .takes_value(true)
                        .default_value("0")
                        .allow_hyphen_values(true)
                        .validator(|v| match v.parse::<i32>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Subsystem must be a 32-bit integer".into()),
                        }),
                )
                .arg(
                    Arg::with_name("int")
                        .long("int")
                        .value_name("VALUE")
                        .help("Integer sample value")
                        .takes_value(true)
                        .allow_hyphen_values(true)
                        .conflicts_with("float")
                        .required_unless("float")
                        .validator(|v| match v.parse::<i32>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Value must be a 32-bit integer".into()),
                        }),
                )
                .arg(
                    Arg::with_name("float")
                        .long("float")
                        .value_name("VALUE")
                        .help("Floating point sample value")
                        .takes_value(true)
                        .allow_hyphen_values(true)
                        .validator(|v| match v.parse::<f32>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Value must be a number".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("📊 Stream telemetry from the broker")
                .long_about("Subscribes to the given topics (all topics when none are given) and prints every sample received")
                .arg(
                    Arg::with_name("topic")
                        .short("t")
                        .long("topic")
                        .value_name("TOPIC")
                        .help("Topic id to subscribe to, may be repeated")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .validator(|v| match v.parse::<u16>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Topic must be a number between 0 and 65535".into()),
                        }),
                )
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Stop after this many seconds")
                        .takes_value(true)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Duration must be a number of seconds".into()),
                        }),
                ),
        )
        .get_matches();

    let host: IpAddr = matches.value_of("host").unwrap_or(DEFAULT_HOST).parse()?;
    let config = ClientConfig {
        host,
        subscriber_port: port_arg(&matches, "subscriber-port", DEFAULT_SUBSCRIBER_PORT)?,
        producer_port: port_arg(&matches, "producer-port", DEFAULT_PRODUCER_PORT)?,
        ..ClientConfig::default()
    };
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    if verbose {
        println!("{}", "🛰️  Telemetry - broker operator tool".bright_blue().bold());
        println!(
            "{} {} (subscribers) / {} (producers)",
            "Broker at".dimmed(),
            config.subscriber_addr(),
            config.producer_addr()
        );
    }

    let client = TelemetryClient::new(config);

    match matches.subcommand() {
        ("publish", Some(sub_matches)) => {
            handle_publish(&client, sub_matches, format).await?;
        }
        ("monitor", Some(sub_matches)) => {
            handle_monitor(&client, sub_matches, format, verbose).await?;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Publish a sample", "telemetry publish --topic 12 --int 99".bright_cyan());
            println!("  {} Watch a topic", "telemetry monitor --topic 12".bright_cyan());
        }
    }

    Ok(())
}

fn port_arg(matches: &ArgMatches<'_>, name: &str, fallback: u16) -> Result<u16, Box<dyn std::error::Error>> {
    match matches.value_of(name) {
        Some(value) => Ok(value.parse()?),
        None => Ok(fallback),
    }
}

async fn handle_publish(
    client: &TelemetryClient,
    matches: &ArgMatches<'_>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let topic: u16 = matches.value_of("topic").unwrap_or("0").parse()?;
    let subsystem: i32 = matches.value_of("subsystem").unwrap_or("0").parse()?;
    let data = match (matches.value_of("int"), matches.value_of("float")) {
        (Some(value), _) => TelemetryData::Int(value.parse()?),
        (None, Some(value)) => TelemetryData::Float(value.parse()?),
        (None, None) => return Err("one of --int or --float is required".into()),
    };

    let packet = TelemetryPacket::new(topic, subsystem, data);
    match client.publish(&packet).await {
        Ok(()) => match format {
            "json" => println!("{}", serde_json::to_string(&packet)?),
            "compact" => println!("published {}", topic),
            _ => println!(
                "{} topic {} ← {} ({:?})",
                "✅ Published".green().bold(),
                topic.to_string().bright_cyan(),
                data,
                data.data_type()
            ),
        },
        Err(e) => {
            println!("{} {}", "❌ Publish failed:".red().bold(), e);
            return Err(e.into());
        }
    }

    Ok(())
}

async fn handle_monitor(
    client: &TelemetryClient,
    matches: &ArgMatches<'_>,
    format: &str,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let topics = match matches.values_of("topic") {
        Some(values) => values.map(str::parse::<u16>).collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    let stop_at = match matches.value_of("duration") {
        Some(secs) => Some(stop_deadline(secs)?),
        None => None,
    };

    let mut connection = client.connect().await?;
    for topic in &topics {
        connection.subscribe(*topic).await?;
        if verbose {
            println!("{} {}", "Subscribed to topic".dimmed(), topic);
        }
    }

    if format == "table" {
        print_table_header(&topics);
    }

    match stream_packets(&mut connection, stop_at, format, tokio::signal::ctrl_c()).await? {
        MonitorEnd::BrokerClosed => {
            println!("{}", "🔌 Broker closed the connection".yellow());
            return Ok(());
        }
        MonitorEnd::Interrupted => println!("{}", "🛑 Monitor interrupted".yellow()),
        MonitorEnd::Elapsed => {}
    }

    connection.disconnect().await;
    Ok(())
}

/// `--duration` seconds from now. Absurdly long durations never elapse.
fn stop_deadline(secs: &str) -> Result<Instant, std::num::ParseIntError> {
    Ok(transport::deadline_after(Duration::from_secs(secs.parse()?)))
}

#[derive(Debug, PartialEq, Eq)]
enum MonitorEnd {
    Elapsed,
    Interrupted,
    BrokerClosed,
}

/// Prints packets until the deadline passes, `stop` resolves or the broker
/// goes away.
async fn stream_packets<S>(
    connection: &mut ClientConnection,
    stop_at: Option<Instant>,
    format: &str,
    stop: S,
) -> Result<MonitorEnd, Box<dyn std::error::Error>>
where
    S: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(stop);

    loop {
        if stop_at.is_some_and(|deadline| Instant::now() >= deadline) {
            return Ok(MonitorEnd::Elapsed);
        }

        tokio::select! {
            signal = &mut stop => {
                signal?;
                return Ok(MonitorEnd::Interrupted);
            }
            read = connection.read(Duration::from_millis(READ_BUDGET_MS)) => match read {
                Ok(packet) => print_packet(&packet, format)?,
                Err(ClientError::Timeout) => {}
                Err(ClientError::Closed) => return Ok(MonitorEnd::BrokerClosed),
                Err(e) => return Err(e.into()),
            },
        }
    }
}

fn print_table_header(topics: &[u16]) {
    let scope = if topics.is_empty() {
        "all topics".to_string()
    } else {
        format!("topics {:?}", topics)
    };
    println!("{}", "┌───────────────┬───────┬───────────┬───────┬──────────────┐".bright_white());
    println!("{} {}", "│ 🛰️  TELEMETRY MONITOR".bright_blue().bold(), scope.dimmed());
    println!("{}", "├───────────────┼───────┼───────────┼───────┼──────────────┤".bright_white());
    println!("{}", "│ Time (ms)     │ Topic │ Subsystem │ Type  │ Value        │".bright_white());
    println!("{}", "├───────────────┼───────┼───────────┼───────┼──────────────┤".bright_white());
}

fn print_packet(packet: &TelemetryPacket, format: &str) -> Result<(), serde_json::Error> {
    match format {
        "json" => println!("{}", serde_json::to_string(packet)?),
        "compact" => println!(
            "[{}] {} {} {}",
            packet.timestamp, packet.topic_id, packet.subsystem_id, packet.data
        ),
        _ => {
            let (kind, value) = match packet.data {
                TelemetryData::Int(i) => ("INT".cyan(), format!("{:>12}", i).white()),
                TelemetryData::Float(f) => ("FLOAT".magenta(), format!("{:>12.4}", f).white()),
            };
            println!(
                "│ {:>13} │ {:>5} │ {:>9} │ {:<5} │ {} │",
                packet.timestamp,
                packet.topic_id.to_string().bright_cyan(),
                packet.subsystem_id,
                kind,
                value
            );
        }
    }
    Ok(())
}
