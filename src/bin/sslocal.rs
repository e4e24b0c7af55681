//! SOCKS5 local proxy binary.

use std::io::Write;
use std::time::Duration;

use clap::{value_parser, Arg, ArgAction, Command};
use log::LevelFilter;

use ssclient::config::{Config, PROTO_TCP_UDP, PROTO_WEBSOCKET};
use ssclient::manage;

const TAG: i32 = 0;

#[tokio::main]
async fn main() {
    let matches = Command::new("sslocal")
        .version(ssclient::VERSION)
        .about("SOCKS5 proxy tunnelling to a Shadowsocks relay")
        .arg(
            Arg::new("SERVER")
                .short('s')
                .long("server")
                .required(true)
                .help("Relay server host"),
        )
        .arg(
            Arg::new("SERVER_PORT")
                .short('p')
                .long("server-port")
                .value_parser(value_parser!(u16))
                .default_value("8488")
                .help("Relay server port"),
        )
        .arg(
            Arg::new("PASSWORD")
                .short('k')
                .long("password")
                .required(true)
                .help("Password"),
        )
        .arg(
            Arg::new("ENCRYPT_METHOD")
                .short('m')
                .long("encrypt-method")
                .default_value("AEAD_CHACHA20_POLY1305")
                .help("Encryption method"),
        )
        .arg(
            Arg::new("LOCAL_HOST")
                .short('b')
                .long("local-host")
                .default_value("127.0.0.1")
                .help("Local SOCKS5 bind address"),
        )
        .arg(
            Arg::new("LOCAL_PORT")
                .short('l')
                .long("local-port")
                .value_parser(value_parser!(u16))
                .default_value("1080")
                .help("Local SOCKS5 port"),
        )
        .arg(
            Arg::new("WEBSOCKET")
                .short('w')
                .long("websocket")
                .action(ArgAction::SetTrue)
                .help("Tunnel over a WebSocket upgrade instead of raw TCP/UDP"),
        )
        .arg(
            Arg::new("WS_PATH")
                .long("ws-path")
                .default_value("/")
                .help("WebSocket path on the relay"),
        )
        .arg(
            Arg::new("WS_USERNAME")
                .long("ws-username")
                .default_value("")
                .help("Account sent as Shadowsocks-Username"),
        )
        .arg(
            Arg::new("WS_TIMEOUT")
                .long("ws-timeout")
                .value_parser(value_parser!(u64))
                .default_value("0")
                .help("WebSocket handshake timeout in milliseconds (0 = default)"),
        )
        .arg(
            Arg::new("MPX")
                .long("mpx")
                .action(ArgAction::SetTrue)
                .help("Multiplex flows over a pool of persistent streams (WebSocket only)"),
        )
        .arg(
            Arg::new("MAX_CONN_COUNT")
                .long("max-conn-count")
                .value_parser(value_parser!(usize))
                .default_value("0")
                .help("Cap on concurrent SOCKS connections (0 = unbounded)"),
        )
        .arg(
            Arg::new("VERBOSE")
                .short('v')
                .action(ArgAction::Count)
                .help("Set the level of debug"),
        )
        .get_matches();

    let verbose = matches.get_count("VERBOSE");
    let mut log_builder = env_logger::Builder::new();
    log_builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}][{}] {}",
            buf.timestamp_millis(),
            record.level(),
            record.args()
        )
    });
    match verbose {
        0 => log_builder.filter(None, LevelFilter::Info),
        1 => log_builder.filter(Some("ssclient"), LevelFilter::Debug),
        2 => log_builder.filter(None, LevelFilter::Debug),
        _ => log_builder.filter(None, LevelFilter::Trace),
    };
    if let Ok(env_conf) = std::env::var("RUST_LOG") {
        log_builder.parse_filters(&env_conf);
    }
    log_builder.init();

    let cfg = Config {
        proto: if matches.get_flag("WEBSOCKET") {
            PROTO_WEBSOCKET
        } else {
            PROTO_TCP_UDP
        },
        server: matches.get_one::<String>("SERVER").unwrap().clone(),
        url: matches.get_one::<String>("WS_PATH").unwrap().clone(),
        username: matches.get_one::<String>("WS_USERNAME").unwrap().clone(),
        port: *matches.get_one::<u16>("SERVER_PORT").unwrap(),
        method: matches.get_one::<String>("ENCRYPT_METHOD").unwrap().clone(),
        password: matches.get_one::<String>("PASSWORD").unwrap().clone(),
        verbose: verbose > 0,
        max_conn_count: *matches.get_one::<usize>("MAX_CONN_COUNT").unwrap(),
        tag: TAG,
        local_host: matches.get_one::<String>("LOCAL_HOST").unwrap().clone(),
        local_port: *matches.get_one::<u16>("LOCAL_PORT").unwrap(),
        mpx: matches.get_flag("MPX"),
        ws_timeout: *matches.get_one::<u64>("WS_TIMEOUT").unwrap(),
    };

    if let Err(e) = cfg.validate() {
        log::error!("{}", e);
        std::process::exit(1);
    }

    log::info!("shadowsocks client {}", ssclient::VERSION);
    if let Err(e) = manage::start_with_config(&cfg).await {
        log::error!("{}", e);
        std::process::exit(1);
    }

    // Periodic transfer totals, like the reference client binary.
    tokio::spawn(async {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Some(stat) = manage::stat(TAG) {
                log::info!(
                    "rx: {} kb, tx: {} kb",
                    stat.rx() / 8 / 1024,
                    stat.tx() / 8 / 1024
                );
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    let _ = manage::stop(TAG);
}
