//! Join an application network over the public DHT and look around in it.
//!
//! Usage: `cargo run --example peers -- [NETWORK KEY]`

use futures_util::StreamExt;
use peernet_dht::{router, DhtEvent, InfoHash, LengthError, MainlineDht, SearchStream};
use std::{
    convert::TryFrom,
    env,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
    time::Instant,
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
};

const DEFAULT_NETWORK_KEY: &str = "GEDKEEPER NETWORK";

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let network_key = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_NETWORK_KEY.to_owned());

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 0));
    let (dht, mut events) = MainlineDht::builder()
        .add_routers(router::DEFAULT_ROUTERS.iter().copied())
        .set_network_key(network_key.as_str())
        .bind(addr)
        .await
        .unwrap();

    println!("bootstrapping...");
    let start = Instant::now();

    while let Some(event) = events.recv().await {
        match event {
            DhtEvent::BootstrapCompleted => {
                let elapsed = start.elapsed();
                println!(
                    "bootstrap completed in {}.{:03} seconds",
                    elapsed.as_secs(),
                    elapsed.subsec_millis()
                );
                break;
            }
            DhtEvent::BootstrapFailed => {
                println!("bootstrap failed, still trying...");
            }
            _ => (),
        }
    }

    // Print what happens in the background.
    tokio::spawn(print_events(events));

    let mut stdout = io::stdout();
    let mut stdin = BufReader::new(io::stdin());
    let mut line = String::new();

    loop {
        stdout.write_all(b"> ").await.unwrap();
        stdout.flush().await.unwrap();

        line.clear();

        if stdin.read_line(&mut line).await.unwrap() > 0 {
            if !handle_command(&dht, &network_key, &line).await {
                break;
            }
        } else {
            break;
        }
    }

    dht.shutdown();
}

async fn print_events(mut events: mpsc::UnboundedReceiver<DhtEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DhtEvent::NodePinged {
                id,
                addr,
                compatible,
            } => println!("pinged {:?} at {} (compatible: {})", id, addr, compatible),
            DhtEvent::Announced {
                info_hash,
                accepted,
            } => println!("announced {:?} to {} nodes", info_hash, accepted),
            DhtEvent::StateChanged(state) => println!("state: {:?}", state),
            _ => (),
        }
    }
}

async fn handle_command(dht: &MainlineDht, network_key: &str, command: &str) -> bool {
    match command.parse() {
        Ok(Command::Help) => {
            println!("    h               shows this help message");
            println!("    j               join the network and list its peers");
            println!("    s <INFO_HASH>   search for the specified info hash");
            println!("    a <INFO_HASH>   announce the specified info hash");
            println!("    p <ADDR>        ping a node");
            println!("    n               show the routing table");
            println!("    d               show debug state");
            println!("    q               quit");
        }
        Ok(Command::Join) => {
            println!("joining {:?}...", network_key);
            collect_peers(dht.join_network()).await;
        }
        Ok(Command::Search {
            info_hash,
            announce,
        }) => {
            if announce {
                println!("announcing {:?}...", info_hash)
            } else {
                println!("searching for {:?}...", info_hash)
            }

            collect_peers(dht.search(info_hash, announce)).await;
        }
        Ok(Command::Ping(addr)) => {
            if let Err(error) = dht.ping(addr) {
                println!("ping failed: {}", error);
            }
        }
        Ok(Command::Nodes) => match dht.nodes().await {
            Ok(nodes) => {
                for node in &nodes {
                    println!("    {:?} {}", node.id, node.addr);
                }
                println!("{} nodes", nodes.len());
            }
            Err(error) => println!("{}", error),
        },
        Ok(Command::Debug) => println!("{:#?}", dht.debug_state().await),
        Ok(Command::Quit) => return false,
        Err(_) => println!("invalid command (use 'h' for help)"),
    }

    true
}

async fn collect_peers(mut peers: SearchStream) {
    let start = Instant::now();
    let mut count = 0;

    while let Some(addr) = peers.next().await {
        println!("peer found: {}", addr);
        count += 1;
    }

    let elapsed = start.elapsed();
    println!(
        "search completed: found {} peers in {}.{:03} seconds",
        count,
        elapsed.as_secs(),
        elapsed.subsec_millis()
    );
}

enum Command {
    Help,
    Join,
    Search { info_hash: InfoHash, announce: bool },
    Ping(SocketAddr),
    Nodes,
    Debug,
    Quit,
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (head, rest) = s.split_at(s.len().min(1));
        let rest = rest.trim();

        match head {
            "h" | "?" => Ok(Self::Help),
            "j" => Ok(Self::Join),
            "s" => Ok(Self::Search {
                info_hash: parse_info_hash(rest)?,
                announce: false,
            }),
            "a" => Ok(Self::Search {
                info_hash: parse_info_hash(rest)?,
                announce: true,
            }),
            "p" => Ok(Self::Ping(rest.parse().map_err(|_| ParseError)?)),
            "n" => Ok(Self::Nodes),
            "d" => Ok(Self::Debug),
            "q" => Ok(Self::Quit),
            _ => Err(ParseError),
        }
    }
}

struct ParseError;

impl From<hex::FromHexError> for ParseError {
    fn from(_: hex::FromHexError) -> Self {
        ParseError
    }
}

impl From<LengthError> for ParseError {
    fn from(_: LengthError) -> Self {
        ParseError
    }
}

/// Either 40 hex digits, or `#` followed by a network key.
fn parse_info_hash(s: &str) -> Result<InfoHash, ParseError> {
    match s.strip_prefix('#') {
        Some(key) => Ok(InfoHash::from_network_key(key.trim())),
        None => Ok(InfoHash::try_from(hex::decode(s)?.as_ref())?),
    }
}
