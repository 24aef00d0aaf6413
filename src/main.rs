use clap::{App, Arg};
use rand::rngs::StdRng;
use rand::SeedableRng;
use raftkv::cluster::UdpCluster;
use raftkv::replica::Replica;
use std::process;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .init();

    let matches = App::new("raftkv")
        .about("Replicated key-value store speaking JSON datagrams to a simulator relay")
        .arg(
            Arg::with_name("port")
                .help("UDP port of the simulator relay on localhost")
                .required(true),
        )
        .arg(
            Arg::with_name("id")
                .help("ID of this replica (hex string)")
                .required(true),
        )
        .arg(
            Arg::with_name("peers")
                .help("IDs of the other replicas")
                .required(true)
                .multiple(true),
        )
        .get_matches();

    let port = match matches.value_of("port").unwrap().parse::<u16>() {
        Ok(port) => port,
        Err(err) => {
            eprintln!("invalid port: {}", err);
            process::exit(1);
        }
    };
    let id = matches.value_of("id").unwrap();
    let peers: Vec<String> = matches
        .values_of("peers")
        .unwrap()
        .map(str::to_string)
        .collect();

    let (cluster, inbox) = match UdpCluster::connect(port) {
        Ok(pair) => pair,
        Err(err) => {
            eprintln!("cannot reach relay on port {}: {}", port, err);
            process::exit(1);
        }
    };

    let mut replica = Replica::new(id, peers, cluster, StdRng::from_entropy());
    replica.start(inbox);
}
