use clap::{App, Arg};
use quark::logging;
use std::io::BufRead;
use std::thread;
use std::time::Duration;
use tachyon::address::Address;
use tachyon::engine;
use tachyon::error::ConnectionStatus;
use tachyon::instance::{ClientInstance, InstanceProfile};
use tachyon::packet::Packet;

fn main() {
    let matches = App::new("echo_client")
        .arg(
            Arg::with_name("tcp")
                .long("tcp")
                .takes_value(true)
                .default_value("127.0.0.1:28008"),
        )
        .arg(
            Arg::with_name("udp")
                .long("udp")
                .takes_value(true)
                .default_value("127.0.0.1:28009"),
        )
        .arg(Arg::with_name("profile").long("profile").takes_value(true))
        .get_matches();

    let log = logging::terminal();

    engine::start(0, log.new(logging::o!("component" => "engine"))).expect("Engine start failed");

    let profile = match matches.value_of("profile") {
        Some(path) => {
            let text = std::fs::read_to_string(path).expect("Profile unreadable");
            InstanceProfile::from_toml(&text).expect("Profile invalid")
        }
        None => InstanceProfile::default(),
    };

    let tcp = Address::parse(matches.value_of("tcp").unwrap()).expect("Bad TCP address");
    let udp = Address::parse(matches.value_of("udp").unwrap()).expect("Bad UDP address");

    let client = ClientInstance::new(1, profile, log.new(logging::o!("component" => "client")))
        .expect("Client construction failed");

    let status = client.connect(tcp, Some(udp), 15_000, true).expect("Connect failed");
    if status != ConnectionStatus::Connected {
        logging::error!(log, "connection failed"; "status" => ?status);
        return;
    }

    logging::info!(log, "connected"; "client_id" => client.client_id(), "max_clients" => client.max_clients());

    // Echo printer.
    {
        let client = client.clone();
        let log = log.clone();
        thread::spawn(move || {
            let mut packet = Packet::new();
            loop {
                thread::sleep(Duration::from_millis(10));

                while client.recv_tcp(&mut packet).unwrap_or(0) == 1 {
                    logging::info!(log, "tcp echo"; "data" => String::from_utf8_lossy(packet.as_slice()).into_owned());
                }
                while client.recv_udp(&mut packet, 0, 0).unwrap_or(0) == 1 {
                    logging::info!(log, "udp echo"; "data" => String::from_utf8_lossy(packet.as_slice()).into_owned());
                }

                if !client.client_connected() {
                    logging::error!(log, "connection lost");
                    std::process::exit(1);
                }
            }
        });
    }

    // Lines from stdin go out over both transports.
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };

        let packet = Packet::from_str(&line);
        drop(client.send_tcp(&packet, false));
        drop(client.send_udp(&packet, false));
    }

    client.disconnect();
    engine::shutdown_friendly(true);
}
