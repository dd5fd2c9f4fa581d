use clap::{App, Arg};
use quark::logging;
use std::thread;
use std::time::Duration;
use tachyon::address::Address;
use tachyon::engine;
use tachyon::instance::{InstanceProfile, ServerInstance};
use tachyon::packet::Packet;

fn main() {
    let matches = App::new("echo_server")
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
        .arg(
            Arg::with_name("max-clients")
                .long("max-clients")
                .takes_value(true)
                .default_value("8"),
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
    let max_clients: usize = matches.value_of("max-clients").unwrap().parse().expect("Bad client count");

    let server = ServerInstance::new(
        1,
        tcp,
        Some(udp),
        max_clients,
        profile,
        log.new(logging::o!("component" => "server")),
    )
    .expect("Server start failed");

    logging::info!(log, "echo server listening";
                   "tcp" => %server.tcp_addr(),
                   "udp" => ?server.udp_addr().map(|a| a.to_string()));

    let mut packet = Packet::new();

    loop {
        thread::sleep(Duration::from_millis(10));

        while let Some(client_id) = server.next_joined() {
            logging::info!(log, "client joined"; "client_id" => client_id);
        }
        while let Some(client_id) = server.next_left() {
            logging::info!(log, "client left"; "client_id" => client_id);
        }

        for client_id in 1..=max_clients {
            while server.recv_tcp(client_id, &mut packet).unwrap_or(0) == 1 {
                drop(server.send_tcp(client_id, &packet, false));
            }

            while server.recv_udp(&mut packet, client_id, 0).unwrap_or(0) == 1 {
                drop(server.send_udp(client_id, &packet, false));
            }
        }

        if server.should_destroy() {
            logging::error!(log, "server requested destroy, exiting");
            break;
        }
    }

    engine::shutdown_friendly(true);
}
